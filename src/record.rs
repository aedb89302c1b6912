use crate::debugger::Debugger;
use std::fmt;

/// One logical patch: a run of contiguous patched bytes inside one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    /// Address of the first patched byte.
    pub address: u64,
    /// Start of the instruction containing `address`; never above it.
    pub head: u64,
    pub old_bytes: Vec<u8>,
    pub new_bytes: Vec<u8>,
    /// Disassembly at `head` with the original bytes put back.
    pub old_disasm: String,
    /// Disassembly at `head` as currently in memory.
    pub disasm: String,
    pub comment: String,
    pub module: String,
    /// Whether memory held `new_bytes` when the record was built.
    pub active: bool,
}

impl PatchRecord {
    pub fn len(&self) -> usize {
        self.new_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new_bytes.is_empty()
    }

    /// One past the last patched byte.
    pub fn end(&self) -> u64 {
        self.address + self.len() as u64
    }

    /// `(address, old, new)` for every byte of the record.
    pub fn bytes(&self) -> impl Iterator<Item = (u64, u8, u8)> + '_ {
        (self.address..)
            .zip(self.old_bytes.iter().zip(&self.new_bytes))
            .map(|(address, (old, new))| (address, *old, *new))
    }

    /// Compare live memory against both byte images.
    pub fn state<D: Debugger + ?Sized>(&self, dbg: &D) -> PatchState {
        match dbg.read_memory(self.address, self.len()) {
            Ok(current) if current == self.new_bytes => PatchState::Applied,
            Ok(current) if current == self.old_bytes => PatchState::Reverted,
            _ => PatchState::Unknown,
        }
    }
}

/// Live status of a patch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    /// Memory holds the patched bytes.
    Applied,
    /// Memory holds the original bytes.
    Reverted,
    /// Neither, or memory could not be read.
    Unknown,
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PatchState::Applied => "applied",
            PatchState::Reverted => "reverted",
            PatchState::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// Space-separated lowercase hex, e.g. `"90 cc"`.
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotDebugger;

    fn record(address: u64, old: &[u8], new: &[u8]) -> PatchRecord {
        PatchRecord {
            address,
            head: address,
            old_bytes: old.to_vec(),
            new_bytes: new.to_vec(),
            old_disasm: String::new(),
            disasm: String::new(),
            comment: String::new(),
            module: "app.exe".to_string(),
            active: true,
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(&[0x90, 0xcc, 0x0f]), "90 cc 0f");
        assert_eq!(format_bytes(&[]), "");
    }

    #[test]
    fn test_bytes_iterates_addresses() {
        let rec = record(0x401000, &[0x74, 0x05], &[0xeb, 0x05]);
        let bytes: Vec<_> = rec.bytes().collect();
        assert_eq!(bytes, vec![(0x401000, 0x74, 0xeb), (0x401001, 0x05, 0x05)]);
        assert_eq!(rec.end(), 0x401002);
    }

    #[test]
    fn test_state_tracks_memory() {
        let rec = record(0x401000, &[0x74], &[0xeb]);
        let dbg = SnapshotDebugger::new().with_memory(0x401000, &[0x74]);
        assert_eq!(rec.state(&dbg), PatchState::Reverted);

        let dbg = dbg.with_patch(0x401000, &[0xeb]);
        assert_eq!(rec.state(&dbg), PatchState::Applied);

        let dbg = dbg.with_patch(0x401000, &[0x90]);
        assert_eq!(rec.state(&dbg), PatchState::Unknown);

        assert_eq!(rec.state(&SnapshotDebugger::new()), PatchState::Unknown);
    }
}
