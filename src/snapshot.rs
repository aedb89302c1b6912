//! Offline debugger backed by a JSON process snapshot.
//!
//! A snapshot captures what the engine needs from a live session: loaded
//! modules with their section layout, memory ranges, a table of known
//! instruction encodings, the comment/label/string databases, source line
//! info, trace starts, breakpoints and the set of patched bytes with their
//! original values. Writes go to the in-memory image and are tracked as
//! patches exactly like a debugger does: writing back the original byte
//! drops the patch.

use crate::codec::atomic_write;
use crate::debugger::{
    BreakpointKind, Debugger, DebuggerError, HostText, Instruction, Operand, RawPatch,
    SourceLine, TraceKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Bytes fed to the instruction table when disassembling live memory.
const MAX_INSTRUCTION_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("failed to read snapshot {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write snapshot: {0}")]
    Write(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDebugger {
    #[serde(default)]
    pub main_module: Option<String>,
    #[serde(default)]
    pub cip: Option<u64>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub memory: Vec<MemoryRange>,
    /// Patched address -> original byte.
    #[serde(default)]
    pub patches: BTreeMap<u64, u8>,
    #[serde(default)]
    pub instructions: Vec<InstructionEntry>,
    #[serde(default)]
    pub comments: BTreeMap<u64, String>,
    #[serde(default)]
    pub labels: BTreeMap<u64, String>,
    #[serde(default)]
    pub strings: BTreeMap<u64, String>,
    #[serde(default)]
    pub source_lines: Vec<SourceEntry>,
    #[serde(default)]
    pub trace_starts: BTreeSet<u64>,
    #[serde(default)]
    pub breakpoints: BTreeSet<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub base: u64,
    pub size: u64,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Module {
    fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

/// Mapping of a file range onto the module image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Offset from the module base.
    pub virtual_address: u64,
    pub raw_offset: u64,
    pub raw_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    pub address: u64,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

impl MemoryRange {
    fn offset_of(&self, address: u64) -> Option<usize> {
        let offset = address.checked_sub(self.address)?;
        let offset = usize::try_from(offset).ok()?;
        (offset < self.bytes.len()).then_some(offset)
    }
}

/// A known encoding at an address and its disassembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionEntry {
    pub address: u64,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub text: String,
    #[serde(default)]
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub address: u64,
    pub size: u64,
    pub file: String,
    pub line: u32,
}

impl SnapshotDebugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(input: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| SnapshotError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the snapshot back atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let json = self.to_json_string()?;
        atomic_write(path.as_ref(), json.as_bytes())?;
        Ok(())
    }

    pub fn with_module(mut self, name: &str, base: u64, size: u64) -> Self {
        self.modules.push(Module {
            name: name.to_string(),
            base,
            size,
            sections: Vec::new(),
        });
        self
    }

    pub fn with_section(
        mut self,
        module: &str,
        virtual_address: u64,
        raw_offset: u64,
        raw_size: u64,
    ) -> Self {
        if let Some(m) = self.modules.iter_mut().find(|m| m.name == module) {
            m.sections.push(Section {
                virtual_address,
                raw_offset,
                raw_size,
            });
        }
        self
    }

    pub fn with_main_module(mut self, name: &str) -> Self {
        self.main_module = Some(name.to_string());
        self
    }

    pub fn with_cip(mut self, cip: u64) -> Self {
        self.cip = Some(cip);
        self
    }

    pub fn with_memory(mut self, address: u64, bytes: &[u8]) -> Self {
        self.memory.push(MemoryRange {
            address,
            bytes: bytes.to_vec(),
        });
        self
    }

    pub fn with_instruction(
        mut self,
        address: u64,
        bytes: &[u8],
        text: &str,
        operands: &[Operand],
    ) -> Self {
        self.instructions.push(InstructionEntry {
            address,
            bytes: bytes.to_vec(),
            text: text.to_string(),
            operands: operands.to_vec(),
        });
        self
    }

    pub fn with_comment(mut self, address: u64, text: &str) -> Self {
        self.comments.insert(address, text.to_string());
        self
    }

    pub fn with_label(mut self, address: u64, text: &str) -> Self {
        self.labels.insert(address, text.to_string());
        self
    }

    pub fn with_string(mut self, address: u64, text: &str) -> Self {
        self.strings.insert(address, text.to_string());
        self
    }

    pub fn with_source_line(mut self, address: u64, size: u64, file: &str, line: u32) -> Self {
        self.source_lines.push(SourceEntry {
            address,
            size,
            file: file.to_string(),
            line,
        });
        self
    }

    pub fn with_trace_start(mut self, address: u64) -> Self {
        self.trace_starts.insert(address);
        self
    }

    pub fn with_breakpoint(mut self, address: u64) -> Self {
        self.breakpoints.insert(address);
        self
    }

    /// Patch `bytes` starting at `address`, as a user would in the debugger.
    pub fn with_patch(mut self, address: u64, bytes: &[u8]) -> Self {
        for (offset, byte) in (0u64..).zip(bytes) {
            // Builder input: a write outside mapped memory is simply dropped.
            let _ = self.write_patch_byte(address + offset, *byte);
        }
        self
    }

    fn range_of(&self, address: u64) -> Option<(usize, usize)> {
        self.memory
            .iter()
            .enumerate()
            .find_map(|(idx, range)| range.offset_of(address).map(|offset| (idx, offset)))
    }

    fn module_of(&self, address: u64) -> Option<&Module> {
        self.modules.iter().find(|m| m.contains(address))
    }

    /// Live bytes at `address`, clipped to the end of its memory range.
    fn live_window(&self, address: u64) -> Option<&[u8]> {
        let (idx, offset) = self.range_of(address)?;
        let bytes = &self.memory[idx].bytes[offset..];
        Some(&bytes[..bytes.len().min(MAX_INSTRUCTION_LEN)])
    }

    /// Longest table entry at `address` whose encoding prefixes `bytes`.
    fn decode(&self, bytes: &[u8], address: u64) -> Option<&InstructionEntry> {
        self.instructions
            .iter()
            .filter(|entry| entry.address == address && bytes.starts_with(&entry.bytes))
            .max_by_key(|entry| entry.bytes.len())
    }

    fn decode_live(&self, address: u64) -> Option<&InstructionEntry> {
        self.decode(self.live_window(address)?, address)
    }

    /// Nearest decodable instruction starting strictly before `address`.
    fn previous_instruction(&self, address: u64) -> Option<u64> {
        let mut starts: Vec<u64> = self
            .instructions
            .iter()
            .map(|entry| entry.address)
            .filter(|start| *start < address)
            .collect();
        starts.sort_unstable();
        starts.dedup();
        starts
            .into_iter()
            .rev()
            .find(|start| self.decode_live(*start).is_some())
    }

    fn eval_sum(&self, expression: &str) -> Option<u64> {
        expression
            .split('+')
            .map(|term| self.eval_term(term.trim()))
            .try_fold(0u64, |acc, term| acc.checked_add(term?))
    }

    fn eval_term(&self, term: &str) -> Option<u64> {
        match term {
            "imagebase" => self.main_module_base(),
            "cip" => self.cip,
            _ => {
                let digits = term.strip_prefix("0x").unwrap_or(term);
                u64::from_str_radix(digits, 16).ok()
            }
        }
    }
}

impl Debugger for SnapshotDebugger {
    fn enumerate_patches(&self) -> Result<Vec<RawPatch>, DebuggerError> {
        let mut patches = Vec::with_capacity(self.patches.len());
        for (&address, &old_byte) in &self.patches {
            let Some((idx, offset)) = self.range_of(address) else {
                log::warn!("skipping patch at {address:#x}: outside recorded memory");
                continue;
            };
            let module = self
                .module_of(address)
                .map(|m| m.name.clone())
                .unwrap_or_default();
            patches.push(RawPatch::new(
                address,
                module,
                old_byte,
                self.memory[idx].bytes[offset],
            ));
        }
        Ok(patches)
    }

    fn can_write_patches(&self) -> bool {
        true
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, DebuggerError> {
        let failed = DebuggerError::ReadFailed { address, len };
        let (idx, offset) = self.range_of(address).ok_or(failed.clone())?;
        let bytes = &self.memory[idx].bytes;
        let end = offset.checked_add(len).ok_or(failed.clone())?;
        bytes.get(offset..end).map(<[u8]>::to_vec).ok_or(failed)
    }

    fn write_patch_byte(&mut self, address: u64, byte: u8) -> Result<(), DebuggerError> {
        let (idx, offset) = self
            .range_of(address)
            .ok_or(DebuggerError::WriteFailed { address })?;
        let current = &mut self.memory[idx].bytes[offset];
        let original = *self.patches.entry(address).or_insert(*current);
        *current = byte;
        if byte == original {
            self.patches.remove(&address);
        }
        Ok(())
    }

    fn disassemble_at(&self, address: u64) -> Option<Instruction> {
        self.decode_live(address).map(|entry| Instruction {
            text: entry.text.clone(),
            operands: entry.operands.clone(),
        })
    }

    fn disassemble_bytes(&self, bytes: &[u8], address: u64) -> Option<Instruction> {
        self.decode(bytes, address).map(|entry| Instruction {
            text: entry.text.clone(),
            operands: entry.operands.clone(),
        })
    }

    fn comment_at(&self, address: u64) -> Option<HostText> {
        self.comments.get(&address).map(|text| HostText::from(text.as_str()))
    }

    fn label_at(&self, address: u64) -> Option<HostText> {
        self.labels.get(&address).map(|text| HostText::from(text.as_str()))
    }

    fn string_at(&self, address: u64) -> Option<HostText> {
        self.strings.get(&address).map(|text| HostText::from(text.as_str()))
    }

    fn evaluate(&self, expression: &str) -> Option<u64> {
        let expression = expression.trim().to_ascii_lowercase();
        let call = |name: &str| {
            expression
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('('))
                .and_then(|rest| rest.strip_suffix(')'))
                .map(str::to_string)
        };

        if let Some(arg) = call("dis.prev") {
            return self.previous_instruction(self.eval_sum(&arg)?);
        }
        if let Some(arg) = call("dis.len") {
            let entry = self.decode_live(self.eval_sum(&arg)?)?;
            return Some(entry.bytes.len() as u64);
        }
        self.eval_sum(&expression)
    }

    fn source_line_for_address(&self, address: u64) -> Option<SourceLine> {
        self.source_lines
            .iter()
            .find(|entry| address >= entry.address && address - entry.address < entry.size)
            .map(|entry| SourceLine {
                file: entry.file.clone(),
                line: entry.line,
            })
    }

    fn address_for_source_line(&self, line: &SourceLine) -> Option<u64> {
        self.source_lines
            .iter()
            .filter(|entry| entry.file == line.file && entry.line == line.line)
            .map(|entry| entry.address)
            .min()
    }

    fn trace_record_kind_at(&self, address: u64) -> TraceKind {
        if self.trace_starts.contains(&address) {
            TraceKind::InstructionStart
        } else {
            TraceKind::Unknown
        }
    }

    fn breakpoint_kind_at(&self, address: u64) -> BreakpointKind {
        if self.breakpoints.contains(&address) {
            BreakpointKind::Software
        } else {
            BreakpointKind::None
        }
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<(), DebuggerError> {
        if self.range_of(address).is_none() {
            return Err(DebuggerError::Breakpoint { address });
        }
        self.breakpoints.insert(address);
        Ok(())
    }

    fn clear_breakpoint(&mut self, address: u64) -> Result<(), DebuggerError> {
        if self.breakpoints.remove(&address) {
            Ok(())
        } else {
            Err(DebuggerError::Breakpoint { address })
        }
    }

    fn module_base_of(&self, address: u64) -> Option<u64> {
        self.module_of(address).map(|m| m.base)
    }

    fn module_name_of(&self, address: u64) -> Option<String> {
        self.module_of(address).map(|m| m.name.clone())
    }

    fn main_module_base(&self) -> Option<u64> {
        let name = self.main_module.as_deref()?;
        self.modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .map(|m| m.base)
    }

    fn file_offset_to_virtual_address(&self, module: &str, offset: u64) -> Option<u64> {
        let module = self
            .modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(module))?;
        module
            .sections
            .iter()
            .find(|s| offset >= s.raw_offset && offset - s.raw_offset < s.raw_size)
            .and_then(|s| {
                module
                    .base
                    .checked_add(s.virtual_address)?
                    .checked_add(offset - s.raw_offset)
            })
    }
}

/// Serialize byte buffers as space-separated hex (`"90 cc 00"`).
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::record::format_bytes(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let compact: String = text.split_whitespace().collect();
        hex::decode(compact).map_err(serde::de::Error::custom)
    }
}
