//! Debugger capability surface.
//!
//! The engine never talks to a debugger directly. Everything it needs from
//! the host (patch enumeration, memory access, disassembly, the symbol,
//! comment and string databases, expression evaluation, trace records and
//! breakpoints) goes through the [`Debugger`] trait.
//!
//! Every method has a default body that reports the capability as missing,
//! so a host integration only implements what it actually exposes. Callers
//! treat a missing lookup as "nothing found" and a missing command as an
//! [`DebuggerError::Unavailable`] failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One capability of the host debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    EnumeratePatches,
    ReadMemory,
    WritePatchByte,
    Breakpoints,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::EnumeratePatches => "patch enumeration",
            Capability::ReadMemory => "memory read",
            Capability::WritePatchByte => "patch write",
            Capability::Breakpoints => "breakpoint control",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DebuggerError {
    #[error("debugger does not provide {0}")]
    Unavailable(Capability),

    #[error("failed to read {len} bytes at {address:#x}")]
    ReadFailed { address: u64, len: usize },

    #[error("failed to write byte at {address:#x}")]
    WriteFailed { address: u64 },

    #[error("breakpoint operation failed at {address:#x}")]
    Breakpoint { address: u64 },
}

/// A single patched byte as reported by the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPatch {
    pub address: u64,
    pub module: String,
    pub old_byte: u8,
    pub new_byte: u8,
}

impl RawPatch {
    pub fn new(address: u64, module: impl Into<String>, old_byte: u8, new_byte: u8) -> Self {
        Self {
            address,
            module: module.into(),
            old_byte,
            new_byte,
        }
    }
}

/// A decoded operand of a disassembled instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    /// The host classified this operand as a memory reference.
    #[serde(default)]
    pub is_address: bool,
    /// Constant value of the operand (immediate, displacement or target).
    pub value: u64,
}

/// Disassembly of one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instruction {
    /// Full text, mnemonic first (`"push 0x403000"`).
    pub text: String,
    pub operands: Vec<Operand>,
}

impl Instruction {
    /// First token of the text with prefixes like `lock`, `rep` or `bnd`
    /// skipped, lowercased.
    pub fn mnemonic(&self) -> String {
        const PREFIXES: [&str; 8] = [
            "lock", "rep", "repe", "repz", "repne", "repnz", "bnd", "notrack",
        ];
        self.text
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .find(|token| !PREFIXES.contains(&token.as_str()))
            .unwrap_or_default()
    }

    /// Jumps, calls and loops point at code, never at data.
    pub fn is_control_transfer(&self) -> bool {
        let mnemonic = self.mnemonic();
        mnemonic.starts_with('j') || mnemonic.starts_with("call") || mnemonic.starts_with("loop")
    }
}

/// A source location known to the symbol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub file: String,
    pub line: u32,
}

/// What the execution trace recorded for a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceKind {
    #[default]
    Unknown,
    /// First byte of an executed instruction.
    InstructionStart,
    /// Non-leading byte of an executed instruction.
    InstructionBody,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakpointKind {
    #[default]
    None,
    Software,
    Hardware,
    Memory,
}

/// Text as handed over by the host, in the host's own encoding and possibly
/// still NUL-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostText(pub Vec<u8>);

impl From<&str> for HostText {
    fn from(text: &str) -> Self {
        HostText(text.as_bytes().to_vec())
    }
}

impl From<String> for HostText {
    fn from(text: String) -> Self {
        HostText(text.into_bytes())
    }
}

/// The host debugger as seen by the engine.
///
/// Lookups return `None` both when nothing is recorded and when the host has
/// no such database; commands return [`DebuggerError`].
pub trait Debugger {
    /// All single-byte patches currently applied, in any order.
    fn enumerate_patches(&self) -> Result<Vec<RawPatch>, DebuggerError> {
        Err(DebuggerError::Unavailable(Capability::EnumeratePatches))
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, DebuggerError> {
        let _ = (address, len);
        Err(DebuggerError::Unavailable(Capability::ReadMemory))
    }

    /// Whether [`Debugger::write_patch_byte`] is backed by the host.
    ///
    /// Bulk writers check this before touching anything, so a host without
    /// the capability fails even when the input holds no writable line.
    fn can_write_patches(&self) -> bool {
        false
    }

    /// Patch one byte. Multi-byte writes issue one call per byte.
    fn write_patch_byte(&mut self, address: u64, byte: u8) -> Result<(), DebuggerError> {
        let _ = (address, byte);
        Err(DebuggerError::Unavailable(Capability::WritePatchByte))
    }

    /// Disassemble the instruction at `address` using current memory.
    fn disassemble_at(&self, address: u64) -> Option<Instruction> {
        let _ = address;
        None
    }

    /// Disassemble `bytes` as if they were located at `address`.
    fn disassemble_bytes(&self, bytes: &[u8], address: u64) -> Option<Instruction> {
        let _ = (bytes, address);
        None
    }

    fn comment_at(&self, address: u64) -> Option<HostText> {
        let _ = address;
        None
    }

    fn label_at(&self, address: u64) -> Option<HostText> {
        let _ = address;
        None
    }

    fn string_at(&self, address: u64) -> Option<HostText> {
        let _ = address;
        None
    }

    /// Evaluate a debugger expression (`imagebase`, `cip`, `dis.prev(..)`).
    fn evaluate(&self, expression: &str) -> Option<u64> {
        let _ = expression;
        None
    }

    fn source_line_for_address(&self, address: u64) -> Option<SourceLine> {
        let _ = address;
        None
    }

    fn address_for_source_line(&self, line: &SourceLine) -> Option<u64> {
        let _ = line;
        None
    }

    fn trace_record_kind_at(&self, address: u64) -> TraceKind {
        let _ = address;
        TraceKind::Unknown
    }

    fn breakpoint_kind_at(&self, address: u64) -> BreakpointKind {
        let _ = address;
        BreakpointKind::None
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<(), DebuggerError> {
        let _ = address;
        Err(DebuggerError::Unavailable(Capability::Breakpoints))
    }

    fn clear_breakpoint(&mut self, address: u64) -> Result<(), DebuggerError> {
        let _ = address;
        Err(DebuggerError::Unavailable(Capability::Breakpoints))
    }

    /// Base of the module that contains `address`.
    fn module_base_of(&self, address: u64) -> Option<u64> {
        let _ = address;
        None
    }

    /// Name of the module that contains `address`.
    fn module_name_of(&self, address: u64) -> Option<String> {
        let _ = address;
        None
    }

    /// Base of the primary (main executable) module.
    fn main_module_base(&self) -> Option<u64> {
        None
    }

    fn file_offset_to_virtual_address(&self, module: &str, offset: u64) -> Option<u64> {
        let _ = (module, offset);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;
    impl Debugger for Bare {}

    #[test]
    fn test_default_methods_report_unavailable() {
        let mut dbg = Bare;
        assert_eq!(
            dbg.enumerate_patches(),
            Err(DebuggerError::Unavailable(Capability::EnumeratePatches))
        );
        assert_eq!(
            dbg.write_patch_byte(0x401000, 0x90),
            Err(DebuggerError::Unavailable(Capability::WritePatchByte))
        );
        assert!(!dbg.can_write_patches());
        assert!(dbg.comment_at(0x401000).is_none());
        assert_eq!(dbg.trace_record_kind_at(0x401000), TraceKind::Unknown);
    }

    #[test]
    fn test_mnemonic_skips_prefixes() {
        let insn = Instruction {
            text: "REP MOVSB".to_string(),
            operands: Vec::new(),
        };
        assert_eq!(insn.mnemonic(), "movsb");

        let insn = Instruction {
            text: "bnd jmp 0x401000".to_string(),
            operands: Vec::new(),
        };
        assert!(insn.is_control_transfer());
    }

    #[test]
    fn test_control_transfer_detection() {
        for text in ["jne 0x401020", "JMP eax", "call 0x402000", "loopne 0x401000"] {
            let insn = Instruction {
                text: text.to_string(),
                operands: Vec::new(),
            };
            assert!(insn.is_control_transfer(), "{text}");
        }
        for text in ["push 0x403000", "mov eax, [0x404000]", "lea ecx, [0x405000]", ""] {
            let insn = Instruction {
                text: text.to_string(),
                operands: Vec::new(),
            };
            assert!(!insn.is_control_transfer(), "{text}");
        }
    }
}
