//! Two-sided regex filter over patch records.
//!
//! The "old" side matches the original disassembly or the comment, the
//! "new" side matches the current disassembly. Each side can be inverted
//! on its own and a record is shown only if it passes both. An empty
//! pattern passes everything whatever its invert flag says. A pattern that
//! does not compile turns the whole filter into "show all".

use crate::cache;
use crate::record::PatchRecord;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum FilterError {
    #[error("invalid old-side pattern '{pattern}': {message}")]
    InvalidOld { pattern: String, message: String },

    #[error("invalid new-side pattern '{pattern}': {message}")]
    InvalidNew { pattern: String, message: String },
}

/// Filter input as typed by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchFilter {
    pub old_pattern: String,
    pub new_pattern: String,
    pub invert_old: bool,
    pub invert_new: bool,
}

impl PatchFilter {
    pub fn new(old_pattern: impl Into<String>, new_pattern: impl Into<String>) -> Self {
        Self {
            old_pattern: old_pattern.into(),
            new_pattern: new_pattern.into(),
            invert_old: false,
            invert_new: false,
        }
    }

    pub fn inverted(mut self, invert_old: bool, invert_new: bool) -> Self {
        self.invert_old = invert_old;
        self.invert_new = invert_new;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.old_pattern.is_empty() && self.new_pattern.is_empty()
    }

    pub fn compile(&self) -> Result<CompiledFilter, FilterError> {
        let old = Side::compile(&self.old_pattern, self.invert_old).map_err(|e| {
            FilterError::InvalidOld {
                pattern: self.old_pattern.clone(),
                message: e.to_string(),
            }
        })?;
        let new = Side::compile(&self.new_pattern, self.invert_new).map_err(|e| {
            FilterError::InvalidNew {
                pattern: self.new_pattern.clone(),
                message: e.to_string(),
            }
        })?;
        Ok(CompiledFilter { old, new })
    }

    /// Compile, substituting the match-all filter when a pattern is invalid.
    pub fn compile_or_show_all(&self) -> CompiledFilter {
        self.compile().unwrap_or_else(|err| {
            log::warn!("{err}; showing all patches");
            CompiledFilter::match_all()
        })
    }

    /// The displayed subset of `records`, in their original order.
    pub fn apply(&self, records: &[PatchRecord]) -> Vec<PatchRecord> {
        self.compile_or_show_all().apply(records)
    }
}

#[derive(Debug, Clone)]
enum Side {
    Any,
    Pattern { re: Regex, invert: bool },
}

impl Side {
    fn compile(pattern: &str, invert: bool) -> Result<Side, regex::Error> {
        if pattern.is_empty() {
            return Ok(Side::Any);
        }
        Ok(Side::Pattern {
            re: cache::get_or_compile(pattern)?,
            invert,
        })
    }

    fn passes(&self, texts: &[&str]) -> bool {
        match self {
            Side::Any => true,
            Side::Pattern { re, invert } => texts.iter().any(|text| re.is_match(text)) != *invert,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFilter {
    old: Side,
    new: Side,
}

impl CompiledFilter {
    pub fn match_all() -> Self {
        Self {
            old: Side::Any,
            new: Side::Any,
        }
    }

    pub fn matches(&self, record: &PatchRecord) -> bool {
        self.old
            .passes(&[record.old_disasm.as_str(), record.comment.as_str()])
            && self.new.passes(&[record.disasm.as_str()])
    }

    pub fn apply(&self, records: &[PatchRecord]) -> Vec<PatchRecord> {
        records
            .iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: u64, old_disasm: &str, disasm: &str, comment: &str) -> PatchRecord {
        PatchRecord {
            address,
            head: address,
            old_bytes: vec![0x90],
            new_bytes: vec![0xcc],
            old_disasm: old_disasm.to_string(),
            disasm: disasm.to_string(),
            comment: comment.to_string(),
            module: "app.exe".to_string(),
            active: true,
        }
    }

    fn sample() -> Vec<PatchRecord> {
        vec![
            record(0x401000, "MOV eax, 1", "xor eax, eax", ""),
            record(0x401010, "jne 0x401020", "jmp 0x401020", "license check"),
            record(0x401030, "push ebp", "ret", "mov trampoline"),
            record(0x401040, "call 0x402000", "nop", ""),
        ]
    }

    fn addresses(records: &[PatchRecord]) -> Vec<u64> {
        records.iter().map(|r| r.address).collect()
    }

    #[test]
    fn test_empty_patterns_show_everything() {
        let records = sample();
        for (io, inn) in [(false, false), (true, false), (false, true), (true, true)] {
            let filter = PatchFilter::default().inverted(io, inn);
            assert_eq!(filter.apply(&records), records);
        }
    }

    #[test]
    fn test_old_side_matches_disasm_or_comment() {
        let shown = PatchFilter::new("mov", "").apply(&sample());
        assert_eq!(addresses(&shown), vec![0x401000, 0x401030]);
    }

    #[test]
    fn test_old_side_inverted() {
        let shown = PatchFilter::new("mov", "").inverted(true, false).apply(&sample());
        assert_eq!(addresses(&shown), vec![0x401010, 0x401040]);
    }

    #[test]
    fn test_new_side_ignores_comment() {
        let shown = PatchFilter::new("", "license").apply(&sample());
        assert!(shown.is_empty());

        let shown = PatchFilter::new("", "^j").apply(&sample());
        assert_eq!(addresses(&shown), vec![0x401010]);
    }

    #[test]
    fn test_both_sides_are_anded() {
        let shown = PatchFilter::new("license|call", "NOP").apply(&sample());
        assert_eq!(addresses(&shown), vec![0x401040]);

        let shown = PatchFilter::new("license|call", "nop")
            .inverted(false, true)
            .apply(&sample());
        assert_eq!(addresses(&shown), vec![0x401010]);
    }

    #[test]
    fn test_invert_ignored_for_empty_side() {
        let shown = PatchFilter::new("jne", "").inverted(false, true).apply(&sample());
        assert_eq!(addresses(&shown), vec![0x401010]);
    }

    #[test]
    fn test_invalid_pattern_shows_all() {
        let records = sample();
        let filter = PatchFilter::new("(", "nop");
        assert!(matches!(filter.compile(), Err(FilterError::InvalidOld { .. })));
        assert_eq!(filter.apply(&records), records);

        let filter = PatchFilter::new("mov", "[z-a]");
        assert!(matches!(filter.compile(), Err(FilterError::InvalidNew { .. })));
        assert_eq!(filter.apply(&records), records);
    }
}
