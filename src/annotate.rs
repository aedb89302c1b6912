//! Annotation lookup for patch groups.
//!
//! Each group gets at most one human-readable note, picked by walking an
//! ordered list of lookups against the host's comment, label and string
//! databases. The first lookup that produces text wins.

use crate::config::AnnotationSettings;
use crate::debugger::{Debugger, HostText, Instruction};
use serde::Deserialize;

/// Marker byte the host puts in front of automatically generated text.
const AUTO_MARKER: u8 = 0x01;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnnotationStrategy {
    /// User or automatic comment at the instruction head.
    CommentAtHead,
    /// Symbol at the instruction head.
    LabelAtHead,
    /// Label or string at an address the instruction references.
    OperandReference,
    /// Comment or label at the patched byte when it is not the head.
    PatchAddress,
}

impl AnnotationStrategy {
    pub fn default_order() -> Vec<AnnotationStrategy> {
        vec![
            AnnotationStrategy::CommentAtHead,
            AnnotationStrategy::LabelAtHead,
            AnnotationStrategy::OperandReference,
            AnnotationStrategy::PatchAddress,
        ]
    }
}

/// Where an annotation is looked up.
#[derive(Debug, Clone, Copy)]
pub struct AnnotationTarget<'a> {
    pub head: u64,
    pub address: u64,
    /// Live disassembly at `head`, if the host could produce one.
    pub instruction: Option<&'a Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub text: String,
    pub strategy: AnnotationStrategy,
}

#[derive(Debug, Clone)]
pub struct AnnotationResolver {
    order: Vec<AnnotationStrategy>,
    min_operand_address: u64,
    string_preview_limit: usize,
}

impl Default for AnnotationResolver {
    fn default() -> Self {
        Self::from_settings(&AnnotationSettings::default())
    }
}

impl AnnotationResolver {
    pub fn from_settings(settings: &AnnotationSettings) -> Self {
        Self {
            order: settings.order.clone(),
            min_operand_address: settings.min_operand_address,
            string_preview_limit: settings.string_preview_limit,
        }
    }

    pub fn order(&self) -> &[AnnotationStrategy] {
        &self.order
    }

    /// Run the lookup chain; `None` means no note was found anywhere.
    pub fn resolve<D: Debugger + ?Sized>(
        &self,
        dbg: &D,
        target: AnnotationTarget<'_>,
    ) -> Option<Annotation> {
        self.order.iter().find_map(|&strategy| {
            self.try_strategy(dbg, strategy, target)
                .map(|text| Annotation { text, strategy })
        })
    }

    fn try_strategy<D: Debugger + ?Sized>(
        &self,
        dbg: &D,
        strategy: AnnotationStrategy,
        target: AnnotationTarget<'_>,
    ) -> Option<String> {
        match strategy {
            AnnotationStrategy::CommentAtHead => lookup(dbg.comment_at(target.head)),
            AnnotationStrategy::LabelAtHead => lookup(dbg.label_at(target.head)),
            AnnotationStrategy::OperandReference => {
                let insn = target.instruction?;
                self.operand_reference(dbg, insn)
            }
            AnnotationStrategy::PatchAddress => {
                if target.head == target.address {
                    return None;
                }
                lookup(dbg.comment_at(target.address))
                    .or_else(|| lookup(dbg.label_at(target.address)))
            }
        }
    }

    fn operand_reference<D: Debugger + ?Sized>(&self, dbg: &D, insn: &Instruction) -> Option<String> {
        let code_target = insn.is_control_transfer();
        insn.operands
            .iter()
            .map(|operand| operand.value)
            .filter(|value| *value >= self.min_operand_address)
            .find_map(|value| {
                if let Some(label) = lookup(dbg.label_at(value)) {
                    return Some(format_reference(value, &label));
                }
                if code_target {
                    return None;
                }
                lookup(dbg.string_at(value))
                    .map(|text| format_reference(value, &truncate(&text, self.string_preview_limit)))
            })
    }
}

fn lookup(text: Option<HostText>) -> Option<String> {
    text.map(|raw| display_text(&raw)).filter(|text| !text.is_empty())
}

fn format_reference(address: u64, text: &str) -> String {
    format!("0x{address:X}: \"{text}\"")
}

/// Cut `text` to `limit` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

/// Convert host text to display text.
///
/// Drops everything from the first NUL and the leading automatic-origin
/// marker. UTF-8 input is taken as is; anything else is decoded as Latin-1,
/// which maps every byte to a character and therefore never fails.
pub fn display_text(raw: &HostText) -> String {
    let bytes = raw.0.as_slice();
    let bytes = match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    };
    let bytes = bytes.strip_prefix(&[AUTO_MARKER]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|b| char::from(*b)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::Operand;
    use crate::snapshot::SnapshotDebugger;

    fn push_of(value: u64) -> Instruction {
        Instruction {
            text: format!("push {value:#x}"),
            operands: vec![Operand {
                is_address: false,
                value,
            }],
        }
    }

    fn call_of(value: u64) -> Instruction {
        Instruction {
            text: format!("call {value:#x}"),
            operands: vec![Operand {
                is_address: true,
                value,
            }],
        }
    }

    fn at(head: u64, address: u64, insn: Option<&Instruction>) -> AnnotationTarget<'_> {
        AnnotationTarget {
            head,
            address,
            instruction: insn,
        }
    }

    #[test]
    fn test_comment_beats_label() {
        let dbg = SnapshotDebugger::new()
            .with_comment(0x401000, "check license")
            .with_label(0x401000, "sub_401000");
        let note = AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, None))
            .unwrap();
        assert_eq!(note.text, "check license");
        assert_eq!(note.strategy, AnnotationStrategy::CommentAtHead);
    }

    #[test]
    fn test_label_when_no_comment() {
        let dbg = SnapshotDebugger::new().with_label(0x401000, "WinMain");
        let note = AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, None))
            .unwrap();
        assert_eq!(note.text, "WinMain");
        assert_eq!(note.strategy, AnnotationStrategy::LabelAtHead);
    }

    #[test]
    fn test_operand_label_beats_string() {
        let dbg = SnapshotDebugger::new()
            .with_label(0x403000, "szTitle")
            .with_string(0x403000, "Registered");
        let insn = push_of(0x403000);
        let note = AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, Some(&insn)))
            .unwrap();
        assert_eq!(note.text, "0x403000: \"szTitle\"");
        assert_eq!(note.strategy, AnnotationStrategy::OperandReference);
    }

    #[test]
    fn test_operand_string_for_data_reference() {
        let dbg = SnapshotDebugger::new().with_string(0x403000, "Trial expired");
        let insn = push_of(0x403000);
        let note = AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, Some(&insn)))
            .unwrap();
        assert_eq!(note.text, "0x403000: \"Trial expired\"");
    }

    #[test]
    fn test_later_operand_resolves_when_first_is_bare() {
        let dbg = SnapshotDebugger::new().with_string(0x403000, "Invalid key");
        let insn = Instruction {
            text: "mov [0x402000], 0x403000".to_string(),
            operands: vec![
                Operand {
                    is_address: true,
                    value: 0x402000,
                },
                Operand {
                    is_address: false,
                    value: 0x403000,
                },
            ],
        };
        let note = AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, Some(&insn)))
            .unwrap();
        assert_eq!(note.text, "0x403000: \"Invalid key\"");
        assert_eq!(note.strategy, AnnotationStrategy::OperandReference);
    }

    #[test]
    fn test_branch_target_never_read_as_string() {
        let dbg = SnapshotDebugger::new().with_string(0x402000, "garbage");
        let insn = call_of(0x402000);
        assert!(AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, Some(&insn)))
            .is_none());

        // A label at a branch target is still used.
        let dbg = dbg.with_label(0x402000, "CheckSerial");
        let note = AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, Some(&insn)))
            .unwrap();
        assert_eq!(note.text, "0x402000: \"CheckSerial\"");
    }

    #[test]
    fn test_small_operands_are_ignored() {
        let dbg = SnapshotDebugger::new().with_string(0x10, "tiny");
        let insn = push_of(0x10);
        assert!(AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, Some(&insn)))
            .is_none());
    }

    #[test]
    fn test_long_string_is_truncated() {
        let long = "A".repeat(80);
        let dbg = SnapshotDebugger::new().with_string(0x403000, &long);
        let insn = push_of(0x403000);
        let note = AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, Some(&insn)))
            .unwrap();
        let expected = format!("0x403000: \"{}...\"", "A".repeat(57));
        assert_eq!(note.text, expected);
    }

    #[test]
    fn test_patch_address_fallback_only_off_head() {
        let dbg = SnapshotDebugger::new().with_comment(0x401002, "patched jump");
        let resolver = AnnotationResolver::default();

        let note = resolver.resolve(&dbg, at(0x401000, 0x401002, None)).unwrap();
        assert_eq!(note.text, "patched jump");
        assert_eq!(note.strategy, AnnotationStrategy::PatchAddress);

        assert!(resolver.resolve(&dbg, at(0x401003, 0x401003, None)).is_none());
    }

    #[test]
    fn test_auto_marker_is_stripped() {
        let dbg = SnapshotDebugger::new().with_comment(0x401000, "\u{1}kernel32.ExitProcess");
        let note = AnnotationResolver::default()
            .resolve(&dbg, at(0x401000, 0x401000, None))
            .unwrap();
        assert_eq!(note.text, "kernel32.ExitProcess");
    }

    #[test]
    fn test_display_text_conversion() {
        assert_eq!(display_text(&HostText(b"hello\0junk".to_vec())), "hello");
        assert_eq!(display_text(&HostText("naïve".into())), "naïve");
        // Latin-1 fallback keeps every byte.
        assert_eq!(display_text(&HostText(vec![0x63, 0x61, 0x66, 0xe9])), "café");
        assert_eq!(display_text(&HostText(vec![AUTO_MARKER])), "");
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("short", 60), "short");
        assert_eq!(truncate("ééééééé", 6), "ééé...");
    }
}
