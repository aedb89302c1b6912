//! Instruction head resolution.
//!
//! A patched byte is often not the first byte of its instruction (prefixes,
//! ModRM/immediate bytes). Disassembly and breakpoints must target the
//! instruction start, so each patch group is mapped to its "head" by trying
//! a list of strategies in order. The first one that yields an address not
//! above the patch wins; when none does the patch address itself is used.

use crate::config::ResolverSettings;
use crate::debugger::{Debugger, TraceKind};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeadStrategy {
    /// Map the address to a source line and that line back to its first address.
    SourceLine,
    /// Ask the disassembler for the previous instruction boundary.
    DisassemblyWalk,
    /// Scan backwards for a byte the execution trace marks as instruction start.
    TraceHistory,
}

impl HeadStrategy {
    pub fn default_order() -> Vec<HeadStrategy> {
        vec![
            HeadStrategy::SourceLine,
            HeadStrategy::DisassemblyWalk,
            HeadStrategy::TraceHistory,
        ]
    }

    fn try_resolve<D: Debugger + ?Sized>(
        self,
        dbg: &D,
        address: u64,
        trace_scan_limit: usize,
    ) -> Option<u64> {
        match self {
            HeadStrategy::SourceLine => {
                let line = dbg.source_line_for_address(address)?;
                dbg.address_for_source_line(&line)
                    .filter(|head| *head != 0 && *head <= address)
            }
            HeadStrategy::DisassemblyWalk => {
                let head = dbg
                    .evaluate(&format!("dis.prev({address:#x} + 1)"))
                    .filter(|head| *head != 0 && *head <= address)?;
                let len = dbg.evaluate(&format!("dis.len({head:#x})"))?;
                // The patched byte must lie inside [head, head + len).
                (address - head < len).then_some(head)
            }
            HeadStrategy::TraceHistory => (0..trace_scan_limit as u64)
                .map_while(|offset| address.checked_sub(offset))
                .find(|candidate| {
                    dbg.trace_record_kind_at(*candidate) == TraceKind::InstructionStart
                }),
        }
    }
}

/// Outcome of head resolution; `strategy` is `None` for the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadResolution {
    pub head: u64,
    pub strategy: Option<HeadStrategy>,
}

#[derive(Debug, Clone)]
pub struct HeadResolver {
    order: Vec<HeadStrategy>,
    trace_scan_limit: usize,
}

impl Default for HeadResolver {
    fn default() -> Self {
        Self::from_settings(&ResolverSettings::default())
    }
}

impl HeadResolver {
    pub fn new(order: Vec<HeadStrategy>, trace_scan_limit: usize) -> Self {
        Self {
            order,
            trace_scan_limit,
        }
    }

    pub fn from_settings(settings: &ResolverSettings) -> Self {
        Self::new(settings.order.clone(), settings.trace_scan_limit)
    }

    pub fn order(&self) -> &[HeadStrategy] {
        &self.order
    }

    pub fn resolve<D: Debugger + ?Sized>(&self, dbg: &D, address: u64) -> HeadResolution {
        for &strategy in &self.order {
            if let Some(head) = strategy.try_resolve(dbg, address, self.trace_scan_limit) {
                log::debug!("head of {address:#x} is {head:#x} via {strategy:?}");
                return HeadResolution {
                    head,
                    strategy: Some(strategy),
                };
            }
        }
        HeadResolution {
            head: address,
            strategy: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::SourceLine;
    use crate::snapshot::SnapshotDebugger;

    /// `mov eax, [0x404000]` at 0x401000 with its displacement patched.
    fn mov_with_patched_operand() -> SnapshotDebugger {
        SnapshotDebugger::new()
            .with_module("app.exe", 0x400000, 0x10000)
            .with_memory(0x401000, &[0xa1, 0x00, 0x40, 0x40, 0x00, 0xc3])
            .with_instruction(0x401000, &[0xa1, 0x00, 0x40, 0x40, 0x00], "mov eax, [0x404000]", &[])
            .with_instruction(0x401000, &[0xa1, 0x00, 0x50, 0x40, 0x00], "mov eax, [0x405000]", &[])
            .with_instruction(0x401005, &[0xc3], "ret", &[])
            .with_patch(0x401002, &[0x50])
    }

    #[test]
    fn test_source_line_strategy_wins_first() {
        let dbg = mov_with_patched_operand().with_source_line(0x401000, 5, "main.c", 12);
        let resolution = HeadResolver::default().resolve(&dbg, 0x401002);
        assert_eq!(resolution.head, 0x401000);
        assert_eq!(resolution.strategy, Some(HeadStrategy::SourceLine));
    }

    #[test]
    fn test_source_line_maps_to_first_line_address() {
        let dbg = SnapshotDebugger::new()
            .with_source_line(0x401000, 0x10, "main.c", 12)
            .with_source_line(0x401020, 0x10, "main.c", 12);
        let resolver = HeadResolver::new(vec![HeadStrategy::SourceLine], 15);
        assert_eq!(resolver.resolve(&dbg, 0x401004).head, 0x401000);
        assert_eq!(resolver.resolve(&dbg, 0x401024).head, 0x401000);
    }

    struct LineAfterPatch;

    impl Debugger for LineAfterPatch {
        fn source_line_for_address(&self, _address: u64) -> Option<SourceLine> {
            Some(SourceLine {
                file: "main.c".to_string(),
                line: 3,
            })
        }

        fn address_for_source_line(&self, _line: &SourceLine) -> Option<u64> {
            Some(0x402000)
        }
    }

    #[test]
    fn test_source_line_above_patch_is_rejected() {
        let resolution = HeadResolver::default().resolve(&LineAfterPatch, 0x401000);
        assert_eq!(resolution.head, 0x401000);
        assert_eq!(resolution.strategy, None);
    }

    #[test]
    fn test_disassembly_walk_finds_containing_instruction() {
        let dbg = mov_with_patched_operand();
        let resolution = HeadResolver::default().resolve(&dbg, 0x401002);
        assert_eq!(resolution.head, 0x401000);
        assert_eq!(resolution.strategy, Some(HeadStrategy::DisassemblyWalk));
    }

    #[test]
    fn test_disassembly_walk_rejects_short_instruction() {
        // Previous instruction ends before the patched byte.
        let dbg = SnapshotDebugger::new()
            .with_memory(0x401000, &[0x90, 0x90, 0x90, 0x90])
            .with_instruction(0x401000, &[0x90], "nop", &[]);
        let resolver = HeadResolver::new(vec![HeadStrategy::DisassemblyWalk], 15);
        let resolution = resolver.resolve(&dbg, 0x401002);
        assert_eq!(resolution.head, 0x401002);
        assert_eq!(resolution.strategy, None);
    }

    #[test]
    fn test_trace_history_scan() {
        let dbg = SnapshotDebugger::new().with_trace_start(0x401000);
        let resolver = HeadResolver::new(vec![HeadStrategy::TraceHistory], 15);
        assert_eq!(resolver.resolve(&dbg, 0x40100e).head, 0x401000);
        // 15 bytes back is one past the scan window.
        assert_eq!(resolver.resolve(&dbg, 0x40100f).head, 0x40100f);
    }

    #[test]
    fn test_trace_history_stops_at_zero() {
        let dbg = SnapshotDebugger::new();
        let resolver = HeadResolver::new(vec![HeadStrategy::TraceHistory], 15);
        assert_eq!(resolver.resolve(&dbg, 3).head, 3);
    }

    #[test]
    fn test_fallback_is_patch_address() {
        let dbg = SnapshotDebugger::new();
        let resolution = HeadResolver::default().resolve(&dbg, 0x401234);
        assert_eq!(
            resolution,
            HeadResolution {
                head: 0x401234,
                strategy: None
            }
        );
    }

    #[test]
    fn test_order_is_respected() {
        let dbg = mov_with_patched_operand()
            .with_trace_start(0x401001)
            .with_source_line(0x401000, 5, "main.c", 1);
        let resolver = HeadResolver::new(
            vec![HeadStrategy::TraceHistory, HeadStrategy::SourceLine],
            15,
        );
        let resolution = resolver.resolve(&dbg, 0x401002);
        assert_eq!(resolution.head, 0x401001);
        assert_eq!(resolution.strategy, Some(HeadStrategy::TraceHistory));
    }
}
