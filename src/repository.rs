//! The patch repository.
//!
//! Holds two views over the debugger's patched bytes: the full set, rebuilt
//! from scratch on every [`PatchRepository::sync`], and the displayed set,
//! the filtered projection the user actually sees. Indices taken by the
//! per-record commands always refer to the displayed set.

use crate::annotate::{AnnotationResolver, AnnotationTarget};
use crate::codec::{self, CodecError, ImportSummary};
use crate::config::{ExportSettings, Settings};
use crate::debugger::{BreakpointKind, Debugger, DebuggerError, RawPatch};
use crate::filter::PatchFilter;
use crate::head::HeadResolver;
use crate::record::{PatchRecord, PatchState};
use std::path::Path;
use thiserror::Error;

/// Bytes read at the head to rebuild the original instruction.
const OLD_DISASM_WINDOW: usize = 120;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("no displayed patch at index {index} ({len} displayed)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Debugger(#[from] DebuggerError),
}

/// A run of contiguous patched bytes in one module, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchGroup {
    pub address: u64,
    pub module: String,
    pub old_bytes: Vec<u8>,
    pub new_bytes: Vec<u8>,
}

impl PatchGroup {
    fn start(patch: RawPatch) -> Self {
        Self {
            address: patch.address,
            module: patch.module,
            old_bytes: vec![patch.old_byte],
            new_bytes: vec![patch.new_byte],
        }
    }

    pub fn len(&self) -> usize {
        self.new_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new_bytes.is_empty()
    }

    /// Whether `patch` is the byte right after this group, in the same module.
    fn continues_with(&self, patch: &RawPatch) -> bool {
        patch.module == self.module
            && self
                .address
                .checked_add(self.len() as u64)
                .is_some_and(|next| next == patch.address)
    }

    fn push(&mut self, patch: RawPatch) {
        self.old_bytes.push(patch.old_byte);
        self.new_bytes.push(patch.new_byte);
    }
}

/// Group single-byte patches into contiguous same-module runs, by address.
pub fn group(mut raw: Vec<RawPatch>) -> Vec<PatchGroup> {
    raw.sort_by_key(|patch| patch.address);

    let mut groups: Vec<PatchGroup> = Vec::new();
    for patch in raw {
        match groups.last_mut() {
            Some(current) if current.continues_with(&patch) => current.push(patch),
            _ => groups.push(PatchGroup::start(patch)),
        }
    }
    groups
}

/// Aggregate result of a bulk command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointToggle {
    Set,
    Cleared,
}

/// Where a presentation layer should jump for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowTarget {
    /// Instruction start to disassemble from.
    pub head: u64,
    /// Patched byte to highlight.
    pub address: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PatchRepository {
    all: Vec<PatchRecord>,
    displayed: Vec<PatchRecord>,
    filter: PatchFilter,
    heads: HeadResolver,
    annotations: AnnotationResolver,
}

impl PatchRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            heads: HeadResolver::from_settings(&settings.resolver),
            annotations: AnnotationResolver::from_settings(&settings.annotation),
            ..Self::default()
        }
    }

    /// Rebuild the full set from the debugger and re-apply the filter.
    ///
    /// A debugger that cannot enumerate patches yields an empty set.
    /// Returns the number of records in the full set.
    pub fn sync<D: Debugger + ?Sized>(&mut self, dbg: &D) -> usize {
        let raw = match dbg.enumerate_patches() {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("cannot enumerate patches: {err}");
                Vec::new()
            }
        };
        let bytes = raw.len();

        self.all = group(raw)
            .into_iter()
            .map(|group| self.finalize(dbg, group))
            .collect();
        self.refilter();

        log::info!(
            "synced {bytes} patched bytes into {} records ({} displayed)",
            self.all.len(),
            self.displayed.len()
        );
        self.all.len()
    }

    fn finalize<D: Debugger + ?Sized>(&self, dbg: &D, group: PatchGroup) -> PatchRecord {
        let head = self.heads.resolve(dbg, group.address).head;

        let live = dbg.disassemble_at(head);
        let disasm = live.as_ref().map(|insn| insn.text.clone()).unwrap_or_default();

        // Bytes past the window do not affect the instruction at `head`.
        let lead = usize::try_from(group.address - head).unwrap_or(usize::MAX);
        let span = lead.saturating_add(group.len()).min(OLD_DISASM_WINDOW);
        let mut window = read_window(dbg, head, span);
        for (offset, old) in group.old_bytes.iter().enumerate() {
            if let Some(slot) = window.get_mut(lead.saturating_add(offset)) {
                *slot = *old;
            }
        }
        let old_disasm = dbg
            .disassemble_bytes(&window, head)
            .map(|insn| insn.text)
            .unwrap_or_default();

        let comment = self
            .annotations
            .resolve(
                dbg,
                AnnotationTarget {
                    head,
                    address: group.address,
                    instruction: live.as_ref(),
                },
            )
            .map(|note| note.text)
            .unwrap_or_default();

        let mut record = PatchRecord {
            address: group.address,
            head,
            old_bytes: group.old_bytes,
            new_bytes: group.new_bytes,
            old_disasm,
            disasm,
            comment,
            module: group.module,
            active: false,
        };
        record.active = record.state(dbg) == PatchState::Applied;
        record
    }

    fn refilter(&mut self) {
        self.displayed = self.filter.apply(&self.all);
    }

    /// Replace the filter and recompute the displayed set.
    pub fn set_filter(&mut self, filter: PatchFilter) {
        self.filter = filter;
        self.refilter();
    }

    pub fn filter(&self) -> &PatchFilter {
        &self.filter
    }

    pub fn all(&self) -> &[PatchRecord] {
        &self.all
    }

    pub fn displayed(&self) -> &[PatchRecord] {
        &self.displayed
    }

    pub fn get(&self, index: usize) -> Option<&PatchRecord> {
        self.displayed.get(index)
    }

    /// Hide a record from the displayed set. Debugger memory is untouched
    /// and the record comes back on the next sync.
    pub fn remove(&mut self, index: usize) -> Option<PatchRecord> {
        (index < self.displayed.len()).then(|| self.displayed.remove(index))
    }

    fn record(&self, index: usize) -> Result<&PatchRecord, RepositoryError> {
        self.displayed
            .get(index)
            .ok_or(RepositoryError::IndexOutOfRange {
                index,
                len: self.displayed.len(),
            })
    }

    pub fn state<D: Debugger + ?Sized>(&self, dbg: &D, index: usize) -> Option<PatchState> {
        self.get(index).map(|record| record.state(dbg))
    }

    pub fn follow_target(&self, index: usize) -> Option<FollowTarget> {
        self.get(index).map(|record| FollowTarget {
            head: record.head,
            address: record.address,
        })
    }

    /// Write the record's patched bytes back. `Ok(false)` if any byte failed.
    ///
    /// The displayed set is not refreshed; call [`sync`](Self::sync) for that.
    pub fn apply<D: Debugger + ?Sized>(
        &self,
        dbg: &mut D,
        index: usize,
    ) -> Result<bool, RepositoryError> {
        let record = self.record(index)?;
        write_bytes(dbg, record.bytes().map(|(address, _, new)| (address, new)))
    }

    /// Write the record's original bytes back. `Ok(false)` if any byte failed.
    pub fn restore<D: Debugger + ?Sized>(
        &self,
        dbg: &mut D,
        index: usize,
    ) -> Result<bool, RepositoryError> {
        let record = self.record(index)?;
        write_bytes(dbg, record.bytes().map(|(address, old, _)| (address, old)))
    }

    /// Restore every displayed record, then resync.
    pub fn restore_displayed<D: Debugger + ?Sized>(
        &mut self,
        dbg: &mut D,
    ) -> Result<BatchSummary, RepositoryError> {
        let mut summary = BatchSummary::default();
        for record in &self.displayed {
            if write_bytes(dbg, record.bytes().map(|(address, old, _)| (address, old)))? {
                summary.succeeded += 1;
            } else {
                log::warn!("could not fully restore patch at {:#x}", record.address);
                summary.failed += 1;
            }
        }
        log::info!(
            "restored {} patches, {} failed",
            summary.succeeded,
            summary.failed
        );
        self.sync(dbg);
        Ok(summary)
    }

    /// Set a breakpoint at the record's head, or clear the one already there.
    pub fn toggle_breakpoint<D: Debugger + ?Sized>(
        &self,
        dbg: &mut D,
        index: usize,
    ) -> Result<BreakpointToggle, RepositoryError> {
        let head = self.record(index)?.head;
        Ok(toggle_at(dbg, head)?)
    }

    pub fn toggle_displayed_breakpoints<D: Debugger + ?Sized>(
        &self,
        dbg: &mut D,
    ) -> Result<BatchSummary, RepositoryError> {
        let mut summary = BatchSummary::default();
        for record in &self.displayed {
            match toggle_at(dbg, record.head) {
                Ok(_) => summary.succeeded += 1,
                Err(err @ DebuggerError::Unavailable(_)) => return Err(err.into()),
                Err(err) => {
                    log::warn!("{err}");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Render the displayed set as patch file text.
    pub fn export(&self, settings: &ExportSettings) -> String {
        codec::export(&self.displayed, settings)
    }

    pub fn export_to_path(
        &self,
        path: impl AsRef<Path>,
        settings: &ExportSettings,
    ) -> Result<usize, CodecError> {
        codec::export_to_path(path, &self.displayed, settings)
    }

    /// Import patch text, then resync so the new bytes show up.
    pub fn import<D: Debugger + ?Sized>(
        &mut self,
        dbg: &mut D,
        text: &str,
    ) -> Result<ImportSummary, CodecError> {
        let summary = codec::import(dbg, text)?;
        self.sync(dbg);
        Ok(summary)
    }

    pub fn import_file<D: Debugger + ?Sized>(
        &mut self,
        dbg: &mut D,
        path: impl AsRef<Path>,
    ) -> Result<ImportSummary, CodecError> {
        let summary = codec::import_file(dbg, path)?;
        self.sync(dbg);
        Ok(summary)
    }
}

/// Bytes at `head` covering at least `span` (itself at most the window),
/// clipped at unreadable memory.
fn read_window<D: Debugger + ?Sized>(dbg: &D, head: u64, span: usize) -> Vec<u8> {
    let mut window = match dbg.read_memory(head, OLD_DISASM_WINDOW) {
        Ok(bytes) => bytes,
        Err(_) => (head..)
            .take(OLD_DISASM_WINDOW)
            .map_while(|address| dbg.read_memory(address, 1).ok())
            .flatten()
            .collect(),
    };
    if window.len() < span {
        window.resize(span, 0);
    }
    window
}

fn write_bytes<D: Debugger + ?Sized>(
    dbg: &mut D,
    bytes: impl Iterator<Item = (u64, u8)>,
) -> Result<bool, RepositoryError> {
    let mut complete = true;
    for (address, byte) in bytes {
        match dbg.write_patch_byte(address, byte) {
            Ok(()) => {}
            Err(err @ DebuggerError::Unavailable(_)) => return Err(err.into()),
            Err(err) => {
                log::debug!("{err}");
                complete = false;
            }
        }
    }
    Ok(complete)
}

fn toggle_at<D: Debugger + ?Sized>(
    dbg: &mut D,
    head: u64,
) -> Result<BreakpointToggle, DebuggerError> {
    if dbg.breakpoint_kind_at(head) != BreakpointKind::None {
        dbg.clear_breakpoint(head)?;
        log::debug!("cleared breakpoint at {head:#x}");
        Ok(BreakpointToggle::Cleared)
    } else {
        dbg.set_breakpoint(head)?;
        log::debug!("set breakpoint at {head:#x}");
        Ok(BreakpointToggle::Set)
    }
}
