//! Patch King: patch synchronization and annotation for debugger byte patches
//!
//! Debuggers track patches as single bytes. This crate turns that flat list
//! into logical patches a human can review: contiguous bytes are grouped,
//! each group is mapped to the instruction that contains it, and the group
//! is annotated from the debugger's comment, label and string databases.
//!
//! # Architecture
//!
//! The host debugger is abstracted by the [`Debugger`] trait. Everything
//! else depends only on that trait:
//!
//! - [`PatchRepository`] groups raw bytes into [`PatchRecord`]s and owns the
//!   full and displayed sets
//! - [`HeadResolver`] finds the instruction start for each group
//! - [`AnnotationResolver`] picks one note per group
//! - [`PatchFilter`] derives the displayed set with two regex predicates
//! - [`codec`] reads and writes `ADDR:OLD->NEW` patch files
//!
//! [`SnapshotDebugger`] is a complete offline host backed by a JSON file,
//! used by the command-line tool and the tests.
//!
//! # Example
//!
//! ```no_run
//! use patch_king::{PatchFilter, PatchRepository, SnapshotDebugger};
//!
//! let dbg = SnapshotDebugger::from_path("session.json")?;
//! let mut repo = PatchRepository::new();
//! repo.sync(&dbg);
//! repo.set_filter(PatchFilter::new("", "^jmp"));
//!
//! for record in repo.displayed() {
//!     println!("{:#x}: {} -> {}", record.address, record.old_disasm, record.disasm);
//! }
//! # Ok::<(), patch_king::SnapshotError>(())
//! ```

pub mod annotate;
pub mod cache;
pub mod codec;
pub mod config;
pub mod debugger;
pub mod filter;
pub mod head;
pub mod record;
pub mod repository;
pub mod snapshot;

// Re-exports
pub use annotate::{Annotation, AnnotationResolver, AnnotationStrategy, AnnotationTarget};
pub use codec::{CodecError, ImportSummary, LineError, PatchLine};
pub use config::{load_from_path, load_from_str, ConfigError, Settings};
pub use debugger::{
    BreakpointKind, Capability, Debugger, DebuggerError, HostText, Instruction, Operand,
    RawPatch, SourceLine, TraceKind,
};
pub use filter::{CompiledFilter, FilterError, PatchFilter};
pub use head::{HeadResolution, HeadResolver, HeadStrategy};
pub use record::{format_bytes, PatchRecord, PatchState};
pub use repository::{
    BatchSummary, BreakpointToggle, FollowTarget, PatchRepository, RepositoryError,
};
pub use snapshot::{SnapshotDebugger, SnapshotError};
