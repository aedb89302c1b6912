//! Text patch files.
//!
//! One record per byte:
//!
//! ```text
//! # comment
//! 0000000000401000:74->EB
//! ```
//!
//! Addresses and bytes are unprefixed, case-insensitive hex. On import the
//! old byte may be omitted (`ADDR:NEW`). Lines that are blank or start with
//! `#`, `;` or `>` are ignored.
//!
//! An imported address is not necessarily a live virtual address: files
//! written by other tools often carry RVAs or raw file offsets. Each line is
//! therefore tried as a raw address, then relative to the image base, then
//! as a file offset of the main module, and counts as applied as soon as
//! one of those writes succeeds.

use crate::config::ExportSettings;
use crate::debugger::{Capability, Debugger, DebuggerError};
use crate::record::PatchRecord;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const COMMENT_PREFIXES: [char; 3] = ['#', ';', '>'];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to read patch file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write patch file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot import patches: debugger does not provide {0}")]
    Unavailable(Capability),
}

/// Why a single import line was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("missing ':' separator")]
    MissingSeparator,

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid byte '{0}'")]
    InvalidByte(String),
}

/// One parsed import line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchLine {
    pub address: u64,
    /// Absent for the `ADDR:NEW` form. Only checked for syntax.
    pub old_byte: Option<u8>,
    pub new_byte: u8,
}

/// Parse one line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<PatchLine>, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(COMMENT_PREFIXES) {
        return Ok(None);
    }

    let (address, value) = line.split_once(':').ok_or(LineError::MissingSeparator)?;
    let address = parse_hex_u64(address).ok_or_else(|| LineError::InvalidAddress(address.trim().to_string()))?;

    let (old_byte, new_byte) = match value.split_once("->") {
        Some((old, new)) => (Some(parse_byte(old)?), parse_byte(new)?),
        None => (None, parse_byte(value)?),
    };

    Ok(Some(PatchLine {
        address,
        old_byte,
        new_byte,
    }))
}

fn strip_hex_prefix(text: &str) -> &str {
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text)
}

fn parse_hex_u64(text: &str) -> Option<u64> {
    let digits = strip_hex_prefix(text.trim());
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

fn parse_byte(text: &str) -> Result<u8, LineError> {
    let digits = strip_hex_prefix(text.trim());
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(LineError::InvalidByte(text.trim().to_string()));
    }
    u8::from_str_radix(digits, 16).map_err(|_| LineError::InvalidByte(text.trim().to_string()))
}

/// Render records as patch file text, one line per byte, in record order.
pub fn export(records: &[PatchRecord], settings: &ExportSettings) -> String {
    let mut out = String::new();
    for line in &settings.header {
        out.push_str("# ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');

    let width = settings.address_width;
    for record in records {
        for (address, old, new) in record.bytes() {
            out.push_str(&format!("{address:0width$X}:{old:02X}->{new:02X}\n"));
        }
    }
    out
}

/// Export to a file atomically. Returns the number of byte lines written.
pub fn export_to_path(
    path: impl AsRef<Path>,
    records: &[PatchRecord],
    settings: &ExportSettings,
) -> Result<usize, CodecError> {
    let path = path.as_ref();
    let text = export(records, settings);
    atomic_write(path, text.as_bytes()).map_err(|source| CodecError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let lines = records.iter().map(PatchRecord::len).sum();
    log::info!("exported {lines} patched bytes to {}", path.display());
    Ok(lines)
}

/// How an imported address is mapped to a live address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStrategy {
    /// The address as written.
    Raw,
    /// Image base plus the address (RVA).
    ImageRelative,
    /// File offset into the main module.
    FileOffset,
}

impl AddressStrategy {
    pub const ORDER: [AddressStrategy; 3] = [
        AddressStrategy::Raw,
        AddressStrategy::ImageRelative,
        AddressStrategy::FileOffset,
    ];
}

/// Where the image base came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageBaseSource {
    /// The host's main-module query.
    ModuleApi,
    /// The `imagebase` expression.
    Expression,
    /// The module containing the current instruction pointer.
    InstructionPointer,
}

impl ImageBaseSource {
    pub const ORDER: [ImageBaseSource; 3] = [
        ImageBaseSource::ModuleApi,
        ImageBaseSource::Expression,
        ImageBaseSource::InstructionPointer,
    ];

    fn try_resolve<D: Debugger + ?Sized>(self, dbg: &D) -> Option<u64> {
        let base = match self {
            ImageBaseSource::ModuleApi => dbg.main_module_base(),
            ImageBaseSource::Expression => dbg.evaluate("imagebase"),
            ImageBaseSource::InstructionPointer => {
                let cip = dbg.evaluate("cip").filter(|cip| *cip != 0)?;
                dbg.module_base_of(cip)
            }
        };
        base.filter(|base| *base != 0)
    }
}

/// Per-import address context, resolved once before the first line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportContext {
    pub image_base: Option<u64>,
    pub main_module: Option<String>,
}

impl ImportContext {
    pub fn resolve<D: Debugger + ?Sized>(dbg: &D) -> Self {
        let image_base = ImageBaseSource::ORDER.iter().find_map(|source| {
            let base = source.try_resolve(dbg)?;
            log::debug!("image base {base:#x} from {source:?}");
            Some(base)
        });
        let main_module = image_base
            .and_then(|base| dbg.module_name_of(base))
            .filter(|name| !name.is_empty());
        Self {
            image_base,
            main_module,
        }
    }

    /// Live address for `address` under `strategy`, if the strategy applies.
    pub fn candidate<D: Debugger + ?Sized>(
        &self,
        dbg: &D,
        strategy: AddressStrategy,
        address: u64,
    ) -> Option<u64> {
        match strategy {
            AddressStrategy::Raw => Some(address),
            AddressStrategy::ImageRelative => self.image_base?.checked_add(address),
            AddressStrategy::FileOffset => {
                let module = self.main_module.as_deref()?;
                dbg.file_offset_to_virtual_address(module, address)
                    .filter(|va| *va != 0)
            }
        }
    }
}

/// Aggregate result of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub applied: usize,
    pub failed: usize,
    pub image_base: Option<u64>,
}

/// Apply every line of `text` to the debugger.
///
/// Malformed lines and lines no strategy could write are counted as failed
/// and skipped. The only hard error is a debugger without a write
/// capability, which is reported before any line is looked at.
pub fn import<D: Debugger + ?Sized>(dbg: &mut D, text: &str) -> Result<ImportSummary, CodecError> {
    if !dbg.can_write_patches() {
        log::warn!("cannot import: host has no {}", Capability::WritePatchByte);
        return Err(CodecError::Unavailable(Capability::WritePatchByte));
    }

    let ctx = ImportContext::resolve(dbg);
    let mut summary = ImportSummary {
        image_base: ctx.image_base,
        ..ImportSummary::default()
    };
    log::info!(
        "importing patches (image base: {}, main module: {})",
        ctx.image_base
            .map(|base| format!("{base:#x}"))
            .unwrap_or_else(|| "unknown".to_string()),
        ctx.main_module.as_deref().unwrap_or("unknown")
    );

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let parsed = match parse_line(line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(err) => {
                log::warn!("line {line_no}: {err} in '{}'", line.trim());
                summary.failed += 1;
                continue;
            }
        };

        if write_line(dbg, &ctx, &parsed, line_no)? {
            summary.applied += 1;
        } else {
            log::warn!("line {line_no}: no strategy could write {:#x}", parsed.address);
            summary.failed += 1;
        }
    }

    log::info!(
        "import finished: {} applied, {} failed",
        summary.applied,
        summary.failed
    );
    Ok(summary)
}

fn write_line<D: Debugger + ?Sized>(
    dbg: &mut D,
    ctx: &ImportContext,
    line: &PatchLine,
    line_no: usize,
) -> Result<bool, CodecError> {
    for strategy in AddressStrategy::ORDER {
        let Some(target) = ctx.candidate(dbg, strategy, line.address) else {
            continue;
        };
        match dbg.write_patch_byte(target, line.new_byte) {
            Ok(()) => {
                log::debug!(
                    "line {line_no}: wrote {:02X} at {target:#x} via {strategy:?}",
                    line.new_byte
                );
                return Ok(true);
            }
            Err(DebuggerError::Unavailable(capability)) => {
                return Err(CodecError::Unavailable(capability));
            }
            Err(err) => log::trace!("line {line_no}: {strategy:?} failed: {err}"),
        }
    }
    Ok(false)
}

/// Read and import a patch file.
pub fn import_file<D: Debugger + ?Sized>(
    dbg: &mut D,
    path: impl AsRef<Path>,
) -> Result<ImportSummary, CodecError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| CodecError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    import(dbg, &text)
}

/// Atomic file write: tempfile + fsync + rename.
///
/// Either the full write succeeds or the target is left untouched.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    // Same directory keeps the rename on one filesystem.
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotDebugger;

    fn process() -> SnapshotDebugger {
        SnapshotDebugger::new()
            .with_module("app.exe", 0x400000, 0x10000)
            .with_section("app.exe", 0x1000, 0x400, 0x1000)
            .with_main_module("app.exe")
            .with_memory(0x401000, &[0x90; 0x20])
    }

    #[test]
    fn test_parse_full_form() {
        let line = parse_line("401000:90->CC").unwrap().unwrap();
        assert_eq!(
            line,
            PatchLine {
                address: 0x401000,
                old_byte: Some(0x90),
                new_byte: 0xcc
            }
        );
    }

    #[test]
    fn test_parse_short_form_is_new_byte() {
        let line = parse_line("  0040100a:eb  ").unwrap().unwrap();
        assert_eq!(line.address, 0x40100a);
        assert_eq!(line.old_byte, None);
        assert_eq!(line.new_byte, 0xeb);
    }

    #[test]
    fn test_parse_skips_comments() {
        for line in ["", "   ", "# header", "; note", "> quoted", "#401000:90->CC"] {
            assert_eq!(parse_line(line), Ok(None), "{line:?}");
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_line("401000"), Err(LineError::MissingSeparator));
        assert!(matches!(
            parse_line("zzzz:90->CC"),
            Err(LineError::InvalidAddress(_))
        ));
        assert!(matches!(parse_line("401000:90->"), Err(LineError::InvalidByte(_))));
        assert!(matches!(parse_line("401000:1FF"), Err(LineError::InvalidByte(_))));
        assert!(matches!(
            parse_line("11112222333344445:90->CC"),
            Err(LineError::InvalidAddress(_))
        ));
        assert!(matches!(parse_line("401000:+5"), Err(LineError::InvalidByte(_))));
    }

    #[test]
    fn test_export_one_line_per_byte() {
        let record = PatchRecord {
            address: 0x401000,
            head: 0x401000,
            old_bytes: vec![0x74, 0x05],
            new_bytes: vec![0xeb, 0x05],
            old_disasm: String::new(),
            disasm: String::new(),
            comment: String::new(),
            module: "app.exe".to_string(),
            active: true,
        };
        let text = export(&[record], &ExportSettings::default());
        let body: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(
            body,
            vec!["", "0000000000401000:74->EB", "0000000000401001:05->05"]
        );
    }

    #[test]
    fn test_import_raw_address() {
        let mut dbg = SnapshotDebugger::new().with_memory(0x401000, &[0x90]);
        let summary = import(&mut dbg, "401000:90->CC\n").unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.image_base, None);
        assert_eq!(dbg.read_memory(0x401000, 1).unwrap(), vec![0xcc]);
    }

    #[test]
    fn test_import_counts_bad_lines() {
        let mut dbg = process();
        let summary = import(&mut dbg, "zzzz:90->CC\n401000:90->CC\n").unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_import_falls_back_to_rva() {
        let mut dbg = process();
        let summary = import(&mut dbg, "1005:90->CC").unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.image_base, Some(0x400000));
        assert_eq!(dbg.read_memory(0x401005, 1).unwrap(), vec![0xcc]);
    }

    #[test]
    fn test_import_falls_back_to_file_offset() {
        // 0x410 is neither mapped nor a mapped RVA, but is a file offset.
        let mut dbg = process();
        let summary = import(&mut dbg, "410:90->EB").unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(dbg.read_memory(0x401010, 1).unwrap(), vec![0xeb]);
    }

    #[test]
    fn test_import_unresolvable_address_fails() {
        let mut dbg = process();
        let summary = import(&mut dbg, "7fff0000:90->CC").unwrap();
        assert_eq!(summary.applied, 0);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_image_base_from_instruction_pointer() {
        let dbg = SnapshotDebugger::new()
            .with_module("app.exe", 0x400000, 0x10000)
            .with_cip(0x401234);
        let ctx = ImportContext::resolve(&dbg);
        assert_eq!(ctx.image_base, Some(0x400000));
        assert_eq!(ctx.main_module.as_deref(), Some("app.exe"));
    }

    struct ReadOnly;
    impl Debugger for ReadOnly {}

    #[test]
    fn test_import_without_write_capability_is_hard_error() {
        let err = import(&mut ReadOnly, "401000:90->CC").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Unavailable(Capability::WritePatchByte)
        ));
    }

    #[test]
    fn test_import_without_write_capability_fails_with_no_writable_line() {
        let err = import(&mut ReadOnly, "# header only\nzzzz:90->CC\n").unwrap_err();
        assert!(matches!(
            err,
            CodecError::Unavailable(Capability::WritePatchByte)
        ));

        let err = import(&mut ReadOnly, "").unwrap_err();
        assert!(matches!(err, CodecError::Unavailable(_)));
    }

    #[test]
    fn test_import_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut dbg = process();
        let err = import_file(&mut dbg, dir.path().join("missing.1337")).unwrap_err();
        assert!(matches!(err, CodecError::Read { .. }));
    }

    #[test]
    fn test_atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.patch");
        fs::write(&path, "old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }
}
