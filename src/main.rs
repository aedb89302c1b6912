use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use patch_king::config::{load_or_default, Settings};
use patch_king::{
    format_bytes, BreakpointKind, BreakpointToggle, Debugger, PatchFilter, PatchRecord, PatchRepository,
    PatchState, SnapshotDebugger,
};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "patch-king")]
#[command(about = "Review, filter, export and import debugger byte patches", long_about = None)]
#[command(version)]
struct Cli {
    /// Debugger snapshot (JSON) to operate on
    #[arg(short, long)]
    snapshot: PathBuf,

    /// Settings file (defaults to $PATCH_KING_CONFIG, then ~/.config/patch-king.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    filter: FilterArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FilterArgs {
    /// Regex matched against the original disassembly and the comment
    #[arg(long, default_value = "")]
    old: String,

    /// Regex matched against the current disassembly
    #[arg(long, default_value = "")]
    new: String,

    /// Show records that do NOT match --old
    #[arg(long)]
    invert_old: bool,

    /// Show records that do NOT match --new
    #[arg(long)]
    invert_new: bool,
}

impl FilterArgs {
    fn to_filter(&self) -> PatchFilter {
        PatchFilter::new(&self.old, &self.new).inverted(self.invert_old, self.invert_new)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List displayed patches
    List,

    /// Show one displayed patch in detail
    Show {
        /// Index in the displayed list
        index: usize,
    },

    /// Export displayed patches to a patch file
    Export {
        /// Output file
        out: PathBuf,
    },

    /// Import a patch file, or every patch file in a directory
    Import {
        /// Patch file or directory
        path: PathBuf,
    },

    /// Restore original bytes of every displayed patch
    RestoreAll,

    /// Toggle a breakpoint at one patch's instruction, or at every displayed one
    ToggleBp {
        /// Index in the displayed list (all displayed patches if omitted)
        index: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    let settings = load_or_default(cli.config.as_deref())?;
    let mut dbg = SnapshotDebugger::from_path(&cli.snapshot)
        .with_context(|| format!("loading snapshot {}", cli.snapshot.display()))?;

    let mut repo = PatchRepository::from_settings(&settings);
    repo.set_filter(cli.filter.to_filter());
    repo.sync(&dbg);

    match cli.command {
        Commands::List => cmd_list(&repo, &dbg),
        Commands::Show { index } => cmd_show(&repo, &dbg, index),
        Commands::Export { out } => cmd_export(&repo, &settings, &out),
        Commands::Import { path } => {
            cmd_import(&mut repo, &mut dbg, &settings, &path, &cli.snapshot)
        }
        Commands::RestoreAll => cmd_restore_all(&mut repo, &mut dbg, &cli.snapshot),
        Commands::ToggleBp { index } => cmd_toggle_bp(&repo, &mut dbg, index, &cli.snapshot),
    }
}

fn colored_state(state: PatchState) -> colored::ColoredString {
    match state {
        PatchState::Applied => state.to_string().green(),
        PatchState::Reverted => state.to_string().yellow(),
        PatchState::Unknown => state.to_string().red(),
    }
}

fn breakpoint_marker(kind: BreakpointKind) -> String {
    let name = match kind {
        BreakpointKind::None => return String::new(),
        BreakpointKind::Software => "bp",
        BreakpointKind::Hardware => "hw bp",
        BreakpointKind::Memory => "mem bp",
    };
    format!("  [{}]", name.magenta())
}

fn print_record(index: usize, record: &PatchRecord, state: PatchState, bp: BreakpointKind) {
    println!(
        "{:>4}  {}  {}  {} -> {}  [{}]{}",
        index,
        format!("{:016X}", record.address).bold(),
        format!("(head {:016X})", record.head).dimmed(),
        format_bytes(&record.old_bytes).red(),
        format_bytes(&record.new_bytes).green(),
        colored_state(state),
        breakpoint_marker(bp)
    );
    println!("        {} {}", "old:".dimmed(), record.old_disasm);
    println!("        {} {}", "new:".dimmed(), record.disasm);
    if !record.comment.is_empty() {
        println!("        {} {}", ";".cyan(), record.comment.cyan());
    }
}

fn cmd_list(repo: &PatchRepository, dbg: &SnapshotDebugger) -> Result<()> {
    if repo.displayed().is_empty() {
        println!("{}", "No patches".yellow());
        return Ok(());
    }

    for (index, record) in repo.displayed().iter().enumerate() {
        print_record(
            index,
            record,
            record.state(dbg),
            dbg.breakpoint_kind_at(record.head),
        );
    }

    println!();
    println!(
        "{} of {} patches shown",
        repo.displayed().len(),
        repo.all().len()
    );
    Ok(())
}

fn cmd_show(repo: &PatchRepository, dbg: &SnapshotDebugger, index: usize) -> Result<()> {
    let Some(record) = repo.get(index) else {
        anyhow::bail!(
            "No displayed patch at index {} ({} displayed)",
            index,
            repo.displayed().len()
        );
    };

    print_record(
        index,
        record,
        record.state(dbg),
        dbg.breakpoint_kind_at(record.head),
    );
    println!("        {} {}", "module:".dimmed(), record.module);
    println!("        {} {}", "size:".dimmed(), record.len());

    if let Some(insn) = dbg.disassemble_at(record.head) {
        for (n, operand) in insn.operands.iter().enumerate() {
            let kind = if operand.is_address { "address" } else { "value" };
            println!(
                "        {} {:#x} ({})",
                format!("operand {n}:").dimmed(),
                operand.value,
                kind
            );
        }
    }
    Ok(())
}

fn cmd_export(repo: &PatchRepository, settings: &Settings, out: &Path) -> Result<()> {
    let lines = repo.export_to_path(out, &settings.export)?;
    println!(
        "{} Exported {} bytes from {} patches to {}",
        "✓".green(),
        lines,
        repo.displayed().len(),
        out.display()
    );
    Ok(())
}

/// Patch files directly inside `dir` with a known extension, sorted.
fn discover_patch_files(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1) {
        let entry = entry?;
        let known = entry
            .path()
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
        if entry.file_type().is_file() && known {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort();

    if files.is_empty() {
        anyhow::bail!(
            "No patch files ({}) found in {}",
            extensions.join(", "),
            dir.display()
        );
    }
    Ok(files)
}

fn cmd_import(
    repo: &mut PatchRepository,
    dbg: &mut SnapshotDebugger,
    settings: &Settings,
    path: &Path,
    snapshot: &Path,
) -> Result<()> {
    let files = if path.is_dir() {
        discover_patch_files(path, &settings.import.extensions)?
    } else {
        vec![path.to_path_buf()]
    };

    let mut applied = 0;
    let mut failed = 0;
    let mut image_base = None;

    for file in &files {
        println!("Importing {}...", file.display());
        let summary = repo.import_file(dbg, file)?;
        applied += summary.applied;
        failed += summary.failed;
        image_base = image_base.or(summary.image_base);
    }

    dbg.save(snapshot)
        .with_context(|| format!("saving snapshot {}", snapshot.display()))?;

    println!();
    println!("{}", "Summary:".bold());
    match image_base {
        Some(base) => println!("  image base {}", format!("{base:#x}").cyan()),
        None => println!("  image base {}", "unknown".yellow()),
    }
    println!("  {} applied", format!("{applied}").green());
    println!("  {} failed", format!("{failed}").red());
    println!("  {} patches now in session", repo.all().len());

    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_restore_all(
    repo: &mut PatchRepository,
    dbg: &mut SnapshotDebugger,
    snapshot: &Path,
) -> Result<()> {
    let summary = repo.restore_displayed(dbg)?;
    dbg.save(snapshot)
        .with_context(|| format!("saving snapshot {}", snapshot.display()))?;

    println!("{}", "Summary:".bold());
    println!("  {} restored", format!("{}", summary.succeeded).green());
    println!("  {} failed", format!("{}", summary.failed).red());
    println!("  {} patches remaining", repo.all().len());
    Ok(())
}

fn cmd_toggle_bp(
    repo: &PatchRepository,
    dbg: &mut SnapshotDebugger,
    index: Option<usize>,
    snapshot: &Path,
) -> Result<()> {
    match index {
        Some(index) => {
            let toggle = repo.toggle_breakpoint(dbg, index)?;
            let head = repo.follow_target(index).map(|t| t.head).unwrap_or_default();
            match toggle {
                BreakpointToggle::Set => {
                    println!("{} Breakpoint set at {:#x}", "✓".green(), head)
                }
                BreakpointToggle::Cleared => {
                    println!("{} Breakpoint cleared at {:#x}", "⊙".yellow(), head)
                }
            }
        }
        None => {
            let summary = repo.toggle_displayed_breakpoints(dbg)?;
            println!(
                "{} Toggled {} breakpoints, {} failed",
                "✓".green(),
                summary.succeeded,
                summary.failed
            );
        }
    }

    dbg.save(snapshot)
        .with_context(|| format!("saving snapshot {}", snapshot.display()))?;
    Ok(())
}
