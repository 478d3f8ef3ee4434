use ccpack::backup::{BackupManager, RunLock};
use ccpack::config::{MergeConfig, VerifySeverity, GIB};
use ccpack::container::{self, ArchiveType};
use ccpack::plugin::{self, PLUGIN_EXTENSION};
use ccpack::{Archive2, Merger, StageEvent};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ccpack", about = "Merge Creation Club archives into a few light-master plugins")]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Game Data directory
    #[arg(short, long, default_value = ".")]
    data: PathBuf,
}

#[derive(Args)]
struct Overrides {
    /// Ceiling for general content in GiB
    #[arg(long, value_parser = ceiling_gib())]
    general_ceiling: Option<u64>,
    /// Ceiling for textures in GiB
    #[arg(long, value_parser = ceiling_gib())]
    texture_ceiling: Option<u64>,
    /// Ceiling for sound archives in GiB
    #[arg(long, value_parser = ceiling_gib())]
    audio_ceiling: Option<u64>,
    #[arg(long, value_enum)]
    verify: Option<VerifySeverity>,
    /// Passed to Archive2 as -maxSizeMB
    #[arg(long)]
    max_part_mb: Option<u64>,
    /// plugins.txt to register the merged plugins in
    #[arg(long)]
    load_order: Option<PathBuf>,
}

/// Largest ceiling accepted on the command line, in GiB.
const MAX_CEILING_GIB: u64 = 1024;

fn ceiling_gib() -> clap::builder::RangedU64ValueParser<u64> {
    clap::value_parser!(u64).range(1..=MAX_CEILING_GIB)
}

impl Overrides {
    fn apply(self, config: &mut MergeConfig) {
        if let Some(gib) = self.general_ceiling { config.general_ceiling = gib * GIB; }
        if let Some(gib) = self.texture_ceiling { config.texture_ceiling = gib * GIB; }
        if let Some(gib) = self.audio_ceiling   { config.audio_ceiling = gib * GIB; }
        if let Some(v) = self.verify            { config.verify = v; }
        if let Some(mb) = self.max_part_mb      { config.max_part_mb = Some(mb); }
        if let Some(p) = self.load_order        { config.load_order_file = Some(p); }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the cc*.ba2 files and merge them
    Merge {
        #[command(flatten)]
        target: Target,
        /// Path to Archive2.exe
        #[arg(short, long)]
        tool: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Put the original archives back and remove the merged ones
    Restore {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        load_order: Option<PathBuf>,
        /// Remove the lock file left by a run that was killed
        #[arg(long)]
        force_unlock: bool,
    },
    /// Keep the merged archives and allow a new merge
    Acknowledge {
        #[command(flatten)]
        target: Target,
    },
    /// Show the backup state and the merge candidates
    Status {
        #[command(flatten)]
        target: Target,
    },
    /// Show the planned merged archives without changing anything
    Plan {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Check archive headers
    Verify {
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Dump an archive header or a plugin header
    Inspect {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let mut config = match &cli.config {
        Some(path) => MergeConfig::load(path)?,
        None       => MergeConfig::default(),
    };

    match cli.command {

        // ── Merge ────────────────────────────────────────────────────────────
        Commands::Merge { target, tool, overrides } => {
            overrides.apply(&mut config);
            let tool = Archive2::new(tool, config.grace_period());
            let (tx, rx) = mpsc::channel();
            let progress = thread::spawn(move || {
                for event in rx {
                    print_event(&event);
                }
            });

            let result = Merger::new(&target.data, config, &tool).with_events(tx).run();
            let _ = progress.join();
            let report = result?;

            println!("Snapshot {} (run {})", report.snapshot_id, report.run_id);
            for (out, esl) in report.outputs.iter().zip(&report.descriptors) {
                println!("  {:<44} {:>14} B  {:?}  {}", out.name, out.size, out.status, esl.name);
            }
            for (path, reason) in &report.skipped {
                println!("  skipped {}: {}", path.display(), reason);
            }
            if report.strings_moved > 0 {
                println!("Moved {} strings file(s) to loose files", report.strings_moved);
            }
        }

        // ── Restore ──────────────────────────────────────────────────────────
        Commands::Restore { target, load_order, force_unlock } => {
            if load_order.is_some() {
                config.load_order_file = load_order;
            }
            if force_unlock && RunLock::break_lock(&target.data)? {
                println!("Removed lock file");
            }
            let report = ccpack::restore(&target.data, &config)?;
            println!("Restored snapshot {}: {} file(s) back, {} output(s) removed, {} strings file(s) removed",
                report.id, report.restored, report.outputs_removed.len(), report.strings_removed);
        }

        // ── Acknowledge ──────────────────────────────────────────────────────
        Commands::Acknowledge { target } => {
            let snapshot = BackupManager::new(&target.data).acknowledge()?;
            println!("Snapshot {} acknowledged", snapshot.id);
        }

        // ── Status ───────────────────────────────────────────────────────────
        Commands::Status { target } => {
            match BackupManager::new(&target.data).current()? {
                Some(snap) => {
                    println!("── Snapshot ─────────────────────────────────────────────");
                    println!("  Id        {}", snap.id);
                    println!("  Run       {}", snap.run_id);
                    println!("  Created   {}", snap.created.format("%Y-%m-%d %H:%M:%S UTC"));
                    println!("  State     {:?}", snap.state);
                    println!("  Originals {}", snap.entries.len());
                    println!("  Outputs   {}", snap.outputs.len());
                }
                None => println!("No snapshot"),
            }
            let scan = ccpack::classify::scan_sources(&target.data, &config.source_prefix, &config.merged_name)?;
            println!("{} source archive(s), {} merged file(s), {} skipped",
                scan.sources.len(), scan.merged_outputs.len(), scan.skipped.len());
        }

        // ── Plan ─────────────────────────────────────────────────────────────
        Commands::Plan { target, overrides } => {
            overrides.apply(&mut config);
            let tool = Archive2::new("Archive2.exe", config.grace_period());
            let groups = Merger::new(&target.data, config, &tool).plan_only()?;
            for group in &groups {
                println!("{}  ({} B{})", group.container_name(), group.size,
                    if group.oversized { ", oversized" } else { "" });
                for file in &group.files {
                    println!("    {:<52} {:>14} B", file.container, file.size);
                }
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let mut failed = 0;
            for path in &input {
                match container::verify(path, expected_type(path)) {
                    Ok(())   => println!("  ok    {}", path.display()),
                    Err(e)   => { println!("  FAIL  {e}"); failed += 1; }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} archive(s) failed verification").into());
            }
        }

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { input } => {
            if has_extension(&input, PLUGIN_EXTENSION) {
                let header = plugin::read_descriptor(&input)?;
                println!("── Plugin ───────────────────────────────────────────────");
                println!("  Path         {}", input.display());
                println!("  Flags        0x{:03x}", header.flags);
                println!("  Light master {}", header.is_light_master());
                println!("  Records      {}", header.record_count().unwrap_or(0));
                println!("  Author       {}", header.author().unwrap_or_default());
                println!("  Localized    {}", header.is_localized());
                for sub in &header.subrecords {
                    println!("    {} {:>4} B", sub.tag_str(), sub.data.len());
                }
            } else {
                let header = container::read_header(&input)?;
                let names = container::read_entry_names(&input).unwrap_or_default();
                println!("── Archive ──────────────────────────────────────────────");
                println!("  Path         {}", input.display());
                println!("  Version      {}", header.version);
                println!("  Type         {}", String::from_utf8_lossy(&header.type_tag));
                println!("  Files        {}", header.file_count);
                println!("  Name table   {} B", header.name_table_offset);
                for name in &names {
                    println!("    {name}");
                }
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn print_event(event: &StageEvent) {
    match event {
        StageEvent::Scanned { sources, skipped } => println!("Found {sources} archive(s), skipped {skipped}"),
        StageEvent::SnapshotTaken { id, files }  => println!("Backed up {files} archive(s) to snapshot {id}"),
        StageEvent::Extracted { container }      => println!("  extracted {container}"),
        StageEvent::StringsMoved { count }       => println!("Moved {count} strings file(s)"),
        StageEvent::Planned { category, groups } => println!("Planned {groups} {category} archive(s)"),
        StageEvent::Packing { container, index, total } => println!("[{index}/{total}] packing {container}"),
        StageEvent::Verified { container, status } => println!("  {container}: {status:?}"),
        StageEvent::DescriptorWritten { name }   => println!("  wrote {name}"),
        StageEvent::RolledBack { snapshot }      => println!("Rolled back to snapshot {snapshot}"),
        StageEvent::Completed { outputs }        => println!("Done: {outputs} archive(s)"),
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
}

/// `... - Textures.ba2` holds DX10 data; everything else is general.
fn expected_type(path: &Path) -> ArchiveType {
    let name = path.file_name().map(|n| n.to_string_lossy().to_ascii_lowercase()).unwrap_or_default();
    if name.ends_with(" - textures.ba2") {
        ArchiveType::Textures
    } else {
        ArchiveType::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_out_of_range_is_rejected() {
        for gib in ["0", "1025", "18446744073709551615"] {
            assert!(Cli::try_parse_from(["ccpack", "plan", "--texture-ceiling", gib]).is_err(), "{gib}");
        }
        let cli = Cli::try_parse_from(["ccpack", "plan", "--general-ceiling", "1024"]).unwrap();
        let Commands::Plan { overrides, .. } = cli.command else { panic!("not plan") };
        let mut config = MergeConfig::default();
        overrides.apply(&mut config);
        assert_eq!(config.general_ceiling, 1024 * GIB);
    }
}
