// Takeout Migrate CLI binary

use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use clap::{Parser, Subcommand};
use anyhow::Result;
use tracing_subscriber::EnvFilter;

use takeout_migrate_lib::catalog::ItemStatus;
use takeout_migrate_lib::config::{load_file_config, CliOverrides, RunMode, Settings};
use takeout_migrate_lib::constants::{EXIT_FATAL, EXIT_OK};
use takeout_migrate_lib::jobs::{install_interrupt_handler, CancelFlag};
use takeout_migrate_lib::pipeline::report::render_summary;
use takeout_migrate_lib::pipeline::{self, OperatorChoice, OperatorPrompt, Pipeline};
use takeout_migrate_lib::tools::SystemRunner;

#[derive(Parser)]
#[command(name = "takeout-migrate")]
#[command(about = "Move a Google Takeout photo export into a photo library", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./config.toml, then the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (or some of its phases)
    Run {
        /// Directory holding the Takeout zip files
        #[arg(long)]
        source_dir: Option<PathBuf>,
        /// Working directory for extracted archives and run state
        #[arg(long)]
        work_dir: Option<PathBuf>,
        /// Directory receiving the processed media tree
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Phases to run; asks interactively when omitted on a terminal
        #[arg(short, long, value_enum)]
        phase: Option<RunMode>,
        /// Report what would happen without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Only process items in this album (repeatable)
        #[arg(long = "album")]
        albums: Vec<String>,
        /// Leave out items that are only in this album (repeatable)
        #[arg(long = "exclude-album")]
        exclude_albums: Vec<String>,
        /// Parallel workers for extraction and metadata
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show the saved state of a working directory
    Status {
        /// Working directory (defaults to the config file's work_dir)
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },

    /// Set the saved state aside so the next run starts over
    Reset {
        /// Working directory (defaults to the config file's work_dir)
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            source_dir,
            work_dir,
            output_dir,
            phase,
            dry_run,
            albums,
            exclude_albums,
            workers,
        } => {
            let overrides = CliOverrides {
                source_dir,
                work_dir,
                output_dir,
                phase,
                dry_run,
                albums,
                exclude_albums,
                workers,
            };
            cmd_run(cli.config, overrides)
        }
        Commands::Status { work_dir } => cmd_status(cli.config, work_dir),
        Commands::Reset { work_dir } => cmd_reset(cli.config, work_dir),
    }
}

fn cmd_run(config: Option<PathBuf>, mut overrides: CliOverrides) -> Result<i32> {
    let (file, config_path) = load_file_config(config.as_deref())?;
    if let Some(path) = &config_path {
        log::info!("Using config {}", path.display());
    }

    if overrides.phase.is_none() && file.phase.is_none() && std::io::stdin().is_terminal() {
        overrides.phase = Some(ask_phase()?);
    }

    let settings = Settings::resolve(file, overrides)?;
    let cancel = CancelFlag::new();
    install_interrupt_handler(&cancel)?;

    let runner = SystemRunner;
    let prompt = StdinPrompt;
    let summary = Pipeline::new(&settings, &runner, &prompt, cancel).run()?;

    println!();
    print!("{}", render_summary(&summary.report));
    if let Some(path) = &summary.report_path {
        println!();
        println!("Report written to {}", path.display());
    }
    Ok(summary.outcome.exit_code())
}

fn cmd_status(config: Option<PathBuf>, work_dir: Option<PathBuf>) -> Result<i32> {
    let work_dir = resolve_work_dir(config, work_dir)?;

    let Some(state) = pipeline::load_status(&work_dir)? else {
        println!("No saved state in {}", work_dir.display());
        return Ok(EXIT_OK);
    };

    println!("Working directory: {}", work_dir.display());
    println!("Stage:             {:?}", state.stage);
    let phases: Vec<&str> = state.phases_completed.iter().map(|p| p.as_str()).collect();
    println!("Phases complete:   {}", if phases.is_empty() { "-".to_string() } else { phases.join(", ") });

    if let Some(run) = &state.last_run {
        println!(
            "Last run:          {} ({}{}) started {}",
            run.run_id,
            run.mode.as_str(),
            if run.dry_run { ", dry run" } else { "" },
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!(
            "Outcome:           {}",
            run.outcome.as_deref().unwrap_or("still running or stopped")
        );
    }

    println!();
    println!("Archives: {}", state.archives.len());
    for (name, record) in &state.archives {
        let error = record.error.as_deref().unwrap_or("");
        let status = format!("{:?}", record.status);
        println!("  {:<40} {:>10} {:>7} files  {}", name, status, record.files, error);
    }

    println!();
    println!("{:<12} {:>8}", "STATUS", "ITEMS");
    println!("{}", "-".repeat(21));
    let counts = state.status_counts();
    for status in [
        ItemStatus::Pending,
        ItemStatus::Matched,
        ItemStatus::Unmatched,
        ItemStatus::Embedded,
        ItemStatus::Imported,
        ItemStatus::Failed,
        ItemStatus::Skipped,
    ] {
        if let Some(n) = counts.get(&status) {
            println!("{:<12} {:>8}", status.as_str(), n);
        }
    }
    println!("{:<12} {:>8}", "total", state.items.len());

    Ok(EXIT_OK)
}

fn cmd_reset(config: Option<PathBuf>, work_dir: Option<PathBuf>) -> Result<i32> {
    let work_dir = resolve_work_dir(config, work_dir)?;
    match pipeline::reset(&work_dir)? {
        Some(backup) => println!("State moved to {}", backup.display()),
        None => println!("No saved state in {}", work_dir.display()),
    }
    Ok(EXIT_OK)
}

fn resolve_work_dir(config: Option<PathBuf>, work_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = work_dir {
        return Ok(dir);
    }
    let (file, _) = load_file_config(config.as_deref())?;
    file.work_dir
        .ok_or_else(|| anyhow::anyhow!("work_dir is not set; pass --work-dir or set it in the config file"))
}

fn ask_phase() -> Result<RunMode> {
    let choices = [
        ("Extract archives", RunMode::Extract),
        ("Match sidecars and write metadata", RunMode::Metadata),
        ("Import into the photo library", RunMode::Import),
        ("All phases", RunMode::All),
        ("Test run (all phases, nothing changed)", RunMode::Test),
    ];

    println!("Which phase should run?");
    for (i, (label, _)) in choices.iter().enumerate() {
        println!("  {}) {}", i + 1, label);
    }

    let stdin = std::io::stdin();
    loop {
        print!("Choice [1-{}]: ", choices.len());
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            anyhow::bail!("no phase selected");
        }
        match line.trim().parse::<usize>() {
            Ok(n) if (1..=choices.len()).contains(&n) => return Ok(choices[n - 1].1),
            _ => println!("Please enter a number between 1 and {}", choices.len()),
        }
    }
}

/// Asks on the terminal what to do when the photo library stops responding.
struct StdinPrompt;

impl OperatorPrompt for StdinPrompt {
    fn app_unavailable(&self, reason: &str) -> OperatorChoice {
        if !std::io::stdin().is_terminal() {
            return OperatorChoice::Abort;
        }
        eprintln!();
        eprintln!("The photo library is not responding: {}", reason);
        loop {
            eprint!("[c]ontinue after starting it, [r]estart it, or [a]bort? ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => return OperatorChoice::Abort,
                Ok(_) => {}
            }
            match line.trim().to_lowercase().as_str() {
                "c" | "continue" => return OperatorChoice::Continue,
                "r" | "restart" => return OperatorChoice::Restart,
                "a" | "abort" => return OperatorChoice::Abort,
                _ => continue,
            }
        }
    }
}
