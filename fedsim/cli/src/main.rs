use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use fedsim_engine::{History, Scenario, SimulationConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::{EventPublisher, EventRecord, FileEventPublisher};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Runtime;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "fedsim", version, about = "Federated learning simulation runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a scenario described by a TOML file.
    Run(RunArgs),
    /// Lists most recent runs.
    List {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = "runs/index.jsonl")]
        manifest: PathBuf,
    },
    /// Prints the round table of a run id or history file.
    Show {
        target: String,
        #[arg(long, default_value = "runs/index.jsonl")]
        manifest: PathBuf,
        /// Print raw records instead of the table.
        #[arg(long)]
        json: bool,
    },
    /// Writes a config file holding every default.
    Init {
        #[arg(long, default_value = "fedsim.toml")]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Overrides `num_rounds`.
    #[arg(long)]
    rounds: Option<u64>,
    /// Overrides `seed`.
    #[arg(long)]
    seed: Option<u64>,
    /// History output; defaults to `runs/<run-id>.history.jsonl`.
    #[arg(long)]
    history: Option<PathBuf>,
    /// Overrides `telemetry.log_path`.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Overrides `telemetry.event_log`.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Overrides `telemetry.log_level` (debug, info, warn, error).
    #[arg(long, value_parser = parse_log_level)]
    log_level: Option<LogLevel>,
    #[arg(long, default_value = "runs/index.jsonl")]
    manifest: PathBuf,
}

fn parse_log_level(raw: &str) -> Result<LogLevel, String> {
    LogLevel::parse(raw).ok_or_else(|| format!("unknown log level `{raw}`"))
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct RunManifestEntry {
    run_id: Uuid,
    finished_at: DateTime<Utc>,
    config: PathBuf,
    history: PathBuf,
    strategy: String,
    rounds: u64,
    completed: usize,
    final_loss: Option<f64>,
}

impl RunManifestEntry {
    fn new(config: PathBuf, history_path: PathBuf, rounds: u64, history: &History) -> Self {
        Self {
            run_id: history.run_id(),
            finished_at: Utc::now(),
            config,
            history: history_path,
            strategy: history.strategy().to_string(),
            rounds,
            completed: history.completed_rounds(),
            final_loss: history
                .centralized_losses()
                .last()
                .copied()
                .or_else(|| history.distributed_losses().last().copied())
                .map(|(_, loss)| loss),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => handle_run(args),
        Commands::List { limit, manifest } => {
            let entries = read_manifest(&manifest)?;
            for entry in entries.into_iter().rev().take(limit) {
                println!(
                    "{} | {} | {}/{} rounds | loss {} | {}",
                    entry.run_id,
                    entry.finished_at,
                    entry.completed,
                    entry.rounds,
                    entry
                        .final_loss
                        .map_or_else(|| "-".to_string(), |loss| format!("{loss:.4}")),
                    entry.history.display()
                );
            }
            Ok(())
        }
        Commands::Show {
            target,
            manifest,
            json,
        } => {
            let history = resolve_history(&target, &manifest)?;
            if json {
                history.write_jsonl(std::io::stdout().lock())?;
            } else {
                print!("{}", history.render_table());
            }
            Ok(())
        }
        Commands::Init { output, force } => {
            if output.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", output.display());
            }
            fs::write(&output, SimulationConfig::default().to_toml()?)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("wrote {}", output.display());
            Ok(())
        }
    }
}

fn handle_run(args: RunArgs) -> Result<()> {
    anyhow::ensure!(args.config.exists(), "config file not found");
    let config = apply_overrides(SimulationConfig::load(&args.config)?, &args);
    let scenario = Scenario::from_config(&config)?;
    let runtime = Runtime::new()?;
    let history = runtime.block_on(scenario.run())?;

    let history_path = args
        .history
        .clone()
        .unwrap_or_else(|| default_history_path(&args.manifest, &history));
    history.save(&history_path)?;
    let entry = RunManifestEntry::new(
        args.config.clone(),
        history_path,
        config.num_rounds,
        &history,
    );
    append_manifest(&args.manifest, &entry)?;

    print!("{}", history.render_table());
    println!("{}", serde_json::to_string_pretty(&entry)?);
    if let Some(path) = &config.telemetry.log_path {
        log_cli_event(
            path,
            config.telemetry.log_level,
            "run recorded",
            json!({ "run_id": entry.run_id, "history": entry.history }),
        )?;
    }
    if let Some(path) = &config.telemetry.event_log {
        let publisher = FileEventPublisher::new(path)?;
        runtime.block_on(publisher.publish(EventRecord::new(
            "fedsim-cli",
            "run.recorded",
            None,
            json!({
                "run_id": entry.run_id,
                "history": entry.history,
                "completed": entry.completed,
                "rounds": entry.rounds,
            }),
        )))?;
    }
    Ok(())
}

fn apply_overrides(mut config: SimulationConfig, args: &RunArgs) -> SimulationConfig {
    if let Some(rounds) = args.rounds {
        config.num_rounds = rounds;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(log) = &args.log {
        config.telemetry.log_path = Some(log.clone());
    }
    if let Some(events) = &args.events {
        config.telemetry.event_log = Some(events.clone());
    }
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }
    config
}

fn default_history_path(manifest: &Path, history: &History) -> PathBuf {
    let dir = manifest.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("{}.history.jsonl", history.run_id()))
}

fn resolve_history(target: &str, manifest: &Path) -> Result<History> {
    let candidate = Path::new(target);
    if candidate.is_file() {
        return History::load(candidate);
    }
    let matches: Vec<_> = read_manifest(manifest)?
        .into_iter()
        .filter(|entry| entry.run_id.to_string().starts_with(target))
        .collect();
    match matches.as_slice() {
        [entry] => History::load(&entry.history),
        [] => bail!("run {target} not found in {}", manifest.display()),
        _ => bail!("run id prefix {target} is ambiguous ({} matches)", matches.len()),
    }
}

fn append_manifest(path: &Path, entry: &RunManifestEntry) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening manifest {}", path.display()))?;
    serde_json::to_writer(&mut file, entry)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_manifest(path: &Path) -> Result<Vec<RunManifestEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: RunManifestEntry = serde_json::from_str(&line)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn log_cli_event(path: &Path, min_level: LogLevel, message: &str, metadata: Value) -> Result<()> {
    let logger = JsonLogger::with_min_level(path, min_level)?;
    logger.log(&LogRecord::new("fedsim-cli", LogLevel::Info, message).with_metadata(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run_args(dir: &Path) -> RunArgs {
        RunArgs {
            config: dir.join("fedsim.toml"),
            rounds: Some(2),
            seed: None,
            history: None,
            log: Some(dir.join("run.log")),
            events: Some(dir.join("events.jsonl")),
            log_level: None,
            manifest: dir.join("runs/index.jsonl"),
        }
    }

    fn small_config(dir: &Path) -> PathBuf {
        let path = dir.join("fedsim.toml");
        fs::write(
            &path,
            r#"
            num_participants = 4
            num_rounds = 5

            [strategy]
            min_fit_participants = 4
            min_evaluate_participants = 2
            min_available_participants = 4

            [resources]
            total = 2.0
            per_participant_resource_cost = 1.0

            [dataset]
            kind = "synthetic"
            samples = 200
            held_out = 40
            features = 4
            classes = 3
            "#,
        )
        .unwrap();
        path
    }

    #[test]
    fn overrides_replace_config_values() {
        let dir = tempdir().unwrap();
        let args = run_args(dir.path());
        let config = apply_overrides(SimulationConfig::default(), &args);
        assert_eq!(config.num_rounds, 2);
        assert_eq!(config.seed, 42);
        assert_eq!(config.telemetry.log_path, Some(dir.path().join("run.log")));
        assert_eq!(
            config.telemetry.event_log,
            Some(dir.path().join("events.jsonl"))
        );
    }

    #[test]
    fn log_level_flag_parses_and_overrides() {
        let cli = Cli::try_parse_from([
            "fedsim",
            "run",
            "--config",
            "fedsim.toml",
            "--log-level",
            "Warning",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.log_level, Some(LogLevel::Warn));
        let config = apply_overrides(SimulationConfig::default(), &args);
        assert_eq!(config.telemetry.log_level, LogLevel::Warn);
        assert!(Cli::try_parse_from(["fedsim", "run", "--config", "x", "--log-level", "trace"]).is_err());
    }

    #[test]
    fn run_records_history_and_manifest() {
        let dir = tempdir().unwrap();
        small_config(dir.path());
        let args = run_args(dir.path());
        let manifest = args.manifest.clone();
        handle_run(args).unwrap();

        let entries = read_manifest(&manifest).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.rounds, 2);
        assert_eq!(entry.completed, 2);
        assert_eq!(entry.strategy, "fedavg");
        assert!(entry.final_loss.is_some());
        assert_eq!(
            entry.history,
            dir.path()
                .join("runs")
                .join(format!("{}.history.jsonl", entry.run_id))
        );

        let short = entry.run_id.to_string()[..8].to_string();
        let history = resolve_history(&short, &manifest).unwrap();
        assert_eq!(history.run_id(), entry.run_id);
        assert_eq!(history.len(), 2);
        let by_path = resolve_history(entry.history.to_str().unwrap(), &manifest).unwrap();
        assert_eq!(by_path.run_id(), entry.run_id);

        let events = fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert!(events.contains("run.recorded"));
        let log = shared_logging::read_log(dir.path().join("run.log")).unwrap();
        assert!(log.iter().any(|r| r.message == "run recorded"));
    }

    #[test]
    fn unknown_run_is_an_error() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("index.jsonl");
        assert!(resolve_history("deadbeef", &manifest).is_err());
    }
}
