use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use retrykit_core::SystemClock;
use retrykit_infra::store::{FailureStore, FileKv};
use retrykit_infra::ResilienceConfig;
use retrykit_observability::LogConfig;

#[derive(Parser)]
#[command(name = "retrykit", version, about = "Inspect and maintain a retrykit failure store")]
struct Cli {
    /// Store directory (defaults to RETRYKIT_STORE_DIR)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Storage key (defaults to RETRYKIT_STORE_KEY or `failed_operations`)
    #[arg(long, global = true)]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List records in replay order
    List {
        /// Include records that used up their replay attempts
        #[arg(long)]
        all: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Write every record as a versioned JSON document
    Export {
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Merge records from an exported document or a legacy array
    Import { file: PathBuf },

    /// Apply age and count retention now
    Purge,

    /// Show record counts
    Stats,

    /// Delete every record
    Clear {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> anyhow::Result<()> {
    retrykit_observability::tracing::init(LogConfig::compact().with_default_filter("warn"));

    let cli = Cli::parse();
    let stdout = io::stdout();
    run(cli, ResilienceConfig::from_env(), &mut stdout.lock())
}

fn open_store(cli: &Cli, config: ResilienceConfig) -> anyhow::Result<FailureStore> {
    let dir = cli
        .dir
        .clone()
        .or(config.store_dir)
        .context("no store directory: pass --dir or set RETRYKIT_STORE_DIR")?;
    let mut store_config = config.store;
    if let Some(key) = &cli.key {
        store_config.storage_key = key.clone();
    }

    let kv = FileKv::open(&dir).with_context(|| format!("opening store directory {}", dir.display()))?;
    FailureStore::open(Arc::new(kv), store_config, Arc::new(SystemClock))
        .with_context(|| format!("loading failure store from {}", dir.display()))
}

fn run(cli: Cli, config: ResilienceConfig, out: &mut impl Write) -> anyhow::Result<()> {
    let store = open_store(&cli, config)?;

    match cli.command {
        Commands::List { all, json } => {
            let records = if all { store.all() } else { store.list_replayable() };
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
            } else {
                for r in &records {
                    writeln!(
                        out,
                        "{}\t{}\tprio={}\tretries={}\t{}\t{}",
                        r.id,
                        r.kind,
                        r.priority,
                        r.retry_count,
                        r.timestamp.to_rfc3339(),
                        r.last_error
                    )?;
                }
            }
        }

        Commands::Export { out: path } => {
            let document = store.export_all()?;
            match path {
                Some(path) => {
                    fs::write(&path, document)
                        .with_context(|| format!("writing {}", path.display()))?;
                    writeln!(out, "exported {} records to {}", store.len(), path.display())?;
                }
                None => writeln!(out, "{document}")?,
            }
        }

        Commands::Import { file } => {
            let json = fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let imported = store.import_all(&json).context("import failed")?;
            tracing::info!(file = %file.display(), imported, total = store.len(), "records imported");
            writeln!(out, "imported {imported} records, store now holds {}", store.len())?;
        }

        Commands::Purge => {
            let purged = store.purge_expired()?;
            tracing::info!(purged, remaining = store.len(), "retention applied");
            writeln!(out, "purged {purged} records")?;
        }

        Commands::Stats => {
            writeln!(out, "{}", serde_json::to_string_pretty(&store.stats())?)?;
        }

        Commands::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to clear {} records without --yes", store.len());
            }
            let cleared = store.len();
            store.clear()?;
            tracing::info!(cleared, "store cleared from the command line");
            writeln!(out, "cleared")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrykit_core::OperationKind;
    use retrykit_infra::StoreConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn seed(dir: &TempDir, priorities: &[i32]) {
        let kv = FileKv::open(dir.path()).unwrap();
        let store =
            FailureStore::open(Arc::new(kv), StoreConfig::default(), Arc::new(SystemClock)).unwrap();
        for p in priorities {
            store
                .store_failure(OperationKind::Update, json!({ "p": p }), "timeout", *p)
                .unwrap();
        }
    }

    fn exec(args: &[&str]) -> anyhow::Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("retrykit").chain(args.iter().copied()))?;
        let mut out = Vec::new();
        run(cli, ResilienceConfig::default(), &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn list_prints_replay_order() {
        let dir = TempDir::new().unwrap();
        seed(&dir, &[1, 9, 4]);
        let path = dir.path().to_str().unwrap();

        let output = exec(&["list", "--dir", path]).unwrap();

        let prios: Vec<&str> = output
            .lines()
            .filter_map(|line| line.split('\t').nth(2))
            .collect();
        assert_eq!(prios, vec!["prio=9", "prio=4", "prio=1"]);
    }

    #[test]
    fn export_then_import_into_another_store() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        seed(&source, &[2, 3]);
        let file = source.path().join("backup.export");

        exec(&[
            "export",
            "--dir",
            source.path().to_str().unwrap(),
            "--out",
            file.to_str().unwrap(),
        ])
        .unwrap();
        let output = exec(&[
            "import",
            file.to_str().unwrap(),
            "--dir",
            target.path().to_str().unwrap(),
        ])
        .unwrap();

        assert!(output.starts_with("imported 2 records"));
    }

    #[test]
    fn clear_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        seed(&dir, &[1]);
        let path = dir.path().to_str().unwrap();

        assert!(exec(&["clear", "--dir", path]).is_err());
        exec(&["clear", "--dir", path, "--yes"]).unwrap();
        assert_eq!(exec(&["list", "--dir", path]).unwrap(), "");
    }

    #[test]
    fn missing_directory_is_reported() {
        let err = exec(&["stats"]).unwrap_err();
        assert!(err.to_string().contains("--dir"));
    }
}
