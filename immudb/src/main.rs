// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use immudb::config::StoreConfig;
use immudb::storage::{Database, DATA_FILE, OpenMode, Storage};
use immudb::tools;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: immudb <dump|check|rebuild> [DIR]
       immudb compact DEST [DIR]

DIR defaults to $IMMUDB_DIRECTORY or ./data";

enum Command {
    Dump,
    Check,
    Rebuild,
    Compact { dst: PathBuf },
}

fn parse(args: &[String], config: &StoreConfig) -> Option<(Command, PathBuf)> {
    let dir = |arg: Option<&String>| arg.map_or_else(|| config.directory.clone(), PathBuf::from);
    match args {
        [cmd, rest @ ..] if rest.len() <= 1 && cmd != "compact" => {
            let command = match cmd.as_str() {
                "dump" => Command::Dump,
                "check" => Command::Check,
                "rebuild" => Command::Rebuild,
                _ => return None,
            };
            Some((command, dir(rest.first())))
        }
        [cmd, dst, rest @ ..] if cmd == "compact" && rest.len() <= 1 => Some((
            Command::Compact {
                dst: PathBuf::from(dst),
            },
            dir(rest.first()),
        )),
        _ => None,
    }
}

fn run(command: Command, dir: &Path, config: &StoreConfig) -> Result<(), tools::ToolError> {
    match command {
        Command::Dump => {
            let stor = Storage::open_with(
                &dir.join(DATA_FILE),
                OpenMode::ReadOnly,
                config.database.chunk_size,
            )
            .map_err(immudb::DatabaseError::from)?;
            let mut out = std::io::stdout().lock();
            tools::dump(&stor, &mut out)?;
        }
        Command::Check => {
            let db = Database::open(dir, config.database)?;
            let report = db.check()?;
            println!(
                "ok: {} tables, {} records, {} commits ({} aborted)",
                report.tables, report.records, report.log.committed, report.log.aborted
            );
        }
        Command::Rebuild => {
            let report = tools::rebuild(dir, config.database)?;
            println!(
                "rebuilt from {} commits: {} tables, {} records",
                report.commits, report.tables, report.records
            );
        }
        Command::Compact { dst } => {
            let report = tools::compact(dir, &dst, config.database)?;
            println!(
                "copied {} records of {} tables in {} commits, {} -> {} bytes",
                report.records, report.tables, report.commits, report.src_bytes, report.dst_bytes
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "immudb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, dir)) = parse(&args, &config) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    match run(command, &dir, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
