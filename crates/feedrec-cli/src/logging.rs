use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_FILE_FILTER: &str =
    "info,feedrec=debug,feedrec_core=debug,feedrec_storage=debug,feedrec_adapters=debug,feedrec_sync=debug";

/// Installs the per-run log file and, when `verbose`, a console layer at `info`.
/// Returns the path of the new log file.
pub fn init_logging(log_dir: &Path, feed: &str, keep: usize, verbose: bool) -> Result<PathBuf> {
    fs::create_dir_all(log_dir).with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = log_dir.join(format!("{feed}_{stamp}.log"));
    let file = File::options()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILE_FILTER));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .with_filter(file_filter);
    let console_layer = verbose.then(|| fmt::layer().with_target(false).with_filter(LevelFilter::INFO));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    let removed = prune_logs(log_dir, feed, keep)?;
    if !removed.is_empty() {
        tracing::debug!(removed = removed.len(), "old log files pruned");
    }
    Ok(path)
}

/// Deletes `{feed}_*.log` files beyond the newest `keep`. File names embed the
/// timestamp, so name order is age order.
pub fn prune_logs(log_dir: &Path, feed: &str, keep: usize) -> Result<Vec<PathBuf>> {
    let prefix = format!("{feed}_");
    let mut logs = fs::read_dir(log_dir)
        .with_context(|| format!("reading {}", log_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".log"))
        })
        .collect::<Vec<_>>();
    logs.sort();

    let excess = logs.len().saturating_sub(keep);
    let removed = logs.into_iter().take(excess).collect::<Vec<_>>();
    for path in &removed {
        fs::remove_file(path).with_context(|| format!("removing old log {}", path.display()))?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prune_keeps_newest_logs_of_one_feed() {
        let dir = tempdir().unwrap();
        for stamp in ["20240101_060000", "20240102_060000", "20240103_060000"] {
            fs::write(dir.path().join(format!("earnings_{stamp}.log")), "x").unwrap();
        }
        fs::write(dir.path().join("marketcap_20231231_060000.log"), "x").unwrap();
        fs::write(dir.path().join("earnings_notes.txt"), "x").unwrap();

        let removed = prune_logs(dir.path(), "earnings", 2).unwrap();
        assert_eq!(removed, vec![dir.path().join("earnings_20240101_060000.log")]);
        assert!(dir.path().join("earnings_20240103_060000.log").exists());
        assert!(dir.path().join("marketcap_20231231_060000.log").exists());
        assert!(dir.path().join("earnings_notes.txt").exists());
    }

    #[test]
    fn prune_is_a_noop_under_the_limit() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("earnings_20240101_060000.log"), "x").unwrap();
        assert!(prune_logs(dir.path(), "earnings", 10).unwrap().is_empty());
    }
}
