//! Logging setup
//!
//! Each run gets its own directory under the configured logs root,
//! named by timestamp, holding:
//! - `app.log`: the application log, truncated per run
//! - `net.log`: network-traffic events (`target: "net"`), size-rotated
//!   in 5 MiB segments
//!
//! Traffic logging is additionally gated by a runtime flag so the CLI
//! can toggle it without touching the subscriber.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Segment size limit for net.log
const NET_LOG_MAX_SIZE: u64 = 5 * 1024 * 1024;

/// Number of per-run log directories to keep around
const MAX_RUN_DIRS: usize = 6;

static TRAFFIC_LOGGING: AtomicBool = AtomicBool::new(false);

/// Runtime gate for the network-traffic log path.
pub fn set_traffic_logging(enabled: bool) {
    TRAFFIC_LOGGING.store(enabled, Ordering::Release);
}

pub fn traffic_logging_enabled() -> bool {
    TRAFFIC_LOGGING.load(Ordering::Acquire)
}

/// Keeps the non-blocking writer threads alive for the process lifetime.
pub struct LogGuards {
    _app: WorkerGuard,
    _net: WorkerGuard,
    /// Where this run's logs live
    pub directory: PathBuf,
}

/// Create the per-run directory, prune old runs and install the global
/// subscriber.
pub fn init_logging(root: &str, level: &str, log_traffic: bool) -> Result<LogGuards> {
    set_traffic_logging(log_traffic);

    let run_dir = create_run_directory(Path::new(root))?;

    let app_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(run_dir.join("app.log"))
        .context("Failed to create app.log")?;
    let (app_writer, app_guard) = tracing_appender::non_blocking(app_file);

    let net_writer = RotatingWriter::create(run_dir.clone(), "net.log", NET_LOG_MAX_SIZE)
        .context("Failed to create net.log")?;
    let (net_writer, net_guard) = tracing_appender::non_blocking(net_writer);

    // Traffic events go only to net.log; everything else goes to the
    // console and app.log.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_filter(filter_fn(|meta| meta.target() != "net"));

    let app_layer = tracing_subscriber::fmt::layer()
        .with_writer(app_writer)
        .with_ansi(false)
        .with_filter(filter_fn(|meta| meta.target() != "net"));

    let net_layer = tracing_subscriber::fmt::layer()
        .with_writer(net_writer)
        .with_ansi(false)
        .with_filter(filter_fn(|meta| {
            meta.target() == "net" && traffic_logging_enabled()
        }));

    let env_filter = EnvFilter::try_new(format!("{},net=trace", level))
        .unwrap_or_else(|_| EnvFilter::new("info,net=trace"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(app_layer)
        .with(net_layer)
        .try_init()
        .context("Failed to set global subscriber")?;

    Ok(LogGuards {
        _app: app_guard,
        _net: net_guard,
        directory: run_dir,
    })
}

/// Make `<root>/<YYYY-MM-DD_HH-MM>/`, pruning the oldest run
/// directories beyond the retention limit.
fn create_run_directory(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root).context("Failed to create logs directory")?;
    prune_old_runs(root)?;

    let stamp = Local::now().format("%Y-%m-%d_%H-%M").to_string();
    let run_dir = root.join(stamp);
    fs::create_dir_all(&run_dir).context("Failed to create run log directory")?;
    Ok(run_dir)
}

fn prune_old_runs(root: &Path) -> Result<()> {
    // Timestamp-named directories sort chronologically by name
    let mut runs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    runs.sort();

    while runs.len() >= MAX_RUN_DIRS {
        let oldest = runs.remove(0);
        if let Err(e) = fs::remove_dir_all(&oldest) {
            eprintln!("Failed to prune old log directory {:?}: {}", oldest, e);
            break;
        }
    }
    Ok(())
}

/// Size-based rotating file writer: `net.log`, then `net.1.log`,
/// `net.2.log`, ... once a segment reaches the limit.
struct RotatingWriter {
    directory: PathBuf,
    base_name: String,
    max_size: u64,
    file: File,
    written: u64,
    segment: u32,
}

impl RotatingWriter {
    fn create(directory: PathBuf, base_name: &str, max_size: u64) -> io::Result<Self> {
        let file = File::create(directory.join(base_name))?;
        Ok(Self {
            directory,
            base_name: base_name.to_string(),
            max_size,
            file,
            written: 0,
            segment: 0,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.segment += 1;
        let stem = self.base_name.trim_end_matches(".log");
        let name = format!("{}.{}.log", stem, self.segment);
        self.file = File::create(self.directory.join(name))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotating_writer_splits_segments() {
        let dir = std::env::temp_dir().join(format!("pb-log-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let mut writer = RotatingWriter::create(dir.clone(), "net.log", 64).unwrap();
        for _ in 0..10 {
            writer.write_all(&[b'x'; 20]).unwrap();
        }
        writer.flush().unwrap();

        assert!(dir.join("net.log").exists());
        assert!(dir.join("net.1.log").exists());
        assert!(fs::metadata(dir.join("net.log")).unwrap().len() <= 64);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn prune_keeps_recent_runs() {
        let root = std::env::temp_dir().join(format!("pb-prune-test-{}", std::process::id()));
        fs::create_dir_all(&root).unwrap();

        for i in 0..8 {
            fs::create_dir_all(root.join(format!("2026-01-0{}_10-00", i + 1))).unwrap();
        }
        prune_old_runs(&root).unwrap();

        let remaining = fs::read_dir(&root).unwrap().count();
        assert!(remaining < MAX_RUN_DIRS);
        // The newest run must survive
        assert!(root.join("2026-01-08_10-00").exists());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn traffic_gate_toggles() {
        set_traffic_logging(true);
        assert!(traffic_logging_enabled());
        set_traffic_logging(false);
        assert!(!traffic_logging_enabled());
    }
}
