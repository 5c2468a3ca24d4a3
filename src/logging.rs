//! Tracing setup for processes embedding the bridge.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "bm_bridge=info,warn";

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "bridge.log";

/// Rotated generations kept next to the live log.
const KEEP_ROTATED: u32 = 3;

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stderr,
    /// `bridge.log` inside this directory, rotated on every init.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub destination: LogDestination,
    pub json: bool,
    pub default_filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            destination: LogDestination::Stderr,
            json: false,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LogOptions {
    /// File logging under the platform data directory.
    pub fn in_data_dir() -> Self {
        Self {
            destination: LogDestination::File(data_dir()),
            ..Self::default()
        }
    }
}

/// Platform data directory for the bridge (`<data_dir>/bm-bridge`).
///
/// Falls back to `~/.bm-bridge` when no data directory can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("bm-bridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bm-bridge")
}

/// Install the global tracing subscriber.
///
/// Returns the log file path when logging to a file. `RUST_LOG` overrides
/// `default_filter`. Fails if a global subscriber is already installed.
pub fn init_tracing(options: &LogOptions) -> anyhow::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let (writer, log_path, ansi) = match &options.destination {
        LogDestination::Stderr => (BoxMakeWriter::new(std::io::stderr), None, true),
        LogDestination::File(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&path, KEEP_ROTATED);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            (BoxMakeWriter::new(SyncedLog::new(file)), Some(path), false)
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi && !options.json)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if options.json {
        builder.json().with_writer(writer).try_init()
    } else {
        builder.with_writer(writer).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "bm bridge logging initialized"
    );
    Ok(log_path)
}

/// Move `bridge.log` to `bridge.log.1`, shifting older generations up.
/// Whatever sat at `.{keep}` is overwritten.
fn rotate_log_file(live: &Path, keep: u32) {
    let numbered = |n: u32| {
        let mut name = live.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };

    for n in (1..=keep).rev() {
        let from = if n == 1 { live.to_path_buf() } else { numbered(n - 1) };
        if from.exists() {
            let _ = std::fs::rename(&from, numbered(n));
        }
    }
}

/// Log file shared by every event; each write is flushed straight through.
struct SyncedLog {
    file: Mutex<File>,
}

impl SyncedLog {
    fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

struct SyncedLogHandle<'a> {
    file: &'a Mutex<File>,
}

impl Write for SyncedLogHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file lock poisoned"))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SyncedLog {
    type Writer = SyncedLogHandle<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SyncedLogHandle { file: &self.file }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_keeps_three_generations() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        for run in 0..5 {
            std::fs::write(&log, format!("run {run}")).unwrap();
            rotate_log_file(&log, KEEP_ROTATED);
        }

        assert!(!log.exists());
        let read = |n: u32| std::fs::read_to_string(format!("{}.{n}", log.display())).unwrap();
        assert_eq!(read(1), "run 4");
        assert_eq!(read(2), "run 3");
        assert_eq!(read(3), "run 2");
        assert!(!PathBuf::from(format!("{}.4", log.display())).exists());
    }

    #[test]
    fn test_rotate_with_no_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        rotate_log_file(&dir.path().join(LOG_FILE_NAME), KEEP_ROTATED);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_synced_log_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let log = SyncedLog::new(std::fs::File::create(&path).unwrap());
        log.make_writer().write_all(b"line one\n").unwrap();
        log.make_writer().write_all(b"line two\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\nline two\n");
    }

    #[test]
    fn test_rotate_with_zero_keep_leaves_live_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&log, "live").unwrap();
        rotate_log_file(&log, 0);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "live");
    }

    #[test]
    fn test_default_options() {
        let options = LogOptions::default();
        assert_eq!(options.destination, LogDestination::Stderr);
        assert_eq!(options.default_filter, "bm_bridge=info,warn");
        assert!(data_dir().ends_with("bm-bridge") || data_dir().ends_with(".bm-bridge"));
    }
}
