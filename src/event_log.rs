//! Optional JSONL record of what the engine did, one line per [`Event`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

pub const DEBUG_EVENTS_DIR_ENV: &str = "CELL_OFFLOAD_DEBUG_EVENTS_DIR";

const LOG_FILE_PREFIX: &str = "cell-offload";
const MAX_NAME_ATTEMPTS: u32 = 1_000;

static LOG: OnceLock<Option<EventLog>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct StartupContext {
    pub mode: String,
    pub worker_program: String,
    pub report_transfers: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    Startup {
        mode: &'a str,
        worker_program: &'a str,
        report_transfers: bool,
        cwd: Option<String>,
        argv: Vec<String>,
        log_file: String,
    },
    Submit {
        task_key: &'a str,
        generation: u64,
        label: &'a str,
        namespace: &'a str,
        destination: &'a str,
        source_bytes: usize,
    },
    Spawn {
        task_key: &'a str,
        generation: u64,
        pid: Option<u32>,
    },
    /// A live generation was killed by a resubmit, cancel or shutdown.
    Supersede {
        task_key: &'a str,
        generation: u64,
        outcome: &'static str,
    },
    Merge {
        task_key: &'a str,
        generation: u64,
        namespace: &'a str,
        names: &'a [String],
    },
    GenerationEnd {
        task_key: &'a str,
        generation: u64,
        outcome: &'static str,
        elapsed_ms: u64,
    },
}

impl Event<'_> {
    fn name(&self) -> &'static str {
        match self {
            Event::Startup { .. } => "startup",
            Event::Submit { .. } => "submit",
            Event::Spawn { .. } => "spawn",
            Event::Supersede { .. } => "supersede",
            Event::Merge { .. } => "merge",
            Event::GenerationEnd { .. } => "generation_end",
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    ts_unix_ms: u64,
    uptime_ms: u64,
    seq: u64,
    session: &'a str,
    pid: u32,
    #[serde(flatten)]
    event: &'a Event<'a>,
}

#[derive(Debug)]
struct EventLog {
    file: Mutex<File>,
    path: PathBuf,
    opened: Instant,
    session: String,
    pid: u32,
    seq: AtomicU64,
}

impl EventLog {
    fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let pid = std::process::id();
        let session = format!("{}-{pid}", unix_ms_now());
        let (file, path) = create_log_file(dir, &session)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            opened: Instant::now(),
            session,
            pid,
            seq: AtomicU64::new(0),
        })
    }

    fn record(&self, event: &Event<'_>) -> io::Result<()> {
        let record = Record {
            ts_unix_ms: unix_ms_now(),
            uptime_ms: self.opened.elapsed().as_millis() as u64,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            session: &self.session,
            pid: self.pid,
            event,
        };
        let line = serde_json::to_string(&record)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("event log mutex poisoned"))?;
        writeln!(file, "{line}")?;
        file.flush()
    }
}

/// Opens the event log when a directory is configured and records `startup`.
/// Returns the log file path. Later calls return the first result.
pub fn initialize(
    debug_events_dir: Option<PathBuf>,
    context: StartupContext,
) -> io::Result<Option<PathBuf>> {
    if let Some(existing) = LOG.get() {
        return Ok(existing.as_ref().map(|log| log.path.clone()));
    }
    let log = match resolve_debug_dir(debug_events_dir) {
        Some(dir) => {
            let log = EventLog::open(&dir)?;
            log.record(&Event::Startup {
                mode: &context.mode,
                worker_program: &context.worker_program,
                report_transfers: context.report_transfers,
                cwd: std::env::current_dir()
                    .ok()
                    .map(|path| path.display().to_string()),
                argv: std::env::args().collect(),
                log_file: log.path.display().to_string(),
            })?;
            Some(log)
        }
        None => None,
    };
    let path = log.as_ref().map(|log| log.path.clone());
    let _ = LOG.set(log);
    Ok(path)
}

/// Appends `event` if the log is open. Write failures are dropped.
pub fn log(event: Event<'_>) {
    let Some(Some(log)) = LOG.get() else {
        return;
    };
    if let Err(err) = log.record(&event) {
        tracing::debug!(target: "cell_offload::event_log", %err, event = event.name(), "dropping debug event");
    }
}

fn resolve_debug_dir(debug_events_dir: Option<PathBuf>) -> Option<PathBuf> {
    debug_events_dir
        .filter(|path| !path.as_os_str().is_empty())
        .or_else(|| {
            std::env::var_os(DEBUG_EVENTS_DIR_ENV)
                .filter(|raw| !raw.is_empty())
                .map(PathBuf::from)
        })
}

/// `cell-offload-<session>.jsonl`, or the first free `-N` variant.
fn create_log_file(dir: &Path, session: &str) -> io::Result<(File, PathBuf)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = match attempt {
            0 => format!("{LOG_FILE_PREFIX}-{session}.jsonl"),
            n => format!("{LOG_FILE_PREFIX}-{session}-{n}.jsonl"),
        };
        let path = dir.join(name);
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free event log name for session {session}"),
    ))
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::Value as JsonValue;

    use super::*;

    fn read_lines(path: &Path) -> Vec<JsonValue> {
        fs::read_to_string(path)
            .expect("read event log")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn events_are_flattened_into_numbered_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(temp.path()).expect("open log");
        let names = vec!["x".to_string()];
        log.record(&Event::Merge {
            task_key: "cellA",
            generation: 2,
            namespace: "default",
            names: &names,
        })
        .expect("record");
        log.record(&Event::GenerationEnd {
            task_key: "cellA",
            generation: 2,
            outcome: "Completed",
            elapsed_ms: 15,
        })
        .expect("record");

        let lines = read_lines(&log.path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "merge");
        assert_eq!(lines[0]["generation"], 2);
        assert_eq!(lines[0]["names"][0], "x");
        assert_eq!(lines[1]["event"], "generation_end");
        assert_eq!(lines[1]["outcome"], "Completed");
        assert_eq!(lines[1]["seq"], 2);
        assert_eq!(lines[1]["session"], log.session.as_str());
    }

    #[test]
    fn taken_names_get_a_numbered_suffix() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("cell-offload-123-456.jsonl"), "{}\n").expect("seed");

        let (_file, path) = create_log_file(temp.path(), "123-456").expect("create");
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some("cell-offload-123-456-1.jsonl")
        );
    }

    #[test]
    fn explicit_dir_wins_and_empty_is_ignored() {
        let explicit = PathBuf::from("/tmp/events");
        assert_eq!(resolve_debug_dir(Some(explicit.clone())), Some(explicit));
        if std::env::var_os(DEBUG_EVENTS_DIR_ENV).is_none() {
            assert_eq!(resolve_debug_dir(Some(PathBuf::new())), None);
        }
    }
}
