use std::collections::BTreeMap;
use std::io::{BufReader, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::portable::{Fingerprint, fingerprint, namespace_from_portable, to_portable};
use crate::protocol::{DiffPayload, Job, OutputEvent, WORKER_MODE_ARG, WorkerMessage};
use crate::script::{Host, Interpreter, Namespace};
use crate::snapshot::SnapshotRules;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Initializing,
    Executing,
    Diffing,
    Terminated,
}

struct WorkerState {
    phase: Phase,
}

impl WorkerState {
    fn advance(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "{:?} -> {next:?}", self.phase);
        tracing::debug!(target: "cell_offload::worker", from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }
}

pub fn is_worker_mode() -> bool {
    std::env::args()
        .nth(1)
        .is_some_and(|arg| arg == WORKER_MODE_ARG || arg == format!("--{WORKER_MODE_ARG}"))
}

/// Stdout, one JSON message per line, flushed per message.
struct Channel<W: Write> {
    out: W,
}

impl<W: Write> Channel<W> {
    fn send(&mut self, message: &WorkerMessage) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.out, message)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

struct ChannelHost<'a, W: Write> {
    channel: &'a mut Channel<W>,
}

impl<W: Write> Host for ChannelHost<'_, W> {
    fn emit(&mut self, event: OutputEvent) {
        if let Err(err) = self.channel.send(&WorkerMessage::Output { event }) {
            // The supervisor dropped the channel; nothing can observe this generation.
            tracing::debug!(target: "cell_offload::worker", %err, "channel closed");
            std::process::exit(0);
        }
    }
}

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let stdin = std::io::stdin();
    run_job(&mut BufReader::new(stdin.lock()), &mut std::io::stdout().lock())
}

/// Runs one job from `input`, writing the channel to `output`.
pub fn run_job(
    input: &mut impl std::io::BufRead,
    output: &mut impl Write,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut state = WorkerState {
        phase: Phase::Initializing,
    };
    let mut channel = Channel { out: output };
    channel.send(&WorkerMessage::Started {
        pid: std::process::id(),
    })?;

    let job = match Job::read_frame(input) {
        Ok(job) => job,
        Err(err) => {
            channel.send(&WorkerMessage::Fatal {
                message: format!("could not read job: {err}"),
            })?;
            return Err(err.into());
        }
    };
    tracing::debug!(
        target: "cell_offload::worker",
        task_key = %job.task_key,
        generation = job.generation,
        names = job.namespace.len(),
        "job received"
    );

    let inbound: BTreeMap<String, Fingerprint> = job
        .namespace
        .iter()
        .map(|(name, value)| (name.clone(), fingerprint(value)))
        .collect();
    let mut globals = namespace_from_portable(job.namespace);

    state.advance(Phase::Executing);
    let mut raised = false;
    let outcome = {
        let mut host = ChannelHost {
            channel: &mut channel,
        };
        catch_unwind(AssertUnwindSafe(|| {
            Interpreter::new(&mut globals, &mut host).run_source(&job.source)
        }))
    };
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            raised = true;
            channel.send(&WorkerMessage::Output {
                event: OutputEvent::stderr(err.traceback()),
            })?;
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            channel.send(&WorkerMessage::Fatal {
                message: format!("interpreter panicked: {message}"),
            })?;
            state.advance(Phase::Terminated);
            return Ok(());
        }
    }

    state.advance(Phase::Diffing);
    let mut payload = compute_diff(&inbound, &globals, &job.rules);
    payload.raised = raised;
    channel.send(&WorkerMessage::Diff { payload })?;
    state.advance(Phase::Terminated);
    Ok(())
}

/// New names and names whose serialized form changed since the inbound snapshot.
pub fn compute_diff(
    inbound: &BTreeMap<String, Fingerprint>,
    globals: &Namespace,
    rules: &SnapshotRules,
) -> DiffPayload {
    let mut diff = DiffPayload::default();
    for (name, value) in globals {
        if rules.is_excluded(name, value) {
            continue;
        }
        match to_portable(value) {
            Ok(portable) => {
                if inbound.get(name) != Some(&fingerprint(&portable)) {
                    diff.changed.insert(name.clone(), portable);
                }
            }
            Err(err) if inbound.contains_key(name) => {
                diff.lost.insert(name.clone(), err.to_string());
            }
            Err(err) => {
                diff.skipped.insert(name.clone(), err.to_string());
            }
        }
    }
    diff
}
