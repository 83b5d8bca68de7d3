//! The task supervisor.
//!
//! [`Engine::submit`] snapshots the target namespace, spawns a worker for the
//! task key (killing any generation still live under that key), and registers
//! a drain task on the current [`tokio::task::LocalSet`]. The drain relays
//! output as it arrives and merges the terminal diff into the target
//! namespace. All host-side state lives on one thread.

mod process;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{Notify, oneshot};

pub use self::process::SpawnError;
use self::process::{format_exit_status_message, kill_process_group, spawn_worker};
use crate::config::EngineConfig;
use crate::event_log::{self, Event};
use crate::portable::Portable;
use crate::protocol::{DiffPayload, Job, OutputEvent, WorkerMessage};
use crate::registry::{DEFAULT_NAMESPACE, NamespaceHandle, NamespaceRegistry};
use crate::relay::{GenerationOutcome, OutputRelay, StatusKind, StatusUpdate};
use crate::script::Namespace;
use crate::snapshot::{SkippedName, UnserializableCache, snapshot};

const STDERR_TAIL_BYTES: usize = 4096;

static NEXT_LABEL: AtomicU64 = AtomicU64::new(1);

/// Per-key spawn sequence number, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Slot identity; derived from the source when absent.
    pub task_key: Option<String>,
    pub destination: String,
    pub source: String,
    /// Target namespace; `default` when absent.
    pub namespace: Option<String>,
}

impl SubmitRequest {
    pub fn new(destination: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            task_key: None,
            destination: destination.into(),
            source: source.into(),
            namespace: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.task_key = Some(key.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduled {
    pub task_key: String,
    pub generation: GenerationId,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Live {
        generation: GenerationId,
        label: String,
    },
}

/// `cell-` and the first 16 hex digits of the source's SHA-256.
pub fn default_task_key(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let hex: String = digest[..8].iter().map(|byte| format!("{byte:02x}")).collect();
    format!("cell-{hex}")
}

struct LiveGeneration {
    generation: GenerationId,
    label: String,
    destination: String,
    pid: Option<u32>,
    stop: Rc<Cell<Option<GenerationOutcome>>>,
    kill: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: EngineConfig,
    registry: NamespaceRegistry,
    relay: OutputRelay,
    slots: RefCell<HashMap<String, LiveGeneration>>,
    sequence: RefCell<HashMap<String, u64>>,
    outcomes: RefCell<HashMap<String, GenerationOutcome>>,
    unserializable: RefCell<UnserializableCache>,
    draining: Cell<usize>,
    changed: Notify,
}

/// Runs cells in worker processes and folds their results back into namespaces.
///
/// `submit` must be called from inside a `LocalSet`.
pub struct Engine {
    inner: Rc<Inner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.inner.slots.borrow().keys().cloned().collect();
        keys.sort();
        f.debug_struct("Engine")
            .field("worker_program", &self.inner.config.worker_program)
            .field("live", &keys)
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, globals: NamespaceHandle) -> Self {
        Self {
            inner: Rc::new(Inner {
                config,
                registry: NamespaceRegistry::new(globals),
                relay: OutputRelay::default(),
                slots: RefCell::new(HashMap::new()),
                sequence: RefCell::new(HashMap::new()),
                outcomes: RefCell::new(HashMap::new()),
                unserializable: RefCell::new(UnserializableCache::default()),
                draining: Cell::new(0),
                changed: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn relay(&self) -> &OutputRelay {
        &self.inner.relay
    }

    pub fn registry(&self) -> &NamespaceRegistry {
        &self.inner.registry
    }

    pub fn get_namespace(&self, name: &str) -> Namespace {
        self.inner.registry.get_namespace(name)
    }

    pub fn submit(&self, request: SubmitRequest) -> Result<Scheduled, SpawnError> {
        let inner = &self.inner;
        let task_key = request
            .task_key
            .unwrap_or_else(|| default_task_key(&request.source));
        let namespace = request
            .namespace
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let destination = request.destination;

        inner.terminate(&task_key, GenerationOutcome::Superseded);

        let generation = {
            let mut sequence = inner.sequence.borrow_mut();
            let next = sequence.entry(task_key.clone()).or_insert(0);
            *next += 1;
            GenerationId(*next)
        };
        let label = format!("bg_task_{}", NEXT_LABEL.fetch_add(1, Ordering::Relaxed));
        event_log::log(Event::Submit {
            task_key: &task_key,
            generation: generation.0,
            label: &label,
            namespace: &namespace,
            destination: &destination,
            source_bytes: request.source.len(),
        });

        let base = inner.registry.base_for(&namespace);
        let inbound = snapshot(
            &base,
            &inner.config.snapshot_rules,
            &mut inner.unserializable.borrow_mut(),
        );
        if !inbound.skipped.is_empty() {
            inner.relay.forward(
                &destination,
                &OutputEvent::stderr(inbound_warning(&inbound.skipped)),
            );
        }

        let job = Job {
            task_key: task_key.clone(),
            generation: generation.0,
            source: request.source,
            namespace: inbound.entries,
            rules: inner.config.snapshot_rules.clone(),
        };
        let frame = job.encode_frame()?;

        let started = Instant::now();
        if inner.config.status_updates {
            inner.publish_status(&destination, &task_key, &label, StatusKind::Starting);
        }
        let worker = match spawn_worker(&inner.config) {
            Ok(worker) => worker,
            Err(err) => {
                tracing::warn!(target: "cell_offload::engine", task_key = %task_key, %err, "worker spawn failed");
                inner.relay.forward(
                    &destination,
                    &OutputEvent::stderr(format!(
                        "[Error] Background task '{task_key}' could not start: {err}\n"
                    )),
                );
                inner
                    .outcomes
                    .borrow_mut()
                    .insert(task_key.clone(), GenerationOutcome::Crashed);
                if inner.config.status_updates {
                    inner.publish_status(
                        &destination,
                        &task_key,
                        &label,
                        StatusKind::Finished {
                            outcome: GenerationOutcome::Crashed,
                            elapsed: started.elapsed(),
                        },
                    );
                }
                event_log::log(Event::GenerationEnd {
                    task_key: &task_key,
                    generation: generation.0,
                    outcome: GenerationOutcome::Crashed.as_str(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                return Err(err);
            }
        };
        tracing::debug!(
            target: "cell_offload::engine",
            task_key = %task_key,
            generation = generation.0,
            pid = ?worker.pid,
            "worker spawned"
        );
        event_log::log(Event::Spawn {
            task_key: &task_key,
            generation: generation.0,
            pid: worker.pid,
        });

        let stop = Rc::new(Cell::new(None));
        let (kill_tx, kill_rx) = oneshot::channel();
        inner.slots.borrow_mut().insert(
            task_key.clone(),
            LiveGeneration {
                generation,
                label: label.clone(),
                destination: destination.clone(),
                pid: worker.pid,
                stop: stop.clone(),
                kill: Some(kill_tx),
            },
        );
        inner.draining.set(inner.draining.get() + 1);

        let drain = Drain {
            inner: self.inner.clone(),
            task_key: task_key.clone(),
            generation,
            label: label.clone(),
            destination,
            namespace,
            stop,
            started,
        };
        tokio::task::spawn_local(drain.run(
            worker.child,
            worker.stdin,
            worker.stdout,
            worker.stderr,
            frame,
            kill_rx,
        ));

        Ok(Scheduled {
            task_key,
            generation,
            label,
        })
    }

    pub fn task_state(&self, key: &str) -> TaskState {
        match self.inner.slots.borrow().get(key) {
            Some(live) => TaskState::Live {
                generation: live.generation,
                label: live.label.clone(),
            },
            None => TaskState::Idle,
        }
    }

    /// Live tasks sorted by key.
    pub fn live_tasks(&self) -> Vec<(String, TaskState)> {
        let mut keys: Vec<String> = self.inner.slots.borrow().keys().cloned().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| {
                let state = self.task_state(&key);
                (key, state)
            })
            .collect()
    }

    pub fn last_outcome(&self, key: &str) -> Option<GenerationOutcome> {
        self.inner.outcomes.borrow().get(key).copied()
    }

    /// Stops the live generation for `key` without starting another.
    pub fn cancel(&self, key: &str) -> bool {
        self.inner.terminate(key, GenerationOutcome::Cancelled)
    }

    pub fn shutdown(&self) {
        let keys: Vec<String> = self.inner.slots.borrow().keys().cloned().collect();
        for key in keys {
            self.inner.terminate(&key, GenerationOutcome::Cancelled);
        }
    }

    /// Resolves once no generation is live and every drain has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            if self.inner.slots.borrow().is_empty() && self.inner.draining.get() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once `key` has no live generation.
    pub async fn wait_for(&self, key: &str) {
        loop {
            let notified = self.inner.changed.notified();
            if !self.inner.slots.borrow().contains_key(key) {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    /// Kills the live generation for `key`, if any. Its drain discards whatever
    /// it has not delivered yet.
    fn terminate(&self, key: &str, outcome: GenerationOutcome) -> bool {
        let Some(mut live) = self.slots.borrow_mut().remove(key) else {
            return false;
        };
        live.stop.set(Some(outcome));
        if let Some(pid) = live.pid
            && let Err(err) = kill_process_group(pid)
        {
            tracing::warn!(target: "cell_offload::engine", key, pid, %err, "failed to kill worker group");
        }
        if let Some(kill) = live.kill.take() {
            let _ = kill.send(());
        }
        tracing::debug!(
            target: "cell_offload::engine",
            key,
            generation = live.generation.0,
            outcome = outcome.as_str(),
            "generation stopped"
        );
        event_log::log(Event::Supersede {
            task_key: key,
            generation: live.generation.0,
            outcome: outcome.as_str(),
        });
        self.outcomes.borrow_mut().insert(key.to_string(), outcome);
        if self.config.status_updates {
            self.publish_status(&live.destination, key, &live.label, StatusKind::Stopped { outcome });
        }
        self.changed.notify_waiters();
        true
    }

    fn publish_status(&self, destination: &str, key: &str, label: &str, kind: StatusKind) {
        self.relay.status(
            destination,
            &StatusUpdate {
                task_key: key.to_string(),
                label: label.to_string(),
                kind,
            },
        );
    }

    fn owns_slot(&self, key: &str, generation: GenerationId) -> bool {
        self.slots
            .borrow()
            .get(key)
            .is_some_and(|live| live.generation == generation)
    }
}

/// The host-side half of one generation.
struct Drain {
    inner: Rc<Inner>,
    task_key: String,
    generation: GenerationId,
    label: String,
    destination: String,
    namespace: String,
    stop: Rc<Cell<Option<GenerationOutcome>>>,
    started: Instant,
}

enum Terminal {
    Diff(DiffPayload),
    Fatal(String),
}

impl Drain {
    fn stopped(&self) -> bool {
        self.stop.get().is_some()
    }

    fn forward(&self, event: &OutputEvent) {
        if !self.stopped() {
            self.inner.relay.forward(&self.destination, event);
        }
    }

    async fn run(
        self,
        mut child: Child,
        mut stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
        frame: Vec<u8>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let stderr_tail = tokio::task::spawn_local(read_tail(stderr));
        if let Err(err) = write_frame(&mut stdin, &frame).await {
            tracing::debug!(target: "cell_offload::engine", task_key = %self.task_key, %err, "job write failed");
        }
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        let mut kill_pending = true;
        let mut terminal = None;
        loop {
            tokio::select! {
                signal = &mut kill_rx, if kill_pending => {
                    kill_pending = false;
                    if signal.is_ok()
                        && let Err(err) = child.start_kill()
                    {
                        tracing::debug!(target: "cell_offload::engine", %err, "start_kill failed");
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(done) = self.handle_line(&line) {
                                terminal = Some(done);
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!(target: "cell_offload::engine", %err, "channel read failed");
                            break;
                        }
                    }
                }
            }
        }
        drop(lines);

        let status = child.wait().await;
        let tail = stderr_tail.await.unwrap_or_default();
        let outcome = match (self.stop.get(), terminal) {
            (Some(stopped), _) => stopped,
            (None, Some(Terminal::Diff(payload))) => self.apply_diff(payload),
            (None, Some(Terminal::Fatal(message))) => {
                self.forward(&OutputEvent::stderr(format!(
                    "[Error] Background task '{}' failed: {message}\n",
                    self.task_key
                )));
                GenerationOutcome::Error
            }
            (None, None) => {
                let exit = match &status {
                    Ok(status) => format_exit_status_message(status),
                    Err(err) => format!("worker status unavailable: {err}"),
                };
                let mut warning = format!(
                    "[Warning] Background task '{}' ended without reporting results ({exit})\n",
                    self.task_key
                );
                let tail = tail.trim_end();
                if !tail.is_empty() {
                    warning.push_str(tail);
                    warning.push('\n');
                }
                self.forward(&OutputEvent::stderr(warning));
                GenerationOutcome::Crashed
            }
        };
        self.finish(outcome);
    }

    /// Returns the terminal message once it arrives.
    fn handle_line(&self, line: &str) -> Option<Terminal> {
        let message = match WorkerMessage::decode_line(line) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(target: "cell_offload::engine", %err, line, "ignoring malformed channel line");
                return None;
            }
        };
        match message {
            WorkerMessage::Started { pid } => {
                tracing::debug!(target: "cell_offload::engine", task_key = %self.task_key, pid, "worker started");
                if !self.stopped() && self.inner.config.status_updates {
                    self.inner.publish_status(
                        &self.destination,
                        &self.task_key,
                        &self.label,
                        StatusKind::Running,
                    );
                }
                None
            }
            WorkerMessage::Output { event } => {
                self.forward(&event);
                None
            }
            WorkerMessage::Diff { payload } => Some(Terminal::Diff(payload)),
            WorkerMessage::Fatal { message } => Some(Terminal::Fatal(message)),
        }
    }

    fn apply_diff(&self, payload: DiffPayload) -> GenerationOutcome {
        let DiffPayload {
            changed,
            lost,
            skipped,
            raised,
        } = payload;
        if !skipped.is_empty() || !lost.is_empty() {
            self.forward(&OutputEvent::stderr(outbound_warning(&skipped, &lost)));
        }
        let merged = self.merge(changed);
        if self.inner.config.report_transfers && !merged.is_empty() {
            self.forward(&OutputEvent::stderr(format!(
                "[Info] Variables from background task updated in namespace '{}': {}\n",
                self.namespace,
                merged.join(", ")
            )));
        }
        if raised {
            GenerationOutcome::Error
        } else {
            GenerationOutcome::Completed
        }
    }

    fn merge(&self, changed: BTreeMap<String, Portable>) -> Vec<String> {
        if changed.is_empty() {
            return Vec::new();
        }
        let merged = self.inner.registry.merge(&self.namespace, changed);
        tracing::debug!(
            target: "cell_offload::engine",
            task_key = %self.task_key,
            namespace = %self.namespace,
            names = ?merged,
            "merged diff"
        );
        event_log::log(Event::Merge {
            task_key: &self.task_key,
            generation: self.generation.0,
            namespace: &self.namespace,
            names: &merged,
        });
        merged
    }

    fn finish(self, outcome: GenerationOutcome) {
        let inner = &self.inner;
        if inner.owns_slot(&self.task_key, self.generation) {
            inner.slots.borrow_mut().remove(&self.task_key);
            inner
                .outcomes
                .borrow_mut()
                .insert(self.task_key.clone(), outcome);
            if inner.config.status_updates {
                inner.publish_status(
                    &self.destination,
                    &self.task_key,
                    &self.label,
                    StatusKind::Finished {
                        outcome,
                        elapsed: self.started.elapsed(),
                    },
                );
            }
        }
        event_log::log(Event::GenerationEnd {
            task_key: &self.task_key,
            generation: self.generation.0,
            outcome: outcome.as_str(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
        inner.draining.set(inner.draining.get().saturating_sub(1));
        inner.changed.notify_waiters();
    }
}

async fn write_frame(stdin: &mut ChildStdin, frame: &[u8]) -> std::io::Result<()> {
    stdin.write_all(frame).await?;
    stdin.flush().await?;
    stdin.shutdown().await
}

/// Drains the worker's stderr, keeping the last few kilobytes.
async fn read_tail(mut stderr: ChildStderr) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

fn inbound_warning(skipped: &[SkippedName]) -> String {
    skipped
        .iter()
        .map(|entry| {
            format!(
                "[Warning] Skipping non-serializable global variable '{}' (type: {}): {}\n",
                entry.name, entry.type_name, entry.reason
            )
        })
        .collect()
}

fn outbound_warning(skipped: &BTreeMap<String, String>, lost: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    if !skipped.is_empty() {
        let names: Vec<&str> = skipped.keys().map(String::as_str).collect();
        out.push_str(&format!(
            "[Warning] Skipped non-serializable variables: {}\n",
            names.join(", ")
        ));
    }
    if !lost.is_empty() {
        let names: Vec<&str> = lost.keys().map(String::as_str).collect();
        out.push_str(&format!(
            "[Warning] Variables no longer serializable were left unchanged: {}\n",
            names.join(", ")
        ));
    }
    for (name, reason) in skipped.iter().chain(lost) {
        out.push_str(&format!("  {name}: {reason}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_is_stable_per_source() {
        let key = default_task_key("x = 1\n");
        assert!(key.starts_with("cell-"));
        assert_eq!(key.len(), "cell-".len() + 16);
        assert_eq!(key, default_task_key("x = 1\n"));
        assert_ne!(key, default_task_key("x = 2\n"));
    }

    #[test]
    fn inbound_warning_lists_each_name() {
        let text = inbound_warning(&[SkippedName {
            name: "it".into(),
            type_name: "iterator".into(),
            reason: "iterator state cannot be serialized".into(),
        }]);
        insta::assert_snapshot!(text, @"[Warning] Skipping non-serializable global variable 'it' (type: iterator): iterator state cannot be serialized");
    }

    #[test]
    fn outbound_warning_is_one_block() {
        let skipped = BTreeMap::from([("gen".to_string(), "cannot serialize iterator".to_string())]);
        let lost = BTreeMap::from([("old".to_string(), "cannot serialize method".to_string())]);
        insta::assert_snapshot!(outbound_warning(&skipped, &lost), @r"
        [Warning] Skipped non-serializable variables: gen
        [Warning] Variables no longer serializable were left unchanged: old
          gen: cannot serialize iterator
          old: cannot serialize method
        ");
    }

    #[tokio::test]
    async fn cancel_and_state_on_idle_engine() {
        let engine = Engine::new(
            EngineConfig::new("/nonexistent/worker"),
            Rc::new(RefCell::new(Namespace::new())),
        );
        assert_eq!(engine.task_state("k"), TaskState::Idle);
        assert!(!engine.cancel("k"));
        assert_eq!(engine.last_outcome("k"), None);
        engine.wait_idle().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_and_leaves_slot_idle() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let engine = Engine::new(
                    EngineConfig::new("/nonexistent/worker"),
                    Rc::new(RefCell::new(Namespace::new())),
                );
                let err = engine
                    .submit(SubmitRequest::new("out", "x = 1").with_key("k"))
                    .unwrap_err();
                assert!(matches!(err, SpawnError::Spawn { .. }));
                assert_eq!(engine.task_state("k"), TaskState::Idle);
                assert_eq!(engine.last_outcome("k"), Some(GenerationOutcome::Crashed));
            })
            .await;
    }
}
