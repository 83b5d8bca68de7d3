use std::path::PathBuf;

use crate::protocol::WORKER_MODE_ARG;
use crate::snapshot::SnapshotRules;

pub const WORKER_EXE_ENV: &str = "CELL_OFFLOAD_WORKER_EXE";
pub const REPORT_TRANSFERS_ENV: &str = "CELL_OFFLOAD_REPORT_TRANSFERS";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executable re-invoked in worker mode for every generation.
    pub worker_program: PathBuf,
    pub worker_args: Vec<String>,
    pub snapshot_rules: SnapshotRules,
    /// Emit an `[Info]` line naming the variables merged by each generation.
    pub report_transfers: bool,
    /// Publish `Starting`/`Running`/`Finished` updates to render surfaces.
    pub status_updates: bool,
}

impl EngineConfig {
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: worker_program.into(),
            worker_args: vec![WORKER_MODE_ARG.to_string()],
            snapshot_rules: SnapshotRules::default(),
            report_transfers: false,
            status_updates: true,
        }
    }

    /// Uses the current executable as the worker unless overridden by the environment.
    pub fn from_env() -> std::io::Result<Self> {
        let current = std::env::current_exe();
        Self::from_lookup(|key| std::env::var(key).ok(), current)
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        current_exe: std::io::Result<PathBuf>,
    ) -> std::io::Result<Self> {
        let worker_program = match lookup(WORKER_EXE_ENV).filter(|raw| !raw.trim().is_empty()) {
            Some(raw) => PathBuf::from(raw),
            None => current_exe?,
        };
        let report_transfers = lookup(REPORT_TRANSFERS_ENV).is_some_and(|raw| is_truthy(&raw));
        Ok(Self::new(worker_program).with_report_transfers(report_transfers))
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_snapshot_rules(mut self, rules: SnapshotRules) -> Self {
        self.snapshot_rules = rules;
        self
    }

    pub fn with_report_transfers(mut self, enabled: bool) -> Self {
        self.report_transfers = enabled;
        self
    }

    pub fn with_status_updates(mut self, enabled: bool) -> Self {
        self.status_updates = enabled;
        self
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
