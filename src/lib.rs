//! Background cell execution.
//!
//! A cell submitted under a task key runs in a fresh worker process that
//! starts from a snapshot of the target namespace. Output streams back while
//! the cell runs; when it finishes, the bindings it created or changed are
//! merged into the target namespace on the host thread.

pub mod config;
pub mod engine;
pub mod event_log;
pub mod portable;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod script;
pub mod shell;
pub mod snapshot;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{
    Engine, GenerationId, Scheduled, SpawnError, SubmitRequest, TaskState, default_task_key,
};
pub use protocol::OutputEvent;
pub use registry::{DEFAULT_NAMESPACE, NamespaceHandle, NamespaceRegistry};
pub use relay::{GenerationOutcome, OutputRelay, RenderSurface, StatusKind, StatusUpdate};
