#![allow(dead_code)]

use std::cell::RefCell;
use std::error::Error;
use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use cell_offload::script::Namespace;
use cell_offload::{Engine, EngineConfig, NamespaceHandle, OutputEvent, RenderSurface, StatusUpdate};

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub const WAIT_LIMIT: Duration = Duration::from_secs(30);

pub fn resolve_exe_path() -> TestResult<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_cell-offload") {
        return Ok(PathBuf::from(path));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("cell-offload");
    if cfg!(windows) {
        path.set_extension("exe");
    }

    if path.exists() {
        Ok(path)
    } else {
        Err("unable to locate cell-offload test binary".into())
    }
}

pub fn engine_config() -> TestResult<EngineConfig> {
    Ok(EngineConfig::new(resolve_exe_path()?))
}

pub fn new_engine(config: EngineConfig) -> (Engine, NamespaceHandle) {
    let globals: NamespaceHandle = Rc::new(RefCell::new(Namespace::new()));
    (Engine::new(config, globals.clone()), globals)
}

/// Runs `body` on a `LocalSet`, as the engine requires.
pub async fn local<F: Future>(body: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(body).await
}

pub async fn wait_idle(engine: &Engine) -> TestResult<()> {
    tokio::time::timeout(WAIT_LIMIT, engine.wait_idle()).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub enum Recorded {
    Event(OutputEvent),
    Status(StatusUpdate),
}

/// A render surface that keeps everything it receives.
#[derive(Clone, Default)]
pub struct Recording {
    seen: Rc<RefCell<Vec<Recorded>>>,
}

impl Recording {
    pub fn attach(&self, engine: &Engine, destination: &str) {
        engine
            .relay()
            .attach(destination, Box::new(RecordingSurface(self.clone())));
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.seen
            .borrow()
            .iter()
            .filter_map(|item| match item {
                Recorded::Event(event) => Some(event.clone()),
                Recorded::Status(_) => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.seen
            .borrow()
            .iter()
            .filter_map(|item| match item {
                Recorded::Status(update) => Some(update.to_string()),
                Recorded::Event(_) => None,
            })
            .collect()
    }

    pub fn stdout(&self) -> String {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                OutputEvent::Stdout { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn stderr_events(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                OutputEvent::Stderr { text } => Some(text),
                _ => None,
            })
            .collect()
    }
}

struct RecordingSurface(Recording);

impl RenderSurface for RecordingSurface {
    fn render(&mut self, event: &OutputEvent) -> std::io::Result<()> {
        self.0.seen.borrow_mut().push(Recorded::Event(event.clone()));
        Ok(())
    }

    fn status(&mut self, update: &StatusUpdate) -> std::io::Result<()> {
        self.0
            .seen
            .borrow_mut()
            .push(Recorded::Status(update.clone()));
        Ok(())
    }
}
