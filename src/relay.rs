use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::protocol::OutputEvent;

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// A diff arrived and the source ran to the end.
    Completed,
    /// A diff arrived after the source raised, or the worker reported a fatal error.
    Error,
    /// The channel closed without a terminal message.
    Crashed,
    Superseded,
    Cancelled,
}

impl GenerationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationOutcome::Completed => "Completed",
            GenerationOutcome::Error => "Error",
            GenerationOutcome::Crashed => "Crashed",
            GenerationOutcome::Superseded => "Superseded",
            GenerationOutcome::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusKind {
    Starting,
    Running,
    Finished {
        outcome: GenerationOutcome,
        elapsed: Duration,
    },
    Stopped {
        outcome: GenerationOutcome,
    },
}

/// One lifecycle transition of a generation.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub task_key: String,
    pub label: String,
    pub kind: StatusKind,
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StatusKind::Starting => write!(f, "Starting [{}]...", self.label),
            StatusKind::Running => f.write_str("Running"),
            StatusKind::Finished { outcome, elapsed } => write!(
                f,
                "Finished ({}) - {:.2}s",
                outcome.as_str(),
                elapsed.as_secs_f64()
            ),
            StatusKind::Stopped {
                outcome: GenerationOutcome::Superseded,
            } => f.write_str("Task stopped (superseded)."),
            StatusKind::Stopped { .. } => f.write_str("Task stopped."),
        }
    }
}

/// Where a destination's output ends up.
pub trait RenderSurface {
    fn render(&mut self, event: &OutputEvent) -> std::io::Result<()>;

    fn status(&mut self, _update: &StatusUpdate) -> std::io::Result<()> {
        Ok(())
    }
}

/// Routes events to the surface registered for their destination.
#[derive(Default)]
pub struct OutputRelay {
    surfaces: RefCell<HashMap<String, Box<dyn RenderSurface>>>,
}

impl fmt::Debug for OutputRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let surfaces = self.surfaces.borrow();
        let mut names: Vec<&String> = surfaces.keys().collect();
        names.sort();
        f.debug_struct("OutputRelay")
            .field("destinations", &names)
            .finish()
    }
}

impl OutputRelay {
    pub fn attach(&self, destination: impl Into<String>, surface: Box<dyn RenderSurface>) {
        self.surfaces
            .borrow_mut()
            .insert(destination.into(), surface);
    }

    pub fn detach(&self, destination: &str) -> Option<Box<dyn RenderSurface>> {
        self.surfaces.borrow_mut().remove(destination)
    }

    pub fn is_attached(&self, destination: &str) -> bool {
        self.surfaces.borrow().contains_key(destination)
    }

    pub fn forward(&self, destination: &str, event: &OutputEvent) {
        let mut surfaces = self.surfaces.borrow_mut();
        let Some(surface) = surfaces.get_mut(destination) else {
            tracing::debug!(target: "cell_offload::relay", destination, kind = event.kind(), "no surface; dropping event");
            return;
        };
        if let Err(err) = surface.render(event) {
            tracing::debug!(target: "cell_offload::relay", destination, %err, "surface rejected event");
        }
    }

    pub fn status(&self, destination: &str, update: &StatusUpdate) {
        let mut surfaces = self.surfaces.borrow_mut();
        let Some(surface) = surfaces.get_mut(destination) else {
            return;
        };
        if let Err(err) = surface.status(update) {
            tracing::debug!(target: "cell_offload::relay", destination, %err, "surface rejected status");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl RenderSurface for Recorder {
        fn render(&mut self, event: &OutputEvent) -> std::io::Result<()> {
            if let OutputEvent::Stdout { text } = event {
                self.seen.borrow_mut().push(text.clone());
            }
            Ok(())
        }
    }

    struct Broken;

    impl RenderSurface for Broken {
        fn render(&mut self, _event: &OutputEvent) -> std::io::Result<()> {
            Err(std::io::Error::other("closed"))
        }
    }

    #[test]
    fn forwards_in_arrival_order_per_destination() {
        let relay = OutputRelay::default();
        let a = Recorder::default();
        let seen_a = a.seen.clone();
        let b = Recorder::default();
        let seen_b = b.seen.clone();
        relay.attach("a", Box::new(a));
        relay.attach("b", Box::new(b));

        relay.forward("a", &OutputEvent::stdout("1"));
        relay.forward("b", &OutputEvent::stdout("x"));
        relay.forward("a", &OutputEvent::stdout("2"));

        assert_eq!(*seen_a.borrow(), vec!["1", "2"]);
        assert_eq!(*seen_b.borrow(), vec!["x"]);
    }

    #[test]
    fn missing_or_failing_destinations_drop_silently() {
        let relay = OutputRelay::default();
        relay.forward("nowhere", &OutputEvent::stderr("lost"));
        relay.attach("broken", Box::new(Broken));
        relay.forward("broken", &OutputEvent::stdout("lost"));
        assert!(relay.detach("broken").is_some());
        assert!(!relay.is_attached("broken"));
    }

    #[test]
    fn status_lines_render_like_the_console() {
        let update = |kind| StatusUpdate {
            task_key: "cellA".into(),
            label: "bg_task_3".into(),
            kind,
        };
        assert_eq!(update(StatusKind::Starting).to_string(), "Starting [bg_task_3]...");
        assert_eq!(
            update(StatusKind::Finished {
                outcome: GenerationOutcome::Completed,
                elapsed: Duration::from_millis(1500),
            })
            .to_string(),
            "Finished (Completed) - 1.50s"
        );
        assert_eq!(
            update(StatusKind::Stopped {
                outcome: GenerationOutcome::Superseded
            })
            .to_string(),
            "Task stopped (superseded)."
        );
    }
}
