use std::cell::RefCell;
use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::engine::{Engine, SubmitRequest, TaskState};
use crate::protocol::OutputEvent;
use crate::registry::{DEFAULT_NAMESPACE, NamespaceHandle};
use crate::relay::{RenderSurface, StatusUpdate};
use crate::script::{Host, Interpreter};

const BACKGROUND_MAGIC: &str = "%%background";

pub type SharedWriter = Rc<RefCell<dyn Write>>;

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Usage(String),
}

/// Options given on a `%%background` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackgroundOptions {
    pub namespace: Option<String>,
    pub key: Option<String>,
}

pub fn parse_background_line(line: &str) -> Result<BackgroundOptions, ShellError> {
    let mut words = line.split_whitespace();
    if words.next() != Some(BACKGROUND_MAGIC) {
        return Err(ShellError::Usage(format!(
            "expected {BACKGROUND_MAGIC}, got {line:?}"
        )));
    }
    let mut options = BackgroundOptions::default();
    while let Some(word) = words.next() {
        match word {
            "--key" => {
                let key = words
                    .next()
                    .ok_or_else(|| ShellError::Usage("--key requires a value".to_string()))?;
                options.key = Some(key.to_string());
            }
            flag if flag.starts_with("--") => {
                return Err(ShellError::Usage(format!("unknown option {flag}")));
            }
            name if options.namespace.is_none() => options.namespace = Some(name.to_string()),
            extra => {
                return Err(ShellError::Usage(format!("unexpected argument {extra}")));
            }
        }
    }
    Ok(options)
}

/// Writes text with a prefix at the start of every line.
struct PrefixWriter {
    prefix: String,
    at_line_start: bool,
}

impl PrefixWriter {
    fn new(prefix: String) -> Self {
        Self {
            prefix,
            at_line_start: true,
        }
    }

    fn write(&mut self, out: &mut dyn Write, text: &str) -> io::Result<()> {
        for piece in text.split_inclusive('\n') {
            if self.at_line_start {
                out.write_all(self.prefix.as_bytes())?;
            }
            out.write_all(piece.as_bytes())?;
            self.at_line_start = piece.ends_with('\n');
        }
        out.flush()
    }
}

/// Renders a background task's output on the terminal, one `[key] ` prefix per line.
pub struct TerminalSurface {
    stdout: SharedWriter,
    stderr: SharedWriter,
    out_lines: PrefixWriter,
    err_lines: PrefixWriter,
}

impl TerminalSurface {
    pub fn new(key: &str, stdout: SharedWriter, stderr: SharedWriter) -> Self {
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("[{key}] ")
        };
        Self {
            stdout,
            stderr,
            out_lines: PrefixWriter::new(prefix.clone()),
            err_lines: PrefixWriter::new(prefix),
        }
    }
}

impl RenderSurface for TerminalSurface {
    fn render(&mut self, event: &OutputEvent) -> io::Result<()> {
        match event {
            OutputEvent::Stdout { text } => {
                self.out_lines.write(&mut *self.stdout.borrow_mut(), text)
            }
            OutputEvent::Stderr { text } => {
                self.err_lines.write(&mut *self.stderr.borrow_mut(), text)
            }
            OutputEvent::Display { data, .. } => {
                let text = display_text(data);
                self.out_lines
                    .write(&mut *self.stdout.borrow_mut(), &format!("{text}\n"))
            }
        }
    }

    fn status(&mut self, update: &StatusUpdate) -> io::Result<()> {
        self.err_lines
            .write(&mut *self.stderr.borrow_mut(), &format!("{update}\n"))
    }
}

fn display_text(data: &std::collections::BTreeMap<String, String>) -> &str {
    ["text/plain", "text/markdown", "text/html"]
        .iter()
        .find_map(|mime| data.get(*mime))
        .or_else(|| data.values().next())
        .map(String::as_str)
        .unwrap_or("")
}

/// Foreground output goes straight to the terminal.
struct ConsoleHost {
    stdout: SharedWriter,
    stderr: SharedWriter,
}

impl Host for ConsoleHost {
    fn emit(&mut self, event: OutputEvent) {
        let result = match &event {
            OutputEvent::Stdout { text } => self.stdout.borrow_mut().write_all(text.as_bytes()),
            OutputEvent::Stderr { text } => self.stderr.borrow_mut().write_all(text.as_bytes()),
            OutputEvent::Display { data, .. } => {
                writeln!(self.stdout.borrow_mut(), "{}", display_text(data))
            }
        };
        if let Err(err) = result {
            tracing::debug!(target: "cell_offload::shell", %err, "foreground write failed");
        }
    }
}

/// Reads cells from a line source and runs them in the foreground or background.
pub struct Shell {
    engine: Engine,
    globals: NamespaceHandle,
    stdout: SharedWriter,
    stderr: SharedWriter,
}

impl Shell {
    pub fn new(engine: Engine, stdout: SharedWriter, stderr: SharedWriter) -> Self {
        let globals = engine.registry().globals();
        Self {
            engine,
            globals,
            stdout,
            stderr,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs until `input` is exhausted, then waits for background tasks.
    pub async fn run(&mut self, input: impl AsyncBufRead + Unpin) -> Result<(), ShellError> {
        let mut lines = input.lines();
        loop {
            let Some(first) = lines.next_line().await? else {
                break;
            };
            if first.trim().is_empty() || is_exact_command(&first, "END") {
                continue;
            }
            if first.starts_with('%') && !first.starts_with("%%") {
                self.line_command(first.trim()).await?;
                continue;
            }
            let mut cell = String::new();
            let header = first.starts_with(BACKGROUND_MAGIC).then(|| first.clone());
            if header.is_none() {
                cell.push_str(&first);
                cell.push('\n');
            }
            while let Some(line) = lines.next_line().await? {
                if is_exact_command(&line, "END") {
                    break;
                }
                cell.push_str(&line);
                cell.push('\n');
            }
            match header {
                Some(header) => self.background(&header, cell)?,
                None => self.foreground(&cell),
            }
            self.flush()?;
        }
        self.engine.wait_idle().await;
        self.flush()?;
        Ok(())
    }

    fn foreground(&mut self, source: &str) {
        let mut host = ConsoleHost {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        };
        let mut globals = self.globals.borrow_mut();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            Interpreter::new(&mut globals, &mut host).run_interactive(source)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => host.emit(OutputEvent::stderr(err.traceback())),
            Err(_) => host.emit(OutputEvent::stderr("[Error] interpreter panicked\n")),
        }
    }

    fn background(&mut self, header: &str, source: String) -> Result<(), ShellError> {
        let options = match parse_background_line(header) {
            Ok(options) => options,
            Err(err) => {
                writeln!(self.stderr.borrow_mut(), "{err}")?;
                return Ok(());
            }
        };
        let key = options
            .key
            .unwrap_or_else(|| crate::engine::default_task_key(&source));
        let request = SubmitRequest {
            task_key: Some(key.clone()),
            destination: key.clone(),
            source,
            namespace: options.namespace,
        };
        if !self.engine.relay().is_attached(&key) {
            self.engine.relay().attach(
                key.clone(),
                Box::new(TerminalSurface::new(
                    &key,
                    self.stdout.clone(),
                    self.stderr.clone(),
                )),
            );
        }
        if let Err(err) = self.engine.submit(request) {
            // Already relayed to the task's surface.
            tracing::debug!(target: "cell_offload::shell", %err, "background submit failed");
        }
        Ok(())
    }

    async fn line_command(&mut self, line: &str) -> Result<(), ShellError> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let argument = words.next();
        match command {
            "%ns" => {
                let name = argument.unwrap_or(DEFAULT_NAMESPACE);
                let namespace = self.engine.get_namespace(name);
                let mut out = self.stdout.borrow_mut();
                for (key, value) in &namespace {
                    writeln!(out, "{key} = {}", value.repr())?;
                }
            }
            "%tasks" => {
                let tasks = self.engine.live_tasks();
                let mut out = self.stdout.borrow_mut();
                if tasks.is_empty() {
                    writeln!(out, "no live tasks")?;
                }
                for (key, state) in tasks {
                    if let TaskState::Live { generation, label } = state {
                        writeln!(out, "{key} {label} generation {generation}")?;
                    }
                }
            }
            "%wait" => self.engine.wait_idle().await,
            "%stop" => {
                let Some(key) = argument else {
                    writeln!(self.stderr.borrow_mut(), "usage: %stop KEY")?;
                    return Ok(());
                };
                let message = if self.engine.cancel(key) {
                    format!("stopped {key}")
                } else {
                    format!("no live task {key}")
                };
                writeln!(self.stdout.borrow_mut(), "{message}")?;
            }
            other => {
                writeln!(self.stderr.borrow_mut(), "unknown command {other}")?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        self.stdout.borrow_mut().flush()?;
        self.stderr.borrow_mut().flush()
    }
}

fn is_exact_command(line: &str, command: &str) -> bool {
    line.trim_end_matches(['\n', '\r']) == command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    #[test]
    fn background_line_options() {
        assert_eq!(
            parse_background_line("%%background").expect("parse"),
            BackgroundOptions::default()
        );
        assert_eq!(
            parse_background_line("%%background spaceA --key cellB").expect("parse"),
            BackgroundOptions {
                namespace: Some("spaceA".into()),
                key: Some("cellB".into()),
            }
        );
        assert!(parse_background_line("%%background --key").is_err());
        assert!(parse_background_line("%%background a b").is_err());
    }

    #[test]
    fn surface_prefixes_every_line_across_chunks() {
        let out = Capture::default();
        let err = Capture::default();
        let mut surface = TerminalSurface::new(
            "k",
            Rc::new(RefCell::new(out.clone())),
            Rc::new(RefCell::new(err.clone())),
        );
        surface.render(&OutputEvent::stdout("a\nb")).expect("render");
        surface.render(&OutputEvent::stdout("c\n")).expect("render");
        surface.render(&OutputEvent::stderr("oops\n")).expect("render");
        assert_eq!(out.text(), "[k] a\n[k] bc\n");
        assert_eq!(err.text(), "[k] oops\n");
    }

    #[tokio::test]
    async fn foreground_cells_and_line_commands() {
        let out = Capture::default();
        let err = Capture::default();
        let globals: NamespaceHandle = Rc::new(RefCell::new(Default::default()));
        let engine = Engine::new(
            crate::config::EngineConfig::new("/nonexistent/worker"),
            globals,
        );
        let mut shell = Shell::new(
            engine,
            Rc::new(RefCell::new(out.clone())),
            Rc::new(RefCell::new(err.clone())),
        );
        let input = "x = 40\nx + 2\nEND\n1 / 0\nEND\n%ns\n%tasks\n";
        shell.run(input.as_bytes()).await.expect("run");
        insta::assert_snapshot!(out.text(), @r"
        42
        x = 40
        no live tasks
        ");
        assert!(err.text().contains("ZeroDivisionError"), "{}", err.text());
    }

    #[tokio::test]
    async fn oversized_foreground_cell_reports_and_keeps_the_session() {
        let out = Capture::default();
        let err = Capture::default();
        let globals: NamespaceHandle = Rc::new(RefCell::new(Default::default()));
        let engine = Engine::new(
            crate::config::EngineConfig::new("/nonexistent/worker"),
            globals,
        );
        let mut shell = Shell::new(
            engine,
            Rc::new(RefCell::new(out.clone())),
            Rc::new(RefCell::new(err.clone())),
        );
        let input = "x = [0] * (2 ** 62)\nEND\ny = 1\nEND\n%ns\n";
        shell.run(input.as_bytes()).await.expect("run");
        assert_eq!(out.text(), "y = 1\n");
        assert!(err.text().contains("OverflowError"), "{}", err.text());
    }
}
