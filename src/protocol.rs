use std::collections::BTreeMap;
use std::io::{BufRead, Read};

use serde::{Deserialize, Serialize};

use crate::portable::Portable;
use crate::snapshot::SnapshotRules;

pub const WORKER_MODE_ARG: &str = "worker";

pub(crate) const JOB_FRAME_PREFIX: &str = "CELL_OFFLOAD_JOB ";

pub(crate) fn format_job_frame_header(len: usize) -> String {
    format!("{JOB_FRAME_PREFIX}{len}\n")
}

pub(crate) fn parse_job_frame_header(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    let rest = trimmed.strip_prefix(JOB_FRAME_PREFIX)?;
    rest.trim().parse().ok()
}

/// The work handed to a worker on its stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub task_key: String,
    pub generation: u64,
    pub source: String,
    pub namespace: BTreeMap<String, Portable>,
    /// Exclusions the worker applies when computing the diff.
    #[serde(default)]
    pub rules: SnapshotRules,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("channel i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("expected job frame header, got {0:?}")]
    BadHeader(String),
    #[error("stdin closed before a job arrived")]
    NoJob,
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Job {
    /// Reads one framed job: a header line, then exactly the announced bytes.
    pub fn read_frame(reader: &mut impl BufRead) -> Result<Self, ProtocolError> {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            return Err(ProtocolError::NoJob);
        }
        let len = parse_job_frame_header(&header).ok_or(ProtocolError::BadHeader(header))?;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn encode_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let body = serde_json::to_vec(self)?;
        let mut frame = format_job_frame_header(body.len()).into_bytes();
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    Display {
        data: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: BTreeMap<String, serde_json::Value>,
    },
}

impl OutputEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        OutputEvent::Stdout { text: text.into() }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        OutputEvent::Stderr { text: text.into() }
    }

    pub fn display(data: BTreeMap<String, String>) -> Self {
        OutputEvent::Display {
            data,
            metadata: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutputEvent::Stdout { .. } => "stdout",
            OutputEvent::Stderr { .. } => "stderr",
            OutputEvent::Display { .. } => "display",
        }
    }
}

/// Bindings a generation reports back once its source has run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffPayload {
    /// New names, and names whose fingerprint changed.
    pub changed: BTreeMap<String, Portable>,
    /// Names present in the inbound snapshot that no longer serialize, with reasons.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lost: BTreeMap<String, String>,
    /// New or rebound names that do not serialize, with reasons.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub skipped: BTreeMap<String, String>,
    /// The source raised before running to the end.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub raised: bool,
}

/// One line on the worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Started { pid: u32 },
    Output { event: OutputEvent },
    Diff { payload: DiffPayload },
    Fatal { message: String },
}

impl WorkerMessage {
    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerMessage::Diff { .. } | WorkerMessage::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_frame_header_roundtrip() {
        let header = format_job_frame_header(42);
        assert_eq!(header, "CELL_OFFLOAD_JOB 42\n");
        assert_eq!(parse_job_frame_header(&header), Some(42));
        assert_eq!(parse_job_frame_header("CELL_OFFLOAD_JOB x\n"), None);
        assert_eq!(parse_job_frame_header("print(1)\n"), None);
    }

    #[test]
    fn job_frame_reads_exactly_the_announced_body() {
        let job = Job {
            task_key: "cellA".into(),
            generation: 3,
            source: "x = 1\n".into(),
            namespace: BTreeMap::from([("y".to_string(), Portable::Int(2))]),
            rules: SnapshotRules::default(),
        };
        let mut bytes = job.encode_frame().expect("encode");
        bytes.extend_from_slice(b"trailing");
        let decoded = Job::read_frame(&mut bytes.as_slice()).expect("decode");
        assert_eq!(decoded.task_key, "cellA");
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.namespace.get("y"), Some(&Portable::Int(2)));
    }

    #[test]
    fn job_frame_rejects_bare_source() {
        let err = Job::read_frame(&mut "x = 1\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ProtocolError::BadHeader(_)), "{err}");
        let err = Job::read_frame(&mut "".as_bytes()).unwrap_err();
        assert!(matches!(err, ProtocolError::NoJob));
    }

    #[test]
    fn output_message_wire_shape() {
        let message = WorkerMessage::Output {
            event: OutputEvent::stdout("hi\n"),
        };
        let line = serde_json::to_string(&message).expect("encode");
        assert_eq!(
            line,
            r#"{"type":"output","event":{"type":"stdout","text":"hi\n"}}"#
        );
    }

    #[test]
    fn empty_diff_omits_lost_and_skipped() {
        let message = WorkerMessage::Diff {
            payload: DiffPayload::default(),
        };
        let line = serde_json::to_string(&message).expect("encode");
        assert_eq!(line, r#"{"type":"diff","payload":{"changed":{}}}"#);
        let decoded: WorkerMessage = serde_json::from_str(&line).expect("decode");
        assert!(decoded.is_terminal());
    }
}
