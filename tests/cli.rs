mod common;

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

use cell_offload::OutputEvent;
use cell_offload::portable::Portable;
use cell_offload::protocol::{Job, WorkerMessage};
use cell_offload::snapshot::SnapshotRules;
use common::{TestResult, resolve_exe_path};

fn run_shell(input: &str) -> TestResult<(String, String)> {
    let mut child = Command::new(resolve_exe_path()?)
        .arg("shell")
        .env_remove("CELL_OFFLOAD_DEBUG_EVENTS_DIR")
        .env_remove("CELL_OFFLOAD_REPORT_TRANSFERS")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    {
        let mut stdin = child.stdin.take().ok_or("missing stdin")?;
        stdin.write_all(input.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    assert!(output.status.success(), "shell exited with {}", output.status);
    Ok((
        String::from_utf8(output.stdout)?,
        String::from_utf8(output.stderr)?,
    ))
}

#[test]
fn shell_merges_background_results_into_the_session() -> TestResult<()> {
    let input = "\
x = 1
END
%%background --key cellA
print('hi')
y = x + 1
END
%wait
%ns
%%background spaceA --key cellB
data = [1, 2, 3]
END
%wait
%ns spaceA
%tasks
";
    let (stdout, stderr) = run_shell(input)?;
    insta::assert_snapshot!(stdout, @r"
    [cellA] hi
    x = 1
    y = 2
    data = [1, 2, 3]
    no live tasks
    ");
    assert!(stderr.contains("[cellA] Starting [bg_task_"), "{stderr}");
    assert!(stderr.contains("[cellA] Finished (Completed) - "), "{stderr}");
    Ok(())
}

#[test]
fn shell_relays_background_tracebacks() -> TestResult<()> {
    let input = "\
%%background --key cellC
partial = 5
raise ValueError('bad input')
END
%wait
%ns
";
    let (stdout, stderr) = run_shell(input)?;
    assert_eq!(stdout, "partial = 5\n");
    assert!(stderr.contains("[cellC] ValueError: bad input"), "{stderr}");
    assert!(stderr.contains("[cellC] Finished (Error) - "), "{stderr}");
    Ok(())
}

#[test]
fn run_writes_the_debug_event_log() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let events_dir = dir.path().join("events");
    let script = dir.path().join("cell.txt");
    std::fs::write(&script, "total = sum(range(4))\nprint(total)\n")?;

    let output = Command::new(resolve_exe_path()?)
        .arg("--debug-events-dir")
        .arg(&events_dir)
        .arg("run")
        .arg(&script)
        .arg("--key")
        .arg("job")
        .output()?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8(output.stdout)?, "6\n");

    let mut logs: Vec<_> = std::fs::read_dir(&events_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    assert_eq!(logs.len(), 1, "{logs:?}");
    let text = std::fs::read_to_string(logs.remove(0))?;
    let lines = text
        .lines()
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<Result<Vec<_>, _>>()?;
    let events: Vec<&str> = lines
        .iter()
        .filter_map(|line| line["event"].as_str())
        .collect();
    assert_eq!(
        events,
        vec!["startup", "submit", "spawn", "merge", "generation_end"]
    );
    assert_eq!(lines[0]["mode"], "run");
    assert_eq!(lines[3]["names"], serde_json::json!(["total"]));
    let end = &lines[4];
    assert_eq!(end["task_key"], "job");
    assert_eq!(end["generation"], 1);
    assert_eq!(end["outcome"], "Completed");
    assert!(end["elapsed_ms"].is_u64(), "{end}");
    Ok(())
}

#[test]
fn run_fails_when_the_cell_raises() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let script = dir.path().join("cell.txt");
    std::fs::write(&script, "1 / 0\n")?;
    let output = Command::new(resolve_exe_path()?)
        .arg("run")
        .arg(&script)
        .env_remove("CELL_OFFLOAD_DEBUG_EVENTS_DIR")
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("ZeroDivisionError"), "{stderr}");
    Ok(())
}

#[test]
fn worker_speaks_the_line_protocol() -> TestResult<()> {
    let job = Job {
        task_key: "cellA".to_string(),
        generation: 1,
        source: "print(greeting)\nanswer = 42\n".to_string(),
        namespace: BTreeMap::from([(
            "greeting".to_string(),
            Portable::Str("hello".to_string()),
        )]),
        rules: SnapshotRules::default(),
    };

    let mut child = Command::new(resolve_exe_path()?)
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    {
        let mut stdin = child.stdin.take().ok_or("missing stdin")?;
        stdin.write_all(&job.encode_frame()?)?;
    }
    let stdout = child.stdout.take().ok_or("missing stdout")?;
    let messages = BufReader::new(stdout)
        .lines()
        .map(|line| Ok(WorkerMessage::decode_line(&line?)?))
        .collect::<TestResult<Vec<_>>>()?;
    assert!(child.wait()?.success());

    assert_eq!(messages.len(), 3, "{messages:?}");
    assert!(matches!(messages[0], WorkerMessage::Started { .. }));
    let WorkerMessage::Output { event } = &messages[1] else {
        panic!("expected output, got {:?}", messages[1]);
    };
    assert_eq!(event, &OutputEvent::stdout("hello\n"));
    let WorkerMessage::Diff { payload } = &messages[2] else {
        panic!("expected diff, got {:?}", messages[2]);
    };
    assert_eq!(payload.changed.keys().collect::<Vec<_>>(), vec!["answer"]);
    assert!(matches!(payload.changed["answer"], Portable::Int(42)));
    assert!(!payload.raised);
    Ok(())
}

#[test]
fn worker_reports_a_malformed_frame_as_fatal() -> TestResult<()> {
    let mut child = Command::new(resolve_exe_path()?)
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    {
        let mut stdin = child.stdin.take().ok_or("missing stdin")?;
        stdin.write_all(b"not a frame\n")?;
    }
    let output = child.wait_with_output()?;
    let text = String::from_utf8(output.stdout)?;
    let last = text.lines().last().ok_or("no messages")?;
    assert!(matches!(
        WorkerMessage::decode_line(last)?,
        WorkerMessage::Fatal { .. }
    ));
    Ok(())
}
