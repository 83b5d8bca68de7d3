use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker was started without a piped {0}")]
    MissingPipe(&'static str),
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A freshly spawned worker and its three pipes.
pub(crate) struct WorkerProcess {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub(crate) fn spawn_worker(config: &EngineConfig) -> Result<WorkerProcess, SpawnError> {
    let mut command = Command::new(&config.worker_program);
    command
        .args(&config.worker_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(target_family = "unix")]
    unsafe {
        command.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
        program: config.worker_program.display().to_string(),
        source,
    })?;
    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;
    let pid = child.id();
    Ok(WorkerProcess {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// SIGKILL to the worker's whole process group.
#[cfg(target_family = "unix")]
pub(crate) fn kill_process_group(pid: u32) -> std::io::Result<()> {
    if pid == 0 {
        return Ok(());
    }
    let result = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // Already gone.
    if err.raw_os_error() == Some(libc::ESRCH) || err.kind() == std::io::ErrorKind::NotFound {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(target_family = "unix"))]
pub(crate) fn kill_process_group(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

pub(crate) fn format_exit_status_message(status: &ExitStatus) -> String {
    #[cfg(target_family = "unix")]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(status) {
        return format!("worker exited with signal {signal}");
    }
    match status.code() {
        Some(code) => format!("worker exited with status {code}"),
        None => "worker exited with unknown status".to_string(),
    }
}

#[cfg(all(test, target_family = "unix"))]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn exit_status_names_signal_or_code() {
        assert_eq!(
            format_exit_status_message(&ExitStatus::from_raw(9)),
            "worker exited with signal 9"
        );
        assert_eq!(
            format_exit_status_message(&ExitStatus::from_raw(3 << 8)),
            "worker exited with status 3"
        );
    }

    #[test]
    fn killing_a_vanished_group_is_not_an_error() {
        // Far above any default pid_max.
        assert!(kill_process_group(0x3fff_fff0).is_ok());
    }

    #[tokio::test]
    async fn missing_program_reports_spawn_error() {
        let config = EngineConfig::new("/nonexistent/cell-offload-worker");
        let err = spawn_worker(&config).err().expect("spawn should fail");
        assert!(matches!(err, SpawnError::Spawn { .. }), "{err}");
    }
}
