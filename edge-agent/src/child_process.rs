//! Generic wrapper around an always-on external process (capture, §6.2, or
//! publisher, §6.1). Keeps a handle, a manual-stop flag, and restarts the
//! child with capped exponential backoff unless the flag is set — the
//! replacement for a language-specific async spawn/supervise library
//! described in §9.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

const RESTART_BASE: Duration = Duration::from_millis(500);
const RESTART_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// Supervises one instance of an external process: (re)spawns it, waits
/// for exit, and restarts with backoff unless told to stop. Readiness
/// (socket file present, log marker seen) is a concern of the caller, not
/// this supervisor — it only owns the process lifecycle.
pub struct Supervisor {
    stop_flag: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
    pid: Arc<std::sync::Mutex<Option<u32>>>,
}

impl Supervisor {
    /// Spawns `spec` and begins supervising it in a background task.
    pub fn spawn(spec: ChildSpec) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let pid = Arc::new(std::sync::Mutex::new(None));

        let task_stop_flag = stop_flag.clone();
        let task_pid = pid.clone();
        let task = tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if task_stop_flag.load(Ordering::SeqCst) {
                    return;
                }
                match spawn_child(&spec) {
                    Ok(mut child) => {
                        *task_pid.lock().unwrap() = child.id();
                        attempt = 0;
                        let status = child.wait().await;
                        *task_pid.lock().unwrap() = None;
                        if task_stop_flag.load(Ordering::SeqCst) {
                            return;
                        }
                        warn!(program = %spec.program, ?status, "child process exited, restarting");
                    }
                    Err(err) => {
                        warn!(program = %spec.program, %err, "failed to spawn child process");
                    }
                }
                let delay = restart_delay(attempt);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        });

        Self {
            stop_flag,
            task: Some(task),
            pid,
        }
    }

    /// Sends SIGINT, waits up to `grace`, then SIGKILLs if still alive, and
    /// stops the supervisor from restarting the process further.
    pub async fn stop(&mut self, grace: Duration) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(pid) = *self.pid.lock().unwrap() {
            send_signal(pid, libc::SIGINT);
        }
        tokio::time::sleep(grace).await;
        if let Some(pid) = *self.pid.lock().unwrap() {
            send_signal(pid, libc::SIGKILL);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn spawn_child(spec: &ChildSpec) -> std::io::Result<Child> {
    info!(program = %spec.program, "spawning child process");
    Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

fn send_signal(pid: u32, signal: libc::c_int) {
    // Safety: kill(2) with a pid we own (spawned by this process) and a
    // fixed signal number; failure (ESRCH if already exited) is ignored.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

fn restart_delay(attempt: u32) -> Duration {
    let exp = RESTART_BASE.saturating_mul(1u32 << attempt.min(16));
    exp.min(RESTART_CAP)
}

/// Publisher child process wrapper, §6.1: RTSP push reading the shared
/// capture socket.
pub fn publisher_spec(socket_path: &str, host: &str, port: u16, path: &str) -> ChildSpec {
    ChildSpec {
        program: "rtsp-publisher".into(),
        args: vec![
            "--input".into(),
            socket_path.into(),
            "--host".into(),
            host.into(),
            "--port".into(),
            port.to_string(),
            "--path".into(),
            path.into(),
        ],
    }
}

/// Capture child process wrapper, §6.2: writes raw frames into shared memory.
pub fn capture_spec(uri: &str, socket_path: &str, width: u32, height: u32, fps_hub: u32) -> ChildSpec {
    ChildSpec {
        program: "capture-source".into(),
        args: vec![
            "--uri".into(),
            uri.into(),
            "--socket".into(),
            socket_path.into(),
            "--width".into(),
            width.to_string(),
            "--height".into(),
            height.to_string(),
            "--fps".into(),
            fps_hub.to_string(),
        ],
    }
}

/// Polls for the capture socket's readiness: file exists and (if a log
/// marker channel is wired up) a PLAYING marker has been observed.
/// Backs off from 1 s to 30 s and never gives up, per §9.
pub async fn wait_for_socket_ready(path: &std::path::Path) {
    let mut delay = Duration::from_secs(1);
    loop {
        if path.exists() {
            return;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(30));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delay_caps_at_30s() {
        for attempt in 0..20 {
            assert!(restart_delay(attempt) <= RESTART_CAP);
        }
    }

    #[test]
    fn restart_delay_grows_before_capping() {
        assert!(restart_delay(1) > restart_delay(0));
        assert!(restart_delay(2) > restart_delay(1));
    }
}
