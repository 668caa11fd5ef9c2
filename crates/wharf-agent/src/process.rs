//! Process supervisor.
//!
//! User commands run inside an external PTY helper
//! (`wharf-pty --cols=80 --rows=24 <command> <args...>`). The supervisor
//! owns the helper children, fans their stdout/stderr out to every socket
//! subscribed to the pid, and forwards resize requests over a dedicated
//! control pipe inherited by the helper as fd 3.
//!
//! Processes deliberately outlive their spawning client: a disconnecting
//! IDE must not take its dev servers down with it. Records are dropped on
//! exit or explicit `kill`, never on socket close.

use std::collections::HashSet;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{PTY_HELPER_LOCAL_PATH, PTY_HELPER_SYSTEM_PATH};
use crate::envelope::Event;
use crate::error::{AgentError, OpResult};
use crate::registry::{self, Connections};

/// Fd number the helper expects its control channel on.
const CONTROL_FD: i32 = 3;
const READ_CHUNK: usize = 8192;
const SPAWN_COLS: u16 = 80;
const SPAWN_ROWS: u16 = 24;

struct ProcessRecord {
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    control: Mutex<std::fs::File>,
}

pub struct ProcessSupervisor {
    connections: Arc<Connections>,
    processes: DashMap<u32, ProcessRecord>,
    /// pid -> subscribed wsIds. Kept separate from the record so late
    /// output and the exit event still reach subscribers after `kill`
    /// removed the record.
    process_clients: DashMap<u32, HashSet<String>>,
    helper_override: Option<PathBuf>,
    coep: String,
}

impl ProcessSupervisor {
    pub fn new(connections: Arc<Connections>, helper_override: Option<PathBuf>, coep: String) -> Self {
        ProcessSupervisor {
            connections,
            processes: DashMap::new(),
            process_clients: DashMap::new(),
            helper_override,
            coep,
        }
    }

    pub fn count(&self) -> usize {
        self.processes.len()
    }

    fn resolve_helper(&self) -> PathBuf {
        if let Some(path) = &self.helper_override {
            return path.clone();
        }
        let system = Path::new(PTY_HELPER_SYSTEM_PATH);
        if system.exists() {
            return system.to_path_buf();
        }
        std::env::current_dir()
            .map(|dir| dir.join(PTY_HELPER_LOCAL_PATH))
            .unwrap_or_else(|_| PathBuf::from(PTY_HELPER_LOCAL_PATH))
    }

    pub async fn spawn(self: &Arc<Self>, ws_id: &str, command: &str, args: &[String]) -> OpResult<u32> {
        let helper = self.resolve_helper();
        let (ctl_read, ctl_write) = control_pipe().map_err(AgentError::process)?;

        let mut cmd = Command::new(&helper);
        cmd.arg(format!("--cols={SPAWN_COLS}"))
            .arg(format!("--rows={SPAWN_ROWS}"))
            .arg(command)
            .args(args)
            .env("COEP", &self.coep)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Hand the helper its control channel on a fixed fd. dup2 clears
        // close-on-exec on the duplicate, so only fd 3 survives into the
        // helper.
        let ctl_read_raw = ctl_read.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(ctl_read_raw, CONTROL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::Process(format!("failed to spawn {}: {e}", helper.display()))
        })?;
        drop(ctl_read);

        let pid = child
            .id()
            .ok_or_else(|| AgentError::Process("spawned process has no pid".to_string()))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(mut stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.start_kill();
            return Err(AgentError::Process(
                "spawned process is missing a stdio handle".to_string(),
            ));
        };

        info!(pid, command, "spawned process");

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.process_clients
            .insert(pid, HashSet::from([ws_id.to_string()]));
        self.processes.insert(
            pid,
            ProcessRecord {
                input_tx,
                control: Mutex::new(ctl_write),
            },
        );

        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
            }
        });

        let stdout_task = tokio::spawn(Self::pump(self.clone(), pid, "stdout", stdout));
        let stderr_task = tokio::spawn(Self::pump(self.clone(), pid, "stderr", stderr));

        let supervisor = self.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(0),
                Err(err) => {
                    warn!(pid, %err, "wait failed");
                    0
                }
            };
            // Drain both streams before announcing the exit so subscribers
            // see output strictly before the terminal event.
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            supervisor.processes.remove(&pid);
            if let Some((_, subscribers)) = supervisor.process_clients.remove(&pid) {
                let event = Event::new(
                    "process",
                    json!({ "pid": pid, "stream": "exit", "data": code.to_string() }),
                );
                let text = event.to_json();
                for ws in &subscribers {
                    registry::send_text(&supervisor.connections, ws, &text);
                }
            }
            debug!(pid, code, "process exited");
        });

        Ok(pid)
    }

    async fn pump(
        supervisor: Arc<Self>,
        pid: u32,
        stream: &'static str,
        mut source: impl tokio::io::AsyncRead + Unpin,
    ) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match source.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                    supervisor.emit(pid, stream, data);
                }
            }
        }
    }

    fn emit(&self, pid: u32, stream: &'static str, data: String) {
        let subscribers = match self.process_clients.get(&pid) {
            Some(subs) => subs.clone(),
            None => return,
        };
        let event = Event::new(
            "process",
            json!({ "pid": pid, "stream": stream, "data": data }),
        );
        let text = event.to_json();
        for ws in &subscribers {
            registry::send_text(&self.connections, ws, &text);
        }
    }

    pub fn input(&self, pid: u32, data: &str) -> OpResult<()> {
        let record = self
            .processes
            .get(&pid)
            .ok_or_else(|| AgentError::Process(format!("Process {pid} not found")))?;
        record
            .input_tx
            .send(data.as_bytes().to_vec())
            .map_err(|_| AgentError::Process(format!("Process {pid} stdin is closed")))
    }

    pub fn resize(&self, pid: u32, cols: u16, rows: u16) -> OpResult<()> {
        let record = self
            .processes
            .get(&pid)
            .ok_or_else(|| AgentError::Process(format!("Process {pid} not found")))?;
        let msg = json!({ "type": "resize", "cols": cols, "rows": rows });
        let mut control = record.control.lock();
        control
            .write_all(format!("{msg}\n").as_bytes())
            .map_err(|e| AgentError::Process(format!("resize of {pid} failed: {e}")))
    }

    pub fn kill(&self, pid: u32) -> OpResult<()> {
        if self.processes.remove(&pid).is_none() {
            return Err(AgentError::Process(format!("Process {pid} not found")));
        }
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            // Record is gone either way; the exit observer finishes cleanup.
            warn!(pid, %err, "SIGTERM failed");
        }
        Ok(())
    }

    /// Drop a disconnecting client from every subscriber set. Records
    /// stay: processes survive their spawning client.
    pub fn unsubscribe(&self, ws_id: &str) {
        for mut entry in self.process_clients.iter_mut() {
            entry.value_mut().remove(ws_id);
        }
    }

    /// Terminate every tracked child. Shutdown path only.
    pub fn kill_all(&self) {
        for entry in self.processes.iter() {
            let pid = *entry.key();
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, %err, "SIGTERM failed during shutdown");
            }
        }
        self.processes.clear();
        self.process_clients.clear();
    }
}

fn control_pipe() -> std::io::Result<(OwnedFd, std::fs::File)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Close-on-exec on both ends; the child only sees the dup2'd fd 3.
    for fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { std::fs::File::from_raw_fd(fds[1]) };
    Ok((read, write))
}
