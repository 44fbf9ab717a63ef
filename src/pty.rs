//! Pseudo-terminal launch and process signalling.

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::{Error, Result};

/// Signals a session can be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Interrupt,
    Terminate,
    Hangup,
    Kill,
}

impl std::fmt::Display for KillSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KillSignal::Interrupt => "SIGINT",
            KillSignal::Terminate => "SIGTERM",
            KillSignal::Hangup => "SIGHUP",
            KillSignal::Kill => "SIGKILL",
        };
        write!(f, "{}", s)
    }
}

/// What to run inside the terminal.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

/// Handles to a process running in a pseudo-terminal.
pub struct SpawnedPty {
    pub process: PtyProcess,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

/// Control side of a running PTY process: geometry and signals.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess").field("pid", &self.pid).finish()
    }
}

/// Open a pseudo-terminal and start `request.program` on its slave side.
pub fn spawn(request: &LaunchRequest) -> Result<SpawnedPty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| Error::Pty(format!("openpty failed: {}", e)))?;

    let mut cmd = CommandBuilder::new(&request.program);
    cmd.args(&request.args);
    if let Some(cwd) = &request.cwd {
        if !cwd.is_dir() {
            return Err(Error::Spawn(format!(
                "Working directory does not exist: {}",
                cwd.display()
            )));
        }
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| Error::Spawn(format!("{}: {}", request.program, e)))?;
    // Only the child may hold the slave, otherwise reads never see EOF
    drop(pair.slave);

    let pid = child.process_id();
    info!(program = %request.program, pid = ?pid, "PTY process spawned");

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| Error::Pty(format!("clone reader failed: {}", e)))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| Error::Pty(format!("take writer failed: {}", e)))?;
    let killer = child.clone_killer();

    Ok(SpawnedPty {
        process: PtyProcess {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            pid,
        },
        reader,
        writer,
        child,
    })
}

impl PtyProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Pty(format!("resize failed: {}", e)))
    }

    /// Deliver `signal` to the process group led by the child.
    pub fn signal(&self, signal: KillSignal) -> Result<()> {
        debug!(pid = ?self.pid, %signal, "Signalling PTY process");

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                use nix::sys::signal::{kill, killpg, Signal};
                use nix::unistd::Pid;

                let sig = match signal {
                    KillSignal::Interrupt => Signal::SIGINT,
                    KillSignal::Terminate => Signal::SIGTERM,
                    KillSignal::Hangup => Signal::SIGHUP,
                    KillSignal::Kill => Signal::SIGKILL,
                };
                let pid = Pid::from_raw(pid as i32);
                // The child leads its own session; reach its descendants too
                return killpg(pid, sig)
                    .or_else(|_| kill(pid, sig))
                    .map_err(|e| Error::Pty(format!("Failed to send {}: {}", signal, e)));
            }
        }

        self.killer
            .lock()
            .kill()
            .map_err(|e| Error::Pty(format!("Failed to kill process: {}", e)))
    }
}
