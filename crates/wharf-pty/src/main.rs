//! PTY helper.
//!
//! Wraps a single user command in a pseudo-terminal:
//!
//! ```text
//! wharf-pty --cols=80 --rows=24 <command> [args...]
//! ```
//!
//! stdin is forwarded to the PTY verbatim and PTY output to stdout; the
//! supervising agent reads both as pipes. Resize requests arrive
//! out-of-band as newline-delimited JSON (`{"type":"resize","cols":..,
//! "rows":..}`) on inherited fd 3; stdin stays reserved for user input.
//! The helper exits with the child's exit code.
//!
//! stderr is left almost silent on purpose: the agent forwards it to
//! clients as the process's stderr stream.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::fd::FromRawFd;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;

/// Fd the agent hands us for control messages.
const CONTROL_FD: i32 = 3;
const READ_BUFFER_SIZE: usize = 4096;

#[derive(Parser)]
#[command(name = "wharf-pty")]
#[command(about = "Run a command inside a pseudo-terminal")]
#[command(version)]
struct Cli {
    /// Initial terminal width
    #[arg(long, default_value_t = 80)]
    cols: u16,

    /// Initial terminal height
    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Command and arguments to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ControlMessage {
    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: cli.rows,
            cols: cli.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("failed to open pty")?;

    let mut cmd = CommandBuilder::new(&cli.command[0]);
    cmd.args(&cli.command[1..]);
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("failed to spawn {}", cli.command[0]))?;
    // The slave side lives in the child now.
    drop(pair.slave);

    let master: Arc<Mutex<Box<dyn MasterPty + Send>>> = Arc::new(Mutex::new(pair.master));

    let mut reader = master
        .lock()
        .expect("pty lock")
        .try_clone_reader()
        .context("failed to clone pty reader")?;
    let mut writer = master
        .lock()
        .expect("pty lock")
        .take_writer()
        .context("failed to take pty writer")?;

    // PTY -> stdout
    let output_thread = std::thread::spawn(move || {
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).is_err() || stdout.flush().is_err() {
                        break;
                    }
                }
            }
        }
    });

    // stdin -> PTY
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).is_err() || writer.flush().is_err() {
                        break;
                    }
                }
            }
        }
    });

    // control fd -> resize
    if unsafe { libc::fcntl(CONTROL_FD, libc::F_GETFD) } >= 0 {
        let master = master.clone();
        std::thread::spawn(move || {
            let control = unsafe { std::fs::File::from_raw_fd(CONTROL_FD) };
            for line in BufReader::new(control).lines() {
                let Ok(line) = line else { break };
                match serde_json::from_str::<ControlMessage>(&line) {
                    Ok(ControlMessage::Resize { cols, rows }) => {
                        if let Ok(master) = master.lock() {
                            let _ = master.resize(PtySize {
                                rows,
                                cols,
                                pixel_width: 0,
                                pixel_height: 0,
                            });
                        }
                    }
                    Err(_) => continue,
                }
            }
        });
    }

    let status = child.wait().context("failed to wait for child")?;
    // Flush whatever the child printed before it went away.
    let _ = output_thread.join();

    std::process::exit(status.exit_code() as i32);
}
