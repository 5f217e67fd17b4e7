//! A supervised child process with a bounded output tail.

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tor_rtcompat::SleepProvider;
use tracing::{debug, warn};

/// How much daemon output we keep for diagnostics.
const TAIL_BYTES: usize = 4 * 1024;

/// Grace period between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Ring buffer over the child's combined stdout/stderr.
#[derive(Debug, Default)]
struct TailBuf {
    /// The most recent bytes, oldest first.
    bytes: VecDeque<u8>,
}

impl TailBuf {
    /// Append, evicting from the front past the cap.
    fn push(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if self.bytes.len() == TAIL_BYTES {
                self.bytes.pop_front();
            }
            self.bytes.push_back(b);
        }
    }

    /// Render as (lossy) UTF-8.
    fn render(&self) -> String {
        let v: Vec<u8> = self.bytes.iter().copied().collect();
        String::from_utf8_lossy(&v).into_owned()
    }
}

/// A spawned daemon: the child handle plus reader threads feeding the
/// tail buffer.
#[derive(Debug)]
pub struct ProcessHost {
    /// Short name for logging (`tor`, `lokinet`).
    name: &'static str,
    /// The child process.
    child: Mutex<Child>,
    /// Combined output tail.
    tail: Arc<Mutex<TailBuf>>,
}

impl ProcessHost {
    /// Spawn `program` with `args`, capturing its output.
    pub fn spawn(
        name: &'static str,
        program: &Path,
        args: &[String],
    ) -> std::io::Result<ProcessHost> {
        debug!("spawning {} from {:?}", name, program);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let tail = Arc::new(Mutex::new(TailBuf::default()));
        for stream in [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        ]
        .into_iter()
        .flatten()
        {
            let tail = Arc::clone(&tail);
            std::thread::spawn(move || drain_into(stream, &tail));
        }

        Ok(ProcessHost {
            name,
            child: Mutex::new(child),
            tail,
        })
    }

    /// The child's pid.
    pub fn pid(&self) -> u32 {
        self.child.lock().expect("poisoned child lock").id()
    }

    /// True while the child has not exited.
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().expect("poisoned child lock");
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!("try_wait on {} failed: {}", self.name, e);
                false
            }
        }
    }

    /// The last few KiB of the child's output.
    pub fn tail(&self) -> String {
        self.tail.lock().expect("poisoned tail lock").render()
    }

    /// Stop the child: SIGTERM, a grace period, then SIGKILL.
    pub async fn stop<S: SleepProvider>(self, sleep: &S) {
        let pid = self.pid();
        debug!("stopping {} (pid {})", self.name, pid);
        terminate(pid);

        let deadline_polls = (STOP_GRACE.as_millis() / 100) as u32;
        for _ in 0..deadline_polls {
            if !self.is_alive() {
                break;
            }
            sleep.sleep(Duration::from_millis(100)).await;
        }

        let mut child = self.child.lock().expect("poisoned child lock");
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} exited with {}", self.name, status);
            }
            _ => {
                warn!("{} ignored SIGTERM; killing", self.name);
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// Ask a process to exit politely.
fn terminate(pid: u32) {
    #[cfg(unix)]
    {
        // Child::kill is SIGKILL; daemons deserve a SIGTERM first so they
        // can tear down circuits and flush state.
        unsafe {
            let _ = libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        // No polite signal to send here; the caller escalates to kill().
        let _ = pid;
    }
}

/// Reader-thread body: move bytes from the child into the tail ring.
fn drain_into(mut stream: Box<dyn Read + Send>, tail: &Arc<Mutex<TailBuf>>) {
    let mut buf = [0_u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => tail.lock().expect("poisoned tail lock").push(&buf[..n]),
        }
    }
}
