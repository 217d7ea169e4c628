//! Waking the event loop from other threads, and shutting it down on SIGINT/SIGTERM.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{SigSet, Signal};
use nix::unistd::{close, pipe2, read, write};
use tracing::{info, warn};

#[derive(Debug)]
struct Pipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Drop for Pipe {
    fn drop(&mut self) {
        let _ = close(self.read_fd);
        let _ = close(self.write_fd);
    }
}

/// Self-pipe that makes `select()` return early.
///
/// Cloned handles share the same pipe; it is closed when the last one is dropped.
#[derive(Debug, Clone)]
pub struct Waker {
    pipe: Arc<Pipe>,
}

impl Waker {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .context("failed to create wake pipe")?;
        Ok(Self {
            pipe: Arc::new(Pipe { read_fd, write_fd }),
        })
    }

    /// Descriptor to watch for readability.
    pub fn fd(&self) -> RawFd {
        self.pipe.read_fd
    }

    pub fn wake(&self) {
        match write(self.pipe.write_fd, &[1]) {
            // A full pipe already guarantees a wakeup.
            Ok(_) | Err(nix::Error::Sys(Errno::EAGAIN)) => {}
            Err(e) => warn!("failed to wake event loop: {}", e),
        }
    }

    /// Discard pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0; 64];
        while let Ok(n) = read(self.pipe.read_fd, &mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

/// Tells the event loop to stop. Checked once per loop iteration.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
    waker: Waker,
}

impl ShutdownToken {
    pub fn new(waker: Waker) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

fn termination_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Block SIGINT and SIGTERM in the calling thread.
///
/// Call this before spawning any thread, so every thread inherits the mask and the signals
/// are only ever picked up by [`spawn_signal_thread`].
pub fn block_termination_signals() -> Result<()> {
    termination_signals()
        .thread_block()
        .context("failed to block termination signals")
}

/// Wait for SIGINT or SIGTERM on a dedicated thread, then trigger `token`.
pub fn spawn_signal_thread(token: ShutdownToken) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || match termination_signals().wait() {
            Ok(signal) => {
                info!("caught {:?}, stopping", signal);
                token.trigger();
            }
            Err(e) => warn!("failed to wait for signals: {}", e),
        })
        .context("failed to spawn signal thread")
}
