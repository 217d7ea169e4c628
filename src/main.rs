use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::info;

use webservd::config::{Config, SERVER_SOFTWARE};
use webservd::server::Server;
use webservd::shutdown::{self, ShutdownToken, Waker};

fn main() -> Result<()> {
    // The access log may be on stdout, so diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let config = Config::from_command_line()?;
    info!("{} starting", SERVER_SOFTWARE);

    let listener = config.create_listener()?;

    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    // Must happen before any thread is spawned so that every thread inherits the mask.
    shutdown::block_termination_signals()?;

    let waker = Waker::new()?;
    let token = ShutdownToken::new(waker.clone());
    shutdown::spawn_signal_thread(token.clone())?;

    let mut server = Server::new(config, listener, waker, token)?;
    server.run()?;
    server.finish()
}
