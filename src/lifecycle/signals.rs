//! OS signal handling.
//!
//! - SIGUSR1 swaps the stream and compare roles
//! - SIGTERM and Ctrl-C trigger graceful shutdown

use std::io;
use std::sync::Arc;

use crate::lifecycle::shutdown::Shutdown;
use crate::proxy::DispatchEngine;

/// Spawn the signal listener task.
#[cfg(unix)]
pub fn spawn_signal_handlers(engine: Arc<DispatchEngine>, shutdown: Arc<Shutdown>) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut term = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = usr1.recv() => {
                    tracing::info!(signal = "SIGUSR1", "Received role switch signal");
                    engine.switch_roles();
                }
                _ = term.recv() => {
                    shutdown.trigger("SIGTERM");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    shutdown.trigger("SIGINT");
                    break;
                }
            }
        }
    });

    Ok(())
}

/// Spawn the signal listener task. Only Ctrl-C is available here.
#[cfg(not(unix))]
pub fn spawn_signal_handlers(engine: Arc<DispatchEngine>, shutdown: Arc<Shutdown>) -> io::Result<()> {
    drop(engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.trigger("SIGINT");
        }
    });
    Ok(())
}
