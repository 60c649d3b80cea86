//! Echo server example for Strand.
//!
//! Listens on 127.0.0.1:7878 (or the address given as the first argument),
//! echoes every message back and stops once a client sends a message longer
//! than five bytes whose fifth byte is `%`. SIGINT stops it as well.

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use strand_core::net::{Listener, Stream};
use strand_core::watch::SignalWatcher;
use strand_core::{LocalScheduler, Reactor, ReactorConfig, Timeout};
use tracing::{info, warn, Level};

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()
        .context("invalid listen address")?;

    let sched = LocalScheduler::default();
    let reactor = Reactor::new(ReactorConfig::default(), Rc::new(sched.clone()))?;
    let stop = Rc::new(Cell::new(false));

    let signals = SignalWatcher::new(&reactor);
    let flag = stop.clone();
    signals.register_signal(Signal::SIGINT, move |signal| {
        info!("Received {}, shutting down", signal);
        flag.set(true);
    })?;

    let listener = Listener::listen(&reactor, addr, 128)?;
    info!("Echo server listening on {}", listener.local_addr()?);

    let spawner = sched.clone();
    sched.block_on(async move {
        while !stop.get() {
            let (conn, peer) = match listener
                .accept_addr(Timeout::after(Duration::from_millis(100)))
                .await
            {
                Ok(accepted) => accepted,
                Err(err) if err.is_timeout() => continue,
                Err(err) => {
                    warn!("Accept failed: {}", err);
                    continue;
                }
            };
            info!("Client connected from {}", peer);
            spawner.spawn(serve(conn, stop.clone()));
        }
    });

    signals.close()?;
    info!("Echo server stopped");
    Ok(())
}

async fn serve(conn: Stream, stop: Rc<Cell<bool>>) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match conn.recv(&mut buf, true, Timeout::Never).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("Receive failed: {}", err);
                break;
            }
        };
        if n > 5 && buf[4] == b'%' {
            info!("Stop request received");
            stop.set(true);
            break;
        }
        if let Err(err) = conn.send(&buf[..n], Timeout::Never).await {
            warn!("Send failed: {}", err);
            break;
        }
    }
}
