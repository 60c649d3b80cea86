//! Directory watcher example for Strand.
//!
//! Prints create, delete, modify and rename events for the directory given
//! as the first argument (default `/tmp`) until interrupted with Ctrl-C.

use anyhow::Result;
use nix::sys::signal::Signal;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use strand_core::watch::{FsWatcher, SignalWatcher, WatchMask};
use strand_core::{LocalScheduler, Reactor, ReactorConfig};
use tracing::{info, Level};

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let dir = std::env::args().nth(1).unwrap_or_else(|| "/tmp".to_string());

    let sched = LocalScheduler::default();
    let reactor = Reactor::new(ReactorConfig::default(), Rc::new(sched.clone()))?;

    let watcher = FsWatcher::new(&reactor);
    let mask = WatchMask::IN_CREATE
        | WatchMask::IN_DELETE
        | WatchMask::IN_MODIFY
        | WatchMask::IN_MOVED_FROM
        | WatchMask::IN_MOVED_TO;
    watcher.watch_path(&dir, mask, |event| {
        let kind = if event.created() {
            "created"
        } else if event.deleted() {
            "deleted"
        } else if event.moved_from() {
            "moved out"
        } else if event.moved_to() {
            "moved in"
        } else {
            "modified"
        };
        info!("{:?} {}", event.name, kind);
    })?;
    info!("Watching {} (Ctrl-C to stop)", dir);

    let stop = Rc::new(Cell::new(false));
    let signals = SignalWatcher::new(&reactor);
    let flag = stop.clone();
    signals.register_signal(Signal::SIGINT, move |_| flag.set(true))?;

    let r = reactor.clone();
    sched.block_on(async move {
        while !stop.get() {
            r.sleep(Duration::from_millis(50)).await;
        }
    });

    watcher.close();
    signals.close()?;
    Ok(())
}
