//! Filesystem-change watcher over a single inotify descriptor.

use crate::error::{Error, Result};
use crate::reactor::{HandleId, Reactor};
use nix::errno::Errno;
use nix::sys::epoll::EpollFlags;
use nix::sys::inotify::{InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Event mask for [`FsWatcher::watch_path`] and [`FsEvent::mask`].
pub use nix::sys::inotify::AddWatchFlags as WatchMask;

/// Kernel-assigned watch descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(WatchDescriptor);

/// One filesystem event.
///
/// `name` borrows from the record being delivered and is only valid for the
/// duration of the callback; copy it if it must outlive the call.
#[derive(Debug)]
pub struct FsEvent<'a> {
    pub watch: WatchId,
    pub mask: WatchMask,
    /// Pairs the two halves of a rename.
    pub cookie: u32,
    /// Entry name relative to the watched directory; empty for the
    /// directory itself.
    pub name: &'a OsStr,
}

impl FsEvent<'_> {
    pub fn created(&self) -> bool {
        self.mask.contains(WatchMask::IN_CREATE)
    }

    pub fn deleted(&self) -> bool {
        self.mask
            .intersects(WatchMask::IN_DELETE | WatchMask::IN_DELETE_SELF)
    }

    pub fn modified(&self) -> bool {
        self.mask.contains(WatchMask::IN_MODIFY)
    }

    pub fn moved_from(&self) -> bool {
        self.mask.contains(WatchMask::IN_MOVED_FROM)
    }

    pub fn moved_to(&self) -> bool {
        self.mask.contains(WatchMask::IN_MOVED_TO)
    }

    pub fn is_dir(&self) -> bool {
        self.mask.contains(WatchMask::IN_ISDIR)
    }
}

type FsCallback = Rc<dyn Fn(&FsEvent<'_>)>;

/// Watch table shared between the reactor and the handle callback.
#[derive(Default)]
pub(crate) struct FsWatchState {
    handle: Option<HandleId>,
    /// Same descriptor as `handle`; unset together with it.
    inotify: Option<Inotify>,
    table: HashMap<WatchId, FsCallback>,
}

/// Handle on the reactor's filesystem watcher.
///
/// Every `FsWatcher` obtained from the same reactor shares one inotify
/// descriptor and one watch table.
#[derive(Clone)]
pub struct FsWatcher {
    reactor: Reactor,
}

impl FsWatcher {
    /// A handle on `reactor`'s filesystem watcher; opens nothing yet.
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            reactor: reactor.clone(),
        }
    }

    fn state(&self) -> &Rc<RefCell<FsWatchState>> {
        self.reactor.fs_watch_state()
    }

    /// Whether the inotify descriptor exists.
    pub fn is_open(&self) -> bool {
        self.state().borrow().handle.is_some()
    }

    /// Creates the inotify descriptor. Does nothing if already open.
    pub fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| Error::sys("inotify_init1", e))?;
        let fd = inotify.as_raw_fd();
        let id = self.reactor.register_fd(fd)?;

        let state = self.state().clone();
        self.reactor.set_callback(
            id,
            Rc::new(move |reactor: &Reactor, id: HandleId| drain(reactor, id, &state)),
        );
        let mut state = self.state().borrow_mut();
        state.handle = Some(id);
        state.inotify = Some(inotify);
        debug!("Filesystem watcher opened on fd {}", fd);
        Ok(())
    }

    /// Watches `path` for the events in `mask`, opening the watcher if
    /// needed.
    ///
    /// # Panics
    ///
    /// If the kernel hands back a watch id that is already registered, which
    /// happens when the same path is watched twice.
    pub fn watch_path<P, F>(&self, path: P, mask: WatchMask, callback: F) -> Result<WatchId>
    where
        P: AsRef<Path>,
        F: Fn(&FsEvent<'_>) + 'static,
    {
        self.open()?;
        let wd = self
            .inotify()?
            .add_watch(path.as_ref(), mask)
            .map_err(|e| Error::sys("inotify_add_watch", e))?;

        let watch = WatchId(wd);
        let mut state = self.state().borrow_mut();
        assert!(
            !state.table.contains_key(&watch),
            "watch {:?} registered twice ({})",
            watch,
            path.as_ref().display()
        );
        state.table.insert(watch, Rc::new(callback));
        debug!("Watching {} as {:?}", path.as_ref().display(), watch);
        Ok(watch)
    }

    /// Removes a watch and its callback.
    ///
    /// # Panics
    ///
    /// If `watch` is not registered.
    pub fn unwatch(&self, watch: WatchId) -> Result<()> {
        let removed = self.state().borrow_mut().table.remove(&watch);
        assert!(removed.is_some(), "unwatch of unknown {:?}", watch);

        self.inotify()?
            .rm_watch(watch.0)
            .map_err(|e| Error::sys("inotify_rm_watch", e))
    }

    /// Number of registered watches.
    pub fn watch_count(&self) -> usize {
        self.state().borrow().table.len()
    }

    /// Drops every watch and closes the inotify descriptor.
    pub fn close(&self) {
        let handle = {
            let mut state = self.state().borrow_mut();
            state.table.clear();
            state.inotify = None;
            state.handle.take()
        };
        if let Some(id) = handle {
            self.reactor.clear_callback(id);
            self.reactor.close(id);
            debug!("Filesystem watcher closed");
        }
    }

    fn inotify(&self) -> Result<Inotify> {
        let state = self.state().borrow();
        state
            .handle
            .and_then(|id| self.reactor.fd(id))
            .and(state.inotify)
            .ok_or(Error::Closed)
    }
}

/// Reads the inotify descriptor until it would block.
fn drain(reactor: &Reactor, id: HandleId, state: &Rc<RefCell<FsWatchState>>) {
    loop {
        // A callback may have closed the watcher.
        let inotify = match (reactor.fd(id), state.borrow().inotify) {
            (Some(_), Some(inotify)) => inotify,
            _ => return,
        };
        match inotify.read_events() {
            Ok(events) if events.is_empty() => return,
            Ok(events) => dispatch(events, state),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                reactor.clear_events(id, EpollFlags::EPOLLIN);
                return;
            }
            Err(err) => {
                error!("Reading inotify fd {} failed: {}", inotify.as_raw_fd(), err);
                return;
            }
        }
    }
}

fn dispatch(events: Vec<InotifyEvent>, state: &Rc<RefCell<FsWatchState>>) {
    for raw in events {
        let event = FsEvent {
            watch: WatchId(raw.wd),
            mask: raw.mask,
            cookie: raw.cookie,
            name: raw.name.as_deref().unwrap_or(OsStr::new("")),
        };
        deliver(&event, state);
    }
}

fn deliver(event: &FsEvent<'_>, state: &Rc<RefCell<FsWatchState>>) {
    let callback = state.borrow().table.get(&event.watch).cloned();
    match callback {
        Some(callback) => {
            callback(event);
            if event.mask.contains(WatchMask::IN_IGNORED) {
                // The kernel dropped the watch (target deleted or unmounted).
                state.borrow_mut().table.remove(&event.watch);
            }
        }
        None if event.mask.contains(WatchMask::IN_Q_OVERFLOW) => {
            warn!("inotify queue overflowed, events were lost");
        }
        // Trailing record for a watch that was just removed.
        None if event.mask.contains(WatchMask::IN_IGNORED) => {}
        None => panic!("inotify event for unknown {:?}", event.watch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorConfig;
    use crate::sched::LocalScheduler;
    use std::ffi::OsString;
    use std::fs;
    use std::time::{Duration, Instant};

    /// A real watch descriptor on a scratch inotify instance.
    fn scratch_watch() -> (Inotify, WatchDescriptor) {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC).unwrap();
        let wd = inotify.add_watch("/tmp", WatchMask::IN_CREATE).unwrap();
        (inotify, wd)
    }

    fn raw_event(wd: WatchDescriptor, mask: WatchMask, name: Option<&str>) -> InotifyEvent {
        InotifyEvent {
            wd,
            mask,
            cookie: 0,
            name: name.map(OsString::from),
        }
    }

    #[test]
    fn test_dispatch_routes_and_forgets_ignored_watch() {
        let (inotify, wd) = scratch_watch();
        let state = Rc::new(RefCell::new(FsWatchState::default()));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        state.borrow_mut().table.insert(
            WatchId(wd),
            Rc::new(move |event: &FsEvent<'_>| {
                s.borrow_mut()
                    .push((event.name.to_os_string(), event.created()))
            }),
        );

        dispatch(
            vec![
                raw_event(wd, WatchMask::IN_CREATE, Some("a.txt")),
                raw_event(wd, WatchMask::IN_DELETE, Some("longer_name.bin")),
                raw_event(wd, WatchMask::IN_IGNORED, None),
                // Trailing record after the watch is gone is tolerated.
                raw_event(wd, WatchMask::IN_IGNORED, None),
            ],
            &state,
        );

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (OsString::from("a.txt"), true));
        assert_eq!(seen[1], (OsString::from("longer_name.bin"), false));
        assert_eq!(seen[2], (OsString::new(), false));
        assert!(state.borrow().table.is_empty());
        let _ = nix::unistd::close(inotify.as_raw_fd());
    }

    #[test]
    #[should_panic(expected = "unknown")]
    fn test_dispatch_unknown_watch_panics() {
        let (inotify, wd) = scratch_watch();
        let _ = nix::unistd::close(inotify.as_raw_fd());
        let state = Rc::new(RefCell::new(FsWatchState::default()));
        dispatch(vec![raw_event(wd, WatchMask::IN_CREATE, Some("x"))], &state);
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        name: String,
        created: bool,
        deleted: bool,
    }

    async fn wait_for(reactor: &Reactor, events: &Rc<RefCell<Vec<Seen>>>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while events.borrow().len() < count && Instant::now() < deadline {
            reactor.sleep(Duration::from_millis(5)).await;
        }
        // Give stray duplicates a chance to show up.
        reactor.sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_watch_directory_create_and_delete() {
        let dir = format!("/tmp/strand_test_fs_watch_{}", std::process::id());
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let sched = LocalScheduler::default();
        let reactor = Reactor::new(ReactorConfig::default(), Rc::new(sched.clone())).unwrap();
        let watcher = FsWatcher::new(&reactor);
        let events = Rc::new(RefCell::new(Vec::new()));

        let sink = events.clone();
        let watch = watcher
            .watch_path(
                &dir,
                WatchMask::IN_CREATE | WatchMask::IN_DELETE,
                move |event| {
                    sink.borrow_mut().push(Seen {
                        name: event.name.to_string_lossy().into_owned(),
                        created: event.created(),
                        deleted: event.deleted(),
                    })
                },
            )
            .unwrap();
        assert_eq!(watcher.watch_count(), 1);

        let file = format!("{}/hello.txt", dir);
        let r = reactor.clone();
        let e = events.clone();
        let f = file.clone();
        sched.block_on(async move {
            fs::write(&f, b"hi").unwrap();
            wait_for(&r, &e, 1).await;
            fs::remove_file(&f).unwrap();
            wait_for(&r, &e, 2).await;
        });

        let events = events.borrow();
        assert_eq!(
            *events,
            vec![
                Seen {
                    name: "hello.txt".into(),
                    created: true,
                    deleted: false
                },
                Seen {
                    name: "hello.txt".into(),
                    created: false,
                    deleted: true
                },
            ]
        );

        watcher.unwatch(watch).unwrap();
        watcher.close();
        assert!(!watcher.is_open());
        assert!(matches!(watcher.inotify(), Err(Error::Closed)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_open_is_idempotent() {
        let sched = LocalScheduler::default();
        let reactor = Reactor::new(ReactorConfig::default(), Rc::new(sched)).unwrap();
        let watcher = FsWatcher::new(&reactor);
        watcher.open().unwrap();
        watcher.open().unwrap();
        assert_eq!(reactor.live_handles(), 1);
        watcher.close();
        assert_eq!(reactor.live_handles(), 0);
    }
}
