use std::cell::RefCell;
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::{debug, trace};

use crate::reactor::fd_set::{is_selectable, select, FdSet};
use crate::reactor::socket_events::SocketEvents;
use crate::util::ordered_map::OrderedMap;

pub type SocketCallback = Box<dyn FnMut(SocketEvents)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Dispatching,
    /// [Reactor::discard] was called from a callback, and the registrations are dropped once
    ///  dispatching is finished
    PendingDispose,
    Disposed,
}

struct Registration {
    interest: SocketEvents,
    /// events from the current `monitor()` snapshot that were not delivered yet
    pending: SocketEvents,
    /// events to be delivered on the next `monitor()` call regardless of readiness
    forced: SocketEvents,
    /// `None` while the callback is running
    callback: Option<SocketCallback>,
}

struct ReactorInner {
    registrations: OrderedMap<RawFd, Registration>,
    /// set whenever a registration is added or removed, so that dispatching can restart its walk
    touched: bool,
    phase: Phase,
}

/// A level-triggered readiness loop over `select(2)`.
///
/// Callbacks are registered per socket descriptor together with an interest mask. Each call to
///  [Reactor::monitor] waits for readiness, takes a snapshot of which registrations are ready
///  for what, and then delivers those events in ascending descriptor order, at most one callback
///  per registration.
///
/// Callbacks may freely add, modify and remove registrations (including their own), and they may
///  discard the reactor. They must not call `monitor()`.
///
/// `Reactor` is a handle: clones refer to the same registrations.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<ReactorInner>>,
}

impl Reactor {
    pub fn new() -> Reactor {
        Reactor {
            inner: Rc::new(RefCell::new(ReactorInner {
                registrations: OrderedMap::new(),
                touched: false,
                phase: Phase::Idle,
            })),
        }
    }

    /// Registers a callback for a descriptor. Registering the same descriptor twice is a bug and
    ///  panics.
    pub fn add(&self, fd: RawFd, interest: SocketEvents, callback: SocketCallback) -> anyhow::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.phase, Phase::PendingDispose | Phase::Disposed) {
            bail!("reactor was discarded");
        }
        if !is_selectable(fd) {
            bail!("descriptor {} is out of range for select()", fd);
        }

        let registration = Registration {
            interest,
            pending: SocketEvents::empty(),
            forced: SocketEvents::empty(),
            callback: Some(callback),
        };
        if inner.registrations.add(fd, registration).is_err() {
            panic!("descriptor {} is registered already", fd);
        }
        inner.touched = true;

        debug!("reactor: added descriptor {} with interest {:?}", fd, interest);
        Ok(())
    }

    /// Changes a registration's interest mask. This is a no-op after the reactor was discarded.
    pub fn modify(&self, fd: RawFd, interest: SocketEvents) {
        let mut inner = self.inner.borrow_mut();
        if inner.phase == Phase::Disposed {
            return;
        }

        let id = inner.registrations.find(&fd);
        match id.and_then(|id| inner.registrations.get_mut(id)) {
            Some(registration) => {
                trace!("reactor: interest for descriptor {}: {:?} -> {:?}", fd, registration.interest, interest);
                registration.interest = interest;
            }
            None => panic!("modifying descriptor {} which is not registered", fd),
        }
    }

    /// Removes a registration. Removing an unknown descriptor is a no-op, so owners can
    ///  unregister unconditionally when they are dropped.
    pub fn del(&self, fd: RawFd) {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.registrations.find(&fd);
            let removed = id.and_then(|id| inner.registrations.del(id));
            if removed.is_some() {
                inner.touched = true;
                debug!("reactor: removed descriptor {}", fd);
            }
            removed
        };
        // the callback may own things with side effects on drop, so it is dropped without holding a borrow
        drop(removed);
    }

    /// Makes the next call to `monitor()` deliver `events` to the descriptor's callback even if
    ///  `select()` does not report them, and makes that call return without waiting. Returns
    ///  `false` if the descriptor is not registered.
    pub fn reschedule(&self, fd: RawFd, events: SocketEvents) -> bool {
        let mut inner = self.inner.borrow_mut();
        let id = inner.registrations.find(&fd);
        match id.and_then(|id| inner.registrations.get_mut(id)) {
            Some(registration) => {
                trace!("reactor: rescheduling {:?} for descriptor {}", events, fd);
                registration.forced |= events;
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.inner.borrow().registrations.find(&fd).is_some()
    }

    pub fn interest(&self, fd: RawFd) -> Option<SocketEvents> {
        let inner = self.inner.borrow();
        let id = inner.registrations.find(&fd)?;
        inner.registrations.get(id).map(|r| r.interest)
    }

    pub fn num_registrations(&self) -> usize {
        self.inner.borrow().registrations.len()
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.inner.borrow().phase, Phase::PendingDispose | Phase::Disposed)
    }

    /// Drops all registrations. When called from a callback, this happens after the current
    ///  `monitor()` call is done dispatching, and no further callbacks are dispatched.
    pub fn discard(&self) {
        let drained = {
            let mut inner = self.inner.borrow_mut();
            match inner.phase {
                Phase::Idle => {
                    inner.phase = Phase::Disposed;
                    Some(inner.registrations.drain())
                }
                Phase::Dispatching => {
                    debug!("reactor: discard requested while dispatching, deferring");
                    inner.phase = Phase::PendingDispose;
                    None
                }
                Phase::PendingDispose | Phase::Disposed => panic!("reactor was discarded twice"),
            }
        };
        drop(drained);
    }

    /// Waits up to `timeout` for readiness and dispatches callbacks, returning the number of
    ///  callbacks that were called. Zero means the timeout expired without activity.
    ///
    /// An interrupted wait (`EINTR`) counts as a timeout; other `select()` failures are returned
    ///  as errors.
    pub fn monitor(&self, timeout: Duration) -> anyhow::Result<usize> {
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        let mut except_set = FdSet::new();

        let (nfds, has_forced) = {
            let inner = self.inner.borrow();
            match inner.phase {
                Phase::Idle => {}
                Phase::Disposed => bail!("reactor was discarded"),
                Phase::Dispatching | Phase::PendingDispose => panic!("monitor() must not be called from a reactor callback"),
            }

            let mut nfds = 0;
            let mut has_forced = false;
            for (&fd, registration) in inner.registrations.iter() {
                if registration.interest.contains(SocketEvents::READABLE) {
                    read_set.insert(fd);
                }
                if registration.interest.contains(SocketEvents::WRITABLE) {
                    write_set.insert(fd);
                }
                except_set.insert(fd);
                nfds = nfds.max(fd + 1);
                has_forced |= !registration.forced.is_empty();
            }
            (nfds, has_forced)
        };

        let effective_timeout = if has_forced { Duration::ZERO } else { timeout };
        let num_ready = match select(nfds, &mut read_set, &mut write_set, &mut except_set, effective_timeout) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                trace!("reactor: select() was interrupted");
                read_set = FdSet::new();
                write_set = FdSet::new();
                except_set = FdSet::new();
                0
            }
            Err(e) => return Err(anyhow!("select() failed: {}", e)),
        };

        if num_ready == 0 && !has_forced {
            return Ok(0);
        }

        let active = {
            let mut inner = self.inner.borrow_mut();
            let mut active = 0;
            let mut cursor = inner.registrations.walk(None);
            while let Some(id) = cursor {
                let fd = inner.registrations.key(id).copied();
                if let (Some(fd), Some(registration)) = (fd, inner.registrations.get_mut(id)) {
                    let mut observed = SocketEvents::empty();
                    if read_set.contains(fd) {
                        observed |= SocketEvents::READABLE;
                    }
                    if write_set.contains(fd) {
                        observed |= SocketEvents::WRITABLE;
                    }
                    if except_set.contains(fd) {
                        observed |= SocketEvents::ERROR;
                    }

                    registration.pending = observed | registration.forced;
                    registration.forced = SocketEvents::empty();
                    if !registration.pending.is_empty() {
                        active += 1;
                    }
                }
                cursor = inner.registrations.walk(Some(id));
            }

            if active > 0 {
                inner.phase = Phase::Dispatching;
            }
            active
        };

        if active == 0 {
            return Ok(0);
        }

        let dispatched = self.dispatch(active);

        let drained = {
            let mut inner = self.inner.borrow_mut();
            if inner.phase == Phase::PendingDispose {
                debug!("reactor: executing deferred discard");
                inner.phase = Phase::Disposed;
                Some(inner.registrations.drain())
            }
            else {
                inner.phase = Phase::Idle;
                None
            }
        };
        drop(drained);

        Ok(dispatched)
    }

    /// Delivers the snapshot's pending events. No borrow of the shared state is held while a
    ///  callback runs. If a callback adds or removes registrations, the walk restarts from the
    ///  smallest descriptor; registrations that were served already have no pending events left,
    ///  so they are skipped.
    fn dispatch(&self, mut active: usize) -> usize {
        let mut dispatched = 0;

        'restart: loop {
            let mut cursor = {
                let mut inner = self.inner.borrow_mut();
                inner.touched = false;
                inner.registrations.walk(None)
            };

            while let Some(id) = cursor {
                let due = {
                    let mut inner = self.inner.borrow_mut();
                    let fd = inner.registrations.key(id).copied();
                    match (fd, inner.registrations.get_mut(id)) {
                        (Some(fd), Some(registration)) if !registration.pending.is_empty() => {
                            let events = std::mem::take(&mut registration.pending);
                            registration.callback.take().map(|callback| (fd, events, callback))
                        }
                        _ => None,
                    }
                };

                if let Some((fd, events, mut callback)) = due {
                    trace!("reactor: dispatching {:?} to descriptor {}", events, fd);
                    callback(events);
                    dispatched += 1;
                    active -= 1;

                    let (orphan, touched, disposing) = {
                        let mut inner = self.inner.borrow_mut();
                        let orphan = match inner.registrations.get_mut(id) {
                            Some(registration) if registration.callback.is_none() => {
                                registration.callback = Some(callback);
                                None
                            }
                            _ => Some(callback),
                        };
                        (orphan, inner.touched, inner.phase == Phase::PendingDispose)
                    };
                    drop(orphan);

                    if active == 0 || disposing {
                        break 'restart;
                    }
                    if touched {
                        continue 'restart;
                    }
                }

                cursor = self.inner.borrow().registrations.walk(Some(id));
            }
            break;
        }

        dispatched
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Reactor::new()
    }
}
