use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::{Channel, STATE_ADDED, STATE_DELETED, STATE_NEW};
use crate::sys::{event, Events, Selector};

/// Readiness demultiplexer for one reactor.
///
/// Wraps the epoll selector plus the fd → channel map; the epoll
/// user-data of every registration is the fd itself. The map and the
/// kernel interest set agree after every `update_channel` /
/// `remove_channel` call.
pub(crate) struct Poller {
    selector: Selector,
    events: Events,
    channels: HashMap<RawFd, Arc<Channel>>,
}

const INITIAL_EVENTS: usize = 16;

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        Ok(Poller {
            selector: Selector::new()?,
            events: Events::with_capacity(INITIAL_EVENTS),
            channels: HashMap::new(),
        })
    }

    /// Wait for events and fill `active` with the ready channels, each
    /// with its ready mask recorded. Returns the poll return timestamp.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<Arc<Channel>>,
    ) -> Instant {
        match self.selector.select(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("Poller::poll failed: {}", err),
        }
        let now = Instant::now();

        for ev in self.events.iter() {
            // A channel may have been removed by an earlier callback in
            // the same poll round; stale fds are silently skipped.
            if let Some(channel) = self.channels.get(&event::fd(ev)) {
                channel.set_ready(event::mask(ev));
                active.push(Arc::clone(channel));
            }
        }

        if self.events.len() == self.events.capacity() {
            // The kernel filled everything we offered; there may be more.
            self.events.reserve(self.events.capacity());
        }
        now
    }

    /// Apply the channel's current interest to the kernel, moving it
    /// through the NEW / ADDED / DELETED registration states.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.poller_state();
        trace!(
            "update channel fd = {} interest = {:?} state = {}",
            channel.fd(),
            channel.interest(),
            state
        );
        match state {
            STATE_NEW | STATE_DELETED => {
                if state == STATE_NEW {
                    let prev = self.channels.insert(channel.fd(), Arc::clone(channel));
                    assert!(prev.is_none(), "fd {} registered twice", channel.fd());
                } else {
                    assert!(self.channels.contains_key(&channel.fd()));
                }
                if let Some(interest) = channel.interest() {
                    channel.set_poller_state(STATE_ADDED);
                    if let Err(err) = self.selector.register(channel.fd(), interest) {
                        error!("epoll_ctl add fd = {}: {}", channel.fd(), err);
                    }
                }
            }
            STATE_ADDED => match channel.interest() {
                None => {
                    if let Err(err) = self.selector.deregister(channel.fd()) {
                        error!("epoll_ctl del fd = {}: {}", channel.fd(), err);
                    }
                    channel.set_poller_state(STATE_DELETED);
                }
                Some(interest) => {
                    if let Err(err) = self.selector.reregister(channel.fd(), interest) {
                        error!("epoll_ctl mod fd = {}: {}", channel.fd(), err);
                    }
                }
            },
            _ => unreachable!("invalid poller state {}", state),
        }
    }

    /// Drop the channel from the map and, if needed, the kernel set.
    /// The channel must have no interest left.
    pub(crate) fn remove_channel(&mut self, channel: &Channel) {
        assert!(channel.interest().is_none());
        let removed = self.channels.remove(&channel.fd());
        debug_assert!(removed.is_some(), "fd {} was not registered", channel.fd());

        if channel.poller_state() == STATE_ADDED {
            if let Err(err) = self.selector.deregister(channel.fd()) {
                error!("epoll_ctl del fd = {}: {}", channel.fd(), err);
            }
        }
        channel.set_poller_state(STATE_NEW);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|found| std::ptr::eq(&**found, channel))
    }
}
