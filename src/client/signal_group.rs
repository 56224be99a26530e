//! Client-side demultiplexer for asynchronous daemon notifications.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, TryLockError, Weak};

use nix::poll::PollFlags;
use tracing::trace;

use super::ClientError;
use crate::sockets::{self, SocketError};
use crate::wire::Deserializer;

static GLOBAL: Mutex<Option<Arc<SignalGroup>>> = Mutex::new(None);

/// Receives the signals routed to one registered identity.
///
/// Handlers run synchronously on the thread driving
/// [`SignalGroup::wait_for_signal`]; they must not re-enter the group's
/// poller.
pub trait SignalSink: Send + Sync {
    fn signal_dispatch(&self, interface_no: u32, args: &mut Deserializer);
}

/// One seqpacket pair shared with the daemon: the far end is handed over at
/// proxy registration, the near end is polled here. Subscribers are held
/// weakly so the group never keeps a proxy alive beyond its users.
pub struct SignalGroup {
    near: Mutex<OwnedFd>,
    far: OwnedFd,
    subscribers: Mutex<Vec<(u32, Weak<dyn SignalSink>)>>,
}

impl SignalGroup {
    pub fn new() -> Result<Arc<SignalGroup>, ClientError> {
        let (far, near) = sockets::seqpacket_pair()?;
        Ok(Arc::new(Self {
            near: Mutex::new(near),
            far,
            subscribers: Mutex::new(Vec::new()),
        }))
    }

    /// The end handed to the daemon on each proxy registration (SCM_RIGHTS
    /// duplicates it server-side).
    pub fn far_fd(&self) -> BorrowedFd<'_> {
        self.far.as_fd()
    }

    /// Route signals for `identity` to `sink`. Dead entries are pruned
    /// during dispatch.
    pub fn add(&self, identity: u32, sink: Weak<dyn SignalSink>) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push((identity, sink));
        }
    }

    /// Drop every route for `identity`.
    pub fn remove(&self, identity: u32) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|(id, _)| *id != identity);
        }
    }

    /// One bounded poll on the group's socket, then a non-blocking drain of
    /// everything already queued. Returns `Ok(0)` on timeout and `Ok(n)`
    /// after dispatching `n` messages. At most one thread may poll a group
    /// at a time; a second caller gets [`ClientError::PollerBusy`].
    pub fn wait_for_signal(&self, timeout_ms: i32) -> Result<usize, ClientError> {
        let near = match self.near.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ClientError::PollerBusy),
            Err(TryLockError::Poisoned(_)) => return Err(ClientError::LockPoisoned),
        };

        let events = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let revents = sockets::poll_one(near.as_fd(), events, timeout_ms)?;
        if revents.is_empty() {
            return Ok(0);
        }
        if !revents.contains(PollFlags::POLLIN) {
            return Err(ClientError::Disconnected);
        }

        let mut dispatched = 0;
        loop {
            match sockets::try_recv_message(near.as_fd()) {
                Ok(Some(mut msg)) => {
                    self.dispatch_message(&mut msg)?;
                    dispatched += 1;
                }
                Ok(None) => break,
                Err(SocketError::Closed) => return Err(ClientError::Disconnected),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(dispatched)
    }

    fn dispatch_message(&self, msg: &mut Deserializer) -> Result<(), ClientError> {
        let identity = msg.get_u32()?;
        let interface_no = msg.get_u32()?;

        // snapshot under the subscriber lock, dispatch outside it, so a
        // handler may add or remove subscribers without deadlocking
        let sinks: Vec<Arc<dyn SignalSink>> = {
            let mut subscribers = self
                .subscribers
                .lock()
                .map_err(|_| ClientError::LockPoisoned)?;
            subscribers.retain(|(_, weak)| weak.strong_count() > 0);
            subscribers
                .iter()
                .filter(|(id, _)| *id == identity)
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        if sinks.is_empty() {
            // legal race with an in-flight unregister
            trace!(identity, "signal for unknown identity dropped");
            return Ok(());
        }
        for sink in sinks {
            let mut args = msg.clone();
            sink.signal_dispatch(interface_no, &mut args);
        }
        Ok(())
    }

    /// Process-wide group, created on first use and replaceable via
    /// [`SignalGroup::set_global`].
    pub fn global() -> Result<Arc<SignalGroup>, ClientError> {
        let mut slot = GLOBAL.lock().map_err(|_| ClientError::LockPoisoned)?;
        if let Some(group) = slot.as_ref() {
            return Ok(Arc::clone(group));
        }
        let group = SignalGroup::new()?;
        *slot = Some(Arc::clone(&group));
        Ok(group)
    }

    /// Replace (or clear) the process-wide group; returns the previous one.
    pub fn set_global(group: Option<Arc<SignalGroup>>) -> Option<Arc<SignalGroup>> {
        match GLOBAL.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, group),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::sockets::send_message;
    use crate::wire::Serializer;

    struct Recorder {
        seen: Mutex<Vec<(u32, String)>>,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl SignalSink for Recorder {
        fn signal_dispatch(&self, interface_no: u32, args: &mut Deserializer) {
            let text = args.get_str().expect("signal payload");
            self.seen
                .lock()
                .expect("recorder lock")
                .push((interface_no, text));
        }
    }

    fn signal(identity: u32, interface_no: u32, text: &str) -> Serializer {
        let mut msg = Serializer::new();
        msg.put_u32(identity);
        msg.put_u32(interface_no);
        msg.put_str(text);
        msg
    }

    #[test]
    fn drains_queued_signals_in_order() {
        let group = SignalGroup::new().unwrap();
        let recorder = Recorder::new();
        let sink: Arc<dyn SignalSink> = Arc::clone(&recorder) as Arc<dyn SignalSink>;
        group.add(7, Arc::downgrade(&sink));

        for text in ["A", "B", "C"] {
            send_message(group.far_fd(), &signal(7, 2, text)).unwrap();
        }

        assert_eq!(group.wait_for_signal(1_000).unwrap(), 3);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (2, "A".to_string()),
                (2, "B".to_string()),
                (2, "C".to_string())
            ]
        );
    }

    #[test]
    fn timeout_returns_zero() {
        let group = SignalGroup::new().unwrap();
        assert_eq!(group.wait_for_signal(10).unwrap(), 0);
    }

    #[test]
    fn unknown_identity_is_dropped_silently() {
        let group = SignalGroup::new().unwrap();
        let recorder = Recorder::new();
        let sink: Arc<dyn SignalSink> = Arc::clone(&recorder) as Arc<dyn SignalSink>;
        group.add(7, Arc::downgrade(&sink));

        send_message(group.far_fd(), &signal(9, 0, "ghost")).unwrap();
        assert_eq!(group.wait_for_signal(1_000).unwrap(), 1);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn dropped_subscribers_no_longer_dispatch() {
        let group = SignalGroup::new().unwrap();
        let recorder = Recorder::new();
        let sink: Arc<dyn SignalSink> = Arc::clone(&recorder) as Arc<dyn SignalSink>;
        group.add(7, Arc::downgrade(&sink));
        drop(sink);
        drop(recorder);

        send_message(group.far_fd(), &signal(7, 0, "late")).unwrap();
        assert_eq!(group.wait_for_signal(1_000).unwrap(), 1);
    }

    #[test]
    fn reentrant_polling_is_rejected() {
        struct Reentrant {
            group: Mutex<Option<Weak<SignalGroup>>>,
            result: Mutex<Option<Result<usize, ClientError>>>,
        }

        impl SignalSink for Reentrant {
            fn signal_dispatch(&self, _interface_no: u32, _args: &mut Deserializer) {
                let group = self
                    .group
                    .lock()
                    .expect("group slot")
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .expect("group alive");
                *self.result.lock().expect("result slot") = Some(group.wait_for_signal(0));
            }
        }

        let group = SignalGroup::new().unwrap();
        let reentrant = Arc::new(Reentrant {
            group: Mutex::new(Some(Arc::downgrade(&group))),
            result: Mutex::new(None),
        });
        let sink: Arc<dyn SignalSink> = Arc::clone(&reentrant) as Arc<dyn SignalSink>;
        group.add(7, Arc::downgrade(&sink));

        send_message(group.far_fd(), &signal(7, 0, "x")).unwrap();
        assert_eq!(group.wait_for_signal(1_000).unwrap(), 1);
        let result = reentrant.result.lock().unwrap();
        assert!(matches!(result.as_ref(), Some(Err(ClientError::PollerBusy))));
    }

    #[test]
    fn subscriber_mutation_while_dispatching_does_not_deadlock() {
        struct SelfRemover {
            group: Weak<SignalGroup>,
        }

        impl SignalSink for SelfRemover {
            fn signal_dispatch(&self, _interface_no: u32, _args: &mut Deserializer) {
                if let Some(group) = self.group.upgrade() {
                    group.remove(7);
                }
            }
        }

        let group = SignalGroup::new().unwrap();
        let remover = Arc::new(SelfRemover {
            group: Arc::downgrade(&group),
        });
        let sink: Arc<dyn SignalSink> = Arc::clone(&remover) as Arc<dyn SignalSink>;
        group.add(7, Arc::downgrade(&sink));

        send_message(group.far_fd(), &signal(7, 0, "x")).unwrap();
        assert_eq!(group.wait_for_signal(1_000).unwrap(), 1);
        send_message(group.far_fd(), &signal(7, 0, "y")).unwrap();
        assert_eq!(group.wait_for_signal(1_000).unwrap(), 1);
    }
}
