//! Object registry, proxy subscriptions and signal fan-out.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::{AsFd, OwnedFd};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::service::{CallContext, CallError, Service};
use crate::event_loop::Loop;
use crate::sockets;
use crate::wire::{Deserializer, Serializer};

/// Identity reserved for the container's own bootstrap service.
pub const BOOTSTRAP_IDENTITY: u32 = 0;
/// Interface index of the bootstrap vocabulary.
pub const CONTAINER_INTERFACE: u32 = 0;
/// `register_proxy(object_path) -> (identity, client_id, signal_group_id)`.
pub const FN_REGISTER_PROXY: u32 = 0;
/// Daemon quit request; authorisation is socket permissions only.
pub const FN_QUIT: u32 = 1;
/// `unregister_proxy(identity, client_id, signal_group_id) -> bool`.
pub const FN_UNREGISTER_PROXY: u32 = 2;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("object path {0:?} is already registered")]
    DuplicatePath(String),
}

/// How a call request was resolved.
pub enum DispatchOutcome {
    /// The service ran; the reply buffer holds its payload.
    Replied,
    /// No service has this identity; the caller gets a single `false`.
    UnknownIdentity,
}

struct ClientState {
    /// Signal sockets handed over but not yet bound to a registration.
    pending_signal_fds: VecDeque<OwnedFd>,
    next_signal_group_id: u32,
}

struct Subscription {
    identity: u32,
    client_id: u32,
    signal_group_id: u32,
    socket: OwnedFd,
}

/// Owns every service in the daemon and the proxy subscription table.
pub struct ServiceContainer {
    paths: HashMap<String, u32>,
    // slot is None only while its service is out for a call
    services: BTreeMap<u32, Option<Box<dyn Service>>>,
    clients: HashMap<u32, ClientState>,
    subscriptions: Vec<Subscription>,
    next_identity: u32,
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceContainer {
    pub fn new() -> Self {
        let mut services: BTreeMap<u32, Option<Box<dyn Service>>> = BTreeMap::new();
        services.insert(
            BOOTSTRAP_IDENTITY,
            Some(Box::new(ContainerService::new())),
        );
        Self {
            paths: HashMap::new(),
            services,
            clients: HashMap::new(),
            subscriptions: Vec::new(),
            next_identity: 1,
        }
    }

    /// Insert a service under `object_path` and return its identity.
    /// Identities are monotone and never reissued within a daemon run.
    pub fn create_object(
        &mut self,
        object_path: &str,
        service: Box<dyn Service>,
    ) -> Result<u32, ContainerError> {
        if self.paths.contains_key(object_path) {
            return Err(ContainerError::DuplicatePath(object_path.to_string()));
        }
        let identity = self.next_identity;
        self.next_identity += 1;
        info!(
            identity,
            path = object_path,
            interfaces = ?service.interface_names(),
            "object registered"
        );
        self.paths.insert(object_path.to_string(), identity);
        self.services.insert(identity, Some(service));
        Ok(identity)
    }

    /// Destroy a service. Its subscriptions are dropped with it; the
    /// identity stays burned.
    pub fn remove_object(&mut self, identity: u32) -> bool {
        if identity == BOOTSTRAP_IDENTITY {
            return false;
        }
        if self.services.remove(&identity).is_none() {
            return false;
        }
        self.paths.retain(|_, id| *id != identity);
        self.subscriptions.retain(|sub| sub.identity != identity);
        info!(identity, "object removed");
        true
    }

    pub fn identity_of(&self, object_path: &str) -> Option<u32> {
        self.paths.get(object_path).copied()
    }

    pub fn subscription_count(&self, identity: u32) -> usize {
        self.subscriptions
            .iter()
            .filter(|sub| sub.identity == identity)
            .count()
    }

    pub(crate) fn client_attached(&mut self, client_id: u32) {
        self.clients.insert(
            client_id,
            ClientState {
                pending_signal_fds: VecDeque::new(),
                next_signal_group_id: 1,
            },
        );
    }

    /// Forget everything about a client: pending hand-offs and every
    /// subscription it holds (their sockets close with them).
    pub(crate) fn client_detached(&mut self, client_id: u32) {
        self.clients.remove(&client_id);
        let before = self.subscriptions.len();
        self.subscriptions.retain(|sub| sub.client_id != client_id);
        let dropped = before - self.subscriptions.len();
        if dropped > 0 {
            info!(client_id, dropped, "dropped subscriptions of detached client");
        }
    }

    pub(crate) fn push_signal_fd(&mut self, client_id: u32, fd: OwnedFd) {
        match self.clients.get_mut(&client_id) {
            Some(client) => client.pending_signal_fds.push_back(fd),
            None => warn!(client_id, "signal socket from unknown client discarded"),
        }
    }

    /// Bind the caller's most recently handed signal socket to a fresh
    /// signal group id. Returns `(0, 0)` when the path is unknown; the
    /// pending socket is consumed either way.
    pub fn register_proxy(
        &mut self,
        object_path: &str,
        client_id: u32,
    ) -> Result<(u32, u32), CallError> {
        let identity = self.paths.get(object_path).copied();
        let client = self
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| CallError::Failed(format!("unknown client {client_id}")))?;
        let socket = client
            .pending_signal_fds
            .pop_front()
            .ok_or_else(|| CallError::Failed("no signal socket pending for registration".into()))?;
        let Some(identity) = identity else {
            debug!(path = object_path, client_id, "register_proxy: unknown object path");
            return Ok((0, 0));
        };
        let signal_group_id = client.next_signal_group_id;
        client.next_signal_group_id += 1;
        self.subscriptions.push(Subscription {
            identity,
            client_id,
            signal_group_id,
            socket,
        });
        debug!(identity, client_id, signal_group_id, "proxy registered");
        Ok((identity, signal_group_id))
    }

    /// Remove one subscription tuple. Idempotent: a second call for the
    /// same tuple reports `false`.
    pub fn unregister_proxy(
        &mut self,
        identity: u32,
        client_id: u32,
        signal_group_id: u32,
    ) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|sub| {
            !(sub.identity == identity
                && sub.client_id == client_id
                && sub.signal_group_id == signal_group_id)
        });
        let removed = before != self.subscriptions.len();
        if removed {
            debug!(identity, client_id, signal_group_id, "proxy unregistered");
        }
        removed
    }

    /// Write one framed signal to every subscriber of `identity`. Writes
    /// are non-blocking; a full buffer is a slow consumer and tears the
    /// subscription down. Returns the number of deliveries.
    pub fn emit_signal(&mut self, identity: u32, interface_no: u32, payload: &Serializer) -> usize {
        let mut msg = Serializer::new();
        msg.put_u32(identity);
        msg.put_u32(interface_no);
        msg.append(payload);

        let mut delivered = 0;
        let mut dead: Vec<usize> = Vec::new();
        for (idx, sub) in self.subscriptions.iter().enumerate() {
            if sub.identity != identity {
                continue;
            }
            match sockets::try_send_message(sub.socket.as_fd(), &msg) {
                Ok(true) => delivered += 1,
                Ok(false) => {
                    warn!(
                        identity,
                        client_id = sub.client_id,
                        signal_group_id = sub.signal_group_id,
                        "slow signal consumer, dropping subscription"
                    );
                    dead.push(idx);
                }
                Err(err) => {
                    warn!(
                        identity,
                        client_id = sub.client_id,
                        error = %err,
                        "signal write failed, dropping subscription"
                    );
                    dead.push(idx);
                }
            }
        }
        for idx in dead.into_iter().rev() {
            self.subscriptions.remove(idx);
        }
        delivered
    }

    /// Route one request to its service. The service is taken out of the
    /// map for the duration of the call so the call context can borrow the
    /// container exclusively.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_call(
        &mut self,
        identity: u32,
        interface_no: u32,
        function_no: u32,
        client_id: u32,
        event_loop: &mut Loop,
        args: &mut Deserializer,
        reply: &mut Serializer,
    ) -> Result<DispatchOutcome, CallError> {
        let Some(slot) = self.services.get_mut(&identity) else {
            return Ok(DispatchOutcome::UnknownIdentity);
        };
        let Some(mut service) = slot.take() else {
            // the service is mid-call further up the stack
            return Err(CallError::Failed(format!("service {identity} is busy")));
        };
        let result = {
            let mut ctx = CallContext {
                identity,
                client_id,
                container: self,
                event_loop,
            };
            service.call(&mut ctx, interface_no, function_no, args, reply)
        };
        // the service may have removed itself during the call
        if let Some(slot) = self.services.get_mut(&identity) {
            if slot.is_none() {
                *slot = Some(service);
            }
        }
        result.map(|()| DispatchOutcome::Replied)
    }
}

/// The synthetic service at identity 0: path resolution, proxy lifecycle
/// and daemon control.
struct ContainerService {
    interfaces: Vec<String>,
}

impl ContainerService {
    fn new() -> Self {
        Self {
            interfaces: vec!["saftbus.Container".to_string()],
        }
    }
}

impl Service for ContainerService {
    fn interface_names(&self) -> &[String] {
        &self.interfaces
    }

    fn call(
        &mut self,
        ctx: &mut CallContext<'_>,
        interface_no: u32,
        function_no: u32,
        args: &mut Deserializer,
        reply: &mut Serializer,
    ) -> Result<(), CallError> {
        if interface_no != CONTAINER_INTERFACE {
            return Err(CallError::UnknownMethod {
                interface_no,
                function_no,
            });
        }
        match function_no {
            FN_REGISTER_PROXY => {
                let object_path = args.get_str()?;
                let (identity, signal_group_id) =
                    ctx.container.register_proxy(&object_path, ctx.client_id)?;
                reply.put_u32(identity);
                reply.put_u32(ctx.client_id);
                reply.put_u32(signal_group_id);
                Ok(())
            }
            FN_QUIT => {
                info!(client_id = ctx.client_id, "quit requested over the bus");
                reply.put_bool(true);
                ctx.event_loop.quit();
                Ok(())
            }
            FN_UNREGISTER_PROXY => {
                let identity = args.get_u32()?;
                let client_id = args.get_u32()?;
                let signal_group_id = args.get_u32()?;
                reply.put_bool(
                    ctx.container
                        .unregister_proxy(identity, client_id, signal_group_id),
                );
                Ok(())
            }
            _ => Err(CallError::UnknownMethod {
                interface_no,
                function_no,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::socket::{setsockopt, sockopt};

    use super::*;
    use crate::sockets::{recv_message, seqpacket_pair};

    struct NullService {
        interfaces: Vec<String>,
    }

    impl NullService {
        fn boxed() -> Box<dyn Service> {
            Box::new(Self {
                interfaces: vec!["test.Null".to_string()],
            })
        }
    }

    impl Service for NullService {
        fn interface_names(&self) -> &[String] {
            &self.interfaces
        }

        fn call(
            &mut self,
            _ctx: &mut CallContext<'_>,
            interface_no: u32,
            function_no: u32,
            _args: &mut Deserializer,
            reply: &mut Serializer,
        ) -> Result<(), CallError> {
            if (interface_no, function_no) == (0, 0) {
                reply.put_bool(true);
                Ok(())
            } else {
                Err(CallError::UnknownMethod {
                    interface_no,
                    function_no,
                })
            }
        }
    }

    /// Attach a fake client and hand it one signal socket; returns the
    /// client-held end.
    fn attach_with_signal_socket(container: &mut ServiceContainer, client_id: u32) -> OwnedFd {
        container.client_attached(client_id);
        let (daemon_end, client_end) = seqpacket_pair().unwrap();
        container.push_signal_fd(client_id, daemon_end);
        client_end
    }

    #[test]
    fn identities_are_monotone_and_never_reused() {
        let mut container = ServiceContainer::new();
        let a = container.create_object("/a", NullService::boxed()).unwrap();
        let b = container.create_object("/b", NullService::boxed()).unwrap();
        assert_eq!((a, b), (1, 2));

        assert!(container.remove_object(a));
        assert!(!container.remove_object(a));
        let c = container.create_object("/c", NullService::boxed()).unwrap();
        assert_eq!(c, 3);
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let mut container = ServiceContainer::new();
        container.create_object("/a", NullService::boxed()).unwrap();
        assert!(matches!(
            container.create_object("/a", NullService::boxed()),
            Err(ContainerError::DuplicatePath(_))
        ));
    }

    #[test]
    fn register_proxy_resolves_known_path() {
        let mut container = ServiceContainer::new();
        let identity = container.create_object("/svc/foo", NullService::boxed()).unwrap();
        let _client_end = attach_with_signal_socket(&mut container, 1);

        let (resolved, signal_group_id) = container.register_proxy("/svc/foo", 1).unwrap();
        assert_eq!(resolved, identity);
        assert_eq!(signal_group_id, 1);
        assert_eq!(container.subscription_count(identity), 1);
    }

    #[test]
    fn register_proxy_unknown_path_returns_zero_and_consumes_socket() {
        let mut container = ServiceContainer::new();
        let _client_end = attach_with_signal_socket(&mut container, 1);

        let (identity, signal_group_id) = container.register_proxy("/svc/none", 1).unwrap();
        assert_eq!((identity, signal_group_id), (0, 0));

        // the pending socket was consumed, a retry needs a new hand-off
        assert!(matches!(
            container.register_proxy("/svc/none", 1),
            Err(CallError::Failed(_))
        ));
    }

    #[test]
    fn unregister_proxy_is_idempotent() {
        let mut container = ServiceContainer::new();
        let identity = container.create_object("/svc/foo", NullService::boxed()).unwrap();
        let _client_end = attach_with_signal_socket(&mut container, 1);
        let (_, signal_group_id) = container.register_proxy("/svc/foo", 1).unwrap();

        assert!(container.unregister_proxy(identity, 1, signal_group_id));
        assert!(!container.unregister_proxy(identity, 1, signal_group_id));
        assert_eq!(container.subscription_count(identity), 0);
    }

    #[test]
    fn signals_fan_out_in_order() {
        let mut container = ServiceContainer::new();
        let identity = container.create_object("/svc/foo", NullService::boxed()).unwrap();
        let first = attach_with_signal_socket(&mut container, 1);
        container.register_proxy("/svc/foo", 1).unwrap();
        let second = attach_with_signal_socket(&mut container, 2);
        container.register_proxy("/svc/foo", 2).unwrap();

        for text in ["A", "B", "C"] {
            let mut payload = Serializer::new();
            payload.put_str(text);
            assert_eq!(container.emit_signal(identity, 0, &payload), 2);
        }

        for client_end in [&first, &second] {
            for expected in ["A", "B", "C"] {
                let mut msg = recv_message(client_end.as_fd()).unwrap().unwrap();
                assert_eq!(msg.get_u32().unwrap(), identity);
                assert_eq!(msg.get_u32().unwrap(), 0);
                assert_eq!(msg.get_str().unwrap(), expected);
            }
        }
    }

    #[test]
    fn slow_consumer_subscription_is_torn_down() {
        let mut container = ServiceContainer::new();
        let identity = container.create_object("/svc/foo", NullService::boxed()).unwrap();

        container.client_attached(1);
        let (daemon_end, _client_end) = seqpacket_pair().unwrap();
        setsockopt(&daemon_end, sockopt::SndBuf, &4096).unwrap();
        container.push_signal_fd(1, daemon_end);
        container.register_proxy("/svc/foo", 1).unwrap();

        // the client never polls; the buffer must fill within a bounded
        // number of emits and the subscription must go away
        let mut payload = Serializer::new();
        payload.put_bytes(&vec![0u8; 4096]);
        let mut torn_down = false;
        for _ in 0..1024 {
            if container.emit_signal(identity, 0, &payload) == 0 {
                torn_down = true;
                break;
            }
        }
        assert!(torn_down);
        assert_eq!(container.subscription_count(identity), 0);
        // subsequent emits no longer attempt any write
        assert_eq!(container.emit_signal(identity, 0, &payload), 0);
    }

    #[test]
    fn client_detach_drops_all_its_subscriptions() {
        let mut container = ServiceContainer::new();
        let a = container.create_object("/a", NullService::boxed()).unwrap();
        let b = container.create_object("/b", NullService::boxed()).unwrap();
        let c = container.create_object("/c", NullService::boxed()).unwrap();

        container.client_attached(1);
        let _ends: Vec<OwnedFd> = (0..3)
            .map(|_| {
                let (daemon_end, client_end) = seqpacket_pair().unwrap();
                container.push_signal_fd(1, daemon_end);
                client_end
            })
            .collect();
        container.register_proxy("/a", 1).unwrap();
        container.register_proxy("/b", 1).unwrap();
        container.register_proxy("/c", 1).unwrap();
        assert_eq!(container.subscription_count(a), 1);

        container.client_detached(1);
        for identity in [a, b, c] {
            assert_eq!(container.subscription_count(identity), 0);
        }
    }

    #[test]
    fn bootstrap_register_and_unregister_over_dispatch() {
        let mut container = ServiceContainer::new();
        let identity = container.create_object("/svc/foo", NullService::boxed()).unwrap();
        let _client_end = attach_with_signal_socket(&mut container, 1);
        let mut event_loop = Loop::new();

        let mut args = {
            let mut ser = Serializer::new();
            ser.put_str("/svc/foo");
            Deserializer::new(ser.into_bytes())
        };
        let mut reply = Serializer::new();
        let outcome = container
            .dispatch_call(
                BOOTSTRAP_IDENTITY,
                CONTAINER_INTERFACE,
                FN_REGISTER_PROXY,
                1,
                &mut event_loop,
                &mut args,
                &mut reply,
            )
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Replied));

        let mut reply = Deserializer::new(reply.into_bytes());
        assert_eq!(reply.get_u32().unwrap(), identity);
        assert_eq!(reply.get_u32().unwrap(), 1);
        let signal_group_id = reply.get_u32().unwrap();
        assert_eq!(signal_group_id, 1);

        let mut args = {
            let mut ser = Serializer::new();
            ser.put_u32(identity);
            ser.put_u32(1);
            ser.put_u32(signal_group_id);
            Deserializer::new(ser.into_bytes())
        };
        let mut reply = Serializer::new();
        container
            .dispatch_call(
                BOOTSTRAP_IDENTITY,
                CONTAINER_INTERFACE,
                FN_UNREGISTER_PROXY,
                1,
                &mut event_loop,
                &mut args,
                &mut reply,
            )
            .unwrap();
        let mut reply = Deserializer::new(reply.into_bytes());
        assert!(reply.get_bool().unwrap());
    }

    #[test]
    fn unknown_identity_is_reported_distinctly() {
        let mut container = ServiceContainer::new();
        let mut event_loop = Loop::new();
        let mut args = Deserializer::default();
        let mut reply = Serializer::new();
        let outcome = container
            .dispatch_call(99, 0, 0, 1, &mut event_loop, &mut args, &mut reply)
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::UnknownIdentity));
    }

    #[test]
    fn quit_request_is_acknowledged() {
        let mut container = ServiceContainer::new();
        let mut event_loop = Loop::new();
        container.client_attached(1);
        let mut args = Deserializer::default();
        let mut reply = Serializer::new();
        container
            .dispatch_call(
                BOOTSTRAP_IDENTITY,
                CONTAINER_INTERFACE,
                FN_QUIT,
                1,
                &mut event_loop,
                &mut args,
                &mut reply,
            )
            .unwrap();
        let mut reply = Deserializer::new(reply.into_bytes());
        assert!(reply.get_bool().unwrap());
    }
}
