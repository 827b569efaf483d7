//! Asynchronous calls between the main thread and tile workers.
//!
//! Every execution context owns one [`Broker`] and one [`TargetRegistry`].
//! Brokers exchange [`Envelope`]s through unbounded channels; calls resolve
//! through a table of pending replies keyed by a process-wide message ID.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_lite::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::broker::envelope::{Envelope, Packet};
pub use crate::broker::envelope::{Payload, Transferable};
pub use crate::broker::pool::{WorkerContext, WorkerPool};
pub use crate::broker::target::{Method, MethodError, MethodResult, Reply, Target, TargetRegistry};

pub mod envelope;
mod pool;
mod target;

/// Next message ID, shared by all brokers of the process.
static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(0);

/// Index of a worker within its pool.
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Debug)]
pub struct WorkerId(pub usize);

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}", self.0)
    }
}

/// Execution context of a broker or one of its peers.
#[derive(Hash, PartialEq, Eq, Copy, Clone, Debug)]
pub enum Role {
    Main,
    Worker(WorkerId),
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => f.write_str("main thread"),
            Self::Worker(id) => id.fmt(f),
        }
    }
}

/// Broker protocol errors.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("No target for method {0:?}")]
    UnknownTarget(String),
    #[error("Method {0:?} is not callable")]
    NotCallable(String),
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("{0}")]
    Remote(String),
    #[error("Lost connection to {0}")]
    Disconnected(Role),
    #[error("Call to {0:?} timed out")]
    Timeout(String),
    #[error("Invalid argument {0}: {1}")]
    InvalidArgument(usize, String),
    #[error("Method {0:?} panicked")]
    Panicked(String),
}

/// Per-call options.
#[derive(Copy, Clone, Default, Debug)]
pub struct CallOptions {
    /// Serialize the envelope into a JSON string before posting it.
    pub stringify: bool,
}

/// Message delivered to a broker's inbox.
#[derive(Debug)]
pub struct Inbound {
    pub from: Role,
    pub packet: Packet,
}

/// Sending half of a broker connection.
#[derive(Clone, Debug)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl Mailbox {
    /// Post a packet, returning `false` if the receiving context is gone.
    pub fn post(&self, from: Role, packet: Packet) -> bool {
        self.tx.send(Inbound { from, packet }).is_ok()
    }
}

/// Receiving half of a broker connection.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

/// Create a new connection to a broker.
///
/// The [`Inbox`] is passed to [`Broker::listen`] on the receiving context,
/// while every peer gets a clone of the [`Mailbox`].
pub fn channel() -> (Mailbox, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Mailbox { tx }, Inbox { rx })
}

/// Call waiting for its reply.
struct PendingCall {
    method: String,
    peer: Role,
    reply: oneshot::Sender<Result<Payload, BrokerError>>,
}

struct BrokerInner {
    role: Role,
    registry: Rc<RefCell<TargetRegistry>>,
    peers: RefCell<HashMap<Role, Mailbox>>,
    pending: RefCell<HashMap<u64, PendingCall>>,
    timeout: Cell<Option<Duration>>,
    last_message_id: Cell<Option<u64>>,
}

/// Message broker of one execution context.
#[derive(Clone)]
pub struct Broker {
    inner: Rc<BrokerInner>,
}

impl Broker {
    pub fn new(role: Role, registry: Rc<RefCell<TargetRegistry>>) -> Self {
        let inner = BrokerInner {
            registry,
            role,
            last_message_id: Default::default(),
            timeout: Default::default(),
            pending: Default::default(),
            peers: Default::default(),
        };
        Self { inner: Rc::new(inner) }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Maximum time to wait for replies to new calls.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.timeout.set(timeout);
    }

    /// Make a namespace callable by peers.
    pub fn register(&self, namespace: &str, target: Target) {
        self.inner.registry.borrow_mut().register(namespace, target);
    }

    /// Stop accepting calls for a namespace.
    pub fn unregister(&self, namespace: &str) {
        self.inner.registry.borrow_mut().unregister(namespace);
    }

    /// Add a peer which can be called and replied to.
    pub fn connect(&self, peer: Role, mailbox: Mailbox) {
        self.inner.peers.borrow_mut().insert(peer, mailbox);
    }

    /// Remove a peer and reject all calls still waiting for its replies.
    pub fn disconnect(&self, peer: Role) {
        self.inner.peers.borrow_mut().remove(&peer);
        self.reject_pending(|call| call.peer == peer);
    }

    /// Number of calls waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// ID of the last call issued by this broker.
    pub fn last_message_id(&self) -> Option<u64> {
        self.inner.last_message_id.get()
    }

    /// Call a method on a peer.
    ///
    /// The message is posted immediately, the returned future only waits for
    /// the reply. Transferables in `args` are moved to the peer.
    pub fn call(
        &self,
        peer: Role,
        method: &str,
        args: impl Into<Payload>,
    ) -> impl Future<Output = Result<Payload, BrokerError>> + 'static {
        self.call_with(peer, method, args, CallOptions::default())
    }

    /// Call a method on a peer with custom options.
    pub fn call_with(
        &self,
        peer: Role,
        method: &str,
        args: impl Into<Payload>,
        options: CallOptions,
    ) -> impl Future<Output = Result<Payload, BrokerError>> + 'static {
        let posted = self.post_call(peer, method, args.into(), options);
        let timeout = self.inner.timeout.get();
        let method = method.to_owned();
        let broker = self.clone();

        async move {
            let (id, rx) = posted?;

            let reply = match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        broker.inner.pending.borrow_mut().remove(&id);
                        return Err(BrokerError::Timeout(method));
                    },
                },
                None => rx.await,
            };

            reply.unwrap_or(Err(BrokerError::Disconnected(peer)))
        }
    }

    /// Call a method on multiple workers.
    ///
    /// Replies are returned in the order of `workers`; the first failing
    /// worker rejects the entire call.
    pub fn call_workers(
        &self,
        workers: &[WorkerId],
        method: &str,
        args: Value,
    ) -> impl Future<Output = Result<Vec<Payload>, BrokerError>> + 'static {
        let calls: Vec<_> =
            workers.iter().map(|&id| self.call(Role::Worker(id), method, args.clone())).collect();

        async move {
            let mut replies = Vec::with_capacity(calls.len());
            for call in calls {
                replies.push(call.await?);
            }
            Ok(replies)
        }
    }

    /// Process inbound messages until every sender is gone.
    pub async fn listen(&self, mut inbox: Inbox) {
        debug!("Broker for {} listening", self.inner.role);

        while let Some(inbound) = inbox.rx.recv().await {
            self.receive(inbound);
        }

        info!("Broker for {} shutting down", self.inner.role);

        // Nobody is left to reply.
        self.inner.peers.borrow_mut().clear();
        self.reject_pending(|_| true);
    }

    /// Register a call as pending and post it to the peer.
    fn post_call(
        &self,
        peer: Role,
        method: &str,
        payload: Payload,
        options: CallOptions,
    ) -> Result<(u64, oneshot::Receiver<Result<Payload, BrokerError>>), BrokerError> {
        let mailbox = self.inner.peers.borrow().get(&peer).cloned();
        let mailbox = mailbox.ok_or(BrokerError::Disconnected(peer))?;

        let id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
        self.inner.last_message_id.set(Some(id));

        let (tx, rx) = oneshot::channel();
        let call = PendingCall { method: method.into(), reply: tx, peer };
        self.inner.pending.borrow_mut().insert(id, call);

        let transferables = payload.transferables.len();
        let envelope = Envelope::call(self.inner.role, id, method, payload);
        let posted = Packet::new(envelope, options.stringify).and_then(|packet| {
            if mailbox.post(self.inner.role, packet) {
                Ok(())
            } else {
                Err(BrokerError::Disconnected(peer))
            }
        });

        if let Err(err) = posted {
            self.inner.pending.borrow_mut().remove(&id);
            return Err(err);
        }

        if transferables > 0 {
            trace!("Transferred {transferables} buffers to {peer} for {method}");
        }

        Ok((id, rx))
    }

    /// Handle a single inbound message.
    fn receive(&self, inbound: Inbound) {
        let envelope = match inbound.packet.into_envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("Failed to read message from {}: {err}", inbound.from);
                return;
            },
        };

        if !envelope.kind.addressed_to(self.inner.role) {
            trace!("Ignoring {:?} message {} on {}", envelope.kind, envelope.id, self.inner.role);
            return;
        }

        if envelope.kind.is_reply() {
            self.resolve(envelope);
        } else {
            self.dispatch(inbound.from, envelope);
        }
    }

    /// Complete a pending call with its reply.
    fn resolve(&self, mut envelope: Envelope) {
        let call = self.inner.pending.borrow_mut().remove(&envelope.id);
        let call = match call {
            Some(call) => call,
            None => {
                trace!("Ignoring reply for unknown message {}", envelope.id);
                return;
            },
        };

        let result = match envelope.error.take() {
            Some(err) => {
                debug!("Call to {} failed: {err}", call.method);
                Err(BrokerError::Remote(err))
            },
            None => {
                let transferables = envelope.transferables.len();
                if transferables > 0 {
                    trace!("Received {transferables} buffers in reply to {}", call.method);
                }
                Ok(envelope.into_payload())
            },
        };

        // Caller might have given up on the reply already.
        let _ = call.reply.send(result);
    }

    /// Invoke the method addressed by an inbound call.
    fn dispatch(&self, from: Role, envelope: Envelope) {
        let id = envelope.id;
        let method = envelope.method.clone().unwrap_or_default();

        // Release the registry before invoking, methods may register targets.
        let resolved = self.inner.registry.borrow().resolve(&method);

        // Panicking methods must not take down the listener.
        let reply = match resolved {
            Ok(callable) => {
                let payload = envelope.into_payload();
                panic::catch_unwind(AssertUnwindSafe(|| callable(payload)))
                    .unwrap_or_else(|_| Reply::Ready(Err(panicked(&method))))
            },
            Err(err) => Reply::Ready(Err(err.into())),
        };

        match reply {
            Reply::Ready(result) => self.reply(from, id, &method, result),
            Reply::Deferred(future) => {
                let broker = self.clone();
                tokio::task::spawn_local(async move {
                    let result = AssertUnwindSafe(future).catch_unwind().await;
                    let result = result.unwrap_or_else(|_| Err(panicked(&method)));
                    broker.reply(from, id, &method, result);
                });
            },
        }
    }

    /// Send the result of a method back to its caller.
    fn reply(&self, to: Role, id: u64, method: &str, result: MethodResult) {
        let result = result.map_err(|err| {
            debug!("Method {method:?} failed: {err}");
            err.to_string()
        });

        let mailbox = match self.inner.peers.borrow().get(&to) {
            Some(mailbox) => mailbox.clone(),
            None => {
                warn!("Dropping reply to {method:?}, {to} is not connected");
                return;
            },
        };

        let envelope = Envelope::reply(self.inner.role, id, result);
        match Packet::new(envelope, false) {
            Ok(packet) => {
                if !mailbox.post(self.inner.role, packet) {
                    warn!("Dropping reply to {method:?}, {to} is gone");
                }
            },
            Err(err) => error!("Failed to reply to {method:?}: {err}"),
        }
    }

    /// Reject all pending calls matching a predicate.
    fn reject_pending(&self, mut predicate: impl FnMut(&PendingCall) -> bool) {
        let rejected: Vec<_> = {
            let mut pending = self.inner.pending.borrow_mut();
            let ids: Vec<u64> = pending
                .iter()
                .filter_map(|(&id, call)| predicate(call).then_some(id))
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        for call in rejected {
            debug!("Rejecting call to {} on {}", call.method, call.peer);
            let _ = call.reply.send(Err(BrokerError::Disconnected(call.peer)));
        }
    }
}

/// Error reply for a method which panicked.
fn panicked(method: &str) -> MethodError {
    error!("Method {method:?} panicked");
    BrokerError::Panicked(method.into()).into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::task::LocalSet;

    use super::*;

    /// Create main and worker brokers connected to each other.
    fn connected_pair() -> (Broker, Broker, Inbox, Inbox) {
        let main = Broker::new(Role::Main, Default::default());
        let worker = Broker::new(Role::Worker(WorkerId(0)), Default::default());

        let (main_mailbox, main_inbox) = channel();
        let (worker_mailbox, worker_inbox) = channel();
        main.connect(Role::Worker(WorkerId(0)), worker_mailbox);
        worker.connect(Role::Main, main_mailbox);

        (main, worker, main_inbox, worker_inbox)
    }

    fn math_target() -> Target {
        Target::new()
            .method("square", |payload: Payload| payload.arg::<i64>(0).map(|x| json!(x * x)))
            .method("fail", |_| Err::<Value, _>("division by zero"))
    }

    #[tokio::test]
    async fn call_and_reply() {
        LocalSet::new()
            .run_until(async {
                let (main, worker, main_inbox, worker_inbox) = connected_pair();
                worker.register("self", math_target());
                tokio::task::spawn_local({
                    let main = main.clone();
                    async move { main.listen(main_inbox).await }
                });
                tokio::task::spawn_local({
                    let worker = worker.clone();
                    async move { worker.listen(worker_inbox).await }
                });

                let worker_id = Role::Worker(WorkerId(0));
                let reply = main.call(worker_id, "self.square", json!([5])).await.unwrap();
                assert_eq!(reply.value, json!(25));
                assert_eq!(main.pending_count(), 0);

                let err = main.call(worker_id, "self.fail", Value::Null).await.unwrap_err();
                assert!(matches!(&err, BrokerError::Remote(msg) if msg == "division by zero"));

                let err = main.call(worker_id, "nothing.here", Value::Null).await.unwrap_err();
                assert!(matches!(err, BrokerError::Remote(_)));
                assert_eq!(main.pending_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn panicking_methods() {
        LocalSet::new()
            .run_until(async {
                let (main, worker, main_inbox, worker_inbox) = connected_pair();
                let target = math_target()
                    .method("overflow", |payload: Payload| {
                        payload.arg::<u32>(0).map(|x| json!(x.checked_add(1).unwrap()))
                    })
                    .method("overflow_later", |payload: Payload| {
                        Reply::deferred(async move {
                            let x = payload.arg::<u32>(0)?;
                            Ok(Payload::new(json!(x.checked_add(1).unwrap())))
                        })
                    });
                main.register("self", target);
                tokio::task::spawn_local({
                    let main = main.clone();
                    async move { main.listen(main_inbox).await }
                });
                tokio::task::spawn_local({
                    let worker = worker.clone();
                    async move { worker.listen(worker_inbox).await }
                });

                let err = worker.call(Role::Main, "self.overflow", json!([u32::MAX])).await;
                let err = err.unwrap_err();
                assert!(matches!(&err, BrokerError::Remote(msg) if msg.contains("panicked")));

                let err = worker.call(Role::Main, "self.overflow_later", json!([u32::MAX])).await;
                assert!(matches!(err, Err(BrokerError::Remote(_))));

                // Main thread keeps serving calls.
                let reply = worker.call(Role::Main, "self.square", json!([3])).await.unwrap();
                assert_eq!(reply.value, json!(9));
                assert_eq!(worker.pending_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn bidirectional_deferred_calls() {
        LocalSet::new()
            .run_until(async {
                let (main, worker, main_inbox, worker_inbox) = connected_pair();
                main.register("self", math_target());

                // Worker method which calls back into the main thread.
                let callback = worker.clone();
                worker.register(
                    "tiles",
                    Target::new().method("build", move |payload: Payload| {
                        let square = callback.call(Role::Main, "self.square", payload.value);
                        Reply::deferred(async move {
                            let squared = square.await?;
                            Ok(Payload::new(json!({ "squared": squared.value })))
                        })
                    }),
                );

                tokio::task::spawn_local({
                    let main = main.clone();
                    async move { main.listen(main_inbox).await }
                });
                tokio::task::spawn_local({
                    let worker = worker.clone();
                    async move { worker.listen(worker_inbox).await }
                });

                let reply =
                    main.call(Role::Worker(WorkerId(0)), "tiles.build", json!([7])).await.unwrap();
                assert_eq!(reply.value, json!({ "squared": 49 }));
                assert_eq!(main.pending_count(), 0);
                assert_eq!(worker.pending_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn out_of_order_replies() {
        LocalSet::new()
            .run_until(async {
                let (main, worker, main_inbox, worker_inbox) = connected_pair();
                worker.register(
                    "timer",
                    Target::new().method("sleep", |payload: Payload| {
                        Reply::deferred(async move {
                            let ms = payload.arg::<u64>(0)?;
                            tokio::time::sleep(Duration::from_millis(ms)).await;
                            Ok(Payload::new(json!(ms)))
                        })
                    }),
                );
                tokio::task::spawn_local({
                    let main = main.clone();
                    async move { main.listen(main_inbox).await }
                });
                tokio::task::spawn_local({
                    let worker = worker.clone();
                    async move { worker.listen(worker_inbox).await }
                });

                let worker_id = Role::Worker(WorkerId(0));
                let slow = main.call(worker_id, "timer.sleep", json!([50]));
                let fast = main.call(worker_id, "timer.sleep", json!([1]));
                assert_eq!(main.pending_count(), 2);

                assert_eq!(fast.await.unwrap().value, json!(1));
                assert_eq!(main.pending_count(), 1);
                assert_eq!(slow.await.unwrap().value, json!(50));
                assert_eq!(main.pending_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn unique_message_ids() {
        let (main, worker, _main_inbox, _worker_inbox) = connected_pair();

        let _first = main.call(Role::Worker(WorkerId(0)), "a.b", Value::Null);
        let first = main.last_message_id().unwrap();
        let _second = worker.call(Role::Main, "a.b", Value::Null);
        let second = worker.last_message_id().unwrap();
        let _third = main.call(Role::Worker(WorkerId(0)), "a.b", Value::Null);
        let third = main.last_message_id().unwrap();

        assert!(first < second);
        assert!(second < third);
    }

    #[tokio::test]
    async fn disconnect_rejects_pending() {
        let (main, _worker, _main_inbox, _worker_inbox) = connected_pair();

        let worker_id = Role::Worker(WorkerId(0));
        let call = main.call(worker_id, "tiles.build", Value::Null);
        assert_eq!(main.pending_count(), 1);

        main.disconnect(worker_id);
        assert_eq!(main.pending_count(), 0);
        assert!(matches!(call.await, Err(BrokerError::Disconnected(role)) if role == worker_id));

        // New calls fail immediately.
        let call = main.call(worker_id, "tiles.build", Value::Null);
        assert!(matches!(call.await, Err(BrokerError::Disconnected(_))));
        assert_eq!(main.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_timeout() {
        let (main, _worker, _main_inbox, _worker_inbox) = connected_pair();
        main.set_timeout(Some(Duration::from_millis(5)));

        let call = main.call(Role::Worker(WorkerId(0)), "never.replies", Value::Null);
        let result = call.await;
        assert!(matches!(result, Err(BrokerError::Timeout(method)) if method == "never.replies"));
        assert_eq!(main.pending_count(), 0);
    }

    #[tokio::test]
    async fn stringified_transfer() {
        LocalSet::new()
            .run_until(async {
                let (main, worker, main_inbox, worker_inbox) = connected_pair();
                worker.register(
                    "buffers",
                    Target::new().method("sum", |payload: Payload| {
                        let bytes = payload.transferables.iter().flatten();
                        let sum: u32 = bytes.map(|&byte| byte as u32).sum();
                        let reversed = payload.transferables.into_iter().rev().collect();
                        Ok::<_, BrokerError>(Payload::with_transferables(json!(sum), reversed))
                    }),
                );
                tokio::task::spawn_local({
                    let main = main.clone();
                    async move { main.listen(main_inbox).await }
                });
                tokio::task::spawn_local({
                    let worker = worker.clone();
                    async move { worker.listen(worker_inbox).await }
                });

                let payload = Payload::with_transferables(Value::Null, vec![vec![1, 2], vec![3]]);
                let options = CallOptions { stringify: true };
                let reply = main
                    .call_with(Role::Worker(WorkerId(0)), "buffers.sum", payload, options)
                    .await
                    .unwrap();

                assert_eq!(reply.value, json!(6));
                assert_eq!(reply.transferables, vec![vec![3], vec![1, 2]]);
            })
            .await;
    }

    #[tokio::test]
    async fn aggregate_worker_calls() {
        LocalSet::new()
            .run_until(async {
                let main = Broker::new(Role::Main, Default::default());
                let (main_mailbox, main_inbox) = channel();
                tokio::task::spawn_local({
                    let main = main.clone();
                    async move { main.listen(main_inbox).await }
                });

                let mut workers = Vec::new();
                for i in 0..3 {
                    let id = WorkerId(i);
                    let worker = Broker::new(Role::Worker(id), Default::default());
                    worker.register(
                        "self",
                        Target::new().method("id", move |payload: Payload| {
                            let fail = payload.arg::<Option<usize>>(0)?;
                            if fail == Some(i) {
                                return Err(MethodError::from("refused"));
                            }
                            Ok(Payload::new(json!(i)))
                        }),
                    );

                    let (mailbox, inbox) = channel();
                    main.connect(Role::Worker(id), mailbox);
                    worker.connect(Role::Main, main_mailbox.clone());
                    tokio::task::spawn_local({
                        let worker = worker.clone();
                        async move { worker.listen(inbox).await }
                    });
                    workers.push(id);
                }

                let replies = main.call_workers(&workers, "self.id", json!([null])).await.unwrap();
                let ids: Vec<_> = replies.into_iter().map(|reply| reply.value).collect();
                assert_eq!(ids, vec![json!(0), json!(1), json!(2)]);

                let result = main.call_workers(&workers, "self.id", json!([1])).await;
                assert!(matches!(result, Err(BrokerError::Remote(msg)) if msg == "refused"));
            })
            .await;
    }
}
