//! RPC server.
//!
//! Subscribes to the server exchange, dispatches every inbound call to its
//! handler on a separate task, and publishes the reply to the caller's
//! `reply_to` exchange. Concurrency is capped by `max_in_flight`; when every
//! slot is taken the consumer loop stops reading from the broker until a call
//! finishes, so excess deliveries stay queued broker-side.
//!
//! The consumer loop task owns the whole stop sequence (drain, transport
//! close, `Stopped`), so it completes even if the caller of
//! [`RpcServer::shutdown`] goes away.

mod dispatch;

use crate::{
    // ---
    lifecycle::{notify_channel, Notifier, Notify, ServerState, StateCell},
    log_error,
    log_info,
    log_warn,
    Address,
    CallError,
    Error,
    ErrorKind,
    Result,
    Router,
    Subscription,
    SubscriptionHandle,
    TransportPtr,
};
use dispatch::CallContext;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

/// Default per-call handler deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on how long shutdown waits for in-flight calls.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on concurrently running handlers.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Builder for [`RpcServer`].
///
/// ```no_run
/// use rmq_rpc::{create_memory_transport, MemoryHub, RouterBuilder, RpcServerBuilder};
/// use std::time::Duration;
///
/// # async fn example() -> rmq_rpc::Result<()> {
/// let transport = create_memory_transport("server", MemoryHub::new());
/// let router = RouterBuilder::new()
///     .route("ping", |_: ()| async { Ok::<_, String>("pong") })?
///     .build();
///
/// let (server, notify) = RpcServerBuilder::new(transport, router, "rpc_server")
///     .call_timeout(Duration::from_secs(2))
///     .start()
///     .await?;
/// # drop(notify);
/// server.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcServerBuilder {
    // ---
    transport: TransportPtr,
    router: Router,
    exchange: Address,
    call_timeout: Duration,
    shutdown_timeout: Duration,
    max_in_flight: usize,
}

impl RpcServerBuilder {
    pub fn new(transport: TransportPtr, router: Router, exchange: impl Into<Address>) -> Self {
        // ---
        Self {
            transport,
            router,
            exchange: exchange.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Deadline for a single handler invocation.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Upper bound on the drain phase of [`RpcServer::shutdown`].
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Maximum number of handlers running at once. Values below one are
    /// raised to one.
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit.max(1);
        self
    }

    /// Subscribe to the server exchange and start the consumer loop.
    ///
    /// Returns the running server and a [`Notify`] that resolves with
    /// [`Error::ConnectionLost`] if the subscription dies without a shutdown
    /// having been requested.
    ///
    /// # Errors
    ///
    /// Fails with the transport error if the subscription cannot be set up.
    pub async fn start(self) -> Result<(RpcServer, Notify)> {
        // ---
        let Self {
            transport,
            router,
            exchange,
            call_timeout,
            shutdown_timeout,
            max_in_flight,
        } = self;

        let state = Arc::new(StateCell::new());
        let inbox = transport
            .subscribe(Subscription::from(exchange.as_str()))
            .await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (notifier, notify) = notify_channel();
        let semaphore = Arc::new(Semaphore::new(max_in_flight));

        let consumer = ConsumerLoop {
            inbox,
            ctx: Arc::new(CallContext {
                transport: transport.clone(),
                router,
                call_timeout,
            }),
            semaphore,
            shutdown_rx,
            notifier,
            state: state.clone(),
            shutdown_timeout,
        };

        state.advance(ServerState::Running);
        let loop_task = tokio::spawn(consumer.run());

        log_info!(
            "rpc server {} consuming from {} (max_in_flight={max_in_flight}, call_timeout={call_timeout:?})",
            transport.transport_id(),
            exchange.as_str()
        );

        let server = RpcServer {
            inner: Arc::new(Inner {
                transport,
                exchange,
                state,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                loop_task: Mutex::new(Some(loop_task)),
            }),
        };

        Ok((server, notify))
    }
}

/// Running RPC server. Cheap to clone; all clones control the same server.
///
/// Dropping every clone without calling [`shutdown`](Self::shutdown) runs
/// the same stop sequence in the background.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    transport: TransportPtr,
    exchange: Address,
    state: Arc<StateCell>,

    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    loop_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RpcServer {
    /// Shorthand for [`RpcServerBuilder::new`].
    pub fn builder(
        transport: TransportPtr,
        router: Router,
        exchange: impl Into<Address>,
    ) -> RpcServerBuilder {
        RpcServerBuilder::new(transport, router, exchange)
    }

    pub fn state(&self) -> ServerState {
        self.inner.state.get()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    pub fn exchange(&self) -> &Address {
        &self.inner.exchange
    }

    /// Stop consuming, serve calls already taken from the broker and wait
    /// for running ones up to the shutdown timeout, then close the transport.
    ///
    /// Calls still running at the deadline are abandoned without a reply;
    /// accepted calls that never started are answered with a `Timeout`
    /// error. Safe to call more than once and from several tasks: later
    /// callers wait for the first shutdown to finish and return `Ok(())`,
    /// even if the first caller stopped waiting.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error, or [`Error::Lifecycle`] if the
    /// consumer loop task itself failed.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        let signal = lock_ignore_poison(&self.inner.shutdown_tx).take();
        let Some(signal) = signal else {
            self.inner.state.wait_for(ServerState::Stopped).await;
            return Ok(());
        };

        self.inner.state.advance(ServerState::ShuttingDown);
        log_info!("rpc server {} shutting down", self.inner.transport.transport_id());

        // The loop may already be gone after a connection loss.
        let _ = signal.send(());

        let task = lock_ignore_poison(&self.inner.loop_task).take();
        let Some(task) = task else {
            self.inner.state.wait_for(ServerState::Stopped).await;
            return Ok(());
        };

        match task.await {
            Ok(result) => result,
            Err(e) => {
                log_error!("consumer loop task failed: {e}");
                if let Err(e) = self.inner.transport.close().await {
                    log_error!("failed to close transport: {e}");
                }
                self.inner.state.advance(ServerState::Stopped);
                Err(Error::Lifecycle(format!("consumer loop task failed: {e}")))
            }
        }
    }
}

enum Exit {
    Requested,
    ConnectionLost,
}

struct ConsumerLoop {
    // ---
    inbox: SubscriptionHandle,
    ctx: Arc<CallContext>,
    semaphore: Arc<Semaphore>,
    shutdown_rx: oneshot::Receiver<()>,
    notifier: Notifier,
    state: Arc<StateCell>,
    shutdown_timeout: Duration,
}

impl ConsumerLoop {
    async fn run(mut self) -> Result<()> {
        // ---
        let mut in_flight: JoinSet<()> = JoinSet::new();

        let exit = loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => break Exit::Requested,

                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        log_error!("call task failed: {e}");
                    }
                }

                permit = self.semaphore.clone().acquire_owned() => {
                    // The semaphore is never closed.
                    let Ok(permit) = permit else { break Exit::Requested };

                    tokio::select! {
                        biased;

                        _ = &mut self.shutdown_rx => break Exit::Requested,

                        next = self.inbox.inbox.recv() => match next {
                            Some(env) => {
                                in_flight.spawn(dispatch::serve_call(self.ctx.clone(), env, permit));
                            }
                            None => break Exit::ConnectionLost,
                        },
                    }
                }
            }
        };

        let ConsumerLoop {
            mut inbox,
            ctx,
            semaphore,
            notifier,
            state,
            shutdown_timeout,
            ..
        } = self;

        state.advance(ServerState::ShuttingDown);

        match exit {
            // Stop accepting; what the inbox already holds is still served.
            Exit::Requested => inbox.inbox.close(),
            Exit::ConnectionLost => {
                log_error!("subscription closed unexpectedly; broker connection lost");
                notifier.notify(Error::ConnectionLost);
            }
        }

        drain(&mut inbox, &mut in_flight, &ctx, &semaphore, shutdown_timeout).await;

        let transport_id = ctx.transport.transport_id().to_string();
        let closed = ctx.transport.close().await;
        if let Err(e) = &closed {
            log_error!("failed to close transport: {e}");
        }

        state.advance(ServerState::Stopped);
        log_info!("rpc server {transport_id} stopped");
        closed
    }
}

/// Dispatch the calls still buffered in the closed `inbox` and wait for every
/// running call, all within `limit`.
///
/// At the deadline running calls are aborted without a reply and buffered
/// calls that never started get a `Timeout` error reply.
async fn drain(
    inbox: &mut SubscriptionHandle,
    in_flight: &mut JoinSet<()>,
    ctx: &Arc<CallContext>,
    semaphore: &Arc<Semaphore>,
    limit: Duration,
) {
    // ---
    let deadline = Instant::now() + limit;

    let buffered = async {
        loop {
            // Permit first: `recv` is cancel-safe, a popped envelope is not.
            let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
            let Some(env) = inbox.inbox.recv().await else { break };
            in_flight.spawn(dispatch::serve_call(ctx.clone(), env, permit));
        }
    };
    let mut finished = tokio::time::timeout_at(deadline, buffered).await.is_ok();

    if finished && !in_flight.is_empty() {
        log_info!("waiting up to {limit:?} for {} in-flight calls", in_flight.len());

        finished = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    log_error!("call task failed: {e}");
                }
            }
        })
        .await
        .is_ok();
    }

    if finished {
        return;
    }

    log_warn!(
        "shutdown deadline reached; abandoning {} calls without reply",
        in_flight.len()
    );
    in_flight.abort_all();

    while let Ok(env) = inbox.inbox.try_recv() {
        let err = CallError::new(
            ErrorKind::Timeout,
            format!("server shut down before the call started (deadline {limit:?})"),
        );
        dispatch::reject(ctx, env, err).await;
    }
}
