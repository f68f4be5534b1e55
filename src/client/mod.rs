//! RPC client.
//!
//! Publishes calls to the server exchange with a fresh correlation id and the
//! client's own reply exchange as `reply_to`, then waits for the matching
//! reply on a subscription to that exchange.
//!
//! A background receive loop matches replies to waiting calls. Replies with an
//! unknown correlation id (late, duplicate or meant for another client sharing
//! the exchange) are dropped. When the reply subscription closes, every
//! waiting call fails with [`Error::ConnectionLost`].

mod pending;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time;

use crate::reply::decode_reply;
use crate::{
    // ---
    log_debug,
    log_warn,
    Address,
    CorrelationId,
    Envelope,
    Error,
    Result,
    Subscription,
    TransportPtr,
};
use pending::PendingCalls;

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Running RPC client. Cheap to clone.
///
/// ```no_run
/// use rmq_rpc::{create_memory_transport, MemoryHub, RpcClient};
/// use std::time::Duration;
///
/// # async fn example() -> rmq_rpc::Result<()> {
/// let transport = create_memory_transport("client", MemoryHub::new());
/// let client = RpcClient::start(transport, "rpc_server", "rpc_client", Duration::from_secs(5)).await?;
///
/// let history: serde_json::Value = client.call("getHistory", &()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    server_exchange: Address,
    reply_exchange: Address,
    timeout: Duration,
    pending: Arc<Mutex<PendingCalls>>,
    rx_task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}

impl RpcClient {
    /// Subscribe to `reply_exchange` and start matching replies.
    ///
    /// `timeout` bounds every [`call`](Self::call) issued through this
    /// client.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the reply subscription fails.
    pub async fn start(
        transport: TransportPtr,
        server_exchange: impl Into<Address>,
        reply_exchange: impl Into<Address>,
        timeout: Duration,
    ) -> Result<Self> {
        // ---
        let server_exchange = server_exchange.into();
        let reply_exchange = reply_exchange.into();

        let mut handle = transport
            .subscribe(Subscription::from(reply_exchange.clone()))
            .await?;

        let pending = Arc::new(Mutex::new(PendingCalls::new()));

        let rx_task = {
            let pending = pending.clone();
            tokio::spawn(async move {
                // ---
                while let Some(env) = handle.inbox.recv().await {
                    deliver(&pending, env);
                }

                let failed = lock_ignore_poison(&pending).fail_all();
                log_debug!("reply subscription closed; failed {failed} waiting calls");
            })
        };

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                server_exchange,
                reply_exchange,
                timeout,
                pending,
                rx_task,
            }),
        })
    }

    /// Call `method` with `req` and decode the reply into `TResp`.
    ///
    /// # Errors
    ///
    /// - [`Error::Remote`] when the server answers with an error reply
    /// - [`Error::Timeout`] when no reply arrives in time
    /// - [`Error::ConnectionLost`] when the reply subscription closes first
    /// - [`Error::Serialization`] when encoding `req` or decoding the reply fails
    pub async fn call<TReq, TResp>(&self, method: &str, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        // ---
        let body = Bytes::from(serde_json::to_vec(req)?);
        let reply = self.call_raw(method, body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Like [`call`](Self::call) but with raw JSON bytes on both sides.
    pub async fn call_raw(&self, method: &str, body: Bytes) -> Result<Bytes> {
        // ---
        let correlation_id = CorrelationId::generate();

        let rx = lock_ignore_poison(&self.inner.pending).register(correlation_id.clone());

        let env = Envelope::request(
            self.inner.server_exchange.clone(),
            Arc::from(method),
            body,
            correlation_id.clone().into(),
            self.inner.reply_exchange.clone(),
        );

        if let Err(e) = self.inner.transport.publish(env).await {
            lock_ignore_poison(&self.inner.pending).remove(&correlation_id);
            return Err(e);
        }

        let reply = match time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::ConnectionLost),
            Err(_) => {
                lock_ignore_poison(&self.inner.pending).remove(&correlation_id);
                return Err(Error::Timeout);
            }
        };

        decode_reply(reply.method.as_deref(), &reply.payload).map_err(|e| Error::Remote {
            kind: e.kind,
            message: e.message,
        })
    }

    /// Send a fire-and-forget call. No reply is produced or awaited.
    pub async fn cast<TReq>(&self, method: &str, req: &TReq) -> Result<()>
    where
        TReq: Serialize + ?Sized,
    {
        // ---
        let body = Bytes::from(serde_json::to_vec(req)?);
        let env = Envelope::cast(self.inner.server_exchange.clone(), Arc::from(method), body);
        self.inner.transport.publish(env).await
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    /// Stop the receive loop and close the transport.
    pub async fn close(&self) -> Result<()> {
        // ---
        self.inner.rx_task.abort();
        lock_ignore_poison(&self.inner.pending).fail_all();
        self.inner.transport.close().await
    }
}

fn deliver(pending: &Mutex<PendingCalls>, env: Envelope) {
    // ---
    let Some(correlation_id) = env.correlation_id.clone() else {
        log_warn!("dropping reply without correlation id");
        return;
    };

    let correlation_id = CorrelationId::from(correlation_id);
    if !lock_ignore_poison(pending).complete(&correlation_id, env) {
        log_debug!("dropping reply for unknown or abandoned call {correlation_id}");
    }
}
