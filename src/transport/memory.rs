//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the transport
//! layer:
//!
//! - Once `subscribe()` returns successfully, messages published *after* that
//!   point to the same address are deliverable.
//! - Message delivery is deterministic within a single process.
//! - No messages are dropped due to timing, scheduling, or background IO.
//! - Closing a transport closes the inboxes of the subscriptions *it* made,
//!   which is how a dropped broker connection looks to the layers above.
//!
//! ## Non-Goals
//!
//! This transport does not emulate the failure modes, persistence, or
//! delivery guarantees of any specific broker.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::{
    // ---
    log_debug,
    Envelope,
    Result,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// Inbox depth per subscription.
const INBOX_CAPACITY: usize = 16;

struct Subscriber {
    owner: Arc<str>,
    tx: mpsc::Sender<Envelope>,
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a message broker within a single process. All transports that
/// share a `MemoryHub` can publish and receive each other's messages, exactly
/// as nodes connected to a real broker would. Construct one hub per test to
/// keep parallel tests isolated.
///
/// ```
/// # async fn example() -> rmq_rpc::Result<()> {
/// let hub = rmq_rpc::MemoryHub::new();
/// let server_transport = rmq_rpc::create_memory_transport("server", hub.clone());
/// let client_transport = rmq_rpc::create_memory_transport("client", hub.clone());
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    subscriptions: RwLock<HashMap<Subscription, Vec<Subscriber>>>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    async fn publish(&self, transport_id: &str, env: Envelope) -> Result<()> {
        // ---
        let key = Subscription(env.address.0.clone());

        // Clone the senders so the lock is not held across a full inbox.
        let senders: Vec<mpsc::Sender<Envelope>> = {
            let subs = self.subscriptions.read().await;
            subs.get(&key)
                .map(|list| list.iter().map(|s| s.tx.clone()).collect())
                .unwrap_or_default()
        };

        if senders.is_empty() {
            log_debug!("{transport_id}: no subscribers for {}", env.address.as_str());
        }

        for sender in senders {
            // A closed channel indicates a dropped SubscriptionHandle.
            if sender.send(env.clone()).await.is_err() {
                log_debug!("{transport_id}: subscriber gone for {}", env.address.as_str());
            }
        }

        Ok(())
    }

    async fn subscribe(&self, transport_id: &str, sub: Subscription) -> Result<SubscriptionHandle> {
        // ---
        log_debug!("{transport_id}: subscribe to {sub:?}");

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        let mut subs = self.subscriptions.write().await;
        subs.entry(sub).or_default().push(Subscriber {
            owner: Arc::from(transport_id),
            tx,
        });

        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn disconnect(&self, transport_id: &str) {
        // ---
        log_debug!("{transport_id}: closing transport...");

        let mut subs = self.subscriptions.write().await;
        for list in subs.values_mut() {
            list.retain(|s| &*s.owner != transport_id);
        }
        subs.retain(|_, list| !list.is_empty());
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }
}

/// In-memory transport.
///
/// Routes messages through a shared [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    /// Publish an envelope to every subscription whose name equals the
    /// envelope address.
    async fn publish(&self, env: Envelope) -> Result<()> {
        self.hub.publish(&self.transport_id, env).await
    }

    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
        self.hub.subscribe(&self.transport_id, sub).await
    }

    /// Drop every subscription this transport registered on the hub.
    ///
    /// Subscriptions owned by other transports on the same hub are untouched.
    async fn close(&self) -> Result<()> {
        self.hub.disconnect(&self.transport_id).await;
        Ok(())
    }
}

/// Create an in-memory transport attached to `hub`.
///
/// Transport ids should be unique per hub; `close()` removes subscriptions
/// by id.
pub fn create_transport(transport_id: impl Into<String>, hub: Arc<MemoryHub>) -> TransportPtr {
    // ---
    let transport_id = transport_id.into();
    log_debug!("{transport_id}: create memory transport");

    Arc::new(MemoryTransport { transport_id, hub })
}
