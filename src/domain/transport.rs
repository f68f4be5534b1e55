// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the transport interface used by the server and client
//! layers to exchange messages. It intentionally avoids any reference to
//! concrete protocols, brokers, or client libraries.
//!
//! The transport layer is responsible only for delivering envelopes to
//! subscribed consumers. Call dispatch, correlation and timeouts are handled
//! by the server and client.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Content type stamped on every RPC body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A transport address.
///
/// An `Address` names a destination to which messages may be published. For
/// the AMQP transport it is an exchange name; for the in-memory transport it
/// is matched verbatim against subscriptions.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

/// A subscription identifier.
///
/// A `Subscription` asks the transport for every message published to the
/// address of the same name. How the subscription is realised (queue
/// declaration, binding) is transport specific.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(pub Arc<str>);

impl From<Address> for Subscription {
    fn from(address: Address) -> Self {
        // ---
        Subscription(address.0)
    }
}

impl<T> From<T> for Subscription
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Subscription(value.into())
    }
}

/// A message envelope.
///
/// An `Envelope` is the unit of transport between producers and consumers.
/// It carries a payload along with the metadata the RPC layers need: the
/// method name, the correlation id and the reply address. Transports map
/// these onto native message properties; they never live in the payload.
///
/// # Examples
///
/// ```
/// # use rmq_rpc::{Envelope, Address};
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let call = Envelope::request(
///     Address::from("rpc_server"),
///     "getHistory".into(),
///     Bytes::new(),
///     Arc::from("abc123"),
///     Address::from("rpc_client"),
/// );
/// assert_eq!(call.method.as_deref(), Some("getHistory"));
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    // ---
    /// Delivery address used by the transport.
    pub address: Address,

    /// Method name for routing to handlers.
    ///
    /// `Some` on call envelopes. Replies built by the server carry their
    /// status here instead.
    pub method: Option<Arc<str>>,

    /// Opaque payload bytes, JSON by convention.
    pub payload: Bytes,

    /// Correlation identifier used to associate calls with replies.
    pub correlation_id: Option<Arc<str>>,

    /// Reply address. `None` marks a fire-and-forget call.
    pub reply_to: Option<Address>,

    /// Content type metadata (e.g., "application/json").
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    // ---
    /// Create a call envelope that expects a reply.
    pub fn request(
        address: Address,
        method: Arc<str>,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
    ) -> Self {
        // ---
        Self {
            address,
            method: Some(method),
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from(JSON_CONTENT_TYPE)),
        }
    }

    /// Create a fire-and-forget call envelope (no reply address).
    pub fn cast(address: Address, method: Arc<str>, payload: Bytes) -> Self {
        // ---
        Self {
            address,
            method: Some(method),
            payload,
            correlation_id: None,
            reply_to: None,
            content_type: Some(Arc::from(JSON_CONTENT_TYPE)),
        }
    }

    /// Create a reply envelope.
    ///
    /// `correlation_id` is copied from the call as-is, including absence.
    pub fn response(address: Address, payload: Bytes, correlation_id: Option<Arc<str>>) -> Self {
        // ---
        Self {
            method: None,
            address,
            payload,
            correlation_id,
            reply_to: None,
            content_type: Some(Arc::from(JSON_CONTENT_TYPE)),
        }
    }
}

/// Handle returned from a successful subscription.
///
/// The subscription remains active until either:
/// - The handle is dropped (receiver channel closes)
/// - The transport is closed or loses its broker connection
///
/// A closed inbox (`recv()` returning `None`) is how consumers learn that
/// the transport went away.
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for delivered envelopes matching this subscription.
    pub inbox: mpsc::Receiver<Envelope>,
}

/// Transport abstraction.
///
/// A `Transport` provides best-effort delivery of envelopes between
/// producers and subscribers. Stronger semantics (correlation, timeouts)
/// belong to the layers above.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after* that
///   point to the matching address are deliverable.
/// - `publish()` does not wait on subscribers to process the message.
/// - The inbox of every live subscription closes when the transport is closed
///   or its connection drops.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used in logs.
    fn transport_id(&self) -> &str;

    /// Publish an envelope to its address.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Register a subscription and return a handle for receiving messages.
    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` only increments a reference count; all clones share the same
/// underlying connection.
pub type TransportPtr = Arc<dyn Transport>;
