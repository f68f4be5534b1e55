//! RPC over a message broker.
//!
//! Turns an asynchronous publish/subscribe transport into request/reply
//! calls: clients publish a call envelope carrying a method name, a
//! correlation id and a reply address; the server routes it to a registered
//! handler and publishes exactly one correlated reply.
//!
//! The crate is organised in layers:
//!
//! - **domain**: the [`Transport`] trait and the [`Envelope`] it carries
//! - **transport**: the in-memory hub and the AMQP (`lapin`) transport
//! - **router / server / client**: method routing, the consumer loop with its
//!   per-call failure boundary, and a correlating client
//! - **app**: host composition with the HTTP health/metrics surface
//!
//! ```no_run
//! use rmq_rpc::{create_memory_transport, MemoryHub, RouterBuilder, RpcClient, RpcServerBuilder};
//! use std::time::Duration;
//!
//! # async fn example() -> rmq_rpc::Result<()> {
//! let hub = MemoryHub::new();
//!
//! let router = RouterBuilder::new()
//!     .route("add", |(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) })?
//!     .build();
//! let (server, _notify) =
//!     RpcServerBuilder::new(create_memory_transport("server", hub.clone()), router, "rpc_server")
//!         .start()
//!         .await?;
//!
//! let client = RpcClient::start(
//!     create_memory_transport("client", hub),
//!     "rpc_server",
//!     "rpc_client",
//!     Duration::from_secs(5),
//! )
//! .await?;
//! let sum: i64 = client.call("add", &(2, 3)).await?;
//! assert_eq!(sum, 5);
//!
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Macros first so every module below can use them.
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Import all sub modules once...
mod client;
mod domain;
mod server;
mod transport;

mod correlation;
mod error;
mod lifecycle;
mod reply;
mod router;

pub mod app;
pub mod config;
pub mod http;
pub mod logging;
pub mod translation;

// Re-export main types
pub use client::RpcClient;
pub use server::{
    // ---
    RpcServer,
    RpcServerBuilder,
    DEFAULT_CALL_TIMEOUT,
    DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_SHUTDOWN_TIMEOUT,
};

pub use correlation::CorrelationId;
pub use error::{Error, Result};
pub use lifecycle::{notify_channel, Notifier, Notify, ServerState};
pub use reply::{
    // ---
    decode_reply,
    encode_error,
    encode_reply,
    CallError,
    ErrorKind,
    STATUS_ERROR,
    STATUS_SUCCESS,
};
pub use router::{
    // ---
    encode,
    CallHandler,
    FnHandler,
    MethodName,
    Request,
    Router,
    RouterBuilder,
    RouterCell,
};

pub use transport::{create_memory_transport, MemoryHub};

#[cfg(feature = "transport_lapin")]
pub use transport::{create_lapin_transport, AmqpConfig};

// --- public re-exports
pub use domain::{
    //
    Address,
    Envelope,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
    JSON_CONTENT_TYPE,
};
