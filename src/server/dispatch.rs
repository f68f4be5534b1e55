//! Per-call dispatch.
//!
//! Every accepted delivery runs [`serve_call`] in its own task. The task
//! resolves the handler, runs it inside a failure boundary (panic recovery
//! plus the per-call timeout), and publishes exactly one reply when the call
//! carries a reply address.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_lite::FutureExt;
use tokio::sync::OwnedSemaphorePermit;

use crate::reply::encode_reply;
use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    Address,
    CallError,
    CallHandler,
    Envelope,
    Request,
    Router,
    TransportPtr,
};

/// Shared, read-only state every call task needs.
pub(super) struct CallContext {
    pub(super) transport: TransportPtr,
    pub(super) router: Router,
    pub(super) call_timeout: Duration,
}

/// Keeps `rpc_calls_in_flight` accurate even when a task is aborted.
struct InFlightGauge;

impl InFlightGauge {
    fn enter() -> Self {
        metrics::gauge!("rpc_calls_in_flight").increment(1.0);
        Self
    }
}

impl Drop for InFlightGauge {
    fn drop(&mut self) {
        metrics::gauge!("rpc_calls_in_flight").decrement(1.0);
    }
}

/// Handle one inbound call envelope end to end.
///
/// `_permit` holds a slot of the server's in-flight limit until the reply is
/// published.
pub(super) async fn serve_call(ctx: Arc<CallContext>, env: Envelope, _permit: OwnedSemaphorePermit) {
    // ---
    let _gauge = InFlightGauge::enter();
    let started = Instant::now();

    let Envelope {
        method,
        payload,
        correlation_id,
        reply_to,
        ..
    } = env;

    let method: Arc<str> = method.unwrap_or_else(|| Arc::from(""));
    let request = Request {
        method: method.clone(),
        correlation_id: correlation_id.clone(),
        body: payload,
    };

    let (label, outcome) = match ctx.router.lookup(&method) {
        Ok(handler) => (
            method.to_string(),
            invoke(handler, request, ctx.call_timeout).await,
        ),
        Err(err) => ("unknown".to_string(), Err(err)),
    };

    record(label, &outcome, started.elapsed());

    let Some(reply_to) = reply_address(reply_to) else {
        match &outcome {
            Ok(_) => log_debug!("fire-and-forget call {method:?} done"),
            Err(e) => log_warn!("fire-and-forget call {method:?} failed: {e}"),
        }
        return;
    };

    if let Err(e) = &outcome {
        log_debug!("call {method:?} answered with error: {e}");
    }

    publish_reply(&ctx, &method, reply_to, correlation_id, &outcome).await;
}

/// Answer an accepted call with `err` without running its handler.
pub(super) async fn reject(ctx: &CallContext, env: Envelope, err: CallError) {
    // ---
    let method = env.method.unwrap_or_else(|| Arc::from(""));
    let label = if ctx.router.contains(&method) {
        method.to_string()
    } else {
        "unknown".to_string()
    };
    record(label, &Err(err.clone()), Duration::ZERO);

    let Some(reply_to) = reply_address(env.reply_to) else {
        log_warn!("fire-and-forget call {method:?} dropped: {err}");
        return;
    };

    publish_reply(ctx, &method, reply_to, env.correlation_id, &Err(err)).await;
}

/// An absent or empty reply address marks a fire-and-forget call.
fn reply_address(reply_to: Option<Address>) -> Option<Address> {
    reply_to.filter(|address| !address.as_str().is_empty())
}

async fn publish_reply(
    ctx: &CallContext,
    method: &str,
    reply_to: Address,
    correlation_id: Option<Arc<str>>,
    outcome: &Result<Bytes, CallError>,
) {
    // ---
    let reply = encode_reply(reply_to, correlation_id, outcome);
    let address = reply.address.clone();
    if let Err(e) = ctx.transport.publish(reply).await {
        log_error!(
            "failed to publish reply for {method:?} to {}: {e}",
            address.as_str()
        );
    }
}

/// Run `handler` inside the per-call failure boundary.
pub(super) async fn invoke(
    handler: Arc<dyn CallHandler>,
    request: Request,
    limit: Duration,
) -> Result<Bytes, CallError> {
    // ---
    let call = AssertUnwindSafe(handler.handle(request)).catch_unwind();

    match tokio::time::timeout(limit, call).await {
        Err(_) => Err(CallError::timeout(limit)),
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            log_error!("handler panicked: {message}");
            Err(CallError::handler(format!("handler panicked: {message}")))
        }
        Ok(Ok(result)) => result,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    // ---
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

fn record(method: String, outcome: &Result<Bytes, CallError>, elapsed: Duration) {
    // ---
    let result = match outcome {
        Ok(_) => "ok",
        Err(e) => e.kind.as_str(),
    };

    metrics::histogram!("rpc_call_duration_seconds", "method" => method.clone())
        .record(elapsed.as_secs_f64());
    metrics::counter!("rpc_calls_total", "method" => method, "outcome" => result).increment(1);
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::ErrorKind;

    struct Panics;

    #[async_trait::async_trait]
    impl CallHandler for Panics {
        async fn handle(&self, _request: Request) -> Result<Bytes, CallError> {
            panic!("boom");
        }
    }

    struct Sleeps(Duration);

    #[async_trait::async_trait]
    impl CallHandler for Sleeps {
        async fn handle(&self, _request: Request) -> Result<Bytes, CallError> {
            tokio::time::sleep(self.0).await;
            Ok(Bytes::from_static(b"null"))
        }
    }

    #[test]
    fn empty_reply_address_means_no_reply() {
        // ---
        assert!(reply_address(None).is_none());
        assert!(reply_address(Some(Address::from(""))).is_none());
        assert_eq!(
            reply_address(Some(Address::from("client"))),
            Some(Address::from("client"))
        );
    }

    fn request() -> Request {
        Request {
            method: Arc::from("m"),
            correlation_id: None,
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn panic_becomes_handler_error() {
        // ---
        let err = invoke(Arc::new(Panics), request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerError);
        assert!(err.message.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        // ---
        let err = invoke(
            Arc::new(Sleeps(Duration::from_secs(10))),
            request(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn fast_handler_passes_through() {
        let body = invoke(Arc::new(Sleeps(Duration::ZERO)), request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&body[..], b"null");
    }

    #[test]
    fn panic_message_variants() {
        // ---
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
