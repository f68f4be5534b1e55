//! Method routing.
//!
//! A [`Router`] maps validated [`MethodName`]s to [`CallHandler`]s. It is
//! assembled once through a [`RouterBuilder`] during startup and is
//! immutable afterwards, so concurrent lookups need no locking.
//!
//! [`RouterCell`] guards the construction itself: the first successful
//! `get_or_try_init` builds the router, later calls get the same mapping
//! back untouched.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{log_debug, log_warn, CallError, Error, Result};

/// AMQP short strings cap at 255 bytes.
const MAX_METHOD_LEN: usize = 255;

/// Validated name of a remotely callable operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodName(Arc<str>);

impl MethodName {
    /// Validate `name`: non-empty, at most 255 bytes, no whitespace or
    /// control characters.
    pub fn new(name: &str) -> Result<Self> {
        // ---
        let valid = !name.is_empty()
            && name.len() <= MAX_METHOD_LEN
            && !name.chars().any(|c| c.is_whitespace() || c.is_control());

        if valid {
            Ok(Self(Arc::from(name)))
        } else {
            Err(Error::InvalidMethodName(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for MethodName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

/// Decoded inbound call as seen by a handler.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Arc<str>,
    pub correlation_id: Option<Arc<str>>,
    pub body: Bytes,
}

impl Request {
    /// Deserialize the JSON body. An empty body decodes as `null`, so
    /// parameterless methods can take `()` or an `Option`.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, CallError> {
        // ---
        let body: &[u8] = if self.body.is_empty() {
            b"null"
        } else {
            &self.body
        };

        serde_json::from_slice(body)
            .map_err(|e| CallError::handler(format!("invalid request body: {e}")))
    }
}

/// Serialize a handler result, reporting failures as `EncodingFailed`.
pub fn encode<T: Serialize>(value: &T) -> std::result::Result<Bytes, CallError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(CallError::encoding)
}

/// Business logic bound to one method name.
///
/// Handlers run concurrently, each in its own task. They must not block the
/// thread; the server bounds every call with a timeout and turns panics into
/// `HandlerError` replies.
#[async_trait::async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle(&self, request: Request) -> std::result::Result<Bytes, CallError>;
}

/// Adapter turning a typed async closure into a [`CallHandler`].
///
/// The request body is decoded into `TReq`, the closure's `TResp` is encoded
/// as JSON, and any error `E` becomes a `HandlerError` reply.
pub struct FnHandler<F, Fut, TReq, TResp, E> {
    func: F,
    _phantom: PhantomData<fn(TReq) -> (Fut, TResp, E)>,
}

impl<F, Fut, TReq, TResp, E> FnHandler<F, Fut, TReq, TResp, E> {
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut, TReq, TResp, E> CallHandler for FnHandler<F, Fut, TReq, TResp, E>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<TResp, E>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    async fn handle(&self, request: Request) -> std::result::Result<Bytes, CallError> {
        // ---
        let req: TReq = request.decode()?;
        let resp = (self.func)(req)
            .await
            .map_err(|e| CallError::handler(e.to_string()))?;
        encode(&resp)
    }
}

type HandlerMap = HashMap<MethodName, Arc<dyn CallHandler>>;

/// Collects handler registrations before the router is frozen.
#[derive(Default)]
pub struct RouterBuilder {
    handlers: HandlerMap,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `method`.
    ///
    /// Registering a name that is already bound is a no-op: the first handler
    /// stays and a warning is logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMethodName`] if `method` fails validation.
    pub fn register<H>(mut self, method: &str, handler: H) -> Result<Self>
    where
        H: CallHandler + 'static,
    {
        // ---
        let name = MethodName::new(method)?;

        if self.handlers.contains_key(&name) {
            log_warn!("method {name} already registered; keeping the first handler");
            return Ok(self);
        }

        log_debug!("registered method {name}");
        self.handlers.insert(name, Arc::new(handler));
        Ok(self)
    }

    /// Bind a typed async closure to `method`.
    ///
    /// ```
    /// # use rmq_rpc::RouterBuilder;
    /// # use serde::{Deserialize, Serialize};
    /// #[derive(Deserialize)]
    /// struct AddRequest { a: i32, b: i32 }
    /// #[derive(Serialize)]
    /// struct AddResponse { sum: i32 }
    ///
    /// let router = RouterBuilder::new()
    ///     .route("add", |req: AddRequest| async move {
    ///         Ok::<_, String>(AddResponse { sum: req.a + req.b })
    ///     })
    ///     .unwrap()
    ///     .build();
    /// assert!(router.contains("add"));
    /// ```
    pub fn route<F, Fut, TReq, TResp, E>(self, method: &str, func: F) -> Result<Self>
    where
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TResp, E>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.register(method, FnHandler::new(func))
    }

    /// Freeze the registrations into an immutable [`Router`].
    pub fn build(self) -> Router {
        Router {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Immutable method → handler mapping. Cloning shares the same map.
#[derive(Clone, Default)]
pub struct Router {
    handlers: Arc<HandlerMap>,
}

impl Router {
    /// Find the handler for a method name as it arrived on the wire.
    ///
    /// # Errors
    ///
    /// Returns a `MethodNotFound` [`CallError`] for unknown or invalid names.
    pub fn lookup(&self, method: &str) -> std::result::Result<Arc<dyn CallHandler>, CallError> {
        // ---
        MethodName::new(method)
            .ok()
            .and_then(|name| self.handlers.get(&name).cloned())
            .ok_or_else(|| CallError::method_not_found(method))
    }

    pub fn contains(&self, method: &str) -> bool {
        self.lookup(method).is_ok()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().map(|n| n.to_string()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods())
            .finish()
    }
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owned construct-once slot for a [`Router`].
///
/// Concurrent first callers serialize on the slot; exactly one successful
/// build runs and every caller receives the same router.
#[derive(Default)]
pub struct RouterCell {
    slot: Mutex<Option<Router>>,
}

impl RouterCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stored router, building it with `init` on first use.
    ///
    /// A failed `init` leaves the cell empty so a later call may retry.
    pub fn get_or_try_init<F, E>(&self, init: F) -> std::result::Result<Router, E>
    where
        F: FnOnce() -> std::result::Result<Router, E>,
    {
        // ---
        let mut slot = lock_ignore_poison(&self.slot);
        if let Some(router) = slot.as_ref() {
            return Ok(router.clone());
        }

        let router = init()?;
        *slot = Some(router.clone());
        Ok(router)
    }

    pub fn get(&self) -> Option<Router> {
        lock_ignore_poison(&self.slot).clone()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::ErrorKind;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize)]
    struct Echo {
        text: String,
    }

    struct Fixed(&'static str);

    #[async_trait::async_trait]
    impl CallHandler for Fixed {
        async fn handle(&self, _request: Request) -> std::result::Result<Bytes, CallError> {
            encode(&self.0)
        }
    }

    fn request(method: &str, body: &'static [u8]) -> Request {
        Request {
            method: Arc::from(method),
            correlation_id: None,
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn method_name_validation() {
        // ---
        assert!(MethodName::new("getHistory").is_ok());
        assert!(MethodName::new("math/add.v2").is_ok());
        assert!(MethodName::new("").is_err());
        assert!(MethodName::new("get history").is_err());
        assert!(MethodName::new("tab\there").is_err());
        assert!(MethodName::new(&"x".repeat(256)).is_err());
        assert!(MethodName::new(&"x".repeat(255)).is_ok());
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_first_handler() {
        // ---
        let router = RouterBuilder::new()
            .register("which", Fixed("first"))
            .unwrap()
            .register("which", Fixed("second"))
            .unwrap()
            .build();

        assert_eq!(router.len(), 1);
        let handler = router.lookup("which").unwrap();
        let body = handler.handle(request("which", b"")).await.unwrap();
        assert_eq!(&body[..], br#""first""#);
    }

    #[test]
    fn lookup_unknown_is_method_not_found() {
        // ---
        let router = RouterBuilder::new().build();
        let err = router.lookup("unknownOp").err().unwrap();
        assert_eq!(err.kind, ErrorKind::MethodNotFound);

        let err = router.lookup("").err().unwrap();
        assert_eq!(err.kind, ErrorKind::MethodNotFound);
    }

    #[test]
    fn register_rejects_invalid_name() {
        let result = RouterBuilder::new().register("bad name", Fixed("x"));
        assert!(matches!(result, Err(Error::InvalidMethodName(_))));
    }

    #[tokio::test]
    async fn fn_handler_decodes_and_encodes() {
        // ---
        let router = RouterBuilder::new()
            .route("echo", |req: Echo| async move { Ok::<_, String>(req.text) })
            .unwrap()
            .route("fail", |_: ()| async move { Err::<(), _>("nope") })
            .unwrap()
            .build();

        let echo = router.lookup("echo").unwrap();
        let body = echo
            .handle(request("echo", br#"{"text":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(&body[..], br#""hi""#);

        let err = echo.handle(request("echo", b"[1,2]")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerError);

        let fail = router.lookup("fail").unwrap();
        let err = fail.handle(request("fail", b"")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerError);
        assert_eq!(err.message, "nope");
    }

    #[tokio::test]
    async fn unencodable_result_is_encoding_failed() {
        // ---
        use std::collections::BTreeMap;

        // JSON object keys must be strings.
        let router = RouterBuilder::new()
            .route("bad", |_: ()| async move {
                let mut map = BTreeMap::new();
                map.insert(vec![1u8], 1);
                Ok::<_, String>(map)
            })
            .unwrap()
            .build();

        let err = router
            .lookup("bad")
            .unwrap()
            .handle(request("bad", b""))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::EncodingFailed);
    }

    #[test]
    fn router_cell_builds_once_under_contention() {
        // ---
        let cell = Arc::new(RouterCell::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                let builds = builds.clone();
                std::thread::spawn(move || {
                    cell.get_or_try_init(|| {
                        builds.fetch_add(1, Ordering::SeqCst);
                        RouterBuilder::new().register("getHistory", Fixed("h"))
                            .map(RouterBuilder::build)
                    })
                    .unwrap()
                })
            })
            .collect();

        for t in threads {
            let router = t.join().unwrap();
            assert_eq!(router.methods(), vec!["getHistory".to_string()]);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn router_cell_retries_after_failed_init() {
        // ---
        let cell = RouterCell::new();
        let failed: std::result::Result<Router, Error> =
            cell.get_or_try_init(|| RouterBuilder::new().register("", Fixed("x")).map(RouterBuilder::build));
        assert!(failed.is_err());
        assert!(cell.get().is_none());

        let router = cell
            .get_or_try_init(|| Ok::<_, Error>(RouterBuilder::new().build()))
            .unwrap();
        assert!(router.is_empty());
    }
}
