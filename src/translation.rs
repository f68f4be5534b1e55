//! Translation history use case exposed over RPC as `getHistory`.
//!
//! The RPC layer only sees the narrow [`HistoryUseCase`] interface; storage
//! lives behind it. [`MemoryHistory`] is the in-process store the binary
//! ships with.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::router::encode;
use crate::{
    // ---
    CallError,
    CallHandler,
    Request,
    Result,
    RouterBuilder,
};

/// Method name the history handler is registered under.
pub const GET_HISTORY: &str = "getHistory";

/// One translated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub source: String,
    pub destination: String,
    pub original: String,
    pub translation: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UseCaseError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to past translations.
#[async_trait::async_trait]
pub trait HistoryUseCase: Send + Sync {
    async fn history(&self) -> std::result::Result<Vec<Translation>, UseCaseError>;
}

/// Reply body of `getHistory`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<Translation>,
}

/// `getHistory` handler. Ignores the request body.
pub struct GetHistory {
    use_case: Arc<dyn HistoryUseCase>,
}

impl GetHistory {
    pub fn new(use_case: Arc<dyn HistoryUseCase>) -> Self {
        Self { use_case }
    }
}

#[async_trait::async_trait]
impl CallHandler for GetHistory {
    async fn handle(&self, _request: Request) -> std::result::Result<Bytes, CallError> {
        // ---
        let history = self
            .use_case
            .history()
            .await
            .map_err(|e| CallError::handler(format!("getHistory: {e}")))?;

        encode(&HistoryResponse { history })
    }
}

/// Register the translation methods on `builder`.
pub fn routes(builder: RouterBuilder, use_case: Arc<dyn HistoryUseCase>) -> Result<RouterBuilder> {
    builder.register(GET_HISTORY, GetHistory::new(use_case))
}

/// In-memory history, oldest first.
#[derive(Default)]
pub struct MemoryHistory {
    records: RwLock<Vec<Translation>>,
}

impl MemoryHistory {
    pub fn new(records: Vec<Translation>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn record(&self, translation: Translation) {
        self.records.write().await.push(translation);
    }
}

#[async_trait::async_trait]
impl HistoryUseCase for MemoryHistory {
    async fn history(&self) -> std::result::Result<Vec<Translation>, UseCaseError> {
        Ok(self.records.read().await.clone())
    }
}
