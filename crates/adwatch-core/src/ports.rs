use std::time::Duration;

use tokio::sync::mpsc;

use crate::{
    domain::{ChannelId, MessageId, MessageKey, TopicId, UserId},
    model::{Advertisement, SourceMessage},
    Result,
};

/// Hexagonal port for the chat transport the monitor ingests from.
///
/// Implementations are expected to be long-lived and shared (`Arc`).
#[async_trait::async_trait]
pub trait ChannelSource: Send + Sync {
    /// Start delivering live messages from the given channels.
    ///
    /// The receiver yields every observed post; filtering by topic and
    /// content is the pipeline's job, not the transport's.
    async fn subscribe(&self, channels: &[ChannelId]) -> Result<mpsc::Receiver<SourceMessage>>;

    /// List recent messages of a channel, newest first, best effort.
    /// Transports without history access may return fewer than `limit`.
    async fn enumerate(
        &self,
        channel: ChannelId,
        topic: Option<TopicId>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>>;

    /// Resolve the anchor (root) message id of a forum topic.
    async fn resolve_topic_anchor(
        &self,
        channel: ChannelId,
        topic: TopicId,
    ) -> Result<Option<MessageId>>;

    /// Re-fetch a single message.
    ///
    /// `Ok(None)` means the transport positively knows the message is gone;
    /// `Err` means it could not tell. Callers must not treat the two alike.
    async fn fetch(&self, key: MessageKey) -> Result<Option<SourceMessage>>;

    /// Acknowledge a message as read, best effort.
    async fn mark_read(&self, key: MessageKey);

    /// Block until the underlying connection drops.
    async fn run_until_disconnected(&self) -> Result<()>;
}

/// Why a classification attempt failed. The pipeline branches on the
/// category, so adapters must map provider responses into exactly one.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClassifyError {
    /// Billing/quota exhausted. Global condition: pause all classification.
    #[error("{provider} quota exhausted: {message}")]
    Quota { provider: String, message: String },

    /// Too many in-flight requests on the provider side. Transient.
    #[error("{provider} concurrency limit: {message}")]
    Concurrency { provider: String, message: String },

    /// Request-rate limit. Honors `retry_after` when the provider sent one.
    #[error("{provider} rate limited: {message}")]
    RateLimit {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Anything else: malformed response, network error, 5xx.
    #[error("{provider} error: {message}")]
    Other { provider: String, message: String },
}

impl ClassifyError {
    pub fn provider(&self) -> &str {
        match self {
            ClassifyError::Quota { provider, .. }
            | ClassifyError::Concurrency { provider, .. }
            | ClassifyError::RateLimit { provider, .. }
            | ClassifyError::Other { provider, .. } => provider,
        }
    }
}

/// Hexagonal port for the LLM classifier.
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a message text.
    ///
    /// `Ok(Some(ad))` — real-estate listing with extracted fields.
    /// `Ok(None)` — confidently not a listing (or spam).
    async fn classify(
        &self,
        text: &str,
        origin: MessageKey,
        topic: Option<TopicId>,
    ) -> std::result::Result<Option<Advertisement>, ClassifyError>;
}

/// Hexagonal port for outbound user notifications.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, user: UserId, text: &str) -> Result<()>;
}
