use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    alerts::{AdminAlerter, AlertKind},
    domain::{ChannelId, MessageId, MessageKey, TopicId},
    model::Advertisement,
    ports::{Classifier, ClassifyError},
    quota::QuotaFlag,
};

/// Probe text used to test whether the provider accepts requests again.
const PROBE_TEXT: &str = "ping";

/// Wraps the raw classifier with quota bookkeeping and admin alerting.
///
/// While the quota flag is set, calls fail fast with a synthetic `Quota`
/// error without touching the provider; the pipeline shelves the message
/// as a quota-tagged error until the flag is lifted by
/// [`ClassifierGateway::probe`].
pub struct ClassifierGateway {
    classifier: Arc<dyn Classifier>,
    quota: Arc<QuotaFlag>,
    alerts: Arc<AdminAlerter>,
    provider: String,
}

impl ClassifierGateway {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        quota: Arc<QuotaFlag>,
        alerts: Arc<AdminAlerter>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            classifier,
            quota,
            alerts,
            provider: provider.into(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.quota.is_exhausted()
    }

    pub async fn classify(
        &self,
        text: &str,
        origin: MessageKey,
        topic: Option<TopicId>,
    ) -> std::result::Result<Option<Advertisement>, ClassifyError> {
        if self.quota.is_exhausted() {
            return Err(ClassifyError::Quota {
                provider: self.provider.clone(),
                message: "classification paused: quota flag set".to_string(),
            });
        }

        match self.classifier.classify(text, origin, topic).await {
            Ok(v) => Ok(v),
            Err(e) => {
                match &e {
                    ClassifyError::Quota { .. } => {
                        if self.quota.set() {
                            warn!("LLM quota exhausted, pausing classification: {e}");
                        }
                        self.alerts
                            .alert(AlertKind::Quota, &format!("LLM quota exhausted: {e}"))
                            .await;
                    }
                    ClassifyError::Concurrency { .. } => {
                        self.alerts
                            .alert(
                                AlertKind::Concurrency,
                                &format!("LLM concurrency limit hit: {e}"),
                            )
                            .await;
                    }
                    ClassifyError::RateLimit { .. } | ClassifyError::Other { .. } => {}
                }
                Err(e)
            }
        }
    }

    /// Fire a minimal request straight at the provider, bypassing the flag.
    ///
    /// Returns `true` when quota is confirmed restored. Non-quota failures
    /// are inconclusive and leave the flag as-is.
    pub async fn probe(&self) -> bool {
        let origin = MessageKey::new(ChannelId(0), MessageId(0));
        match self.classifier.classify(PROBE_TEXT, origin, None).await {
            Ok(_) => {
                if self.quota.clear() {
                    info!("LLM quota restored");
                    self.alerts.reset(AlertKind::Quota).await;
                }
                true
            }
            Err(ClassifyError::Quota { .. }) => false,
            Err(e) => {
                warn!("quota probe inconclusive: {e}");
                false
            }
        }
    }
}
