use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::{domain::UserId, ports::Notifier};

/// Category of an operator alert. Throttling is per category so a quota
/// storm can't drown out a connection alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Quota,
    Concurrency,
    Connection,
}

impl AlertKind {
    fn label(self) -> &'static str {
        match self {
            AlertKind::Quota => "quota",
            AlertKind::Concurrency => "concurrency",
            AlertKind::Connection => "connection",
        }
    }
}

/// Sends throttled operational alerts to the configured admin users.
///
/// Send failures are logged and swallowed: alerting must never take the
/// pipeline down with it.
pub struct AdminAlerter {
    notifier: Arc<dyn Notifier>,
    recipients: Vec<UserId>,
    cooldown: Duration,
    last_sent: Mutex<HashMap<AlertKind, Instant>>,
}

impl AdminAlerter {
    pub fn new(notifier: Arc<dyn Notifier>, recipients: Vec<UserId>, cooldown: Duration) -> Self {
        Self {
            notifier,
            recipients,
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Send an alert unless one of the same kind went out within the
    /// cooldown window. Returns whether anything was sent.
    pub async fn alert(&self, kind: AlertKind, text: &str) -> bool {
        {
            let mut last = self.last_sent.lock().await;
            if let Some(at) = last.get(&kind) {
                if at.elapsed() < self.cooldown {
                    return false;
                }
            }
            last.insert(kind, Instant::now());
        }

        if self.recipients.is_empty() {
            info!("no admin recipients configured, dropping {} alert", kind.label());
            return false;
        }

        let message = format!("[adwatch:{}] {text}", kind.label());
        for user in &self.recipients {
            if let Err(e) = self.notifier.notify_user(*user, &message).await {
                error!(user = user.0, "failed to deliver {} alert: {e}", kind.label());
            }
        }
        true
    }

    /// Forget the cooldown for a kind, so the next occurrence alerts
    /// immediately (used after a condition recovers).
    pub async fn reset(&self, kind: AlertKind) {
        self.last_sent.lock().await.remove(&kind);
    }
}
