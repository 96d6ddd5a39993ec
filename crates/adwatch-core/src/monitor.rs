use std::{sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    alerts::{AdminAlerter, AlertKind},
    ports::ChannelSource,
    Error, Result,
};

const BACKOFF_CAP_SECS: u64 = 60;

/// Reconnect backoff: 1s doubling per consecutive failure, capped at 60s.
pub fn connection_backoff(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let secs = (1u64 << (attempt - 1).min(10)).min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

/// Keeps the transport connection alive, reconnecting with backoff.
///
/// After `max_retries` consecutive connection failures the supervisor gives
/// up and returns the error; the process exits and an external supervisor
/// (systemd, docker) restarts it with fresh state.
pub struct ConnectionSupervisor {
    source: Arc<dyn ChannelSource>,
    alerts: Arc<AdminAlerter>,
    max_retries: u32,
}

impl ConnectionSupervisor {
    pub fn new(source: Arc<dyn ChannelSource>, alerts: Arc<AdminAlerter>, max_retries: u32) -> Self {
        Self {
            source,
            alerts,
            max_retries,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            match self.source.run_until_disconnected().await {
                Ok(()) => {
                    // Clean disconnect; reconnect immediately and reset the
                    // failure streak.
                    info!("transport disconnected cleanly, reconnecting");
                    attempts = 0;
                    self.alerts.reset(AlertKind::Connection).await;
                }
                Err(Error::Connection(msg)) => {
                    attempts += 1;
                    if attempts > self.max_retries {
                        error!("giving up after {attempts} connection failures: {msg}");
                        self.alerts
                            .alert(
                                AlertKind::Connection,
                                &format!(
                                    "connection lost, giving up after {attempts} attempts: {msg}"
                                ),
                            )
                            .await;
                        return Err(Error::Connection(msg));
                    }

                    let delay = connection_backoff(attempts);
                    warn!(
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        "connection failed, retrying: {msg}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // Non-connection errors are not retried blindly.
                    error!("transport failed: {e}");
                    return Err(e);
                }
            }
        }
    }
}
