//! Telegram adapter (teloxide).
//!
//! Implements the `adwatch-core` ports over the Telegram Bot API: the
//! `ChannelSource` that watches monitored channels and the `Notifier` that
//! delivers matched listings to users.

use async_trait::async_trait;

use teloxide::prelude::*;
use tokio::time::sleep;

pub mod commands;
pub mod source;

pub use source::TelegramSource;
pub use teloxide::Bot;

use adwatch_core::{domain::UserId, errors::Error, ports::Notifier, Result};

pub(crate) fn map_err(e: teloxide::RequestError) -> Error {
    match e {
        teloxide::RequestError::Network(e) => Error::Connection(format!("telegram network: {e}")),
        teloxide::RequestError::Io(e) => Error::Connection(format!("telegram io: {e}")),
        other => Error::External(format!("telegram error: {other}")),
    }
}

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_user(&self, user: UserId, text: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .send_message(teloxide::types::ChatId(user.0), text.to_string())
        })
        .await?;
        Ok(())
    }
}
