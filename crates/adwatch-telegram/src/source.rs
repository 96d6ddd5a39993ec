//! `ChannelSource` over the Telegram Bot API.
//!
//! The Bot API delivers posts as updates but offers no history reads, so
//! the source keeps a bounded per-channel archive of everything it has
//! observed. `enumerate` and `fetch` answer from that archive; a miss is
//! reported as "unknown" rather than "gone", because the API genuinely
//! cannot tell the difference for an uncached message.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*, types::Message};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use adwatch_core::{
    domain::{ChannelId, MessageId, MessageKey, TopicId},
    errors::Error,
    model::SourceMessage,
    ports::ChannelSource,
    Result,
};

use crate::commands::{handle_admin_message, AdminContext};
use crate::map_err;

const SUBSCRIPTION_BUFFER: usize = 256;

pub(crate) struct SourceInner {
    pub(crate) channels: Vec<ChannelId>,
    depth: usize,
    archive: Mutex<HashMap<ChannelId, VecDeque<SourceMessage>>>,
    tx: Mutex<Option<mpsc::Sender<SourceMessage>>>,
    pub(crate) admin: Mutex<Option<Arc<AdminContext>>>,
}

impl SourceInner {
    /// Record an observed message and forward it to the subscriber.
    pub(crate) async fn observe(&self, msg: SourceMessage) {
        if !self.channels.contains(&msg.key.channel_id) {
            return;
        }

        {
            let mut archive = self.archive.lock().await;
            let deque = archive.entry(msg.key.channel_id).or_default();
            if deque.iter().any(|m| m.key == msg.key) {
                return;
            }
            deque.push_front(msg.clone());
            while deque.len() > self.depth {
                deque.pop_back();
            }
        }

        let tx = self.tx.lock().await;
        if let Some(tx) = tx.as_ref() {
            if let Err(e) = tx.try_send(msg) {
                warn!("subscription buffer full, dropping message: {e}");
            }
        }
    }
}

pub struct TelegramSource {
    bot: Bot,
    inner: Arc<SourceInner>,
}

impl TelegramSource {
    pub fn new(bot: Bot, channels: Vec<ChannelId>, archive_depth: usize) -> Self {
        Self {
            bot,
            inner: Arc::new(SourceInner {
                channels,
                depth: archive_depth,
                archive: Mutex::new(HashMap::new()),
                tx: Mutex::new(None),
                admin: Mutex::new(None),
            }),
        }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    /// Wire in the operator command handler. Done after construction
    /// because the pipeline the commands drive needs this source first.
    pub async fn set_admin(&self, ctx: Arc<AdminContext>) {
        *self.inner.admin.lock().await = Some(ctx);
    }
}

/// Convert a teloxide message into the transport-agnostic shape.
fn convert(msg: &Message) -> SourceMessage {
    let has_media = msg.photo().is_some()
        || msg.video().is_some()
        || msg.document().is_some()
        || msg.audio().is_some()
        || msg.voice().is_some()
        || msg.animation().is_some()
        || msg.video_note().is_some()
        || msg.sticker().is_some();

    SourceMessage {
        key: MessageKey::new(ChannelId(msg.chat.id.0), MessageId(msg.id.0)),
        thread_id: msg.thread_id.map(TopicId),
        reply_to: msg.reply_to_message().map(|m| MessageId(m.id.0)),
        text: msg
            .text()
            .or_else(|| msg.caption())
            .unwrap_or_default()
            .to_string(),
        has_media,
        date: msg.date,
        channel_title: msg.chat.title().map(|t| t.to_string()),
    }
}

async fn on_channel_post(msg: Message, inner: Arc<SourceInner>) -> ResponseResult<()> {
    inner.observe(convert(&msg)).await;
    Ok(())
}

async fn on_message(bot: Bot, msg: Message, inner: Arc<SourceInner>) -> ResponseResult<()> {
    // Forum/supergroup posts arrive as plain messages.
    if inner.channels.contains(&ChannelId(msg.chat.id.0)) {
        inner.observe(convert(&msg)).await;
        return Ok(());
    }

    if msg.chat.is_private() {
        let admin = inner.admin.lock().await.clone();
        if let Some(ctx) = admin {
            return handle_admin_message(bot, msg, ctx).await;
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl ChannelSource for TelegramSource {
    async fn subscribe(&self, channels: &[ChannelId]) -> Result<mpsc::Receiver<SourceMessage>> {
        for ch in channels {
            if !self.inner.channels.contains(ch) {
                return Err(Error::Config(format!(
                    "channel {} is not configured on this source",
                    ch.0
                )));
            }
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        *self.inner.tx.lock().await = Some(tx);
        Ok(rx)
    }

    async fn enumerate(
        &self,
        channel: ChannelId,
        topic: Option<TopicId>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        let archive = self.inner.archive.lock().await;
        let Some(deque) = archive.get(&channel) else {
            return Ok(vec![]);
        };
        Ok(deque
            .iter()
            .filter(|m| topic.is_none() || m.thread_id == topic)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn resolve_topic_anchor(
        &self,
        _channel: ChannelId,
        topic: TopicId,
    ) -> Result<Option<MessageId>> {
        // In the Bot API a forum topic's thread id is the message id of the
        // service message that opened it.
        Ok(Some(MessageId(topic.0)))
    }

    async fn fetch(&self, key: MessageKey) -> Result<Option<SourceMessage>> {
        {
            let archive = self.inner.archive.lock().await;
            if let Some(deque) = archive.get(&key.channel_id) {
                if let Some(m) = deque.iter().find(|m| m.key == key) {
                    return Ok(Some(m.clone()));
                }
            }
        }

        // Not cached. The chat itself disappearing is the only "definitely
        // gone" signal this API can give.
        match self
            .bot
            .get_chat(teloxide::types::ChatId(key.channel_id.0))
            .await
        {
            Ok(_) => Err(Error::External(format!(
                "message {key} not in the observed archive"
            ))),
            Err(teloxide::RequestError::Api(teloxide::ApiError::ChatNotFound)) => {
                info!(%key, "chat not found, treating message as gone");
                Ok(None)
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn mark_read(&self, key: MessageKey) {
        // The Bot API has no read receipts for channels.
        debug!(%key, "mark_read is a no-op on the bot API");
    }

    async fn run_until_disconnected(&self) -> Result<()> {
        // Surface connectivity problems as typed errors before handing
        // control to the dispatcher, which retries internally.
        let me = self.bot.get_me().await.map_err(map_err)?;
        info!("connected to telegram as @{}", me.username());

        let handler = dptree::entry()
            .branch(Update::filter_channel_post().endpoint(on_channel_post))
            .branch(Update::filter_message().endpoint(on_message));

        Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![self.inner.clone()])
            .build()
            .dispatch()
            .await;

        Ok(())
    }
}
