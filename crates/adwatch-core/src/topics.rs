use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    config::ChannelSpec,
    domain::{ChannelId, MessageId, TopicId},
    ports::ChannelSource,
};

/// Lazy cache of forum-topic anchor message ids.
///
/// Forum posts carry their topic either as a thread id or as a reply to the
/// topic's anchor message; the validator needs the anchor id to tell which.
/// Resolution goes through the transport once per `(channel, topic)` and is
/// cached for the lifetime of the process. Failed resolutions are not cached
/// so a later attempt can still succeed.
pub struct TopicAnchorCache {
    anchors: Mutex<HashMap<(ChannelId, TopicId), MessageId>>,
}

impl TopicAnchorCache {
    pub fn new() -> Self {
        Self {
            anchors: Mutex::new(HashMap::new()),
        }
    }

    pub async fn anchor(
        &self,
        source: &dyn ChannelSource,
        channel: ChannelId,
        topic: TopicId,
    ) -> Option<MessageId> {
        {
            let anchors = self.anchors.lock().await;
            if let Some(id) = anchors.get(&(channel, topic)) {
                return Some(*id);
            }
        }

        match source.resolve_topic_anchor(channel, topic).await {
            Ok(Some(id)) => {
                let mut anchors = self.anchors.lock().await;
                anchors.insert((channel, topic), id);
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(channel = channel.0, topic = topic.0, "topic anchor resolution failed: {e}");
                None
            }
        }
    }

    /// Resolve anchors for all topic-scoped specs up front so the first
    /// live message doesn't pay the lookup.
    pub async fn warm(&self, source: &dyn ChannelSource, specs: &[ChannelSpec]) {
        for spec in specs {
            if let Some(topic) = spec.topic_id {
                let _ = self.anchor(source, spec.channel_id, topic).await;
            }
        }
    }

    #[cfg(test)]
    pub async fn insert(&self, channel: ChannelId, topic: TopicId, anchor: MessageId) {
        self.anchors.lock().await.insert((channel, topic), anchor);
    }

    pub async fn len(&self) -> usize {
        self.anchors.lock().await.len()
    }
}

impl Default for TopicAnchorCache {
    fn default() -> Self {
        Self::new()
    }
}
