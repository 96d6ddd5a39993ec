use std::sync::Arc;

use crate::{
    config::ChannelSpec,
    domain::TopicId,
    model::SourceMessage,
    ports::ChannelSource,
    topics::TopicAnchorCache,
};

/// Service-message fragments that never carry a listing.
const NOISE_PATTERNS: &[&str] = &[
    "pinned a message",
    "joined the group",
    "left the group",
    "changed the group photo",
    "changed the group name",
    "started a video chat",
];

/// Gatekeeper for incoming messages: monitored-channel/topic membership and
/// cheap content checks that run before any LLM call.
pub struct MessageValidator {
    specs: Vec<ChannelSpec>,
    excluded_topics: Vec<TopicId>,
    topics: Arc<TopicAnchorCache>,
}

impl MessageValidator {
    pub fn new(
        specs: Vec<ChannelSpec>,
        excluded_topics: Vec<TopicId>,
        topics: Arc<TopicAnchorCache>,
    ) -> Self {
        Self {
            specs,
            excluded_topics,
            topics,
        }
    }

    pub fn has_text(&self, msg: &SourceMessage) -> bool {
        !msg.text.trim().is_empty()
    }

    pub fn is_media_only(&self, msg: &SourceMessage) -> bool {
        msg.has_media && msg.text.trim().is_empty()
    }

    pub fn is_technical_noise(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        NOISE_PATTERNS.iter().any(|p| lower.contains(p))
    }

    /// Whether the message falls inside a monitored channel/topic.
    ///
    /// A channel monitored without a topic admits everything in it (minus
    /// excluded topics). A topic-scoped entry admits the topic's anchor
    /// message and replies to it, plus messages whose thread id matches.
    pub async fn admits(&self, source: &dyn ChannelSource, msg: &SourceMessage) -> bool {
        let entries: Vec<_> = self
            .specs
            .iter()
            .filter(|s| s.channel_id == msg.key.channel_id)
            .collect();
        if entries.is_empty() {
            return false;
        }

        if let Some(thread) = msg.thread_id {
            if self.excluded_topics.contains(&thread) {
                return false;
            }
        }

        if entries.iter().any(|s| s.topic_id.is_none()) {
            return true;
        }

        for entry in entries {
            let Some(topic) = entry.topic_id else {
                continue;
            };
            if msg.thread_id == Some(topic) {
                return true;
            }
            let Some(anchor) = self.topics.anchor(source, entry.channel_id, topic).await else {
                continue;
            };
            if msg.key.message_id == anchor || msg.reply_to == Some(anchor) {
                return true;
            }
        }

        false
    }
}
