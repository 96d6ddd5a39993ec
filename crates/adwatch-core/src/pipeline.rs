//! Message ingestion pipeline: validation, dedup, classification, matching.
//!
//! One logical path handles live messages, the startup catch-up and the
//! recovery scan. Mutual exclusion between those entry points rides on the
//! store's `claim_processing` compare-and-swap, so losing a claim is a
//! normal, silent outcome rather than an error.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ChannelSpec,
    domain::{ChannelId, MessageKey, UserId},
    gateway::ClassifierGateway,
    matching::MatchEngine,
    model::{IncomingMessage, ProcessingStatus, SourceMessage},
    ports::{ChannelSource, ClassifyError},
    store::{InsertOutcome, Store},
    util::{content_hash, extract_phone_numbers},
    validator::MessageValidator,
    Result,
};

const RETRY_BASE_SECS: u64 = 30;
const RETRY_CAP_SECS: u64 = 480;
const MAX_CLASSIFY_RETRIES: u32 = 5;

/// Statuses a fresh processing attempt may claim from.
const CLAIMABLE: &[ProcessingStatus] = &[
    ProcessingStatus::Pending,
    ProcessingStatus::Retry,
    ProcessingStatus::Error,
];

/// Every status, for forced re-processing.
const ANY_STATUS: &[ProcessingStatus] = &[
    ProcessingStatus::Pending,
    ProcessingStatus::Processing,
    ProcessingStatus::Parsed,
    ProcessingStatus::NotRealEstate,
    ProcessingStatus::SpamFiltered,
    ProcessingStatus::MediaOnly,
    ProcessingStatus::NoText,
    ProcessingStatus::Error,
    ProcessingStatus::Retry,
    ProcessingStatus::Duplicate,
    ProcessingStatus::Deleted,
    ProcessingStatus::Forwarded,
];

/// Error fragments that mean the source message no longer exists.
const DELETION_PATTERNS: &[&str] = &[
    "not found",
    "deleted",
    "channel not found",
    "chat not found",
    "access denied",
    "forbidden",
    "not accessible",
];

/// Exponential classification retry backoff: 30s doubling per attempt,
/// capped at 480s.
pub fn retry_backoff(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let secs = RETRY_BASE_SECS
        .saturating_mul(1u64 << (attempt - 1).min(10))
        .min(RETRY_CAP_SECS);
    Duration::from_secs(secs)
}

pub fn is_deletion_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    DELETION_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Whether a stored error string came from a quota failure. Both the
/// provider-reported and the gateway's synthetic quota errors carry this
/// phrase (see [`ClassifyError::Quota`]).
pub fn is_quota_error(text: &str) -> bool {
    text.to_lowercase().contains("quota exhausted")
}

/// What happened to one message, mostly for logs and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    NotMonitored,
    NoText,
    MediaOnly,
    Noise,
    AlreadyStored,
    LostClaim,
    Duplicate,
    NotRealEstate,
    Parsed { delivered: usize },
    Deferred,
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub scanned: usize,
    pub reprocessed: usize,
    pub deleted: usize,
    pub skipped: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatchUpStats {
    pub channels: usize,
    pub fetched: usize,
    pub processed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReprocessStats {
    pub selected: usize,
    pub reprocessed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefilterStats {
    pub ads: usize,
    pub matched: usize,
    pub delivered: usize,
}

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    source: Arc<dyn ChannelSource>,
    gateway: Arc<ClassifierGateway>,
    validator: MessageValidator,
    matcher: MatchEngine,
    specs: Vec<ChannelSpec>,
    processing_stale_after: Duration,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn ChannelSource>,
        gateway: Arc<ClassifierGateway>,
        validator: MessageValidator,
        matcher: MatchEngine,
        specs: Vec<ChannelSpec>,
        processing_stale_after: Duration,
    ) -> Self {
        Self {
            store,
            source,
            gateway,
            validator,
            matcher,
            specs,
            processing_stale_after,
        }
    }

    /// Drive the full path for one observed message.
    ///
    /// Never propagates classification failures: they end up as a `Retry`
    /// or `Error` status on the message record. Store failures do propagate.
    pub async fn process(&self, msg: &SourceMessage, force: bool) -> Result<ProcessOutcome> {
        if !self.validator.admits(self.source.as_ref(), msg).await {
            return Ok(ProcessOutcome::NotMonitored);
        }

        let key = msg.key;

        // Media-only posts and service noise are dropped before any record
        // is written.
        if self.validator.is_media_only(msg) {
            debug!(%key, "dropping media-only message");
            self.source.mark_read(key).await;
            return Ok(ProcessOutcome::MediaOnly);
        }
        if self.validator.has_text(msg) && self.validator.is_technical_noise(&msg.text) {
            debug!(%key, "dropping technical noise");
            self.source.mark_read(key).await;
            return Ok(ProcessOutcome::Noise);
        }

        let hash = content_hash(&msg.text);
        let record = IncomingMessage::pending(msg, hash.clone());
        let inserted = self.store.insert_message(record).await?;
        if inserted == InsertOutcome::Duplicate && !force {
            // Seen before (catch-up overlapping live delivery, usually).
            if let Some(existing) = self.store.message(key).await? {
                if existing.status.is_terminal() {
                    // Re-observing a key that already produced a listing is
                    // a repost signal: mark it and re-run matching so
                    // filters created since the first pass still hit.
                    if let Some(ad) = self.store.ad_by_origin(key).await? {
                        self.store.set_duplicate(key, key, ad.id.clone()).await?;
                        self.source.mark_read(key).await;
                        self.matcher.run(&ad, key).await?;
                        return Ok(ProcessOutcome::Duplicate);
                    }
                    return Ok(ProcessOutcome::AlreadyStored);
                }
            }
        }

        self.source.mark_read(key).await;

        if !self.validator.has_text(msg) {
            self.store.set_status(key, ProcessingStatus::NoText).await?;
            return Ok(ProcessOutcome::NoText);
        }

        let allowed = if force { ANY_STATUS } else { CLAIMABLE };
        if !self.store.claim_processing(key, allowed).await? {
            debug!(%key, "lost processing claim");
            return Ok(ProcessOutcome::LostClaim);
        }

        // Cross-post dedup by content hash.
        if let Some(original) = self.store.find_by_hash(&hash, key).await? {
            self.store
                .set_duplicate(key, original.key, original.ad_id.clone())
                .await?;
            info!(%key, original = %original.key, "duplicate of earlier message");

            // A repost of a parsed listing still fans out to users who
            // missed the original; the delivery triple keys on this copy.
            if let Some(ad_id) = original.ad_id {
                if let Some(ad) = self.store.ad(&ad_id).await? {
                    self.matcher.run(&ad, key).await?;
                }
            }
            return Ok(ProcessOutcome::Duplicate);
        }

        self.classify_and_match(key, msg).await
    }

    /// Classification + matching for a message that is already claimed.
    async fn classify_and_match(
        &self,
        key: MessageKey,
        msg: &SourceMessage,
    ) -> Result<ProcessOutcome> {
        self.classify_and_match_scoped(key, msg, None).await
    }

    /// Like [`classify_and_match`](Self::classify_and_match), but matching
    /// may be restricted to one user's filters (operator reprocess batches).
    async fn classify_and_match_scoped(
        &self,
        key: MessageKey,
        msg: &SourceMessage,
        only_user: Option<UserId>,
    ) -> Result<ProcessOutcome> {
        match self.gateway.classify(&msg.text, key, msg.thread_id).await {
            Ok(Some(mut ad)) => {
                ad.origin = key;
                ad.topic_id = msg.thread_id;
                if ad.original_text.is_empty() {
                    ad.original_text = msg.text.clone();
                }
                if ad.contacts.is_empty() {
                    ad.contacts = extract_phone_numbers(&msg.text);
                }
                let confidence = ad.confidence;
                let ad_id = self.store.upsert_ad(ad.clone()).await?;
                ad.id = Some(ad_id.clone());
                self.store
                    .set_parsed(key, Some(ad_id), true, confidence)
                    .await?;

                let outcome = self.matcher.run_scoped(&ad, key, only_user).await?;
                Ok(ProcessOutcome::Parsed {
                    delivered: outcome.delivered,
                })
            }
            Ok(None) => {
                self.store
                    .set_status(key, ProcessingStatus::NotRealEstate)
                    .await?;
                Ok(ProcessOutcome::NotRealEstate)
            }
            Err(e) => self.handle_classify_error(key, e).await,
        }
    }

    async fn handle_classify_error(
        &self,
        key: MessageKey,
        e: ClassifyError,
    ) -> Result<ProcessOutcome> {
        let retry_count = self
            .store
            .message(key)
            .await?
            .map(|m| m.retry_count)
            .unwrap_or(0);

        match &e {
            // Quota is a global condition, not this message's fault: shelve
            // the message as a quota-tagged error without burning one of
            // its attempts. The recovery scan leaves these alone until the
            // flag is lifted, then re-claims them (`Error` is claimable).
            ClassifyError::Quota { .. } => {
                self.store
                    .set_failed(key, ProcessingStatus::Error, &e.to_string())
                    .await?;
                Ok(ProcessOutcome::Deferred)
            }
            ClassifyError::Concurrency { .. }
            | ClassifyError::RateLimit { .. }
            | ClassifyError::Other { .. } => {
                let attempt = retry_count + 1;
                if attempt > MAX_CLASSIFY_RETRIES {
                    error!(%key, "classification failed permanently: {e}");
                    self.store
                        .set_failed(key, ProcessingStatus::Error, &e.to_string())
                        .await?;
                    return Ok(ProcessOutcome::Failed);
                }

                let mut delay = retry_backoff(attempt);
                if let ClassifyError::RateLimit {
                    retry_after: Some(ra),
                    ..
                } = &e
                {
                    delay = delay.max(*ra);
                }
                let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                warn!(%key, attempt, delay_secs = delay.as_secs(), "classification deferred: {e}");
                self.store
                    .set_retry(key, attempt, due, &e.to_string())
                    .await?;
                Ok(ProcessOutcome::Deferred)
            }
        }
    }

    /// Consume the live subscription until cancelled or the sender closes.
    pub async fn consume(
        &self,
        mut rx: mpsc::Receiver<SourceMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => {
                    let Some(msg) = maybe else { break };
                    if let Err(e) = self.process(&msg, false).await {
                        error!(key = %msg.key, "message processing failed: {e}");
                        let _ = self
                            .store
                            .set_failed(msg.key, ProcessingStatus::Error, &e.to_string())
                            .await;
                    }
                }
            }
        }
    }

    /// Sweep non-terminal messages: re-queue due retries, re-classify
    /// stalled ones, and mark messages whose source is gone as deleted.
    pub async fn run_recovery_scan(&self) -> Result<RecoveryStats> {
        let quota_paused = self.gateway.is_paused();
        let now = Utc::now();
        let candidates = self.store.recoverable_messages().await?;
        let mut stats = RecoveryStats {
            scanned: candidates.len(),
            ..RecoveryStats::default()
        };

        for m in candidates {
            match m.status {
                ProcessingStatus::Processing => {
                    let stale = chrono::Duration::from_std(self.processing_stale_after)
                        .unwrap_or_default();
                    if now - m.updated_at < stale {
                        stats.skipped += 1;
                        continue;
                    }
                    // Orphaned by a crash: release the stuck claim.
                    self.store.set_status(m.key, ProcessingStatus::Pending).await?;
                }
                ProcessingStatus::Retry => {
                    if m.retry_after.map(|t| t > now).unwrap_or(false) {
                        stats.skipped += 1;
                        continue;
                    }
                }
                ProcessingStatus::Error => {
                    // Quota-shelved messages stay put until the flag lifts;
                    // retrying them while paused would only re-shelve them.
                    let quota_tagged = m.error.as_deref().map(is_quota_error).unwrap_or(false);
                    if quota_paused && quota_tagged {
                        stats.skipped += 1;
                        continue;
                    }
                }
                _ => {}
            }

            match self.source.fetch(m.key).await {
                Ok(Some(src)) => {
                    match self.process(&src, false).await {
                        Ok(_) => stats.reprocessed += 1,
                        Err(e) => {
                            error!(key = %m.key, "recovery reprocess failed: {e}");
                        }
                    }
                }
                Ok(None) => {
                    self.store
                        .set_failed(m.key, ProcessingStatus::Deleted, "source message gone")
                        .await?;
                    stats.deleted += 1;
                }
                Err(e) if is_deletion_error(&e.to_string()) => {
                    self.store
                        .set_failed(m.key, ProcessingStatus::Deleted, &e.to_string())
                        .await?;
                    stats.deleted += 1;
                }
                Err(e) => {
                    // Transport couldn't tell; leave it for the next scan.
                    warn!(key = %m.key, "recovery fetch inconclusive: {e}");
                    stats.skipped += 1;
                }
            }
        }

        if stats.scanned > 0 {
            info!(
                scanned = stats.scanned,
                reprocessed = stats.reprocessed,
                deleted = stats.deleted,
                "recovery scan finished"
            );
        }
        Ok(stats)
    }

    /// Recovery scans until cancelled: one at startup (the interval's first
    /// tick fires immediately), then one per interval.
    pub async fn run_recovery_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.run_recovery_scan().await {
                        error!("recovery scan failed: {e}");
                    }
                }
            }
        }
    }

    /// While classification is quota-paused, probe the provider on a timer
    /// and run a recovery scan as soon as it answers again.
    pub async fn run_quota_recheck(&self, interval: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if !self.gateway.is_paused() {
                        continue;
                    }
                    if self.gateway.probe().await {
                        info!("quota restored, sweeping deferred messages");
                        if let Err(e) = self.run_recovery_scan().await {
                            error!("post-restore recovery scan failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Backfill recent history for every monitored channel, oldest first.
    ///
    /// Enumeration is newest-first; the walk stops at the first message
    /// already stored in a terminal status, since everything older was
    /// handled by a previous run.
    pub async fn catch_up(&self, limit: usize) -> Result<CatchUpStats> {
        let mut stats = CatchUpStats::default();
        for spec in self.specs.clone() {
            stats.channels += 1;
            let messages = match self
                .source
                .enumerate(spec.channel_id, spec.topic_id, limit)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(channel = spec.channel_id.0, "catch-up enumeration failed: {e}");
                    continue;
                }
            };
            stats.fetched += messages.len();

            let mut backlog = Vec::new();
            for msg in messages {
                if let Some(existing) = self.store.message(msg.key).await? {
                    if existing.status.is_terminal() {
                        break;
                    }
                }
                backlog.push(msg);
            }

            for msg in backlog.into_iter().rev() {
                if let Err(e) = self.process(&msg, false).await {
                    error!(key = %msg.key, "catch-up processing failed: {e}");
                    continue;
                }
                stats.processed += 1;
            }
        }
        info!(
            channels = stats.channels,
            fetched = stats.fetched,
            processed = stats.processed,
            "catch-up finished"
        );
        Ok(stats)
    }

    /// Re-classify the most recently stored messages. Operator tool.
    ///
    /// `channel` and `user` narrow the batch to one channel's messages and
    /// one user's filters; `force` claims messages regardless of their
    /// current status; `stop_on_seen` ends the batch at the first
    /// already-terminal record.
    pub async fn reprocess_recent(
        &self,
        limit: usize,
        channel: Option<ChannelId>,
        user: Option<UserId>,
        force: bool,
        stop_on_seen: bool,
    ) -> Result<ReprocessStats> {
        let messages = self.store.recent_messages(limit).await?;
        let mut stats = ReprocessStats::default();

        for m in messages {
            if channel.map(|c| m.key.channel_id != c).unwrap_or(false) {
                continue;
            }
            stats.selected += 1;
            if stop_on_seen && m.status.is_terminal() {
                break;
            }
            if m.text.trim().is_empty() {
                stats.skipped += 1;
                continue;
            }
            if self.validator.is_technical_noise(&m.text) {
                // Stored before the noise list caught it.
                self.store
                    .set_status(m.key, ProcessingStatus::SpamFiltered)
                    .await?;
                stats.skipped += 1;
                continue;
            }
            let allowed = if force { ANY_STATUS } else { CLAIMABLE };
            if !self.store.claim_processing(m.key, allowed).await? {
                stats.skipped += 1;
                continue;
            }
            let src = SourceMessage {
                key: m.key,
                thread_id: m.thread_id,
                reply_to: None,
                text: m.text.clone(),
                has_media: false,
                date: m.date,
                channel_title: m.channel_title.clone(),
            };
            match self.classify_and_match_scoped(m.key, &src, user).await {
                Ok(ProcessOutcome::Failed) => stats.failed += 1,
                Ok(_) => stats.reprocessed += 1,
                Err(e) => {
                    error!(key = %m.key, "reprocess failed: {e}");
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Re-run matching for the most recent ads without touching the LLM,
    /// optionally for a single user's filters. Useful after filter changes.
    /// Delivery dedup still applies, so users only receive listings they
    /// have not been sent before.
    pub async fn refilter_recent(
        &self,
        limit: usize,
        user: Option<UserId>,
    ) -> Result<RefilterStats> {
        let ads = self.store.recent_ads(limit).await?;
        let mut stats = RefilterStats {
            ads: ads.len(),
            ..RefilterStats::default()
        };
        for ad in ads {
            let origin = ad.origin;
            let outcome = self.matcher.run_scoped(&ad, origin, user).await?;
            stats.matched += outcome.matched;
            stats.delivered += outcome.delivered;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use crate::{
        alerts::AdminAlerter,
        domain::{AdId, ChannelId, FilterId, MessageId, TopicId, UserId},
        forwarder::Forwarder,
        model::{Advertisement, ChannelSelection, Currency, PriceFilter, SimpleFilter},
        ports::{Classifier, Notifier},
        quota::QuotaFlag,
        store::MemoryStore,
        topics::TopicAnchorCache,
        Error,
    };

    // --- test doubles ---

    enum Fetch {
        Found(SourceMessage),
        Gone,
        Fail(String),
    }

    #[derive(Default)]
    struct ScriptedSource {
        enumerated: Vec<SourceMessage>,
        fetches: HashMap<MessageKey, Fetch>,
    }

    #[async_trait::async_trait]
    impl ChannelSource for ScriptedSource {
        async fn subscribe(
            &self,
            _channels: &[ChannelId],
        ) -> Result<mpsc::Receiver<SourceMessage>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn enumerate(
            &self,
            channel: ChannelId,
            _topic: Option<TopicId>,
            limit: usize,
        ) -> Result<Vec<SourceMessage>> {
            Ok(self
                .enumerated
                .iter()
                .filter(|m| m.key.channel_id == channel)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn resolve_topic_anchor(
            &self,
            _channel: ChannelId,
            topic: TopicId,
        ) -> Result<Option<MessageId>> {
            Ok(Some(MessageId(topic.0)))
        }

        async fn fetch(&self, key: MessageKey) -> Result<Option<SourceMessage>> {
            match self.fetches.get(&key) {
                Some(Fetch::Found(m)) => Ok(Some(m.clone())),
                Some(Fetch::Gone) => Ok(None),
                Some(Fetch::Fail(text)) => Err(Error::External(text.clone())),
                None => Err(Error::External("no scripted fetch".to_string())),
            }
        }

        async fn mark_read(&self, _key: MessageKey) {}

        async fn run_until_disconnected(&self) -> Result<()> {
            Ok(())
        }
    }

    type ClassifyResult = std::result::Result<Option<Advertisement>, ClassifyError>;

    struct ScriptedClassifier {
        responses: Mutex<VecDeque<ClassifyResult>>,
        fallback: ClassifyResult,
        calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        fn always(fallback: ClassifyResult) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        fn sequence(responses: Vec<ClassifyResult>, fallback: ClassifyResult) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(
            &self,
            _text: &str,
            origin: MessageKey,
            topic: Option<TopicId>,
        ) -> ClassifyResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            let result = responses.pop_front().unwrap_or_else(|| self.fallback.clone());
            result.map(|opt| {
                opt.map(|mut ad| {
                    ad.origin = origin;
                    ad.topic_id = topic;
                    ad
                })
            })
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        async fn notify_user(&self, _user: UserId, _text: &str) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // --- fixtures ---

    fn key(id: i32) -> MessageKey {
        MessageKey::new(ChannelId(-100), MessageId(id))
    }

    fn source_msg(id: i32, text: &str) -> SourceMessage {
        SourceMessage {
            key: key(id),
            thread_id: None,
            reply_to: None,
            text: text.to_string(),
            has_media: false,
            date: Utc::now(),
            channel_title: Some("listings".to_string()),
        }
    }

    fn parsed_ad(price: Option<f64>, currency: Option<Currency>) -> Advertisement {
        let now = Utc::now();
        Advertisement {
            id: None,
            origin: key(0),
            topic_id: None,
            original_text: "2 rooms".to_string(),
            property_type: Some(crate::model::PropertyType::Apartment),
            rental_type: None,
            rooms: Some(2),
            area_sqm: None,
            price,
            currency,
            district: None,
            city: None,
            address: None,
            contacts: vec![],
            has_balcony: None,
            has_furniture: None,
            has_parking: None,
            has_air_conditioning: None,
            has_elevator: None,
            pets_allowed: None,
            floor: None,
            total_floors: None,
            is_real_estate: true,
            confidence: 0.92,
            created_at: now,
            updated_at: now,
        }
    }

    struct Harness {
        pipeline: IngestionPipeline,
        store: Arc<MemoryStore>,
        notifier: Arc<CountingNotifier>,
        classifier: Arc<ScriptedClassifier>,
    }

    fn harness(classifier: ScriptedClassifier, source: ScriptedSource) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let classifier = Arc::new(classifier);
        let alerts = Arc::new(AdminAlerter::new(
            notifier.clone(),
            vec![],
            Duration::from_secs(900),
        ));
        let gateway = Arc::new(ClassifierGateway::new(
            classifier.clone(),
            Arc::new(QuotaFlag::new()),
            alerts,
            "test",
        ));
        let specs = vec![ChannelSpec {
            channel_id: ChannelId(-100),
            topic_id: None,
        }];
        let validator =
            MessageValidator::new(specs.clone(), vec![], Arc::new(TopicAnchorCache::new()));
        let forwarder = Arc::new(Forwarder::new(store.clone(), notifier.clone()));
        let matcher = MatchEngine::new(store.clone(), forwarder);
        let pipeline = IngestionPipeline::new(
            store.clone(),
            Arc::new(source),
            gateway,
            validator,
            matcher,
            specs,
            Duration::from_secs(300),
        );
        Harness {
            pipeline,
            store,
            notifier,
            classifier,
        }
    }

    async fn seed_user(store: &MemoryStore, user: i64) {
        store
            .insert_filter(SimpleFilter {
                id: FilterId(format!("f{user}")),
                user_id: UserId(user),
                name: "all".to_string(),
                is_active: true,
                property_types: vec![],
                rental_type: None,
                min_rooms: None,
                max_rooms: None,
                min_area_sqm: None,
                districts: vec![],
                has_balcony: None,
                has_furniture: None,
                has_parking: None,
                has_air_conditioning: None,
                has_elevator: None,
                pets_allowed: None,
            })
            .await
            .unwrap();
        store
            .set_selection(ChannelSelection {
                user_id: UserId(user),
                channel_id: ChannelId(-100),
                is_selected: true,
            })
            .await
            .unwrap();
    }

    // --- tests ---

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(1), Duration::from_secs(30));
        assert_eq!(retry_backoff(2), Duration::from_secs(60));
        assert_eq!(retry_backoff(3), Duration::from_secs(120));
        assert_eq!(retry_backoff(4), Duration::from_secs(240));
        assert_eq!(retry_backoff(5), Duration::from_secs(480));
        assert_eq!(retry_backoff(6), Duration::from_secs(480));
        assert_eq!(retry_backoff(40), Duration::from_secs(480));
    }

    #[test]
    fn deletion_errors_match_known_patterns() {
        assert!(is_deletion_error("MESSAGE_ID_INVALID: message not found"));
        assert!(is_deletion_error("Chat Not Found"));
        assert!(is_deletion_error("403 Forbidden"));
        assert!(!is_deletion_error("timed out"));
    }

    #[tokio::test]
    async fn happy_path_parses_and_delivers() {
        let h = harness(
            ScriptedClassifier::always(Ok(Some(parsed_ad(Some(700.0), Some(Currency::Usd))))),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;

        let out = h
            .pipeline
            .process(&source_msg(1, "renting 2 rooms in Kentron, 700 USD"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Parsed { delivered: 1 });

        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::Forwarded);
        assert_eq!(m.is_ad, Some(true));
        assert!(m.ad_id.is_some());
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unselected_channel_suppresses_delivery() {
        let h = harness(
            ScriptedClassifier::always(Ok(Some(parsed_ad(None, None)))),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;
        // Withdraw the opt-in.
        h.store
            .set_selection(ChannelSelection {
                user_id: UserId(10),
                channel_id: ChannelId(-100),
                is_selected: false,
            })
            .await
            .unwrap();

        let out = h
            .pipeline
            .process(&source_msg(1, "renting 2 rooms"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Parsed { delivered: 0 });
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 0);

        // The opted-out user's filters are never evaluated, so no match is
        // recorded either.
        let stats = h.pipeline.refilter_recent(10, None).await.unwrap();
        assert_eq!(stats.matched, 0);

        // Opting back in surfaces the ad through refilter.
        h.store
            .set_selection(ChannelSelection {
                user_id: UserId(10),
                channel_id: ChannelId(-100),
                is_selected: true,
            })
            .await
            .unwrap();
        let stats = h.pipeline.refilter_recent(10, None).await.unwrap();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmonitored_and_empty_messages_short_circuit() {
        let h = harness(
            ScriptedClassifier::always(Ok(None)),
            ScriptedSource::default(),
        );

        let mut foreign = source_msg(1, "text");
        foreign.key = MessageKey::new(ChannelId(-999), MessageId(1));
        assert_eq!(
            h.pipeline.process(&foreign, false).await.unwrap(),
            ProcessOutcome::NotMonitored
        );

        let mut media = source_msg(2, "  ");
        media.has_media = true;
        assert_eq!(
            h.pipeline.process(&media, false).await.unwrap(),
            ProcessOutcome::MediaOnly
        );

        let empty = source_msg(3, "");
        assert_eq!(
            h.pipeline.process(&empty, false).await.unwrap(),
            ProcessOutcome::NoText
        );
        let m = h.store.message(key(3)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::NoText);

        let noise = source_msg(4, "Admin pinned a message");
        assert_eq!(
            h.pipeline.process(&noise, false).await.unwrap(),
            ProcessOutcome::Noise
        );
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 0);
        // Media-only and noise drops leave no stored record.
        assert!(h.store.message(key(2)).await.unwrap().is_none());
        assert!(h.store.message(key(4)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_duplicates_are_flagged_and_fanned_out() {
        let h = harness(
            ScriptedClassifier::always(Ok(Some(parsed_ad(None, None)))),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;

        let out = h
            .pipeline
            .process(&source_msg(1, "Same listing TEXT"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Parsed { delivered: 1 });

        // Same content, different message id and formatting.
        let out = h
            .pipeline
            .process(&source_msg(2, "same   listing text"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Duplicate);

        let m = h.store.message(key(2)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::Duplicate);
        // Only one classifier call: the repost never reaches the LLM.
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 1);
        // Each copy is its own delivery identity, so the repost notifies
        // the user again without touching the original's record.
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repost_reaches_users_the_original_missed() {
        let h = harness(
            ScriptedClassifier::always(Ok(Some(parsed_ad(None, None)))),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;

        h.pipeline
            .process(&source_msg(1, "listing text"), false)
            .await
            .unwrap();
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 1);

        // A new user signs up between the original and the repost.
        seed_user(&h.store, 20).await;
        h.pipeline
            .process(&source_msg(2, "listing text"), false)
            .await
            .unwrap();
        // Both users are covered now; user 10 was not re-notified for the
        // original, but the repost is a distinct delivery identity.
        assert!(h.notifier.sent.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn re_observed_listing_is_rematched_without_reclassifying() {
        let h = harness(
            ScriptedClassifier::always(Ok(Some(parsed_ad(None, None)))),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;

        let out = h
            .pipeline
            .process(&source_msg(1, "listing text"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Parsed { delivered: 1 });

        // The same message arrives again (catch-up replaying history) after
        // a new user signed up.
        seed_user(&h.store, 20).await;
        let out = h
            .pipeline
            .process(&source_msg(1, "listing text"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Duplicate);

        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::Duplicate);
        // User 20 is picked up; user 10's delivery record still holds.
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 2);
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn quota_failure_shelves_without_burning_attempts() {
        let h = harness(
            ScriptedClassifier::always(Err(ClassifyError::Quota {
                provider: "test".to_string(),
                message: "insufficient_quota".to_string(),
            })),
            ScriptedSource::default(),
        );

        let out = h
            .pipeline
            .process(&source_msg(1, "some listing"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Deferred);

        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::Error);
        assert_eq!(m.retry_count, 0);
        assert!(is_quota_error(m.error.as_deref().unwrap()));

        // The pause short-circuits the next message before the provider.
        let out = h
            .pipeline
            .process(&source_msg(2, "another listing"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Deferred);
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_leaves_quota_shelved_messages_while_paused() {
        let mut source = ScriptedSource::default();
        source
            .fetches
            .insert(key(1), Fetch::Found(source_msg(1, "some listing")));
        let h = harness(
            ScriptedClassifier::always(Err(ClassifyError::Quota {
                provider: "test".to_string(),
                message: "insufficient_quota".to_string(),
            })),
            source,
        );

        h.pipeline
            .process(&source_msg(1, "some listing"), false)
            .await
            .unwrap();
        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::Error);

        // The flag is still set, so the scan must not retry the message.
        let stats = h.pipeline.run_recovery_scan().await.unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.reprocessed, 0);
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_fail_permanently() {
        let h = harness(
            ScriptedClassifier::always(Err(ClassifyError::Other {
                provider: "test".to_string(),
                message: "boom".to_string(),
            })),
            ScriptedSource::default(),
        );

        let out = h
            .pipeline
            .process(&source_msg(1, "listing"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Deferred);
        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.retry_count, 1);

        // Exhaust the attempts.
        h.store
            .set_retry(
                key(1),
                MAX_CLASSIFY_RETRIES,
                Utc::now() - chrono::Duration::seconds(1),
                "boom",
            )
            .await
            .unwrap();
        assert!(h
            .store
            .claim_processing(key(1), CLAIMABLE)
            .await
            .unwrap());
        let out = h
            .pipeline
            .classify_and_match(key(1), &source_msg(1, "listing"))
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Failed);
        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::Error);
    }

    #[tokio::test]
    async fn recovery_marks_gone_messages_deleted() {
        let mut source = ScriptedSource::default();
        source.fetches.insert(key(1), Fetch::Gone);
        source
            .fetches
            .insert(key(2), Fetch::Fail("CHANNEL_PRIVATE: access denied".to_string()));
        source
            .fetches
            .insert(key(3), Fetch::Fail("connection timed out".to_string()));

        let h = harness(ScriptedClassifier::always(Ok(None)), source);
        for id in 1..=3 {
            h.store
                .insert_message(IncomingMessage::pending(
                    &source_msg(id, "text"),
                    content_hash(&format!("text {id}")),
                ))
                .await
                .unwrap();
        }

        let stats = h.pipeline.run_recovery_scan().await.unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.skipped, 1);

        let m1 = h.store.message(key(1)).await.unwrap().unwrap();
        let m2 = h.store.message(key(2)).await.unwrap().unwrap();
        let m3 = h.store.message(key(3)).await.unwrap().unwrap();
        assert_eq!(m1.status, ProcessingStatus::Deleted);
        assert_eq!(m2.status, ProcessingStatus::Deleted);
        // Inconclusive fetch: left for the next scan.
        assert_eq!(m3.status, ProcessingStatus::Pending);
    }

    #[tokio::test]
    async fn recovery_honors_retry_schedule() {
        let mut source = ScriptedSource::default();
        source
            .fetches
            .insert(key(1), Fetch::Found(source_msg(1, "deferred listing")));

        let h = harness(ScriptedClassifier::always(Ok(None)), source);
        h.store
            .insert_message(IncomingMessage::pending(
                &source_msg(1, "deferred listing"),
                content_hash("deferred listing"),
            ))
            .await
            .unwrap();
        // Not due yet.
        h.store
            .set_retry(key(1), 1, Utc::now() + chrono::Duration::seconds(300), "later")
            .await
            .unwrap();

        let stats = h.pipeline.run_recovery_scan().await.unwrap();
        assert_eq!(stats.reprocessed, 0);
        assert_eq!(stats.skipped, 1);

        // Now due.
        h.store
            .set_retry(key(1), 1, Utc::now() - chrono::Duration::seconds(1), "due")
            .await
            .unwrap();
        let stats = h.pipeline.run_recovery_scan().await.unwrap();
        assert_eq!(stats.reprocessed, 1);
        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::NotRealEstate);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_loop_scans_at_startup_before_the_first_interval() {
        let mut source = ScriptedSource::default();
        source.fetches.insert(key(1), Fetch::Gone);

        let h = harness(ScriptedClassifier::always(Ok(None)), source);
        h.store
            .insert_message(IncomingMessage::pending(
                &source_msg(1, "stuck message"),
                content_hash("stuck message"),
            ))
            .await
            .unwrap();

        // One second is nowhere near the interval: only the immediate
        // startup scan can have run.
        let cancel = CancellationToken::new();
        tokio::select! {
            _ = h.pipeline.run_recovery_loop(Duration::from_secs(300), cancel) => {}
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::Deleted);
    }

    #[tokio::test]
    async fn catch_up_stops_at_first_terminal_message() {
        let mut source = ScriptedSource::default();
        // Newest first: 5, 4, 3.
        source.enumerated = vec![
            source_msg(5, "newest listing"),
            source_msg(4, "already handled"),
            source_msg(3, "old listing"),
        ];

        let h = harness(ScriptedClassifier::always(Ok(None)), source);
        // Message 4 was fully handled by a previous run.
        h.store
            .insert_message(IncomingMessage::pending(
                &source_msg(4, "already handled"),
                content_hash("already handled"),
            ))
            .await
            .unwrap();
        h.store
            .set_status(key(4), ProcessingStatus::NotRealEstate)
            .await
            .unwrap();

        let stats = h.pipeline.catch_up(50).await.unwrap();
        assert_eq!(stats.fetched, 3);
        assert_eq!(stats.processed, 1);
        assert!(h.store.message(key(5)).await.unwrap().is_some());
        assert!(h.store.message(key(3)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refilter_delivers_to_new_filters_only_once() {
        let h = harness(
            ScriptedClassifier::always(Ok(Some(parsed_ad(None, None)))),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;
        h.pipeline
            .process(&source_msg(1, "listing"), false)
            .await
            .unwrap();
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 1);

        // New user appears; refilter picks them up, once.
        seed_user(&h.store, 20).await;
        let stats = h.pipeline.refilter_recent(10, None).await.unwrap();
        assert_eq!(stats.ads, 1);
        assert_eq!(stats.delivered, 1);

        let stats = h.pipeline.refilter_recent(10, None).await.unwrap();
        assert_eq!(stats.delivered, 0);
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 2);
        // Refilter never calls the classifier.
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reprocess_recent_forces_a_new_classification() {
        let h = harness(
            ScriptedClassifier::sequence(
                vec![Ok(None)],
                Ok(Some(parsed_ad(Some(700.0), Some(Currency::Usd)))),
            ),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;

        // First pass: classifier says not real estate.
        let out = h
            .pipeline
            .process(&source_msg(1, "2 rooms 700 usd"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::NotRealEstate);

        // Operator reprocesses; the improved result lands and matches.
        let stats = h
            .pipeline
            .reprocess_recent(10, None, None, true, false)
            .await
            .unwrap();
        assert_eq!(stats.selected, 1);
        assert_eq!(stats.reprocessed, 1);
        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::Forwarded);
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reprocess_marks_stored_noise_as_spam() {
        let h = harness(
            ScriptedClassifier::always(Ok(None)),
            ScriptedSource::default(),
        );
        // Stored by an earlier run, before the noise list knew the phrase.
        h.store
            .insert_message(IncomingMessage::pending(
                &source_msg(1, "Admin pinned a message"),
                content_hash("Admin pinned a message"),
            ))
            .await
            .unwrap();

        let stats = h
            .pipeline
            .reprocess_recent(10, None, None, true, false)
            .await
            .unwrap();
        assert_eq!(stats.skipped, 1);
        let m = h.store.message(key(1)).await.unwrap().unwrap();
        assert_eq!(m.status, ProcessingStatus::SpamFiltered);
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reprocess_can_stop_at_the_first_terminal_record() {
        let h = harness(
            ScriptedClassifier::always(Ok(None)),
            ScriptedSource::default(),
        );
        h.pipeline
            .process(&source_msg(1, "old listing"), false)
            .await
            .unwrap();

        let stats = h
            .pipeline
            .reprocess_recent(10, None, None, true, true)
            .await
            .unwrap();
        assert_eq!(stats.reprocessed, 0);
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reprocess_can_target_one_users_filters() {
        let h = harness(
            ScriptedClassifier::sequence(
                vec![Ok(None)],
                Ok(Some(parsed_ad(None, None))),
            ),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;
        let out = h
            .pipeline
            .process(&source_msg(1, "2 rooms in Kentron"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::NotRealEstate);

        // Reprocess for user 20 only: user 10's matching filter must not
        // produce a notification.
        seed_user(&h.store, 20).await;
        let stats = h
            .pipeline
            .reprocess_recent(10, None, Some(UserId(20)), true, false)
            .await
            .unwrap();
        assert_eq!(stats.reprocessed, 1);
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reprocess_keeps_the_stored_thread_context() {
        let h = harness(
            ScriptedClassifier::sequence(
                vec![Ok(None)],
                Ok(Some(parsed_ad(None, None))),
            ),
            ScriptedSource::default(),
        );
        let mut msg = source_msg(1, "room in the rentals topic");
        msg.thread_id = Some(TopicId(7));
        h.pipeline.process(&msg, false).await.unwrap();

        let stats = h
            .pipeline
            .reprocess_recent(10, None, None, true, false)
            .await
            .unwrap();
        assert_eq!(stats.reprocessed, 1);
        let ad = h.store.ad_by_origin(key(1)).await.unwrap().unwrap();
        assert_eq!(ad.topic_id, Some(TopicId(7)));
    }

    #[tokio::test]
    async fn refilter_can_target_one_user() {
        let h = harness(
            ScriptedClassifier::always(Ok(Some(parsed_ad(None, None)))),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;
        h.pipeline
            .process(&source_msg(1, "listing"), false)
            .await
            .unwrap();
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 1);

        seed_user(&h.store, 20).await;
        seed_user(&h.store, 30).await;
        let stats = h
            .pipeline
            .refilter_recent(10, Some(UserId(20)))
            .await
            .unwrap();
        // Only user 20's filters were evaluated.
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn price_gate_flows_through_the_pipeline() {
        let h = harness(
            ScriptedClassifier::always(Ok(Some(parsed_ad(Some(1400.0), Some(Currency::Usd))))),
            ScriptedSource::default(),
        );
        seed_user(&h.store, 10).await;
        h.store
            .insert_price_filter(PriceFilter {
                id: "p-amd".to_string(),
                filter_id: FilterId("f10".to_string()),
                currency: Currency::Amd,
                min_price: None,
                max_price: Some(350_000.0),
                is_active: true,
            })
            .await
            .unwrap();
        h.store
            .insert_price_filter(PriceFilter {
                id: "p-usd".to_string(),
                filter_id: FilterId("f10".to_string()),
                currency: Currency::Usd,
                min_price: None,
                max_price: Some(800.0),
                is_active: true,
            })
            .await
            .unwrap();

        // 1400 USD: over the USD cap, AMD cap irrelevant.
        let out = h
            .pipeline
            .process(&source_msg(1, "big expensive flat"), false)
            .await
            .unwrap();
        assert_eq!(out, ProcessOutcome::Parsed { delivered: 0 });
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 0);
    }
}
