//! Persistence port + in-memory implementation with a JSON snapshot.
//!
//! The trait is document-store shaped: keyed lookups, a couple of scans and
//! one compare-and-swap (`claim_processing`) that the pipeline relies on for
//! mutual exclusion. The in-memory store is the only implementation today;
//! it snapshots to disk so restarts don't re-notify users.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{AdId, ChannelId, FilterId, MessageKey, UserId},
    model::{
        Advertisement, ChannelSelection, DeliveryRecord, FilterMatch, IncomingMessage,
        MonitoredChannel, PriceFilter, ProcessingStatus, SimpleFilter,
    },
    Error, Result,
};

/// Outcome of a uniqueness-guarded insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same identity already exists. Callers treat this as
    /// a lost race, not an error.
    Duplicate,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // --- messages ---

    /// Insert a new message record. `Duplicate` if the key is already stored.
    async fn insert_message(&self, msg: IncomingMessage) -> Result<InsertOutcome>;

    async fn message(&self, key: MessageKey) -> Result<Option<IncomingMessage>>;

    /// Atomically move a message into `Processing`, but only if its current
    /// status is one of `allowed_from`. Returns whether the claim won.
    async fn claim_processing(
        &self,
        key: MessageKey,
        allowed_from: &[ProcessingStatus],
    ) -> Result<bool>;

    async fn set_status(&self, key: MessageKey, status: ProcessingStatus) -> Result<()>;

    /// Record a failure status together with its error text.
    async fn set_failed(
        &self,
        key: MessageKey,
        status: ProcessingStatus,
        error: &str,
    ) -> Result<()>;

    /// Schedule another attempt after `retry_after`.
    async fn set_retry(
        &self,
        key: MessageKey,
        retry_count: u32,
        retry_after: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    /// Record a successful classification.
    async fn set_parsed(
        &self,
        key: MessageKey,
        ad_id: Option<AdId>,
        is_ad: bool,
        confidence: f64,
    ) -> Result<()>;

    /// Mark a message as a repost of `original`.
    async fn set_duplicate(
        &self,
        key: MessageKey,
        original: MessageKey,
        ad_id: Option<AdId>,
    ) -> Result<()>;

    /// Record that `user` was notified about this message. Promotes the
    /// status to `Forwarded` unless the message is a `Duplicate` (reposts
    /// keep that status so dedup stays visible).
    async fn mark_forwarded(&self, key: MessageKey, user: UserId) -> Result<()>;

    /// Find another message with the same content hash, excluding `key`.
    async fn find_by_hash(&self, hash: &str, exclude: MessageKey)
        -> Result<Option<IncomingMessage>>;

    /// All messages in a non-terminal status, for the recovery scan.
    async fn recoverable_messages(&self) -> Result<Vec<IncomingMessage>>;

    /// Most recently ingested messages, newest first.
    async fn recent_messages(&self, limit: usize) -> Result<Vec<IncomingMessage>>;

    // --- advertisements ---

    /// Insert or replace the ad for its origin message. Assigns an id when
    /// the ad has none; returns the id either way.
    async fn upsert_ad(&self, ad: Advertisement) -> Result<AdId>;

    async fn ad(&self, id: &AdId) -> Result<Option<Advertisement>>;

    async fn ad_by_origin(&self, origin: MessageKey) -> Result<Option<Advertisement>>;

    /// Most recently created ads, newest first.
    async fn recent_ads(&self, limit: usize) -> Result<Vec<Advertisement>>;

    // --- filters ---

    async fn insert_filter(&self, filter: SimpleFilter) -> Result<()>;

    async fn insert_price_filter(&self, filter: PriceFilter) -> Result<()>;

    async fn active_filters(&self) -> Result<Vec<SimpleFilter>>;

    /// Active price bounds belonging to any of the given filters.
    async fn price_filters_for(&self, ids: &[FilterId]) -> Result<Vec<PriceFilter>>;

    /// Remove a filter and cascade to its price bounds and match records.
    async fn remove_filter(&self, id: &FilterId) -> Result<()>;

    // --- channels / selections ---

    async fn upsert_channel(&self, channel: MonitoredChannel) -> Result<()>;

    async fn monitored_channels(&self) -> Result<Vec<MonitoredChannel>>;

    async fn set_selection(&self, selection: ChannelSelection) -> Result<()>;

    /// Users who opted in to notifications from `channel`.
    async fn selected_users(&self, channel: ChannelId) -> Result<HashSet<UserId>>;

    // --- matches / deliveries ---

    /// Record a filter/ad match, once per `(user, filter, ad)`.
    async fn record_match(&self, m: FilterMatch) -> Result<()>;

    /// Insert a delivery record. `Duplicate` when `(user, ad, origin)` was
    /// already delivered; the caller must then skip the send.
    async fn insert_delivery(&self, d: DeliveryRecord) -> Result<InsertOutcome>;

    /// Users already notified about `(ad, origin)`.
    async fn delivered_users(&self, ad: &AdId, origin: MessageKey) -> Result<HashSet<UserId>>;
}

/// Serialized form of the store, written as one JSON document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    messages: Vec<IncomingMessage>,
    ads: Vec<Advertisement>,
    filters: Vec<SimpleFilter>,
    price_filters: Vec<PriceFilter>,
    matches: Vec<FilterMatch>,
    deliveries: Vec<DeliveryRecord>,
    channels: Vec<MonitoredChannel>,
    selections: Vec<ChannelSelection>,
    next_ad_id: u64,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageKey, IncomingMessage>,
    ads: HashMap<AdId, Advertisement>,
    ads_by_origin: HashMap<MessageKey, AdId>,
    filters: HashMap<FilterId, SimpleFilter>,
    price_filters: Vec<PriceFilter>,
    matches: Vec<FilterMatch>,
    deliveries: Vec<DeliveryRecord>,
    channels: HashMap<ChannelId, MonitoredChannel>,
    selections: Vec<ChannelSelection>,
    next_ad_id: u64,
}

impl Inner {
    fn from_snapshot(snap: Snapshot) -> Self {
        let mut inner = Inner {
            next_ad_id: snap.next_ad_id,
            ..Inner::default()
        };
        for m in snap.messages {
            inner.messages.insert(m.key, m);
        }
        for ad in snap.ads {
            let Some(id) = ad.id.clone() else {
                continue;
            };
            inner.ads_by_origin.insert(ad.origin, id.clone());
            inner.ads.insert(id, ad);
        }
        for f in snap.filters {
            inner.filters.insert(f.id.clone(), f);
        }
        for ch in snap.channels {
            inner.channels.insert(ch.channel_id, ch);
        }
        inner.price_filters = snap.price_filters;
        inner.matches = snap.matches;
        inner.deliveries = snap.deliveries;
        inner.selections = snap.selections;
        inner
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            messages: self.messages.values().cloned().collect(),
            ads: self.ads.values().cloned().collect(),
            filters: self.filters.values().cloned().collect(),
            price_filters: self.price_filters.clone(),
            matches: self.matches.clone(),
            deliveries: self.deliveries.clone(),
            channels: self.channels.values().cloned().collect(),
            selections: self.selections.clone(),
            next_ad_id: self.next_ad_id,
        }
    }

    fn touch(&mut self, key: MessageKey) {
        if let Some(m) = self.messages.get_mut(&key) {
            m.updated_at = Utc::now();
        }
    }
}

/// In-memory store with an optional JSON snapshot on disk.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it when present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snap: Snapshot = serde_json::from_slice(&bytes)?;
                Inner::from_snapshot(snap)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Inner::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            inner: Mutex::new(inner),
            path: Some(path),
        })
    }

    /// Write the snapshot to disk (write-then-rename so a crash mid-write
    /// never leaves a truncated file).
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snap = {
            let inner = self.inner.lock().await;
            inner.to_snapshot()
        };
        let bytes = serde_json::to_vec_pretty(&snap)?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn missing(key: MessageKey) -> Error {
    Error::Store(format!("no message record for {key}"))
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn insert_message(&self, msg: IncomingMessage) -> Result<InsertOutcome> {
        let mut inner = self.inner.lock().await;
        if inner.messages.contains_key(&msg.key) {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.messages.insert(msg.key, msg);
        Ok(InsertOutcome::Inserted)
    }

    async fn message(&self, key: MessageKey) -> Result<Option<IncomingMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner.messages.get(&key).cloned())
    }

    async fn claim_processing(
        &self,
        key: MessageKey,
        allowed_from: &[ProcessingStatus],
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(m) = inner.messages.get_mut(&key) else {
            return Ok(false);
        };
        if !allowed_from.contains(&m.status) {
            return Ok(false);
        }
        m.status = ProcessingStatus::Processing;
        m.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_status(&self, key: MessageKey, status: ProcessingStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let m = inner.messages.get_mut(&key).ok_or_else(|| missing(key))?;
        m.status = status;
        m.updated_at = Utc::now();
        Ok(())
    }

    async fn set_failed(
        &self,
        key: MessageKey,
        status: ProcessingStatus,
        error: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let m = inner.messages.get_mut(&key).ok_or_else(|| missing(key))?;
        m.status = status;
        m.error = Some(error.to_string());
        m.updated_at = Utc::now();
        Ok(())
    }

    async fn set_retry(
        &self,
        key: MessageKey,
        retry_count: u32,
        retry_after: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let m = inner.messages.get_mut(&key).ok_or_else(|| missing(key))?;
        m.status = ProcessingStatus::Retry;
        m.retry_count = retry_count;
        m.retry_after = Some(retry_after);
        m.error = Some(error.to_string());
        m.updated_at = Utc::now();
        Ok(())
    }

    async fn set_parsed(
        &self,
        key: MessageKey,
        ad_id: Option<AdId>,
        is_ad: bool,
        confidence: f64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let m = inner.messages.get_mut(&key).ok_or_else(|| missing(key))?;
        m.status = if is_ad {
            ProcessingStatus::Parsed
        } else {
            ProcessingStatus::NotRealEstate
        };
        m.is_ad = Some(is_ad);
        m.confidence = Some(confidence);
        m.ad_id = ad_id;
        m.error = None;
        m.updated_at = Utc::now();
        Ok(())
    }

    async fn set_duplicate(
        &self,
        key: MessageKey,
        original: MessageKey,
        ad_id: Option<AdId>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let m = inner.messages.get_mut(&key).ok_or_else(|| missing(key))?;
        m.status = ProcessingStatus::Duplicate;
        m.error = Some(format!("duplicate of {original}"));
        m.ad_id = ad_id;
        m.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_forwarded(&self, key: MessageKey, user: UserId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let m = inner.messages.get_mut(&key).ok_or_else(|| missing(key))?;
        if !m.forwarded_to.contains(&user) {
            m.forwarded_to.push(user);
        }
        if m.status != ProcessingStatus::Duplicate {
            m.status = ProcessingStatus::Forwarded;
        }
        m.updated_at = Utc::now();
        Ok(())
    }

    async fn find_by_hash(
        &self,
        hash: &str,
        exclude: MessageKey,
    ) -> Result<Option<IncomingMessage>> {
        let inner = self.inner.lock().await;
        let mut best: Option<&IncomingMessage> = None;
        for m in inner.messages.values() {
            if m.key == exclude || m.message_hash != hash {
                continue;
            }
            // Prefer the oldest copy as the canonical original.
            if best.map(|b| m.created_at < b.created_at).unwrap_or(true) {
                best = Some(m);
            }
        }
        Ok(best.cloned())
    }

    async fn recoverable_messages(&self) -> Result<Vec<IncomingMessage>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .messages
            .values()
            .filter(|m| m.status.is_recoverable())
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<IncomingMessage>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner.messages.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn upsert_ad(&self, mut ad: Advertisement) -> Result<AdId> {
        let mut inner = self.inner.lock().await;
        let id = match ad.id.clone() {
            Some(id) => id,
            None => match inner.ads_by_origin.get(&ad.origin) {
                // Re-classification of the same message replaces its ad.
                Some(existing) => existing.clone(),
                None => {
                    inner.next_ad_id += 1;
                    AdId(format!("ad-{:06}", inner.next_ad_id))
                }
            },
        };
        ad.id = Some(id.clone());
        ad.updated_at = Utc::now();
        inner.ads_by_origin.insert(ad.origin, id.clone());
        inner.ads.insert(id.clone(), ad);
        Ok(id)
    }

    async fn ad(&self, id: &AdId) -> Result<Option<Advertisement>> {
        let inner = self.inner.lock().await;
        Ok(inner.ads.get(id).cloned())
    }

    async fn ad_by_origin(&self, origin: MessageKey) -> Result<Option<Advertisement>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ads_by_origin
            .get(&origin)
            .and_then(|id| inner.ads.get(id))
            .cloned())
    }

    async fn recent_ads(&self, limit: usize) -> Result<Vec<Advertisement>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner.ads.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn insert_filter(&self, filter: SimpleFilter) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.filters.insert(filter.id.clone(), filter);
        Ok(())
    }

    async fn insert_price_filter(&self, filter: PriceFilter) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.price_filters.retain(|p| p.id != filter.id);
        inner.price_filters.push(filter);
        Ok(())
    }

    async fn active_filters(&self) -> Result<Vec<SimpleFilter>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .filters
            .values()
            .filter(|f| f.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn price_filters_for(&self, ids: &[FilterId]) -> Result<Vec<PriceFilter>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .price_filters
            .iter()
            .filter(|p| p.is_active && ids.contains(&p.filter_id))
            .cloned()
            .collect())
    }

    async fn remove_filter(&self, id: &FilterId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.filters.remove(id);
        inner.price_filters.retain(|p| &p.filter_id != id);
        inner.matches.retain(|m| &m.filter_id != id);
        Ok(())
    }

    async fn upsert_channel(&self, channel: MonitoredChannel) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.channels.insert(channel.channel_id, channel);
        Ok(())
    }

    async fn monitored_channels(&self) -> Result<Vec<MonitoredChannel>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner.channels.values().cloned().collect();
        out.sort_by_key(|c| c.channel_id);
        Ok(out)
    }

    async fn set_selection(&self, selection: ChannelSelection) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.selections.retain(|s| {
            !(s.user_id == selection.user_id && s.channel_id == selection.channel_id)
        });
        inner.selections.push(selection);
        Ok(())
    }

    async fn selected_users(&self, channel: ChannelId) -> Result<HashSet<UserId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .selections
            .iter()
            .filter(|s| s.channel_id == channel && s.is_selected)
            .map(|s| s.user_id)
            .collect())
    }

    async fn record_match(&self, m: FilterMatch) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let exists = inner.matches.iter().any(|x| {
            x.user_id == m.user_id && x.filter_id == m.filter_id && x.ad_id == m.ad_id
        });
        if !exists {
            inner.matches.push(m);
        }
        Ok(())
    }

    async fn insert_delivery(&self, d: DeliveryRecord) -> Result<InsertOutcome> {
        let mut inner = self.inner.lock().await;
        let exists = inner
            .deliveries
            .iter()
            .any(|x| x.user_id == d.user_id && x.ad_id == d.ad_id && x.origin == d.origin);
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.deliveries.push(d);
        Ok(InsertOutcome::Inserted)
    }

    async fn delivered_users(&self, ad: &AdId, origin: MessageKey) -> Result<HashSet<UserId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .iter()
            .filter(|d| &d.ad_id == ad && d.origin == origin)
            .map(|d| d.user_id)
            .collect())
    }
}
