use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AdId, ChannelId, FilterId, MessageId, MessageKey, TopicId, UserId};

/// Lifecycle status of an ingested message.
///
/// The status doubles as a processing lock: a message may only move into
/// `Processing` from `Pending` / `Retry` / `Error` via a compare-and-swap on
/// the store, so two workers never classify the same message concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Parsed,
    NotRealEstate,
    SpamFiltered,
    MediaOnly,
    NoText,
    Error,
    Retry,
    Duplicate,
    Deleted,
    Forwarded,
}

impl ProcessingStatus {
    /// Statuses that will never be picked up again by the pipeline.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Parsed
                | ProcessingStatus::NotRealEstate
                | ProcessingStatus::SpamFiltered
                | ProcessingStatus::MediaOnly
                | ProcessingStatus::NoText
                | ProcessingStatus::Duplicate
                | ProcessingStatus::Deleted
                | ProcessingStatus::Forwarded
        )
    }

    /// Statuses the recovery scan considers stuck or due for another attempt.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Pending
                | ProcessingStatus::Processing
                | ProcessingStatus::Error
                | ProcessingStatus::Retry
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Parsed => "parsed",
            ProcessingStatus::NotRealEstate => "not_real_estate",
            ProcessingStatus::SpamFiltered => "spam_filtered",
            ProcessingStatus::MediaOnly => "media_only",
            ProcessingStatus::NoText => "no_text",
            ProcessingStatus::Error => "error",
            ProcessingStatus::Retry => "retry",
            ProcessingStatus::Duplicate => "duplicate",
            ProcessingStatus::Deleted => "deleted",
            ProcessingStatus::Forwarded => "forwarded",
        }
    }
}

/// Currency a price is quoted in. Closed set: anything else coming back from
/// the classifier is treated as "no currency" and skips the price gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Amd,
    Usd,
    Eur,
    Rub,
    Gbp,
}

impl Currency {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "AMD" | "֏" | "DRAM" => Some(Currency::Amd),
            "USD" | "$" => Some(Currency::Usd),
            "EUR" | "€" => Some(Currency::Eur),
            "RUB" | "₽" => Some(Currency::Rub),
            "GBP" | "£" => Some(Currency::Gbp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Amd => "AMD",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Rub => "RUB",
            Currency::Gbp => "GBP",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    House,
    Room,
    HotelRoom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalType {
    LongTerm,
    Daily,
}

/// A message as observed on the wire, before any persistence.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceMessage {
    pub key: MessageKey,
    /// Forum thread this message belongs to, when the transport exposes it.
    pub thread_id: Option<TopicId>,
    /// Message id this one replies to (forum posts reply to the topic anchor).
    pub reply_to: Option<MessageId>,
    pub text: String,
    pub has_media: bool,
    pub date: DateTime<Utc>,
    pub channel_title: Option<String>,
}

/// Persisted record of an ingested message and its processing state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub key: MessageKey,
    /// Forum thread the message arrived in, kept so operator reprocessing
    /// sees the same topic context the live pass did.
    #[serde(default)]
    pub thread_id: Option<TopicId>,
    pub channel_title: Option<String>,
    pub text: String,
    /// SHA-256 over the normalized text, used for cross-post dedup.
    pub message_hash: String,
    pub date: DateTime<Utc>,
    pub status: ProcessingStatus,
    pub error: Option<String>,
    pub retry_count: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub is_ad: Option<bool>,
    pub confidence: Option<f64>,
    pub ad_id: Option<AdId>,
    pub forwarded_to: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn pending(msg: &SourceMessage, message_hash: String) -> Self {
        let now = Utc::now();
        Self {
            key: msg.key,
            thread_id: msg.thread_id,
            channel_title: msg.channel_title.clone(),
            text: msg.text.clone(),
            message_hash,
            date: msg.date,
            status: ProcessingStatus::Pending,
            error: None,
            retry_count: 0,
            retry_after: None,
            is_ad: None,
            confidence: None,
            ad_id: None,
            forwarded_to: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Structured listing extracted by the classifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: Option<AdId>,
    pub origin: MessageKey,
    pub topic_id: Option<TopicId>,
    pub original_text: String,

    pub property_type: Option<PropertyType>,
    pub rental_type: Option<RentalType>,
    pub rooms: Option<u32>,
    pub area_sqm: Option<f64>,
    pub price: Option<f64>,
    pub currency: Option<Currency>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
    pub contacts: Vec<String>,

    pub has_balcony: Option<bool>,
    pub has_furniture: Option<bool>,
    pub has_parking: Option<bool>,
    pub has_air_conditioning: Option<bool>,
    pub has_elevator: Option<bool>,
    pub pets_allowed: Option<bool>,
    pub floor: Option<i32>,
    pub total_floors: Option<i32>,

    pub is_real_estate: bool,
    pub confidence: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A saved user search. All set fields must hold for an ad to match;
/// unset fields are wildcards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimpleFilter {
    pub id: FilterId,
    pub user_id: UserId,
    pub name: String,
    pub is_active: bool,

    /// Empty means "any property type".
    pub property_types: Vec<PropertyType>,
    pub rental_type: Option<RentalType>,
    pub min_rooms: Option<u32>,
    pub max_rooms: Option<u32>,
    pub min_area_sqm: Option<f64>,
    pub districts: Vec<String>,

    pub has_balcony: Option<bool>,
    pub has_furniture: Option<bool>,
    pub has_parking: Option<bool>,
    pub has_air_conditioning: Option<bool>,
    pub has_elevator: Option<bool>,
    pub pets_allowed: Option<bool>,
}

/// Per-currency price bound attached to a [`SimpleFilter`].
///
/// A filter may carry several of these (one per currency); an ad passes the
/// price gate when at least one bound in the ad's own currency accepts it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PriceFilter {
    pub id: String,
    pub filter_id: FilterId,
    pub currency: Currency,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub is_active: bool,
}

/// Audit record of a filter matching an ad (written whether or not a
/// notification was ultimately sent).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterMatch {
    pub user_id: UserId,
    pub filter_id: FilterId,
    pub ad_id: AdId,
    pub created_at: DateTime<Utc>,
}

/// Idempotency record for an outgoing notification. Unique on
/// `(user_id, ad_id, origin)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub user_id: UserId,
    pub ad_id: AdId,
    pub origin: MessageKey,
    pub filter_id: FilterId,
    pub sent_at: DateTime<Utc>,
}

/// A channel (optionally narrowed to one forum topic) the monitor watches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoredChannel {
    pub channel_id: ChannelId,
    pub topic_id: Option<TopicId>,
    pub title: Option<String>,
    pub is_active: bool,
}

/// Per-user opt-in for notifications originating from a given channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelSelection {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub is_selected: bool,
}
