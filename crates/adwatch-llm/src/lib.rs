//! LLM classifier adapter (OpenAI-compatible chat completions).
//!
//! Sends message text with an extraction prompt and parses the JSON the
//! model returns into an [`Advertisement`]. Provider failures are mapped
//! into the closed [`ClassifyError`] taxonomy the pipeline branches on.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use adwatch_core::{
    domain::{MessageKey, TopicId},
    model::{Advertisement, Currency, PropertyType, RentalType},
    ports::{Classifier, ClassifyError},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TEMPERATURE: f64 = 0.1;

const SYSTEM_PROMPT: &str = "\
You analyze chat messages from rental channels and extract real-estate listings.\n\
Respond with a single JSON object, no prose, with these fields:\n\
  is_real_estate (bool), confidence (0..1),\n\
  property_type (apartment|house|room|hotel_room|null), rental_type (long_term|daily|null),\n\
  rooms (int|null), area_sqm (number|null), price (number|null), currency (AMD|USD|EUR|RUB|GBP|null),\n\
  district (string|null), city (string|null), address (string|null), contacts (string[]),\n\
  has_balcony, has_furniture, has_parking, has_air_conditioning, has_elevator, pets_allowed (bool|null each),\n\
  floor (int|null), total_floors (int|null).\n\
Messages may mix Armenian, Russian and English. Requests to FIND housing are not listings.\n\
Set is_real_estate=false for anything that is not an offer of housing for rent.";

pub struct OpenAiClassifier {
    provider: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

impl OpenAiClassifier {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client build");
        Self {
            provider: provider.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http,
        }
    }

    fn other(&self, message: impl Into<String>) -> ClassifyError {
        ClassifyError::Other {
            provider: self.provider.clone(),
            message: message.into(),
        }
    }
}

#[async_trait::async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        text: &str,
        origin: MessageKey,
        topic: Option<TopicId>,
    ) -> Result<Option<Advertisement>, ClassifyError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": TEMPERATURE,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": text },
            ],
        });

        let mut req = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| self.other(format!("request error: {e}")))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_failure(&self.provider, status, &body, retry_after));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| self.other(format!("response json error: {e}")))?;
        let content = v["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| self.other("response has no message content"))?;

        let listing = parse_listing(content)
            .map_err(|e| self.other(format!("could not parse model output: {e}")))?;
        debug!(
            %origin,
            is_real_estate = listing.is_real_estate,
            confidence = listing.confidence,
            "classification result"
        );

        if !listing.is_real_estate {
            return Ok(None);
        }
        Ok(Some(listing.into_advertisement(origin, topic)))
    }
}

/// Map a non-2xx provider response to the error taxonomy.
///
/// Quota and concurrency come back as 429s on most OpenAI-compatible
/// providers, so the body is inspected before the status code.
pub fn map_failure(
    provider: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> ClassifyError {
    let provider = provider.to_string();
    let lower = body.to_lowercase();
    let message = snippet(body);

    if lower.contains("insufficient_quota") || lower.contains("quota") || lower.contains("billing")
    {
        return ClassifyError::Quota { provider, message };
    }
    // Some gateways signal an in-flight request cap with code 1302.
    if lower.contains("\"1302\"")
        || lower.contains(":1302")
        || lower.contains("high concurrency")
        || lower.contains("concurrency")
    {
        return ClassifyError::Concurrency { provider, message };
    }
    if status == 429 {
        return ClassifyError::RateLimit {
            provider,
            message,
            retry_after,
        };
    }
    ClassifyError::Other {
        provider,
        message: format!("HTTP {status}: {message}"),
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Pull the JSON object out of the model's reply, tolerating markdown
/// fences and surrounding prose.
fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&content[start..=end])
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ParsedListing {
    is_real_estate: bool,
    confidence: f64,
    property_type: Option<String>,
    rental_type: Option<String>,
    rooms: Option<u32>,
    area_sqm: Option<f64>,
    price: Option<f64>,
    currency: Option<String>,
    district: Option<String>,
    city: Option<String>,
    address: Option<String>,
    contacts: Vec<String>,
    has_balcony: Option<bool>,
    has_furniture: Option<bool>,
    has_parking: Option<bool>,
    has_air_conditioning: Option<bool>,
    has_elevator: Option<bool>,
    pets_allowed: Option<bool>,
    floor: Option<i32>,
    total_floors: Option<i32>,
}

fn parse_listing(content: &str) -> Result<ParsedListing, String> {
    let json = extract_json(content).ok_or_else(|| "no JSON object in output".to_string())?;
    serde_json::from_str(json).map_err(|e| e.to_string())
}

impl ParsedListing {
    fn into_advertisement(self, origin: MessageKey, topic: Option<TopicId>) -> Advertisement {
        let now = Utc::now();
        Advertisement {
            id: None,
            origin,
            topic_id: topic,
            original_text: String::new(),
            property_type: self.property_type.as_deref().and_then(parse_property_type),
            rental_type: self.rental_type.as_deref().and_then(parse_rental_type),
            rooms: self.rooms,
            area_sqm: self.area_sqm,
            price: self.price,
            currency: self.currency.as_deref().and_then(Currency::parse),
            district: self.district,
            city: self.city,
            address: self.address,
            contacts: self.contacts,
            has_balcony: self.has_balcony,
            has_furniture: self.has_furniture,
            has_parking: self.has_parking,
            has_air_conditioning: self.has_air_conditioning,
            has_elevator: self.has_elevator,
            pets_allowed: self.pets_allowed,
            floor: self.floor,
            total_floors: self.total_floors,
            is_real_estate: true,
            confidence: self.confidence,
            created_at: now,
            updated_at: now,
        }
    }
}

fn parse_property_type(s: &str) -> Option<PropertyType> {
    match s.trim().to_lowercase().as_str() {
        "apartment" | "flat" => Some(PropertyType::Apartment),
        "house" => Some(PropertyType::House),
        "room" => Some(PropertyType::Room),
        "hotel_room" | "hotel room" => Some(PropertyType::HotelRoom),
        _ => None,
    }
}

fn parse_rental_type(s: &str) -> Option<RentalType> {
    match s.trim().to_lowercase().as_str() {
        "long_term" | "long term" | "monthly" => Some(RentalType::LongTerm),
        "daily" | "short_term" | "short term" => Some(RentalType::Daily),
        _ => None,
    }
}
