use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::{
    domain::{AdId, MessageKey},
    model::{Advertisement, DeliveryRecord, PropertyType, RentalType, SimpleFilter},
    ports::Notifier,
    store::{InsertOutcome, Store},
    util::truncate_chars,
    Result,
};

const NOTIFICATION_TEXT_LIMIT: usize = 600;

/// Sends matched listings to users, at most once per `(user, ad, origin)`.
///
/// The delivery record is claimed in the store *before* the send. If the
/// send then fails the record stays, which trades a lost notification for
/// never duplicating one. Reposts get fresh records because the origin
/// message differs.
pub struct Forwarder {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl Forwarder {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Returns whether a notification actually went out. `origin` is the
    /// message that triggered the match (the repost's key for reposts).
    pub async fn deliver(
        &self,
        filter: &SimpleFilter,
        ad: &Advertisement,
        ad_id: &AdId,
        origin: MessageKey,
    ) -> Result<bool> {
        let record = DeliveryRecord {
            user_id: filter.user_id,
            ad_id: ad_id.clone(),
            origin,
            filter_id: filter.id.clone(),
            sent_at: Utc::now(),
        };
        if self.store.insert_delivery(record).await? == InsertOutcome::Duplicate {
            debug!(
                user = filter.user_id.0,
                ad = %ad_id.0,
                "delivery already recorded, skipping send"
            );
            return Ok(false);
        }

        let text = render_notification(ad, filter);
        if let Err(e) = self.notifier.notify_user(filter.user_id, &text).await {
            // The claimed record is kept: better one missed notification
            // than a duplicate on the next matching pass.
            error!(user = filter.user_id.0, ad = %ad_id.0, "notification send failed: {e}");
            return Ok(false);
        }

        // The origin message may no longer have a record (e.g. after a
        // manual re-filter of old ads); that is fine.
        if let Err(e) = self.store.mark_forwarded(origin, filter.user_id).await {
            debug!("could not mark origin message forwarded: {e}");
        }

        info!(user = filter.user_id.0, ad = %ad_id.0, "listing forwarded");
        Ok(true)
    }
}

/// Plain-text notification body.
pub fn render_notification(ad: &Advertisement, filter: &SimpleFilter) -> String {
    let mut lines = vec![format!("🏠 New listing for \"{}\"", filter.name)];

    let mut what = Vec::new();
    if let Some(rooms) = ad.rooms {
        what.push(format!("{rooms}-room"));
    }
    what.push(
        match ad.property_type {
            Some(PropertyType::Apartment) => "apartment",
            Some(PropertyType::House) => "house",
            Some(PropertyType::Room) => "room",
            Some(PropertyType::HotelRoom) => "hotel room",
            None => "listing",
        }
        .to_string(),
    );
    if let Some(area) = ad.area_sqm {
        what.push(format!("{area:.0} m²"));
    }
    match ad.rental_type {
        Some(RentalType::Daily) => what.push("daily".to_string()),
        Some(RentalType::LongTerm) => what.push("long term".to_string()),
        None => {}
    }
    lines.push(what.join(", "));

    if let (Some(price), Some(currency)) = (ad.price, ad.currency) {
        lines.push(format!("💰 {price:.0} {}", currency.as_str()));
    }

    let mut place = Vec::new();
    if let Some(d) = &ad.district {
        place.push(d.clone());
    }
    if let Some(c) = &ad.city {
        place.push(c.clone());
    }
    if !place.is_empty() {
        lines.push(format!("📍 {}", place.join(", ")));
    }

    if let (Some(floor), Some(total)) = (ad.floor, ad.total_floors) {
        lines.push(format!("🏢 floor {floor}/{total}"));
    }

    if !ad.contacts.is_empty() {
        lines.push(format!("📞 {}", ad.contacts.join(", ")));
    }

    lines.push(String::new());
    lines.push(truncate_chars(&ad.original_text, NOTIFICATION_TEXT_LIMIT));

    lines.join("\n")
}
