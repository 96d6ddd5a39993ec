//! Filter evaluation and fan-out to matched users.
//!
//! Evaluation is batch-shaped: one pass loads the active filters, their
//! price bounds, the channel opt-ins and the existing delivery records, then
//! every filter is checked in memory against the ad.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::{
    domain::{FilterId, MessageKey, UserId},
    forwarder::Forwarder,
    model::{Advertisement, FilterMatch, PriceFilter, SimpleFilter},
    store::Store,
    Error, Result,
};

/// Counters from one matching pass, for logs and the recovery stats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: usize,
    pub delivered: usize,
    pub skipped_unselected: usize,
    pub skipped_delivered: usize,
}

/// Currency-scoped price gate.
///
/// No bounds, or an ad without a price, passes. A priced ad must be accepted
/// by at least one bound quoted in its own currency; bounds in other
/// currencies are never compared against it, and a price whose currency
/// could not be extracted fails closed when any bounds exist.
pub fn price_gate(ad: &Advertisement, bounds: &[PriceFilter]) -> bool {
    if bounds.is_empty() {
        return true;
    }
    let Some(price) = ad.price else {
        return true;
    };
    let Some(currency) = ad.currency else {
        return false;
    };
    bounds
        .iter()
        .filter(|b| b.currency == currency)
        .any(|b| {
            b.min_price.map(|m| price >= m).unwrap_or(true)
                && b.max_price.map(|m| price <= m).unwrap_or(true)
        })
}

/// Whether `ad` satisfies every set criterion of `filter`.
///
/// Criteria are conjunctive; unset ones are wildcards. A criterion on a
/// field the ad is missing fails closed (a "2+ rooms" filter should not
/// match a listing whose room count could not be extracted).
pub fn filter_matches(filter: &SimpleFilter, ad: &Advertisement, bounds: &[PriceFilter]) -> bool {
    if !filter.property_types.is_empty() {
        match ad.property_type {
            Some(pt) if filter.property_types.contains(&pt) => {}
            _ => return false,
        }
    }

    if let Some(rt) = filter.rental_type {
        if ad.rental_type != Some(rt) {
            return false;
        }
    }

    if let Some(min) = filter.min_rooms {
        match ad.rooms {
            Some(r) if r >= min => {}
            _ => return false,
        }
    }
    if let Some(max) = filter.max_rooms {
        match ad.rooms {
            Some(r) if r <= max => {}
            _ => return false,
        }
    }

    if let Some(min) = filter.min_area_sqm {
        match ad.area_sqm {
            Some(a) if a >= min => {}
            _ => return false,
        }
    }

    if !filter.districts.is_empty() {
        let Some(district) = ad.district.as_deref() else {
            return false;
        };
        let district = district.to_lowercase();
        if !filter
            .districts
            .iter()
            .any(|d| d.to_lowercase() == district)
        {
            return false;
        }
    }

    let amenities = [
        (filter.has_balcony, ad.has_balcony),
        (filter.has_furniture, ad.has_furniture),
        (filter.has_parking, ad.has_parking),
        (filter.has_air_conditioning, ad.has_air_conditioning),
        (filter.has_elevator, ad.has_elevator),
        (filter.pets_allowed, ad.pets_allowed),
    ];
    for (wanted, actual) in amenities {
        if let Some(w) = wanted {
            if actual != Some(w) {
                return false;
            }
        }
    }

    price_gate(ad, bounds)
}

pub struct MatchEngine {
    store: Arc<dyn Store>,
    forwarder: Arc<Forwarder>,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn Store>, forwarder: Arc<Forwarder>) -> Self {
        Self { store, forwarder }
    }

    /// Match one ad against all active filters and notify the users whose
    /// filters hit, once per `(user, ad, origin)`.
    ///
    /// `origin` is the message that triggered this pass. For a repost it is
    /// the repost's key, not the ad's original message, so users who missed
    /// the original still get notified exactly once per copy.
    pub async fn run(&self, ad: &Advertisement, origin: MessageKey) -> Result<MatchOutcome> {
        self.run_scoped(ad, origin, None).await
    }

    /// Like [`run`](Self::run), optionally restricted to one user's filters
    /// (operator re-filter batches).
    pub async fn run_scoped(
        &self,
        ad: &Advertisement,
        origin: MessageKey,
        only_user: Option<UserId>,
    ) -> Result<MatchOutcome> {
        let ad_id = ad
            .id
            .clone()
            .ok_or_else(|| Error::Store("cannot match an unsaved ad".to_string()))?;

        let mut filters = self.store.active_filters().await?;
        if let Some(user) = only_user {
            filters.retain(|f| f.user_id == user);
        }
        if filters.is_empty() {
            return Ok(MatchOutcome::default());
        }

        let filter_ids: Vec<FilterId> = filters.iter().map(|f| f.id.clone()).collect();
        let mut bounds_by_filter: HashMap<FilterId, Vec<PriceFilter>> = HashMap::new();
        for bound in self.store.price_filters_for(&filter_ids).await? {
            bounds_by_filter
                .entry(bound.filter_id.clone())
                .or_default()
                .push(bound);
        }

        let selected = self.store.selected_users(origin.channel_id).await?;
        let mut delivered = self.store.delivered_users(&ad_id, origin).await?;

        let mut outcome = MatchOutcome::default();
        for filter in &filters {
            // A user who has not opted into the channel gets no evaluation
            // and no match record; a later opt-in sees the ad via refilter.
            if !selected.contains(&filter.user_id) {
                debug!(
                    user = filter.user_id.0,
                    channel = origin.channel_id.0,
                    "user has not selected the channel"
                );
                outcome.skipped_unselected += 1;
                continue;
            }

            let bounds = bounds_by_filter
                .get(&filter.id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if !filter_matches(filter, ad, bounds) {
                continue;
            }

            outcome.matched += 1;
            self.store
                .record_match(FilterMatch {
                    user_id: filter.user_id,
                    filter_id: filter.id.clone(),
                    ad_id: ad_id.clone(),
                    created_at: Utc::now(),
                })
                .await?;

            if delivered.contains(&filter.user_id) {
                outcome.skipped_delivered += 1;
                continue;
            }

            if self.forwarder.deliver(filter, ad, &ad_id, origin).await? {
                delivered.insert(filter.user_id);
                outcome.delivered += 1;
            }
        }

        if outcome.matched > 0 {
            info!(
                ad = %ad_id.0,
                matched = outcome.matched,
                delivered = outcome.delivered,
                "matching pass finished"
            );
        }
        Ok(outcome)
    }
}
