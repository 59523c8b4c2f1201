use chrono::NaiveDate;
use ulid::Ulid;

use crate::interval::generate_slots;
use crate::limits::*;
use crate::model::*;

use super::calendar::{find_conflict, is_free};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_courts(&self) -> Vec<CourtInfo> {
        let courts: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(courts.len());
        for shared in courts {
            let guard = shared.read().await;
            out.push(CourtInfo {
                id: guard.id,
                name: guard.name.clone(),
                active: guard.active,
            });
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub async fn get_reservations(&self, court_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let court_id = self.court_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Waitlist rows for a court in queue order.
    pub async fn get_waitlist(&self, court_id: Ulid) -> Result<Vec<WaitlistEntry>, EngineError> {
        let rs = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        let mut entries = guard.waitlist.clone();
        entries.sort_by_key(|e| (e.span.start, e.span.end, e.position));
        Ok(entries)
    }

    pub async fn get_waitlist_entry(&self, id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let court_id = self.court_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        guard.waitlist_entry(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn get_cart(&self, cart_id: Ulid) -> Result<Cart, EngineError> {
        let shared = self.shared_cart(&cart_id).ok_or(EngineError::NotFound(cart_id))?;
        let cart = shared.lock().await.clone();
        Ok(cart)
    }

    /// The cart new requests from `owner` currently land in.
    pub fn open_cart_of(&self, owner: &Ulid) -> Option<Ulid> {
        self.open_carts.get(owner).map(|e| *e.value())
    }

    pub async fn get_line_items(&self, cart_id: Ulid) -> Result<Vec<LineItem>, EngineError> {
        let cart = self.get_cart(cart_id).await?;
        let mut items = Vec::with_capacity(cart.items.len());
        for p in &cart.items {
            let Some(rs) = self.get_court(&p.court_id) else {
                continue;
            };
            let guard = rs.read().await;
            if let Some(item) = guard.line_item(&p.id) {
                items.push(item.clone());
            }
        }
        Ok(items)
    }

    /// First blocking reservation on `court_id` overlapping `span`.
    pub async fn find_conflict(
        &self,
        court_id: Ulid,
        span: Span,
        excluding: Option<Ulid>,
    ) -> Result<Option<Reservation>, EngineError> {
        let rs = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        let exclude: Vec<Ulid> = excluding.into_iter().collect();
        Ok(find_conflict(&guard, &span, &exclude).cloned())
    }

    /// Business-hours slots of `minutes` length on `date`, each flagged free
    /// when nothing (reservation or pending line-item) holds any part of it.
    pub async fn free_slots(
        &self,
        court_id: Ulid,
        date: NaiveDate,
        minutes: u32,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        if minutes == 0 {
            return Err(EngineError::invalid("slot length must be positive"));
        }
        let slots = generate_slots(
            date,
            self.policy.business_open,
            self.policy.business_close,
            minutes,
        );
        if slots.len() > MAX_SLOTS_PER_QUERY {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        let rs = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let guard = rs.read().await;
        let active = guard.active;
        Ok(slots
            .into_iter()
            .map(|(start, end, span)| SlotInfo {
                court_id,
                start,
                end,
                span,
                free: active && is_free(&guard, &span),
            })
            .collect())
    }
}
