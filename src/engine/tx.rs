use std::collections::BTreeMap;

use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::collab::{CourtEvent, CourtEventKind, Effect, MailTemplate};
use crate::model::*;

use super::{EngineError, apply_to_court};

/// An open unit of work. Holds the locks it was begun with and a scratch
/// copy of everything they guard; dropping it without commit is a rollback.
pub(super) struct Tx {
    pub now: Ms,
    gate: OwnedRwLockReadGuard<()>,
    court_guards: BTreeMap<Ulid, OwnedRwLockWriteGuard<CourtState>>,
    courts: BTreeMap<Ulid, CourtState>,
    cart_guards: BTreeMap<Ulid, OwnedMutexGuard<Cart>>,
    carts: BTreeMap<Ulid, Cart>,
    events: Vec<Event>,
    effects: Vec<Effect>,
}

pub(super) struct TxParts {
    pub now: Ms,
    pub _gate: OwnedRwLockReadGuard<()>,
    pub court_guards: BTreeMap<Ulid, OwnedRwLockWriteGuard<CourtState>>,
    pub courts: BTreeMap<Ulid, CourtState>,
    pub cart_guards: BTreeMap<Ulid, OwnedMutexGuard<Cart>>,
    pub carts: BTreeMap<Ulid, Cart>,
    pub events: Vec<Event>,
    pub effects: Vec<Effect>,
}

impl Tx {
    pub fn new(now: Ms, gate: OwnedRwLockReadGuard<()>) -> Self {
        Self {
            now,
            gate,
            court_guards: BTreeMap::new(),
            courts: BTreeMap::new(),
            cart_guards: BTreeMap::new(),
            carts: BTreeMap::new(),
            events: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn hold_court(&mut self, guard: OwnedRwLockWriteGuard<CourtState>) {
        self.courts.insert(guard.id, (*guard).clone());
        self.court_guards.insert(guard.id, guard);
    }

    pub fn hold_cart(&mut self, guard: OwnedMutexGuard<Cart>) {
        self.carts.insert(guard.id, (*guard).clone());
        self.cart_guards.insert(guard.id, guard);
    }

    pub fn into_parts(self) -> TxParts {
        TxParts {
            now: self.now,
            _gate: self.gate,
            court_guards: self.court_guards,
            courts: self.courts,
            cart_guards: self.cart_guards,
            carts: self.carts,
            events: self.events,
            effects: self.effects,
        }
    }

    // ── Reads (see this transaction's own writes) ────────────

    pub fn holds_court(&self, id: &Ulid) -> bool {
        self.courts.contains_key(id)
    }

    pub fn has_cart(&self, id: &Ulid) -> bool {
        self.carts.contains_key(id)
    }

    pub fn court(&self, id: &Ulid) -> Result<&CourtState, EngineError> {
        self.courts.get(id).ok_or(EngineError::NotFound(*id))
    }

    pub fn cart(&self, id: &Ulid) -> Result<&Cart, EngineError> {
        self.carts.get(id).ok_or(EngineError::NotFound(*id))
    }

    pub fn line_item(&self, court_id: &Ulid, id: &Ulid) -> Result<&LineItem, EngineError> {
        self.court(court_id)?
            .line_item(id)
            .ok_or(EngineError::NotFound(*id))
    }

    pub fn reservation(&self, court_id: &Ulid, id: &Ulid) -> Result<&Reservation, EngineError> {
        self.court(court_id)?
            .reservation(id)
            .ok_or(EngineError::NotFound(*id))
    }

    pub fn waitlist_entry(&self, court_id: &Ulid, id: &Ulid) -> Result<&WaitlistEntry, EngineError> {
        self.court(court_id)?
            .waitlist_entry(id)
            .ok_or(EngineError::NotFound(*id))
    }

    // ── Writes ───────────────────────────────────────────────

    /// Apply an event to the scratch state and queue it for the WAL.
    pub fn record(&mut self, event: Event) -> Result<(), EngineError> {
        match &event {
            Event::CartSaved(cart) => {
                self.carts.insert(cart.id, cart.clone());
            }
            other => {
                let court_id = other.court_id().ok_or(EngineError::state("unscoped event"))?;
                let rs = self
                    .courts
                    .get_mut(&court_id)
                    .ok_or(EngineError::state("court not locked by this transaction"))?;
                apply_to_court(rs, other);
            }
        }
        self.events.push(event);
        Ok(())
    }

    pub fn save_line_item(&mut self, mut item: LineItem) -> Result<(), EngineError> {
        item.updated_at = self.now;
        self.record(Event::LineItemSaved(item))
    }

    pub fn save_reservation(&mut self, mut reservation: Reservation) -> Result<(), EngineError> {
        reservation.updated_at = self.now;
        self.record(Event::ReservationSaved(reservation))
    }

    pub fn save_waitlist_entry(&mut self, mut entry: WaitlistEntry) -> Result<(), EngineError> {
        entry.updated_at = self.now;
        self.record(Event::WaitlistSaved(entry))
    }

    pub fn save_cart(&mut self, mut cart: Cart) -> Result<(), EngineError> {
        cart.updated_at = self.now;
        self.record(Event::CartSaved(cart))
    }

    pub fn mail(&mut self, template: MailTemplate, recipient: Ulid, data: serde_json::Value) {
        self.effects.push(Effect::Mail { template, recipient, data });
    }

    pub fn broadcast(&mut self, court_id: Ulid, kind: CourtEventKind, subject_id: Ulid, span: Option<Span>) {
        self.effects.push(Effect::Broadcast(CourtEvent {
            court_id,
            kind,
            subject_id,
            span,
        }));
    }
}
