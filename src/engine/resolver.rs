use serde_json::json;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::collab::{CourtEventKind, MailTemplate};
use crate::interval::normalize;
use crate::limits::*;
use crate::model::*;

use super::calendar::{Conflict, ConflictClass, competing_holders, own_overlap};
use super::tx::Tx;
use super::{Engine, EngineError, Receipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Admitted { cart_id: Ulid, line_item_id: Ulid },
    Waitlisted { entry_id: Ulid, position: u32 },
}

/// What to do with a request given the holders already on its interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<'a> {
    Admit,
    /// Privileged requester admitted over a soft holder.
    Overbook(&'a Conflict),
    Waitlist(&'a Conflict),
    Reject(&'a Conflict),
}

/// Pure conflict policy. An approved holder rejects everyone; a pending
/// holder waitlists regular users and is overridden by staff and admins.
/// A regular user never queues behind their own hold.
pub fn decide<'a>(requester: &Actor, holders: &'a [Conflict]) -> Decision<'a> {
    if let Some(hard) = holders.iter().find(|h| h.class == ConflictClass::Hard) {
        return Decision::Reject(hard);
    }
    let Some(first) = holders.first() else {
        return Decision::Admit;
    };
    if requester.role.is_privileged() {
        return Decision::Overbook(first);
    }
    match holders.iter().find(|h| h.owner == requester.id) {
        Some(own) => Decision::Reject(own),
        None => Decision::Waitlist(first),
    }
}

fn validate_request(request: &TimeSlotRequest) -> Result<Span, EngineError> {
    let span = normalize(request.date, request.start, request.end)
        .ok_or_else(|| EngineError::invalid("date/time out of range"))?;
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::invalid("slot longer than one day"));
    }
    if request.player_count == 0 {
        return Err(EngineError::invalid("player count must be at least 1"));
    }
    if request.player_count > MAX_PLAYERS_PER_SLOT {
        return Err(EngineError::LimitExceeded("too many players"));
    }
    if let Some(ref sport) = request.sport
        && sport.len() > MAX_SPORT_LEN
    {
        return Err(EngineError::LimitExceeded("sport name too long"));
    }
    if let Some(ref booked_for) = request.booked_for
        && booked_for.name.trim().is_empty()
    {
        return Err(EngineError::invalid("booked_for name must not be empty"));
    }
    Ok(span)
}

impl Engine {
    /// Admit a requested slot into the requester's open cart, waitlist it,
    /// or reject it. The conflict check and the insert run under the same
    /// court lock.
    pub async fn submit_request(
        &self,
        actor: &Actor,
        request: TimeSlotRequest,
    ) -> Result<Receipt<SubmitOutcome>, EngineError> {
        let span = validate_request(&request)?;
        let court_id = request.court_id;
        let price = self.collab.pricing.price(court_id, &span);
        if let Some(quoted) = request.quoted_price
            && quoted != price
        {
            return Err(EngineError::invalid(format!(
                "quoted price {quoted} does not match current price {price}"
            )));
        }

        let open_cart = self.open_carts.get(&actor.id).map(|e| *e.value());
        let mut tx = self.begin([court_id], open_cart).await?;

        let court = tx.court(&court_id)?;
        if !court.active {
            return Err(EngineError::invalid("court is not active"));
        }
        let cart_id = open_cart.filter(|id| {
            tx.cart(id)
                .is_ok_and(|c| c.status == CartStatus::Pending && c.owner.id == actor.id)
        });
        if let Some(cid) = cart_id {
            if let Some(dup) = own_overlap(court, &span, cid) {
                return Err(EngineError::Conflict {
                    holder: dup.id,
                    kind: super::HolderKind::LineItem,
                });
            }
            if tx.cart(&cid)?.items.len() >= MAX_ITEMS_PER_CART {
                return Err(EngineError::LimitExceeded("too many items in cart"));
            }
        }

        let holders = competing_holders(court, &span, cart_id);
        let outcome = match decide(actor, &holders) {
            Decision::Reject(c) => {
                metrics::counter!(crate::observability::REQUESTS_TOTAL, "outcome" => "rejected")
                    .increment(1);
                debug!(court_id = %court_id, holder = %c.holder, "request rejected");
                return Err(EngineError::Conflict { holder: c.holder, kind: c.kind });
            }
            Decision::Waitlist(c) => {
                let blocker = c.holder;
                let outcome = enqueue(&mut tx, actor, request, span, price, blocker)?;
                metrics::counter!(crate::observability::REQUESTS_TOTAL, "outcome" => "waitlisted")
                    .increment(1);
                outcome
            }
            Decision::Overbook(c) => {
                warn!(
                    court_id = %court_id,
                    actor = %actor.id,
                    role = actor.role.as_str(),
                    holder = %c.holder,
                    "privileged overbooking over pending hold"
                );
                let outcome = admit(&mut tx, actor, cart_id, request, span, price)?;
                metrics::counter!(crate::observability::REQUESTS_TOTAL, "outcome" => "overbooked")
                    .increment(1);
                outcome
            }
            Decision::Admit => {
                let outcome = admit(&mut tx, actor, cart_id, request, span, price)?;
                metrics::counter!(crate::observability::REQUESTS_TOTAL, "outcome" => "admitted")
                    .increment(1);
                outcome
            }
        };
        self.finish(tx, outcome).await
    }
}

fn admit(
    tx: &mut Tx,
    actor: &Actor,
    cart_id: Option<Ulid>,
    request: TimeSlotRequest,
    span: Span,
    price: Money,
) -> Result<SubmitOutcome, EngineError> {
    let mut cart = match cart_id {
        Some(id) => tx.cart(&id)?.clone(),
        None => Cart::new(Ulid::new(), *actor, tx.now),
    };
    let item = LineItem {
        id: Ulid::new(),
        cart_id: cart.id,
        court_id: request.court_id,
        owner: actor.id,
        sport: request.sport,
        date: request.date,
        start: request.start,
        end: request.end,
        span,
        price,
        player_count: request.player_count,
        status: ItemStatus::Pending,
        waitlist_entry_id: None,
        booked_for: request.booked_for,
        reservation_id: None,
        created_at: tx.now,
        updated_at: tx.now,
    };
    let outcome = SubmitOutcome::Admitted { cart_id: cart.id, line_item_id: item.id };

    cart.items.push(Placement { court_id: item.court_id, id: item.id });
    cart.aggregate_price += price;
    tx.broadcast(item.court_id, CourtEventKind::ItemAdmitted, item.id, Some(span));
    tx.save_line_item(item)?;
    tx.save_cart(cart)?;
    Ok(outcome)
}

/// Queue the request behind `blocker`. A user already queued for the same
/// interval gets their existing place back.
fn enqueue(
    tx: &mut Tx,
    actor: &Actor,
    request: TimeSlotRequest,
    span: Span,
    price: Money,
    blocker: Ulid,
) -> Result<SubmitOutcome, EngineError> {
    let court_id = request.court_id;
    let court = tx.court(&court_id)?;
    let queued: Vec<&WaitlistEntry> = court
        .waitlist
        .iter()
        .filter(|e| e.span == span && e.status.is_open())
        .collect();
    if let Some(existing) = queued.iter().find(|e| e.requested_by.id == actor.id) {
        return Ok(SubmitOutcome::Waitlisted {
            entry_id: existing.id,
            position: existing.position,
        });
    }
    if queued.len() >= MAX_WAITLIST_PER_SLOT {
        return Err(EngineError::LimitExceeded("waitlist full for this slot"));
    }
    let position = queued.iter().map(|e| e.position).max().unwrap_or(0) + 1;

    let entry = WaitlistEntry {
        id: Ulid::new(),
        court_id,
        span,
        requested_by: *actor,
        request,
        price,
        position,
        status: WaitlistStatus::Pending,
        blocker_id: blocker,
        expires_at: None,
        reservation_id: None,
        created_at: tx.now,
        updated_at: tx.now,
    };
    let outcome = SubmitOutcome::Waitlisted { entry_id: entry.id, position };

    tx.mail(
        MailTemplate::Waitlisted,
        actor.id,
        json!({
            "entry_id": entry.id.to_string(),
            "court_id": court_id.to_string(),
            "start": span.start,
            "end": span.end,
            "position": position,
        }),
    );
    tx.broadcast(court_id, CourtEventKind::Waitlisted, entry.id, Some(span));
    tx.save_waitlist_entry(entry)?;
    Ok(outcome)
}
