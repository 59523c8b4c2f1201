use std::collections::VecDeque;

use serde_json::json;
use tracing::{debug, info};
use ulid::Ulid;

use crate::collab::{CourtEventKind, MailTemplate};
use crate::limits::MAX_CASCADE_STEPS;
use crate::model::*;

use super::calendar::{ConflictClass, competing_holders};
use super::committer::new_check_in_code;
use super::tx::Tx;
use super::{Engine, EngineError, Receipt, Target, owns_or_privileged};

/// Something happened to a slot holder that waitlist entries may care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Trigger {
    /// Holder let go (rejected, cancelled, expired, removed).
    Freed { court_id: Ulid, holder: Ulid },
    /// Holder was approved; the slot is gone.
    Taken { court_id: Ulid, holder: Ulid },
}

impl Engine {
    /// Run waitlist consequences to a fixed point inside the caller's transaction.
    pub(super) async fn settle(&self, tx: &mut Tx, triggers: Vec<Trigger>) -> Result<(), EngineError> {
        let mut queue: VecDeque<Trigger> = triggers.into();
        let mut steps = 0;
        while let Some(trigger) = queue.pop_front() {
            steps += 1;
            if steps > MAX_CASCADE_STEPS {
                return Err(EngineError::state("waitlist cascade did not settle"));
            }
            match trigger {
                Trigger::Freed { court_id, holder } => {
                    let mut spans: Vec<Span> = tx
                        .court(&court_id)?
                        .waitlist
                        .iter()
                        .filter(|e| e.blocker_id == holder && e.status == WaitlistStatus::Pending)
                        .map(|e| e.span)
                        .collect();
                    spans.sort_by_key(|s| (s.start, s.end));
                    spans.dedup();
                    for span in spans {
                        self.promote_head(tx, court_id, span, &mut queue).await?;
                    }
                }
                Trigger::Taken { court_id, holder } => {
                    let entries: Vec<WaitlistEntry> = tx
                        .court(&court_id)?
                        .waitlist
                        .iter()
                        .filter(|e| e.blocker_id == holder && e.status.is_open())
                        .cloned()
                        .collect();
                    for entry in entries {
                        self.close_entry(tx, entry, WaitlistStatus::Cancelled, &mut queue)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The slot's last holder went away. Only the lowest-position pending
    /// entry moves; everyone behind it now waits on what it spawned.
    async fn promote_head(
        &self,
        tx: &mut Tx,
        court_id: Ulid,
        span: Span,
        queue: &mut VecDeque<Trigger>,
    ) -> Result<(), EngineError> {
        let court = tx.court(&court_id)?;
        let mut pending: Vec<WaitlistEntry> = court
            .waitlist
            .iter()
            .filter(|e| e.span == span && e.status == WaitlistStatus::Pending)
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_by_key(|e| e.position);

        let holders = competing_holders(court, &span, None);
        if holders.iter().any(|h| h.class == ConflictClass::Hard) {
            for entry in pending {
                self.close_entry(tx, entry, WaitlistStatus::Cancelled, queue).await?;
            }
            return Ok(());
        }
        if let Some(soft) = holders.first() {
            let holder = soft.holder;
            debug!(court_id = %court_id, %holder, "slot still held; re-pointing waitlist");
            for mut entry in pending {
                if entry.blocker_id != holder {
                    entry.blocker_id = holder;
                    tx.save_waitlist_entry(entry)?;
                }
            }
            return Ok(());
        }

        let head = pending.remove(0);
        let reservation_id = self.spawn_for(tx, head)?;
        for mut entry in pending {
            entry.blocker_id = reservation_id;
            tx.save_waitlist_entry(entry)?;
        }
        Ok(())
    }

    /// Give the head entry a real booking: a checked-out cart with one
    /// line-item and a pending, unpaid reservation with a payment deadline.
    fn spawn_for(&self, tx: &mut Tx, mut head: WaitlistEntry) -> Result<Ulid, EngineError> {
        let now = tx.now;
        let owner = head.requested_by;
        let mut cart = Cart::new(Ulid::new(), owner, now);
        let reservation_id = Ulid::new();
        let item = LineItem {
            id: Ulid::new(),
            cart_id: cart.id,
            court_id: head.court_id,
            owner: owner.id,
            sport: head.request.sport.clone(),
            date: head.request.date,
            start: head.request.start,
            end: head.request.end,
            span: head.span,
            price: head.price,
            player_count: head.request.player_count,
            status: ItemStatus::Completed,
            waitlist_entry_id: Some(head.id),
            booked_for: head.request.booked_for.clone(),
            reservation_id: Some(reservation_id),
            created_at: now,
            updated_at: now,
        };
        let reservation = Reservation {
            id: reservation_id,
            court_id: head.court_id,
            owner: owner.id,
            booked_for: head.request.booked_for.clone(),
            date: head.request.date,
            span: head.span,
            price: head.price,
            player_count: head.request.player_count,
            status: ReservationStatus::Pending,
            payment: PaymentStatus::Unpaid,
            attendance: Attendance::default(),
            cart_id: Some(cart.id),
            waitlist_entry_id: Some(head.id),
            line_item_ids: vec![item.id],
            check_in_code: new_check_in_code(),
            approver: None,
            rejection_reason: None,
            payment_evidence: None,
            created_at: now,
            updated_at: now,
        };
        cart.items.push(Placement { court_id: head.court_id, id: item.id });
        cart.reservations.push(Placement { court_id: head.court_id, id: reservation_id });
        cart.aggregate_price = head.price;
        cart.status = CartStatus::Completed;

        let deadline = self.collab.deadlines.payment_deadline(now);
        head.status = WaitlistStatus::Notified;
        head.reservation_id = Some(reservation_id);
        head.expires_at = Some(deadline);

        info!(
            court_id = %head.court_id,
            entry_id = %head.id,
            position = head.position,
            %reservation_id,
            "waitlist head promoted"
        );
        metrics::counter!(crate::observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
        tx.mail(
            MailTemplate::WaitlistPromoted,
            owner.id,
            json!({
                "entry_id": head.id.to_string(),
                "reservation_id": reservation_id.to_string(),
                "court_id": head.court_id.to_string(),
                "start": head.span.start,
                "end": head.span.end,
                "pay_by": deadline,
            }),
        );
        tx.broadcast(head.court_id, CourtEventKind::WaitlistPromoted, head.id, Some(head.span));

        tx.save_cart(cart)?;
        tx.save_line_item(item)?;
        tx.save_reservation(reservation)?;
        tx.save_waitlist_entry(head)?;
        Ok(reservation_id)
    }

    /// Close an open entry. A reservation it spawned that is still pending
    /// is cancelled with it, which frees the slot for the next in line.
    pub(super) async fn close_entry(
        &self,
        tx: &mut Tx,
        mut entry: WaitlistEntry,
        status: WaitlistStatus,
        queue: &mut VecDeque<Trigger>,
    ) -> Result<(), EngineError> {
        if !entry.status.is_open() {
            return Ok(());
        }
        if let Some(rid) = entry.reservation_id {
            let spawned = tx.reservation(&entry.court_id, &rid)?;
            if spawned.status == ReservationStatus::Pending {
                self.set_reservation_status(tx, entry.court_id, rid, ReservationStatus::Cancelled, None)
                    .await?;
                queue.push_back(Trigger::Freed { court_id: entry.court_id, holder: rid });
            }
        }
        let template = match status {
            WaitlistStatus::Expired => MailTemplate::WaitlistExpired,
            _ => MailTemplate::WaitlistCancelled,
        };
        tx.mail(
            template,
            entry.requested_by.id,
            json!({
                "entry_id": entry.id.to_string(),
                "court_id": entry.court_id.to_string(),
                "start": entry.span.start,
                "end": entry.span.end,
            }),
        );
        debug!(entry_id = %entry.id, status = status.as_str(), "waitlist entry closed");
        entry.status = status;
        tx.save_waitlist_entry(entry)
    }

    /// A promoted entry whose booking was paid for or approved is done.
    pub(super) fn convert_entry(&self, tx: &mut Tx, court_id: Ulid, entry_id: Ulid) -> Result<(), EngineError> {
        let mut entry = tx.waitlist_entry(&court_id, &entry_id)?.clone();
        if entry.status != WaitlistStatus::Notified {
            return Ok(());
        }
        entry.status = WaitlistStatus::Converted;
        tx.save_waitlist_entry(entry)
    }

    /// Withdraw from the waitlist. Withdrawing after promotion also drops
    /// the spawned booking and passes the slot on.
    pub async fn cancel_waitlist_entry(&self, actor: &Actor, entry_id: Ulid) -> Result<Receipt<()>, EngineError> {
        let (mut tx, target) = self.lock_target(entry_id).await?;
        let Target::Waitlist { court_id, .. } = target else {
            return Err(EngineError::invalid("target is not a waitlist entry"));
        };
        let entry = tx.waitlist_entry(&court_id, &entry_id)?.clone();
        owns_or_privileged(actor, entry.requested_by.id)?;
        if !entry.status.is_open() {
            return Err(EngineError::state(format!("waitlist entry is {}", entry.status.as_str())));
        }
        let mut queue = VecDeque::new();
        self.close_entry(&mut tx, entry, WaitlistStatus::Cancelled, &mut queue).await?;
        self.settle(&mut tx, queue.into()).await?;
        self.finish(tx, ()).await
    }

    /// Notified entries whose payment deadline passed.
    pub fn lapsed_promotions(&self) -> Vec<Ulid> {
        let now = self.now();
        let courts: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut lapsed = Vec::new();
        for shared in courts {
            // Skip contended courts; the next sweep picks them up.
            let Ok(rs) = shared.try_read() else {
                continue;
            };
            lapsed.extend(
                rs.waitlist
                    .iter()
                    .filter(|e| {
                        e.status == WaitlistStatus::Notified && e.expires_at.is_some_and(|t| t <= now)
                    })
                    .map(|e| e.id),
            );
        }
        lapsed
    }

    /// Expire one promoted entry whose deadline passed and promote the next.
    /// Returns false when there was nothing to do.
    pub async fn expire_promotion(&self, entry_id: Ulid) -> Result<bool, EngineError> {
        let (mut tx, target) = self.lock_target(entry_id).await?;
        let Target::Waitlist { court_id, .. } = target else {
            return Ok(false);
        };
        let entry = tx.waitlist_entry(&court_id, &entry_id)?.clone();
        let lapsed = entry.status == WaitlistStatus::Notified
            && entry.expires_at.is_some_and(|t| t <= tx.now);
        if !lapsed {
            return Ok(false);
        }
        if let Some(rid) = entry.reservation_id
            && tx.reservation(&court_id, &rid)?.payment == PaymentStatus::Paid
        {
            self.convert_entry(&mut tx, court_id, entry_id)?;
            self.finish(tx, ()).await?;
            return Ok(false);
        }
        info!(court_id = %court_id, %entry_id, "promoted waitlist entry expired unpaid");
        let mut queue = VecDeque::new();
        self.close_entry(&mut tx, entry, WaitlistStatus::Expired, &mut queue).await?;
        self.settle(&mut tx, queue.into()).await?;
        self.finish(tx, ()).await?;
        metrics::counter!(crate::observability::SWEEP_EXPIRED_TOTAL, "kind" => "waitlist").increment(1);
        Ok(true)
    }
}
