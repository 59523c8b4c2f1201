use std::collections::VecDeque;

use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::collab::{CourtEventKind, MailTemplate};
use crate::limits::MAX_REASON_LEN;
use crate::model::*;

use super::tx::Tx;
use super::waitlist::Trigger;
use super::{Engine, EngineError, Receipt, Target, owns_or_privileged};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    /// Nothing changed and no side effects ran.
    AlreadyApproved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOutcome {
    Rejected,
    AlreadyRejected,
}

fn item_status_for(status: ReservationStatus) -> Option<ItemStatus> {
    match status {
        ReservationStatus::Approved => Some(ItemStatus::Approved),
        ReservationStatus::Rejected => Some(ItemStatus::Rejected),
        ReservationStatus::Cancelled => Some(ItemStatus::Cancelled),
        _ => None,
    }
}

fn mail_for(status: ReservationStatus) -> Option<(MailTemplate, CourtEventKind)> {
    match status {
        ReservationStatus::Approved => Some((MailTemplate::ReservationApproved, CourtEventKind::ReservationApproved)),
        ReservationStatus::Rejected => Some((MailTemplate::ReservationRejected, CourtEventKind::ReservationRejected)),
        ReservationStatus::Cancelled => Some((MailTemplate::ReservationCancelled, CourtEventKind::ReservationCancelled)),
        _ => None,
    }
}

fn require_privileged(actor: &Actor) -> Result<(), EngineError> {
    if actor.role.is_privileged() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized("staff or admin role required"))
    }
}

impl Engine {
    /// Move a reservation to `status`, mirror it onto its line-items and
    /// refresh the owning cart's aggregate status.
    pub(super) async fn set_reservation_status(
        &self,
        tx: &mut Tx,
        court_id: Ulid,
        id: Ulid,
        status: ReservationStatus,
        actor: Option<&Actor>,
    ) -> Result<(), EngineError> {
        let mut r = tx.reservation(&court_id, &id)?.clone();
        r.status = status;
        if let Some(actor) = actor
            && matches!(status, ReservationStatus::Approved | ReservationStatus::Rejected)
        {
            r.approver = Some(actor.id);
        }

        if let Some(item_status) = item_status_for(status) {
            for item_id in &r.line_item_ids {
                let mut item = tx.line_item(&court_id, item_id)?.clone();
                item.status = item_status;
                tx.save_line_item(item)?;
            }
        }
        if let Some((template, kind)) = mail_for(status) {
            tx.mail(
                template,
                r.owner,
                json!({
                    "reservation_id": id.to_string(),
                    "court_id": court_id.to_string(),
                    "start": r.span.start,
                    "end": r.span.end,
                    "reason": r.rejection_reason,
                }),
            );
            tx.broadcast(court_id, kind, id, Some(r.span));
        }
        info!(reservation_id = %id, status = status.as_str(), "reservation status changed");

        let cart_id = r.cart_id;
        tx.save_reservation(r)?;
        if let Some(cart_id) = cart_id {
            self.refresh_cart(tx, cart_id, actor).await?;
        }
        Ok(())
    }

    /// Recompute a checked-out cart's approval and payment from its
    /// reservations.
    pub(super) async fn refresh_cart(&self, tx: &mut Tx, cart_id: Ulid, actor: Option<&Actor>) -> Result<(), EngineError> {
        self.join_cart(tx, cart_id).await?;
        let mut cart = tx.cart(&cart_id)?.clone();
        if cart.reservations.is_empty() {
            return Ok(());
        }
        let mut approvals = Vec::with_capacity(cart.reservations.len());
        let mut all_paid = true;
        for p in &cart.reservations {
            let r = tx.reservation(&p.court_id, &p.id)?;
            approvals.push(r.status.approval());
            if r.status.blocks_slot() && r.payment != PaymentStatus::Paid {
                all_paid = false;
            }
        }
        let approval = if approvals.iter().any(|a| *a == ApprovalStatus::Pending) {
            ApprovalStatus::Pending
        } else if approvals.iter().any(|a| *a == ApprovalStatus::Approved) {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let payment = if all_paid { PaymentStatus::Paid } else { PaymentStatus::Unpaid };
        if approval == cart.approval && payment == cart.payment {
            return Ok(());
        }
        if approval != cart.approval && approval != ApprovalStatus::Pending {
            cart.approver = actor.map(|a| a.id);
        }
        cart.approval = approval;
        cart.payment = payment;
        tx.save_cart(cart)
    }

    /// Approve a pending reservation, or every pending reservation of a
    /// checked-out cart. Anyone waiting on an approved slot is told it is gone.
    pub async fn approve(&self, actor: &Actor, target: Ulid) -> Result<Receipt<ApprovalOutcome>, EngineError> {
        require_privileged(actor)?;
        let (mut tx, located) = self.lock_target(target).await?;

        let to_approve: Vec<Placement> = match located {
            Target::Cart(cart_id) => {
                let cart = tx.cart(&cart_id)?;
                if cart.status != CartStatus::Completed {
                    return Err(EngineError::state("cart has not been checked out"));
                }
                match cart.approval {
                    ApprovalStatus::Approved => return self.finish(tx, ApprovalOutcome::AlreadyApproved).await,
                    ApprovalStatus::Rejected => return Err(EngineError::state("cart was rejected")),
                    ApprovalStatus::Pending => {}
                }
                let placements = cart.reservations.clone();
                let mut pending = Vec::new();
                for p in placements {
                    if tx.reservation(&p.court_id, &p.id)?.status == ReservationStatus::Pending {
                        pending.push(p);
                    }
                }
                pending
            }
            Target::Reservation { court_id, .. } => {
                match tx.reservation(&court_id, &target)?.status {
                    ReservationStatus::Pending => vec![Placement { court_id, id: target }],
                    ReservationStatus::Approved | ReservationStatus::CheckedIn | ReservationStatus::Completed => {
                        return self.finish(tx, ApprovalOutcome::AlreadyApproved).await;
                    }
                    other => return Err(EngineError::state(format!("reservation is {}", other.as_str()))),
                }
            }
            _ => return Err(EngineError::invalid("target is not a cart or reservation")),
        };

        let mut triggers = Vec::with_capacity(to_approve.len());
        for p in to_approve {
            self.set_reservation_status(&mut tx, p.court_id, p.id, ReservationStatus::Approved, Some(actor))
                .await?;
            if let Some(entry_id) = tx.reservation(&p.court_id, &p.id)?.waitlist_entry_id {
                self.convert_entry(&mut tx, p.court_id, entry_id)?;
            }
            triggers.push(Trigger::Taken { court_id: p.court_id, holder: p.id });
        }
        self.settle(&mut tx, triggers).await?;
        metrics::counter!(crate::observability::APPROVALS_TOTAL, "decision" => "approved").increment(1);
        self.finish(tx, ApprovalOutcome::Approved).await
    }

    /// Reject a reservation or a whole checked-out cart. Staff may only
    /// reject pending bookings; reversing an approval takes an admin.
    pub async fn reject(
        &self,
        actor: &Actor,
        target: Ulid,
        reason: Option<String>,
    ) -> Result<Receipt<RejectionOutcome>, EngineError> {
        require_privileged(actor)?;
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("rejection reason too long"));
        }
        let (mut tx, located) = self.lock_target(target).await?;

        let may_reverse = actor.role == Role::Admin;
        let to_reject: Vec<Placement> = match located {
            Target::Cart(cart_id) => {
                let cart = tx.cart(&cart_id)?;
                if cart.status != CartStatus::Completed {
                    return Err(EngineError::state("cart has not been checked out"));
                }
                if cart.approval == ApprovalStatus::Rejected {
                    return self.finish(tx, RejectionOutcome::AlreadyRejected).await;
                }
                let placements = cart.reservations.clone();
                let mut open = Vec::new();
                for p in placements {
                    match tx.reservation(&p.court_id, &p.id)?.status {
                        ReservationStatus::Pending => open.push(p),
                        ReservationStatus::Approved if may_reverse => open.push(p),
                        ReservationStatus::Approved => {
                            return Err(EngineError::Unauthorized("only an admin may reject an approved booking"));
                        }
                        _ => {}
                    }
                }
                let mut cart = tx.cart(&cart_id)?.clone();
                cart.rejection_reason = reason.clone();
                tx.save_cart(cart)?;
                open
            }
            Target::Reservation { court_id, .. } => match tx.reservation(&court_id, &target)?.status {
                ReservationStatus::Pending => vec![Placement { court_id, id: target }],
                ReservationStatus::Approved if may_reverse => vec![Placement { court_id, id: target }],
                ReservationStatus::Approved => {
                    return Err(EngineError::Unauthorized("only an admin may reject an approved booking"));
                }
                ReservationStatus::Rejected => return self.finish(tx, RejectionOutcome::AlreadyRejected).await,
                other => return Err(EngineError::state(format!("reservation is {}", other.as_str()))),
            },
            _ => return Err(EngineError::invalid("target is not a cart or reservation")),
        };

        let mut triggers = Vec::with_capacity(to_reject.len());
        for p in to_reject {
            let mut r = tx.reservation(&p.court_id, &p.id)?.clone();
            r.rejection_reason = reason.clone();
            let spawned_from = r.waitlist_entry_id;
            tx.save_reservation(r)?;
            self.set_reservation_status(&mut tx, p.court_id, p.id, ReservationStatus::Rejected, Some(actor))
                .await?;
            if let Some(entry_id) = spawned_from {
                let entry = tx.waitlist_entry(&p.court_id, &entry_id)?.clone();
                let mut queue = VecDeque::new();
                self.close_entry(&mut tx, entry, WaitlistStatus::Cancelled, &mut queue).await?;
                triggers.extend(queue);
            }
            triggers.push(Trigger::Freed { court_id: p.court_id, holder: p.id });
        }
        self.settle(&mut tx, triggers).await?;
        metrics::counter!(crate::observability::APPROVALS_TOTAL, "decision" => "rejected").increment(1);
        self.finish(tx, RejectionOutcome::Rejected).await
    }

    /// Cancel a reservation. Owners may withdraw a pending booking; staff
    /// and admins may also cancel approved ones.
    pub async fn cancel_reservation(&self, actor: &Actor, id: Ulid) -> Result<Receipt<()>, EngineError> {
        let (mut tx, located) = self.lock_target(id).await?;
        let Target::Reservation { court_id, .. } = located else {
            return Err(EngineError::invalid("target is not a reservation"));
        };
        let r = tx.reservation(&court_id, &id)?;
        owns_or_privileged(actor, r.owner)?;
        match r.status {
            ReservationStatus::Pending => {}
            ReservationStatus::Approved if actor.role.is_privileged() => {}
            ReservationStatus::Approved => {
                return Err(EngineError::Unauthorized("approved bookings are cancelled by staff"));
            }
            other => return Err(EngineError::state(format!("reservation is {}", other.as_str()))),
        }
        let spawned_from = r.waitlist_entry_id;

        self.set_reservation_status(&mut tx, court_id, id, ReservationStatus::Cancelled, Some(actor))
            .await?;
        let mut triggers = Vec::new();
        if let Some(entry_id) = spawned_from {
            let entry = tx.waitlist_entry(&court_id, &entry_id)?.clone();
            let mut queue = VecDeque::new();
            self.close_entry(&mut tx, entry, WaitlistStatus::Cancelled, &mut queue).await?;
            triggers.extend(queue);
        }
        triggers.push(Trigger::Freed { court_id, holder: id });
        self.settle(&mut tx, triggers).await?;
        self.finish(tx, ()).await
    }

    /// Pay for a checked-out cart or a single reservation after the fact.
    pub async fn submit_payment(
        &self,
        actor: &Actor,
        target: Ulid,
        payment: PaymentInfo,
    ) -> Result<Receipt<()>, EngineError> {
        let (mut tx, located) = self.lock_target(target).await?;

        let (owner, placements) = match located {
            Target::Cart(cart_id) => {
                let cart = tx.cart(&cart_id)?;
                if cart.status != CartStatus::Completed {
                    return Err(EngineError::state("cart has not been checked out"));
                }
                if cart.payment == PaymentStatus::Paid {
                    return Err(EngineError::state("cart is already paid"));
                }
                (cart.owner.id, cart.reservations.clone())
            }
            Target::Reservation { court_id, .. } => {
                let r = tx.reservation(&court_id, &target)?;
                if r.payment == PaymentStatus::Paid {
                    return Err(EngineError::state("reservation is already paid"));
                }
                (r.owner, vec![Placement { court_id, id: target }])
            }
            _ => return Err(EngineError::invalid("target is not a cart or reservation")),
        };
        owns_or_privileged(actor, owner)?;

        let mut payable = Vec::new();
        for p in placements {
            let r = tx.reservation(&p.court_id, &p.id)?;
            if matches!(r.status, ReservationStatus::Pending | ReservationStatus::Approved)
                && r.payment == PaymentStatus::Unpaid
            {
                payable.push(r.clone());
            }
        }
        if payable.is_empty() {
            return Err(EngineError::state("nothing left to pay"));
        }

        let evidence = self.store_evidence(&payment).await?;
        let applied = self.apply_payment(&mut tx, payable, &evidence).await;
        let result = match applied {
            Ok(()) => self.finish(tx, ()).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.discard_evidence(Some(&evidence)).await;
        } else {
            info!(%target, "payment recorded");
        }
        result
    }

    async fn apply_payment(
        &self,
        tx: &mut Tx,
        payable: Vec<Reservation>,
        evidence: &PaymentEvidence,
    ) -> Result<(), EngineError> {
        let mut carts = Vec::new();
        for mut r in payable {
            r.payment = PaymentStatus::Paid;
            r.payment_evidence = Some(evidence.clone());
            let (court_id, entry_id) = (r.court_id, r.waitlist_entry_id);
            if let Some(cart_id) = r.cart_id
                && !carts.contains(&cart_id)
            {
                carts.push(cart_id);
            }
            tx.save_reservation(r)?;
            if let Some(entry_id) = entry_id {
                self.convert_entry(tx, court_id, entry_id)?;
            }
        }
        for cart_id in carts {
            self.refresh_cart(tx, cart_id, None).await?;
            let mut cart = tx.cart(&cart_id)?.clone();
            if cart.payment == PaymentStatus::Paid && cart.payment_evidence.is_none() {
                cart.payment_evidence = Some(evidence.clone());
                tx.save_cart(cart)?;
            }
        }
        Ok(())
    }

    /// Scan a check-in code. Each scan admits one player; the booking is
    /// completed once everyone is in.
    pub async fn check_in(&self, actor: &Actor, code: &str) -> Result<Receipt<u32>, EngineError> {
        require_privileged(actor)?;
        let id = self
            .check_in_codes
            .get(code.trim())
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::CheckInDenied("unknown check-in code".into()))?;
        let court_id = self.court_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let mut tx = self.begin([court_id], []).await?;
        let mut r = tx.reservation(&court_id, &id)?.clone();

        match r.status {
            ReservationStatus::Approved | ReservationStatus::CheckedIn => {}
            ReservationStatus::Completed => {
                return Err(EngineError::CheckInDenied("all players already checked in".into()));
            }
            other => return Err(EngineError::CheckInDenied(format!("reservation is {}", other.as_str()))),
        }
        if r.payment != PaymentStatus::Paid {
            return Err(EngineError::CheckInDenied("reservation is unpaid".into()));
        }
        let opens = r.span.start - self.policy.check_in_grace_ms;
        if tx.now < opens || tx.now >= r.span.end {
            return Err(EngineError::CheckInDenied("outside the check-in window".into()));
        }
        if r.attendance.players_checked_in >= r.player_count {
            return Err(EngineError::CheckInDenied("all players already checked in".into()));
        }

        r.attendance.players_checked_in += 1;
        r.attendance.first_check_in_at.get_or_insert(tx.now);
        r.status = if r.attendance.players_checked_in >= r.player_count {
            ReservationStatus::Completed
        } else {
            ReservationStatus::CheckedIn
        };
        let count = r.attendance.players_checked_in;
        info!(reservation_id = %id, players = count, of = r.player_count, "player checked in");
        tx.broadcast(court_id, CourtEventKind::CheckedIn, id, Some(r.span));
        tx.save_reservation(r)?;
        self.finish(tx, count).await
    }
}
