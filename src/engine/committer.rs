use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::NaiveDate;
use serde_json::json;
use tracing::{info, warn};
use ulid::Ulid;

use crate::collab::{CourtEventKind, MailTemplate};
use crate::limits::*;
use crate::model::*;

use super::calendar::find_conflict;
use super::tx::Tx;
use super::{Engine, EngineError, HolderKind, Receipt, owns_or_privileged};

/// Contiguous line-items on one court and date that commit as one reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGroup {
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub price: Money,
    pub player_count: u32,
    pub booked_for: Option<BookedFor>,
    pub item_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutReceipt {
    pub cart_id: Ulid,
    pub reservation_ids: Vec<Ulid>,
    /// Cart holding the pending items that were not selected.
    pub successor_cart_id: Option<Ulid>,
    pub total: Money,
}

/// Sort by (court, date, start) and merge runs where each item starts
/// exactly where the previous one ended. Ends are compared as absolute
/// instants, so a run ending at midnight is handled like any other.
pub fn group_line_items(items: &[LineItem]) -> Vec<SlotGroup> {
    let mut sorted: Vec<&LineItem> = items.iter().collect();
    sorted.sort_by_key(|i| (i.court_id, i.date, i.span.start));

    let mut groups: Vec<SlotGroup> = Vec::new();
    for item in sorted {
        if let Some(group) = groups.last_mut()
            && group.court_id == item.court_id
            && group.date == item.date
            && group.span.end == item.span.start
        {
            group.span.end = item.span.end;
            group.price += item.price;
            group.player_count = group.player_count.max(item.player_count);
            group.item_ids.push(item.id);
            continue;
        }
        groups.push(SlotGroup {
            court_id: item.court_id,
            date: item.date,
            span: item.span,
            price: item.price,
            player_count: item.player_count,
            booked_for: item.booked_for.clone(),
            item_ids: vec![item.id],
        });
    }
    groups
}

pub(super) fn new_check_in_code() -> String {
    Ulid::new().to_string()
}

impl Engine {
    /// Decode and persist payment proof. Runs before any row is touched so a
    /// storage failure leaves nothing half-written.
    pub(super) async fn store_evidence(&self, info: &PaymentInfo) -> Result<PaymentEvidence, EngineError> {
        if let Some(ref reference) = info.reference
            && reference.len() > MAX_REFERENCE_LEN
        {
            return Err(EngineError::LimitExceeded("payment reference too long"));
        }
        let proof_path = match info.proof {
            Some(ref encoded) => {
                let bytes = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| EngineError::invalid(format!("payment proof is not valid base64: {e}")))?;
                if bytes.len() > MAX_EVIDENCE_BYTES {
                    return Err(EngineError::LimitExceeded("payment proof too large"));
                }
                let path = self
                    .collab
                    .files
                    .store_file(&bytes)
                    .await
                    .map_err(|e| EngineError::Storage(e.to_string()))?;
                Some(path)
            }
            None => None,
        };
        Ok(PaymentEvidence {
            method: info.method.clone(),
            reference: info.reference.clone(),
            proof_path,
        })
    }

    /// Turn a cart's pending line-items (all, or the selected subset) into
    /// reservations. Either every step lands or none does.
    pub async fn checkout(
        &self,
        actor: &Actor,
        cart_id: Ulid,
        selected: Option<Vec<Ulid>>,
        payment: Option<PaymentInfo>,
    ) -> Result<Receipt<CheckoutReceipt>, EngineError> {
        let mut tx = self.begin_for_cart(cart_id, &[]).await?;
        let cart = tx.cart(&cart_id)?.clone();
        owns_or_privileged(actor, cart.owner.id)?;
        if cart.status != CartStatus::Pending {
            return Err(EngineError::state(format!("cart is {}", cart.status.as_str())));
        }

        let mut pending = Vec::new();
        for p in &cart.items {
            let item = tx.line_item(&p.court_id, &p.id)?;
            if item.status == ItemStatus::Pending {
                pending.push(item.clone());
            }
        }
        let (chosen, rest): (Vec<LineItem>, Vec<LineItem>) = match selected {
            Some(ids) => {
                if ids.is_empty() {
                    return Err(EngineError::invalid("no line-items selected"));
                }
                if let Some(missing) = ids.iter().find(|id| !pending.iter().any(|i| i.id == **id)) {
                    return Err(EngineError::invalid(format!(
                        "line-item {missing} is not a pending item of this cart"
                    )));
                }
                pending.into_iter().partition(|i| ids.contains(&i.id))
            }
            None => (pending, Vec::new()),
        };
        if chosen.is_empty() {
            return Err(EngineError::invalid("cart has no pending line-items"));
        }

        // 1. Re-check every final interval against committed reservations.
        let groups = group_line_items(&chosen);
        for (n, group) in groups.iter().enumerate() {
            let court = tx.court(&group.court_id)?;
            if !court.active {
                return Err(EngineError::invalid("court is not active"));
            }
            if let Some(r) = find_conflict(court, &group.span, &[]) {
                metrics::counter!(crate::observability::CHECKOUTS_TOTAL, "status" => "conflict")
                    .increment(1);
                return Err(EngineError::Conflict { holder: r.id, kind: HolderKind::Reservation });
            }
            if let Some(other) = groups[..n]
                .iter()
                .find(|g| g.court_id == group.court_id && g.span.overlaps(&group.span))
            {
                return Err(EngineError::Conflict {
                    holder: other.item_ids[0],
                    kind: HolderKind::LineItem,
                });
            }
        }

        // 2. Evidence before any write.
        let evidence = match payment {
            Some(ref info) => match self.store_evidence(info).await {
                Ok(ev) => Some(ev),
                Err(e) => {
                    metrics::counter!(crate::observability::CHECKOUTS_TOTAL, "status" => "storage_error")
                        .increment(1);
                    return Err(e);
                }
            },
            None => None,
        };
        let payment_status = if evidence.is_some() {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Unpaid
        };

        // 3-5. Reservations, line-items, cart. A failure from here on leaves
        // the stored proof orphaned, so it is removed again.
        let written = write_checkout(&mut tx, &cart, &groups, rest, evidence.clone(), payment_status);
        let result = match written {
            Ok(receipt) => self.finish(tx, receipt).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(receipt) => {
                info!(
                    cart_id = %cart_id,
                    reservations = receipt.value.reservation_ids.len(),
                    total = receipt.value.total,
                    paid = payment_status == PaymentStatus::Paid,
                    "checkout committed"
                );
                metrics::counter!(crate::observability::CHECKOUTS_TOTAL, "status" => "ok").increment(1);
                Ok(receipt)
            }
            Err(e) => {
                self.discard_evidence(evidence.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Remove proof stored for a transaction that never committed.
    pub(super) async fn discard_evidence(&self, evidence: Option<&PaymentEvidence>) {
        let Some(path) = evidence.and_then(|e| e.proof_path.as_deref()) else {
            return;
        };
        if let Err(e) = self.collab.files.remove_file(path).await {
            warn!(path, "could not remove orphaned payment proof: {e}");
        }
    }
}

/// Record the reservations, completed line-items, finished cart and any
/// successor cart for one checkout.
fn write_checkout(
    tx: &mut Tx,
    cart: &Cart,
    groups: &[SlotGroup],
    rest: Vec<LineItem>,
    evidence: Option<PaymentEvidence>,
    payment_status: PaymentStatus,
) -> Result<CheckoutReceipt, EngineError> {
    let cart_id = cart.id;
    let now = tx.now;
    let mut reservation_ids = Vec::with_capacity(groups.len());
    let mut placements = Vec::with_capacity(groups.len());
    for group in groups {
        let reservation = Reservation {
            id: Ulid::new(),
            court_id: group.court_id,
            owner: cart.owner.id,
            booked_for: group.booked_for.clone(),
            date: group.date,
            span: group.span,
            price: group.price,
            player_count: group.player_count,
            status: ReservationStatus::Pending,
            payment: payment_status,
            attendance: Attendance::default(),
            cart_id: Some(cart_id),
            waitlist_entry_id: None,
            line_item_ids: group.item_ids.clone(),
            check_in_code: new_check_in_code(),
            approver: None,
            rejection_reason: None,
            payment_evidence: evidence.clone(),
            created_at: now,
            updated_at: now,
        };
        let rid = reservation.id;

        for item_id in &group.item_ids {
            let mut item = tx.line_item(&group.court_id, item_id)?.clone();
            item.status = ItemStatus::Completed;
            item.reservation_id = Some(rid);
            tx.save_line_item(item)?;
        }

        // Entries queued behind a line-item now queue behind its reservation.
        let requeued: Vec<WaitlistEntry> = tx
            .court(&group.court_id)?
            .waitlist
            .iter()
            .filter(|e| e.status == WaitlistStatus::Pending && group.item_ids.contains(&e.blocker_id))
            .cloned()
            .collect();
        for mut entry in requeued {
            entry.blocker_id = rid;
            tx.save_waitlist_entry(entry)?;
        }

        tx.mail(
            MailTemplate::ReservationSubmitted,
            cart.owner.id,
            json!({
                "reservation_id": rid.to_string(),
                "court_id": group.court_id.to_string(),
                "start": group.span.start,
                "end": group.span.end,
                "price": group.price,
                "check_in_code": reservation.check_in_code,
            }),
        );
        tx.broadcast(group.court_id, CourtEventKind::ReservationCommitted, rid, Some(group.span));
        tx.save_reservation(reservation)?;
        reservation_ids.push(rid);
        placements.push(Placement { court_id: group.court_id, id: rid });
    }

    let total: Money = groups.iter().map(|g| g.price).sum();
    let mut done = cart.clone();
    done.items.retain(|p| !rest.iter().any(|i| i.id == p.id));
    done.reservations = placements;
    done.aggregate_price = total;
    done.status = CartStatus::Completed;
    done.payment = payment_status;
    done.payment_evidence = evidence;
    tx.save_cart(done)?;

    let successor_cart_id = if rest.is_empty() {
        None
    } else {
        let mut successor = Cart::new(Ulid::new(), cart.owner, now);
        successor.split_from = Some(cart_id);
        for mut item in rest {
            successor.items.push(Placement { court_id: item.court_id, id: item.id });
            successor.aggregate_price += item.price;
            item.cart_id = successor.id;
            tx.save_line_item(item)?;
        }
        let id = successor.id;
        tx.save_cart(successor)?;
        Some(id)
    };

    Ok(CheckoutReceipt {
        cart_id,
        reservation_ids,
        successor_cart_id,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    const H: Ms = 3_600_000;

    fn item(court_id: Ulid, day: u32, from_h: i64, to_h: i64, price: Money) -> LineItem {
        let date = NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
        let base = crate::interval::to_ms(date.and_hms_opt(0, 0, 0).unwrap());
        LineItem {
            id: Ulid::new(),
            cart_id: Ulid::nil(),
            court_id,
            owner: Ulid::nil(),
            sport: None,
            date,
            start: NaiveTime::from_hms_opt((from_h % 24) as u32, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt((to_h % 24) as u32, 0, 0).unwrap(),
            span: Span::new(base + from_h * H, base + to_h * H),
            price,
            player_count: 2,
            status: ItemStatus::Pending,
            waitlist_entry_id: None,
            booked_for: None,
            reservation_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn contiguous_items_merge() {
        let court = Ulid::new();
        // Deliberately out of order.
        let items = vec![
            item(court, 1, 11, 12, 300),
            item(court, 1, 9, 10, 100),
            item(court, 1, 10, 11, 200),
        ];
        let groups = group_line_items(&items);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].span.duration_ms(), 3 * H);
        assert_eq!(groups[0].price, 600);
        assert_eq!(groups[0].item_ids, vec![items[1].id, items[2].id, items[0].id]);
    }

    #[test]
    fn gap_splits_groups() {
        let court = Ulid::new();
        let items = vec![item(court, 1, 9, 10, 100), item(court, 1, 14, 15, 100)];
        assert_eq!(group_line_items(&items).len(), 2);
    }

    #[test]
    fn different_courts_or_dates_never_merge() {
        let a = Ulid::new();
        let b = Ulid::new();
        let items = vec![item(a, 1, 9, 10, 100), item(b, 1, 10, 11, 100)];
        assert_eq!(group_line_items(&items).len(), 2);

        // 23:00-24:00 on day 1 touches 00:00-01:00 on day 2 but the dates differ.
        let items = vec![item(a, 1, 23, 24, 100), item(a, 2, 0, 1, 100)];
        assert_eq!(group_line_items(&items).len(), 2);
    }

    #[test]
    fn player_count_is_the_largest_in_group() {
        let court = Ulid::new();
        let mut first = item(court, 1, 9, 10, 100);
        first.player_count = 4;
        let items = vec![first, item(court, 1, 10, 11, 100)];
        assert_eq!(group_line_items(&items)[0].player_count, 4);
    }
}
