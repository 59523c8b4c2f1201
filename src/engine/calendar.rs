use ulid::Ulid;

use crate::model::*;

use super::HolderKind;

/// How firmly a competing holder sits on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictClass {
    /// Approved (or later) reservation. Nobody gets in, nobody queues.
    Hard,
    /// Pending reservation or another cart's pending line-item.
    Soft,
}

/// One row currently holding part of a requested interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub holder: Ulid,
    pub kind: HolderKind,
    pub class: ConflictClass,
    pub owner: Ulid,
    pub span: Span,
}

/// First reservation that blocks `span`, ignoring the ids in `exclude`.
/// Only reservations count here; line-items are provisional.
pub fn find_conflict<'a>(court: &'a CourtState, span: &Span, exclude: &[Ulid]) -> Option<&'a Reservation> {
    overlapping(&court.reservations, span)
        .find(|r| r.status.blocks_slot() && !exclude.contains(&r.id))
}

fn classify(status: ReservationStatus) -> ConflictClass {
    match status.approval() {
        ApprovalStatus::Approved => ConflictClass::Hard,
        _ => ConflictClass::Soft,
    }
}

/// Every blocking reservation and every pending line-item outside
/// `own_cart` that overlaps `span`. Reservations come first, each group in
/// start order, so the first soft entry is the natural blocker.
pub fn competing_holders(court: &CourtState, span: &Span, own_cart: Option<Ulid>) -> Vec<Conflict> {
    let reservations = overlapping(&court.reservations, span)
        .filter(|r| r.status.blocks_slot())
        .map(|r| Conflict {
            holder: r.id,
            kind: HolderKind::Reservation,
            class: classify(r.status),
            owner: r.owner,
            span: r.span,
        });
    let items = overlapping(&court.line_items, span)
        .filter(|i| i.status == ItemStatus::Pending && Some(i.cart_id) != own_cart)
        .map(|i| Conflict {
            holder: i.id,
            kind: HolderKind::LineItem,
            class: ConflictClass::Soft,
            owner: i.owner,
            span: i.span,
        });
    reservations.chain(items).collect()
}

/// Pending line-item of `cart_id` already overlapping `span`.
pub(super) fn own_overlap<'a>(court: &'a CourtState, span: &Span, cart_id: Ulid) -> Option<&'a LineItem> {
    overlapping(&court.line_items, span)
        .find(|i| i.cart_id == cart_id && i.status == ItemStatus::Pending)
}

pub(super) fn is_free(court: &CourtState, span: &Span) -> bool {
    competing_holders(court, span, None).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const H: Ms = 3_600_000;

    fn court() -> CourtState {
        CourtState::new(Ulid::new(), Some("Court 1".into()))
    }

    fn reservation(court_id: Ulid, span: Span, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            court_id,
            owner: Ulid::new(),
            booked_for: None,
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            span,
            price: 0,
            player_count: 1,
            status,
            payment: PaymentStatus::Unpaid,
            attendance: Attendance::default(),
            cart_id: None,
            waitlist_entry_id: None,
            line_item_ids: Vec::new(),
            check_in_code: Ulid::new().to_string(),
            approver: None,
            rejection_reason: None,
            payment_evidence: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn item(court_id: Ulid, cart_id: Ulid, span: Span) -> LineItem {
        LineItem {
            id: Ulid::new(),
            cart_id,
            court_id,
            owner: Ulid::new(),
            sport: None,
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            start: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: chrono::NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            span,
            price: 0,
            player_count: 1,
            status: ItemStatus::Pending,
            waitlist_entry_id: None,
            booked_for: None,
            reservation_id: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn find_conflict_ignores_released_and_excluded() {
        let mut c = court();
        let span = Span::new(9 * H, 10 * H);
        let cancelled = reservation(c.id, span, ReservationStatus::Cancelled);
        let pending = reservation(c.id, span, ReservationStatus::Pending);
        c.upsert_reservation(cancelled);
        c.upsert_reservation(pending.clone());

        assert_eq!(find_conflict(&c, &span, &[]).map(|r| r.id), Some(pending.id));
        assert!(find_conflict(&c, &span, &[pending.id]).is_none());
        assert!(find_conflict(&c, &Span::new(10 * H, 11 * H), &[]).is_none());
    }

    #[test]
    fn approved_is_hard_pending_is_soft() {
        let mut c = court();
        let approved = reservation(c.id, Span::new(9 * H, 10 * H), ReservationStatus::Approved);
        let pending = reservation(c.id, Span::new(10 * H, 11 * H), ReservationStatus::Pending);
        c.upsert_reservation(approved.clone());
        c.upsert_reservation(pending.clone());

        let holders = competing_holders(&c, &Span::new(9 * H, 11 * H), None);
        assert_eq!(holders.len(), 2);
        assert_eq!(holders[0].holder, approved.id);
        assert_eq!(holders[0].class, ConflictClass::Hard);
        assert_eq!(holders[1].class, ConflictClass::Soft);
    }

    #[test]
    fn checked_in_is_hard() {
        let mut c = court();
        c.upsert_reservation(reservation(c.id, Span::new(9 * H, 10 * H), ReservationStatus::CheckedIn));
        let holders = competing_holders(&c, &Span::new(9 * H, 10 * H), None);
        assert_eq!(holders[0].class, ConflictClass::Hard);
    }

    #[test]
    fn own_cart_items_are_not_competitors() {
        let mut c = court();
        let cart = Ulid::new();
        let mine = item(c.id, cart, Span::new(9 * H, 10 * H));
        let theirs = item(c.id, Ulid::new(), Span::new(9 * H, 10 * H));
        c.upsert_line_item(mine.clone());
        c.upsert_line_item(theirs.clone());

        let holders = competing_holders(&c, &Span::new(9 * H, 10 * H), Some(cart));
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].holder, theirs.id);
        assert_eq!(holders[0].kind, HolderKind::LineItem);
        assert_eq!(own_overlap(&c, &Span::new(9 * H, 10 * H), cart).map(|i| i.id), Some(mine.id));
    }

    #[test]
    fn adjacent_slots_are_free() {
        let mut c = court();
        c.upsert_reservation(reservation(c.id, Span::new(9 * H, 10 * H), ReservationStatus::Approved));
        assert!(is_free(&c, &Span::new(10 * H, 11 * H)));
        assert!(!is_free(&c, &Span::new(9 * H + 30 * 60_000, 10 * H + 30 * 60_000)));
    }

    #[test]
    fn settled_items_do_not_compete() {
        let mut c = court();
        let mut done = item(c.id, Ulid::new(), Span::new(9 * H, 10 * H));
        done.status = ItemStatus::Completed;
        c.upsert_line_item(done);
        assert!(is_free(&c, &Span::new(9 * H, 10 * H)));
    }
}
