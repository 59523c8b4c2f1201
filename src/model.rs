use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only absolute time type.
pub type Ms = i64;

/// Minor currency units (cents).
pub type Money = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The one canonical overlap test. Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Regular,
    Staff,
    Admin,
}

impl Role {
    /// Staff and admins bypass the waitlist and cart expiry.
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Staff | Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Regular => "regular",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "regular" | "user" => Some(Role::Regular),
            "staff" => Some(Role::Staff),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Whoever is performing an operation. Authentication happens upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }
}

/// "Booking for someone else" metadata carried from request to reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedFor {
    pub name: String,
    pub email: Option<String>,
    pub user_id: Option<Ulid>,
}

// ── Requests ─────────────────────────────────────────────────────

/// One requested slot. Never stored on its own; always embedded in a line-item
/// or a waitlist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlotRequest {
    pub court_id: Ulid,
    pub sport: Option<String>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Price the client was shown; checked against the pricing engine.
    pub quoted_price: Option<Money>,
    pub player_count: u32,
    pub booked_for: Option<BookedFor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    BankTransfer,
    Card,
    Other(String),
}

impl PaymentMethod {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cash" => PaymentMethod::Cash,
            "bank_transfer" | "transfer" => PaymentMethod::BankTransfer,
            "card" => PaymentMethod::Card,
            other => PaymentMethod::Other(other.to_string()),
        }
    }
}

/// Payment details submitted with a checkout. `proof` is base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInfo {
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub proof: Option<String>,
}

/// Stored payment proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvidence {
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub proof_path: Option<String>,
}

// ── Statuses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartStatus {
    Pending,
    Completed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Completed,
    CheckedIn,
}

impl ReservationStatus {
    /// Cancelled and rejected reservations never block a slot.
    pub fn blocks_slot(self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending
                | ReservationStatus::Approved
                | ReservationStatus::Completed
                | ReservationStatus::CheckedIn
        )
    }

    pub fn approval(self) -> ApprovalStatus {
        match self {
            ReservationStatus::Pending => ApprovalStatus::Pending,
            ReservationStatus::Approved
            | ReservationStatus::Completed
            | ReservationStatus::CheckedIn => ApprovalStatus::Approved,
            ReservationStatus::Rejected | ReservationStatus::Cancelled => ApprovalStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Pending,
    Notified,
    Converted,
    Cancelled,
    Expired,
}

impl WaitlistStatus {
    pub fn is_open(self) -> bool {
        matches!(self, WaitlistStatus::Pending | WaitlistStatus::Notified)
    }
}

macro_rules! status_str {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }
    };
}

status_str!(CartStatus { Pending => "pending", Completed => "completed", Cancelled => "cancelled", Expired => "expired" });
status_str!(ApprovalStatus { Pending => "pending", Approved => "approved", Rejected => "rejected" });
status_str!(PaymentStatus { Unpaid => "unpaid", Paid => "paid" });
status_str!(ItemStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Cancelled => "cancelled",
    Completed => "completed",
    Expired => "expired",
});
status_str!(ReservationStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Cancelled => "cancelled",
    Completed => "completed",
    CheckedIn => "checked_in",
});
status_str!(WaitlistStatus {
    Pending => "pending",
    Notified => "notified",
    Converted => "converted",
    Cancelled => "cancelled",
    Expired => "expired",
});

// ── Rows ─────────────────────────────────────────────────────────

/// Anything that sits on a court's timeline.
pub trait Timed {
    fn id(&self) -> Ulid;
    fn span(&self) -> Span;
}

/// A provisional slot inside a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Ulid,
    pub cart_id: Ulid,
    pub court_id: Ulid,
    pub owner: Ulid,
    pub sport: Option<String>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub span: Span,
    pub price: Money,
    pub player_count: u32,
    pub status: ItemStatus,
    pub waitlist_entry_id: Option<Ulid>,
    pub booked_for: Option<BookedFor>,
    /// Set once the item has been committed into a reservation.
    pub reservation_id: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Timed for LineItem {
    fn id(&self) -> Ulid {
        self.id
    }
    fn span(&self) -> Span {
        self.span
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendance {
    pub players_checked_in: u32,
    pub first_check_in_at: Option<Ms>,
}

/// A committed grant of a court interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub court_id: Ulid,
    pub owner: Ulid,
    pub booked_for: Option<BookedFor>,
    pub date: NaiveDate,
    pub span: Span,
    pub price: Money,
    pub player_count: u32,
    pub status: ReservationStatus,
    pub payment: PaymentStatus,
    pub attendance: Attendance,
    pub cart_id: Option<Ulid>,
    pub waitlist_entry_id: Option<Ulid>,
    /// Line-items folded into this reservation.
    pub line_item_ids: Vec<Ulid>,
    pub check_in_code: String,
    pub approver: Option<Ulid>,
    pub rejection_reason: Option<String>,
    pub payment_evidence: Option<PaymentEvidence>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Timed for Reservation {
    fn id(&self) -> Ulid {
        self.id
    }
    fn span(&self) -> Span {
        self.span
    }
}

/// A ranked, deferred request for a contested slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub court_id: Ulid,
    pub span: Span,
    pub requested_by: Actor,
    pub request: TimeSlotRequest,
    pub price: Money,
    /// Immutable creation-order rank within `(court_id, span)`.
    pub position: u32,
    pub status: WaitlistStatus,
    /// Reservation or line-item currently holding the slot.
    pub blocker_id: Ulid,
    /// Payment deadline once notified.
    pub expires_at: Option<Ms>,
    /// Reservation spawned on promotion.
    pub reservation_id: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Locates a row on a court.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub court_id: Ulid,
    pub id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: Ulid,
    pub owner: Actor,
    pub items: Vec<Placement>,
    pub reservations: Vec<Placement>,
    pub aggregate_price: Money,
    pub status: CartStatus,
    pub approval: ApprovalStatus,
    pub payment: PaymentStatus,
    pub payment_evidence: Option<PaymentEvidence>,
    pub approver: Option<Ulid>,
    pub rejection_reason: Option<String>,
    /// Cart whose unselected items were carried into this one.
    pub split_from: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Cart {
    pub fn new(id: Ulid, owner: Actor, now: Ms) -> Self {
        Self {
            id,
            owner,
            items: Vec::new(),
            reservations: Vec::new(),
            aggregate_price: 0,
            status: CartStatus::Pending,
            approval: ApprovalStatus::Pending,
            payment: PaymentStatus::Unpaid,
            payment_evidence: None,
            approver: None,
            rejection_reason: None,
            split_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Every court this cart touches, through items or reservations.
    pub fn court_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .items
            .iter()
            .chain(self.reservations.iter())
            .map(|p| p.court_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Everything the engine knows about one court. Guarded by one lock: the
/// per-court lock key every slot mutation serializes on.
#[derive(Debug, Clone)]
pub struct CourtState {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    /// Sorted by `span.start`.
    pub line_items: Vec<LineItem>,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Creation order.
    pub waitlist: Vec<WaitlistEntry>,
}

impl CourtState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            active: true,
            line_items: Vec::new(),
            reservations: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    pub fn line_item(&self, id: &Ulid) -> Option<&LineItem> {
        self.line_items.iter().find(|i| i.id == *id)
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn waitlist_entry(&self, id: &Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.id == *id)
    }

    pub fn upsert_line_item(&mut self, item: LineItem) {
        upsert_sorted(&mut self.line_items, item);
    }

    pub fn upsert_reservation(&mut self, reservation: Reservation) {
        upsert_sorted(&mut self.reservations, reservation);
    }

    pub fn upsert_waitlist_entry(&mut self, entry: WaitlistEntry) {
        match self.waitlist.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => *slot = entry,
            None => self.waitlist.push(entry),
        }
    }
}

/// Replace-or-insert keeping `span.start` order.
pub fn upsert_sorted<T: Timed>(rows: &mut Vec<T>, row: T) {
    if let Some(pos) = rows.iter().position(|r| r.id() == row.id()) {
        rows.remove(pos);
    }
    let start = row.span().start;
    let pos = rows.partition_point(|r| r.span().start <= start);
    rows.insert(pos, row);
}

/// Rows whose span overlaps the query window.
/// Uses binary search to skip rows starting at or after `query.end`.
pub fn overlapping<'a, T: Timed>(rows: &'a [T], query: &Span) -> impl Iterator<Item = &'a T> {
    let right_bound = rows.partition_point(|r| r.span().start < query.end);
    let query = *query;
    rows[..right_bound]
        .iter()
        .filter(move |r| r.span().end > query.start)
}

// ── WAL record ───────────────────────────────────────────────────

/// Full-row upserts. Rows are soft-deleted through their status, never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtSaved {
        id: Ulid,
        name: Option<String>,
        active: bool,
    },
    CartSaved(Cart),
    LineItemSaved(LineItem),
    ReservationSaved(Reservation),
    WaitlistSaved(WaitlistEntry),
}

impl Event {
    /// The court whose lock guards this row. Carts are not court-scoped.
    pub fn court_id(&self) -> Option<Ulid> {
        match self {
            Event::CourtSaved { id, .. } => Some(*id),
            Event::LineItemSaved(item) => Some(item.court_id),
            Event::ReservationSaved(r) => Some(r.court_id),
            Event::WaitlistSaved(e) => Some(e.court_id),
            Event::CartSaved(_) => None,
        }
    }
}

/// One committed transaction. Everything in `events` lands or nothing does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub at: Ms,
    pub events: Vec<Event>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourtInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub court_id: Ulid,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub span: Span,
    pub free: bool,
}
