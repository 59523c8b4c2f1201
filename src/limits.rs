//! Hard caps on per-tenant state and request sizes.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_COURTS_PER_TENANT: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SPORT_LEN: usize = 64;
pub const MAX_REASON_LEN: usize = 1_024;
pub const MAX_REFERENCE_LEN: usize = 256;

pub const MAX_ITEMS_PER_CART: usize = 64;
pub const MAX_PLAYERS_PER_SLOT: u32 = 64;
pub const MAX_WAITLIST_PER_SLOT: usize = 100;

/// A single slot may not exceed one day.
pub const MAX_SLOT_DURATION_MS: Ms = 24 * 3_600_000;

/// Decoded payment proof size cap (8 MiB).
pub const MAX_EVIDENCE_BYTES: usize = 8 * 1024 * 1024;

pub const MAX_SLOTS_PER_QUERY: usize = 1_440;

/// Attempts to lock a cart whose court set moved underneath us.
pub const MAX_LOCK_RETRIES: usize = 8;

/// Upper bound on waitlist cascade steps inside one transaction.
pub const MAX_CASCADE_STEPS: usize = 1_000;
