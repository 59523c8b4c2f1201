mod approval;
mod calendar;
mod cart;
mod committer;
mod error;
mod queries;
mod resolver;
mod tx;
mod waitlist;

pub use approval::{ApprovalOutcome, RejectionOutcome};
pub use calendar::{Conflict, ConflictClass, competing_holders, find_conflict};
pub use committer::{CheckoutReceipt, SlotGroup, group_line_items};
pub use error::{EngineError, HolderKind};
pub use resolver::{Decision, SubmitOutcome, decide};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::collab::{Collaborators, CourtEventKind};
use crate::config::Policy;
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use tx::Tx;

pub type SharedCourt = Arc<RwLock<CourtState>>;
pub type SharedCart = Arc<Mutex<Cart>>;

/// Result of a committed operation plus any collaborator failures that
/// happened after the commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Record, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Record, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let mut batch = vec![(record, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

/// One tenant's reservation state.
pub struct Engine {
    pub(super) courts: DashMap<Ulid, SharedCourt>,
    pub(super) carts: DashMap<Ulid, SharedCart>,
    /// Owner → the pending cart new line-items go into.
    pub(super) open_carts: DashMap<Ulid, Ulid>,
    /// Line-item / reservation / waitlist entry id → court id.
    pub(super) entity_to_court: DashMap<Ulid, Ulid>,
    pub(super) check_in_codes: DashMap<String, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every transaction, exclusive for compaction.
    pub(super) gate: Arc<RwLock<()>>,
    pub collab: Collaborators,
    pub policy: Policy,
}

/// Apply an event to a court. Caller holds the lock.
pub(super) fn apply_to_court(rs: &mut CourtState, event: &Event) {
    match event {
        Event::CourtSaved { name, active, .. } => {
            rs.name = name.clone();
            rs.active = *active;
        }
        Event::LineItemSaved(item) => rs.upsert_line_item(item.clone()),
        Event::ReservationSaved(r) => rs.upsert_reservation(r.clone()),
        Event::WaitlistSaved(e) => rs.upsert_waitlist_entry(e.clone()),
        Event::CartSaved(_) => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, collab: Collaborators, policy: Policy) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            courts: DashMap::new(),
            carts: DashMap::new(),
            open_carts: DashMap::new(),
            entity_to_court: DashMap::new(),
            check_in_codes: DashMap::new(),
            wal_tx,
            gate: Arc::new(RwLock::new(())),
            collab,
            policy,
        };

        // We're the sole owner of these Arcs, so try_write/try_lock always
        // succeed. Never block here: this may run inside an async context.
        for record in &records {
            for event in &record.events {
                engine.replay_event(event)?;
            }
        }
        if !records.is_empty() {
            info!(
                records = records.len(),
                courts = engine.courts.len(),
                carts = engine.carts.len(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::CartSaved(cart) => {
                self.carts
                    .insert(cart.id, Arc::new(Mutex::new(cart.clone())));
            }
            Event::CourtSaved { id, name, .. } if !self.courts.contains_key(id) => {
                let mut rs = CourtState::new(*id, name.clone());
                apply_to_court(&mut rs, event);
                self.courts.insert(*id, Arc::new(RwLock::new(rs)));
            }
            other => {
                if let Some(court_id) = other.court_id()
                    && let Some(shared) = self.get_court(&court_id)
                {
                    let mut guard = shared
                        .try_write()
                        .map_err(|_| io::Error::other("replay: court lock contended"))?;
                    apply_to_court(&mut guard, other);
                }
            }
        }
        self.index_event(event);
        Ok(())
    }

    /// Keep the secondary lookups in step with a committed event.
    fn index_event(&self, event: &Event) {
        match event {
            Event::LineItemSaved(item) => {
                self.entity_to_court.insert(item.id, item.court_id);
            }
            Event::ReservationSaved(r) => {
                self.entity_to_court.insert(r.id, r.court_id);
                self.check_in_codes.insert(r.check_in_code.clone(), r.id);
            }
            Event::WaitlistSaved(e) => {
                self.entity_to_court.insert(e.id, e.court_id);
            }
            Event::CartSaved(cart) => {
                if cart.status == CartStatus::Pending {
                    self.open_carts.insert(cart.owner.id, cart.id);
                } else {
                    self.open_carts
                        .remove_if(&cart.owner.id, |_, open| *open == cart.id);
                }
            }
            Event::CourtSaved { .. } => {}
        }
    }

    /// Write a record to the WAL via the background group-commit writer.
    async fn wal_append(&self, record: &Record) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn now(&self) -> Ms {
        self.collab.clock.now_ms()
    }

    pub fn get_court(&self, id: &Ulid) -> Option<SharedCourt> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub(super) fn shared_cart(&self, id: &Ulid) -> Option<SharedCart> {
        self.carts.get(id).map(|e| e.value().clone())
    }

    pub fn court_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_court.get(entity_id).map(|e| *e.value())
    }

    // ── Transactions ─────────────────────────────────────────

    /// Lock courts (ascending), then carts (ascending), and open a scratch
    /// copy of everything locked.
    pub(super) async fn begin(
        &self,
        courts: impl IntoIterator<Item = Ulid>,
        carts: impl IntoIterator<Item = Ulid>,
    ) -> Result<Tx, EngineError> {
        let gate = self.gate.clone().read_owned().await;
        let mut tx = Tx::new(self.now(), gate);

        let mut court_ids: Vec<Ulid> = courts.into_iter().collect();
        court_ids.sort();
        court_ids.dedup();
        for id in court_ids {
            let shared = self.get_court(&id).ok_or(EngineError::NotFound(id))?;
            tx.hold_court(shared.write_owned().await);
        }

        let mut cart_ids: Vec<Ulid> = carts.into_iter().collect();
        cart_ids.sort();
        cart_ids.dedup();
        for id in cart_ids {
            let shared = self.shared_cart(&id).ok_or(EngineError::NotFound(id))?;
            tx.hold_cart(shared.lock_owned().await);
        }

        Ok(tx)
    }

    /// Lock a cart together with every court it touches. The court set is
    /// read first, so it is re-checked under the locks and retried if the
    /// cart gained a court in between.
    pub(super) async fn begin_for_cart(
        &self,
        cart_id: Ulid,
        extra_courts: &[Ulid],
    ) -> Result<Tx, EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let shared = self.shared_cart(&cart_id).ok_or(EngineError::NotFound(cart_id))?;
            let mut courts = shared.lock().await.court_ids();
            courts.extend_from_slice(extra_courts);
            let tx = self.begin(courts, [cart_id]).await?;
            let covered = tx
                .cart(&cart_id)?
                .court_ids()
                .iter()
                .all(|c| tx.holds_court(c));
            if covered {
                return Ok(tx);
            }
        }
        Err(EngineError::state("cart kept changing while locking; retry"))
    }

    /// Bring a cart into a running transaction. Only valid for carts whose
    /// courts are all held already: anyone else locking that cart must take
    /// those courts first, so this cannot deadlock.
    pub(super) async fn join_cart(&self, tx: &mut Tx, cart_id: Ulid) -> Result<(), EngineError> {
        if tx.has_cart(&cart_id) {
            return Ok(());
        }
        let shared = self.shared_cart(&cart_id).ok_or(EngineError::NotFound(cart_id))?;
        let guard = shared.lock_owned().await;
        if !guard.court_ids().iter().all(|c| tx.holds_court(c)) {
            return Err(EngineError::state("cart spans courts outside this transaction"));
        }
        tx.hold_cart(guard);
        Ok(())
    }

    /// WAL-append the transaction, then swap the scratch state in.
    /// Nothing is visible to other callers unless the append succeeded.
    pub(super) async fn commit(&self, tx: Tx) -> Result<Vec<crate::collab::Effect>, EngineError> {
        let parts = tx.into_parts();
        if parts.events.is_empty() {
            return Ok(parts.effects);
        }
        let record = Record { at: parts.now, events: parts.events };
        self.wal_append(&record).await?;

        let mut court_guards = parts.court_guards;
        for (id, state) in parts.courts {
            if let Some(guard) = court_guards.get_mut(&id) {
                **guard = state;
            }
        }
        let mut cart_guards = parts.cart_guards;
        for (id, cart) in parts.carts {
            match cart_guards.get_mut(&id) {
                Some(guard) => **guard = cart,
                None => {
                    self.carts.insert(id, Arc::new(Mutex::new(cart)));
                }
            }
        }
        for event in &record.events {
            self.index_event(event);
        }
        Ok(parts.effects)
    }

    /// Commit, release every lock, then run the post-commit effects.
    pub(super) async fn finish<T>(&self, tx: Tx, value: T) -> Result<Receipt<T>, EngineError> {
        let effects = self.commit(tx).await?;
        let warnings = self.collab.dispatch(effects).await;
        Ok(Receipt { value, warnings })
    }

    // ── Target lookup ────────────────────────────────────────

    /// Classify an id from a snapshot. The answer can go stale before the
    /// caller locks anything; use `lock_target` for writes.
    pub(super) async fn locate(&self, id: Ulid) -> Result<Target, EngineError> {
        if self.carts.contains_key(&id) {
            return Ok(Target::Cart(id));
        }
        let court_id = self.court_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let shared = self.get_court(&court_id).ok_or(EngineError::NotFound(court_id))?;
        let rs = shared.read().await;
        target_in(&rs, id).ok_or(EngineError::NotFound(id))
    }

    /// Lock whatever `id` names together with the cart it belongs to, and
    /// confirm it still belongs there once the locks are held.
    pub(super) async fn lock_target(&self, id: Ulid) -> Result<(Tx, Target), EngineError> {
        for _ in 0..MAX_LOCK_RETRIES {
            let target = self.locate(id).await?;
            let tx = match target {
                Target::Cart(cart_id) => return Ok((self.begin_for_cart(cart_id, &[]).await?, target)),
                other => match (other.court_id(), other.cart_id()) {
                    (Some(court_id), Some(cart_id)) => self.begin_for_cart(cart_id, &[court_id]).await?,
                    (Some(court_id), None) => self.begin([court_id], []).await?,
                    _ => return Err(EngineError::NotFound(id)),
                },
            };
            let court_id = target.court_id().ok_or(EngineError::NotFound(id))?;
            if target_in(tx.court(&court_id)?, id) == Some(target) {
                return Ok((tx, target));
            }
        }
        Err(EngineError::state("row kept moving while locking; retry"))
    }

    // ── Court catalog ────────────────────────────────────────

    pub async fn create_court(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.courts.len() >= MAX_COURTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many courts"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("court name too long"));
        }
        let _gate = self.gate.read().await;
        if self.courts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CourtSaved { id, name: name.clone(), active: true };
        self.wal_append(&Record { at: self.now(), events: vec![event] }).await?;
        self.courts
            .insert(id, Arc::new(RwLock::new(CourtState::new(id, name))));
        info!(court_id = %id, "court created");
        Ok(())
    }

    /// Inactive courts keep their reservations but admit no new requests.
    pub async fn set_court_active(&self, id: Ulid, active: bool) -> Result<Receipt<()>, EngineError> {
        let mut tx = self.begin([id], []).await?;
        let court = tx.court(&id)?;
        if court.active == active {
            return self.finish(tx, ()).await;
        }
        let name = court.name.clone();
        tx.record(Event::CourtSaved { id, name, active })?;
        tx.broadcast(id, CourtEventKind::CourtUpdated, id, None);
        self.finish(tx, ()).await
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with one upsert per live row. Holds the gate
    /// exclusively, so no transaction is in flight while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let at = self.now();
        let mut records = Vec::new();

        let mut courts: Vec<(Ulid, SharedCourt)> = self
            .courts
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        courts.sort_by_key(|(id, _)| *id);

        for (_, shared) in courts {
            let rs = shared.read().await;
            let mut events = vec![Event::CourtSaved {
                id: rs.id,
                name: rs.name.clone(),
                active: rs.active,
            }];
            events.extend(rs.line_items.iter().cloned().map(Event::LineItemSaved));
            events.extend(rs.reservations.iter().cloned().map(Event::ReservationSaved));
            events.extend(rs.waitlist.iter().cloned().map(Event::WaitlistSaved));
            records.push(Record { at, events });
        }

        let carts: Vec<SharedCart> = self.carts.iter().map(|e| e.value().clone()).collect();
        let mut cart_events = Vec::with_capacity(carts.len());
        for shared in carts {
            cart_events.push(Event::CartSaved(shared.lock().await.clone()));
        }
        // Pending carts last so the open-cart index ends on the newest one.
        cart_events.sort_by_key(|e| match e {
            Event::CartSaved(c) => (c.status == CartStatus::Pending, c.updated_at),
            _ => (false, 0),
        });
        if !cart_events.is_empty() {
            records.push(Record { at, events: cart_events });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// What an operation's target id refers to, and where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Target {
    Cart(Ulid),
    LineItem { court_id: Ulid, cart_id: Ulid },
    Reservation { court_id: Ulid, cart_id: Option<Ulid> },
    /// `cart_id` is the cart spawned on promotion, if any.
    Waitlist { court_id: Ulid, cart_id: Option<Ulid> },
}

impl Target {
    fn court_id(&self) -> Option<Ulid> {
        match *self {
            Target::Cart(_) => None,
            Target::LineItem { court_id, .. }
            | Target::Reservation { court_id, .. }
            | Target::Waitlist { court_id, .. } => Some(court_id),
        }
    }

    fn cart_id(&self) -> Option<Ulid> {
        match *self {
            Target::Cart(id) | Target::LineItem { cart_id: id, .. } => Some(id),
            Target::Reservation { cart_id, .. } | Target::Waitlist { cart_id, .. } => cart_id,
        }
    }
}

fn target_in(rs: &CourtState, id: Ulid) -> Option<Target> {
    let court_id = rs.id;
    if let Some(r) = rs.reservation(&id) {
        return Some(Target::Reservation { court_id, cart_id: r.cart_id });
    }
    if let Some(item) = rs.line_item(&id) {
        return Some(Target::LineItem { court_id, cart_id: item.cart_id });
    }
    let entry = rs.waitlist_entry(&id)?;
    let cart_id = entry
        .reservation_id
        .and_then(|rid| rs.reservation(&rid))
        .and_then(|r| r.cart_id);
    Some(Target::Waitlist { court_id, cart_id })
}

/// Authorization helper: owners act on their own rows, staff and admins on any.
pub(super) fn owns_or_privileged(actor: &Actor, owner: Ulid) -> Result<(), EngineError> {
    if actor.id == owner || actor.role.is_privileged() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized("not the owner"))
    }
}
