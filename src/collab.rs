//! Collaborators the engine calls out to. None of them can roll back a
//! committed state transition: failures come back as warnings.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{Days, NaiveTime};
use serde::Serialize;
use ulid::Ulid;

use crate::config::Policy;
use crate::interval::{from_ms, to_ms};
use crate::model::{Money, Ms, Span};
use crate::notify::NotifyHub;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollabError(pub String);

impl From<std::io::Error> for CollabError {
    fn from(e: std::io::Error) -> Self {
        CollabError(e.to_string())
    }
}

// ── Traits ───────────────────────────────────────────────────────

/// Pure pricing rule.
pub trait Pricing: Send + Sync {
    fn price(&self, court_id: Ulid, span: &Span) -> Money;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_mail(
        &self,
        template: MailTemplate,
        recipient: Ulid,
        data: &serde_json::Value,
    ) -> Result<(), CollabError>;
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist bytes, returning the stored path.
    async fn store_file(&self, bytes: &[u8]) -> Result<String, CollabError>;

    /// Drop a file written for a transaction that never committed.
    async fn remove_file(&self, _path: &str) -> Result<(), CollabError> {
        Ok(())
    }
}

pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, event: &CourtEvent) -> Result<(), CollabError>;
}

/// When a promoted waitlist entry must have paid by.
pub trait DeadlinePolicy: Send + Sync {
    fn payment_deadline(&self, promoted_at: Ms) -> Ms;
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

// ── Effects ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MailTemplate {
    ReservationSubmitted,
    ReservationApproved,
    ReservationRejected,
    ReservationCancelled,
    Waitlisted,
    WaitlistPromoted,
    WaitlistCancelled,
    WaitlistExpired,
    CartExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CourtEventKind {
    ItemAdmitted,
    ItemReleased,
    Waitlisted,
    ReservationCommitted,
    ReservationApproved,
    ReservationRejected,
    ReservationCancelled,
    WaitlistPromoted,
    CheckedIn,
    CourtUpdated,
}

/// Payload pushed to per-court subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourtEvent {
    pub court_id: Ulid,
    pub kind: CourtEventKind,
    pub subject_id: Ulid,
    pub span: Option<Span>,
}

/// Side effects collected inside a transaction and run once it has committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Mail {
        template: MailTemplate,
        recipient: Ulid,
        data: serde_json::Value,
    },
    Broadcast(CourtEvent),
}

/// Everything the engine talks to besides its own state.
#[derive(Clone)]
pub struct Collaborators {
    pub pricing: Arc<dyn Pricing>,
    pub mailer: Arc<dyn Mailer>,
    pub files: Arc<dyn FileStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub deadlines: Arc<dyn DeadlinePolicy>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Production defaults for one tenant.
    pub fn standard(policy: &Policy, evidence_dir: PathBuf, hub: Arc<NotifyHub>) -> Self {
        Self {
            pricing: Arc::new(FlatRate { hourly_rate: policy.hourly_rate }),
            mailer: Arc::new(TracingMailer),
            files: Arc::new(DiskFileStore::new(evidence_dir)),
            broadcaster: hub,
            deadlines: Arc::new(BusinessHours::from_policy(policy)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Run effects in order; failures are logged and returned as warnings.
    pub async fn dispatch(&self, effects: Vec<Effect>) -> Vec<String> {
        let mut warnings = Vec::new();
        for effect in effects {
            match effect {
                Effect::Mail { template, recipient, data } => {
                    if let Err(e) = self.mailer.send_mail(template, recipient, &data).await {
                        tracing::warn!(?template, %recipient, "mail delivery failed: {e}");
                        warnings.push(format!("mail {template:?} to {recipient} failed: {e}"));
                    }
                }
                Effect::Broadcast(event) => {
                    if let Err(e) = self.broadcaster.broadcast(&event) {
                        tracing::warn!(court_id = %event.court_id, "broadcast failed: {e}");
                        warnings.push(format!("broadcast {:?} failed: {e}", event.kind));
                    }
                }
            }
        }
        warnings
    }
}

// ── Defaults ─────────────────────────────────────────────────────

/// Same hourly rate on every court, prorated to the minute.
pub struct FlatRate {
    pub hourly_rate: Money,
}

impl Pricing for FlatRate {
    fn price(&self, _court_id: Ulid, span: &Span) -> Money {
        let minutes = span.duration_ms() / 60_000;
        self.hourly_rate * minutes / 60
    }
}

pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send_mail(
        &self,
        template: MailTemplate,
        recipient: Ulid,
        data: &serde_json::Value,
    ) -> Result<(), CollabError> {
        tracing::info!(?template, %recipient, %data, "mail queued");
        Ok(())
    }
}

pub struct DiskFileStore {
    dir: PathBuf,
}

impl DiskFileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn store_file(&self, bytes: &[u8]) -> Result<String, CollabError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.bin", Ulid::new()));
        tokio::fs::write(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn remove_file(&self, path: &str) -> Result<(), CollabError> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}

impl Broadcaster for NotifyHub {
    fn broadcast(&self, event: &CourtEvent) -> Result<(), CollabError> {
        self.send(event.court_id, event);
        Ok(())
    }
}

/// Counts only time between `open` and `close` each day.
pub struct BusinessHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub window_ms: Ms,
}

impl BusinessHours {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            open: policy.business_open,
            close: policy.business_close,
            window_ms: policy.payment_window_ms,
        }
    }
}

impl DeadlinePolicy for BusinessHours {
    fn payment_deadline(&self, promoted_at: Ms) -> Ms {
        if self.close <= self.open {
            return promoted_at + self.window_ms;
        }
        let Some(mut cursor) = from_ms(promoted_at) else {
            return promoted_at + self.window_ms;
        };
        let mut remaining = self.window_ms;
        // Bounded: every iteration either returns or advances one day.
        for _ in 0..366 {
            let day = cursor.date();
            let open = to_ms(day.and_time(self.open));
            let close = to_ms(day.and_time(self.close));
            let now = to_ms(cursor);
            let start = now.max(open);
            if start < close {
                let available = close - start;
                if remaining <= available {
                    return start + remaining;
                }
                remaining -= available;
            }
            let Some(next) = day.checked_add_days(Days::new(1)) else {
                break;
            };
            cursor = next.and_time(self.open);
        }
        promoted_at + self.window_ms
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as Ms)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: Ms) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::{normalize, parse_date, parse_time};

    const H: Ms = 3_600_000;

    fn at(date: &str, time: &str) -> Ms {
        to_ms(parse_date(date).unwrap().and_time(parse_time(time).unwrap()))
    }

    fn hours(window_h: Ms) -> BusinessHours {
        BusinessHours {
            open: parse_time("08:00").unwrap(),
            close: parse_time("22:00").unwrap(),
            window_ms: window_h * H,
        }
    }

    #[test]
    fn deadline_within_business_day() {
        let policy = hours(2);
        assert_eq!(
            policy.payment_deadline(at("2024-06-01", "10:00")),
            at("2024-06-01", "12:00")
        );
    }

    #[test]
    fn deadline_rolls_over_closing_time() {
        let policy = hours(2);
        assert_eq!(
            policy.payment_deadline(at("2024-06-01", "21:00")),
            at("2024-06-02", "09:00")
        );
    }

    #[test]
    fn deadline_promoted_overnight_starts_at_open() {
        let policy = hours(2);
        assert_eq!(
            policy.payment_deadline(at("2024-06-01", "23:30")),
            at("2024-06-02", "10:00")
        );
        assert_eq!(
            policy.payment_deadline(at("2024-06-02", "03:00")),
            at("2024-06-02", "10:00")
        );
    }

    #[test]
    fn flat_rate_prorates() {
        let pricing = FlatRate { hourly_rate: 2_000 };
        let span = normalize(
            parse_date("2024-06-01").unwrap(),
            parse_time("10:00").unwrap(),
            parse_time("11:30").unwrap(),
        )
        .unwrap();
        assert_eq!(pricing.price(Ulid::new(), &span), 3_000);
    }

    #[test]
    fn manual_clock_moves() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[tokio::test]
    async fn disk_store_writes_and_removes() {
        let dir = std::env::temp_dir().join(format!("courtside_test_store_{}", Ulid::new()));
        let store = DiskFileStore::new(dir);
        let path = store.store_file(b"receipt").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"receipt");

        store.remove_file(&path).await.unwrap();
        assert!(!std::path::Path::new(&path).exists());
    }

    struct FailingMailer;

    #[async_trait]
    impl Mailer for FailingMailer {
        async fn send_mail(
            &self,
            _template: MailTemplate,
            _recipient: Ulid,
            _data: &serde_json::Value,
        ) -> Result<(), CollabError> {
            Err(CollabError("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn dispatch_collects_warnings() {
        let hub = Arc::new(NotifyHub::new());
        let mut collab = Collaborators::standard(
            &Policy::default(),
            std::env::temp_dir().join("courtside_test_collab"),
            hub.clone(),
        );
        collab.mailer = Arc::new(FailingMailer);
        let court_id = Ulid::new();
        let mut rx = hub.subscribe(court_id);

        let warnings = collab
            .dispatch(vec![
                Effect::Mail {
                    template: MailTemplate::ReservationApproved,
                    recipient: Ulid::new(),
                    data: serde_json::json!({}),
                },
                Effect::Broadcast(CourtEvent {
                    court_id,
                    kind: CourtEventKind::ReservationApproved,
                    subject_id: Ulid::new(),
                    span: None,
                }),
            ])
            .await;

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("smtp down"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, CourtEventKind::ReservationApproved);
    }
}
