use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::CourtsideAuthSource;
use crate::engine::{ApprovalOutcome, Engine, RejectionOutcome, SubmitOutcome};
use crate::interval::{format_time, from_ms};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct CourtsideHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CourtsideQueryParser>,
}

impl CourtsideHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CourtsideQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertCourt { id, name } => {
                engine.create_court(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeactivateCourt { id } => {
                engine.set_court_active(id, false).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SubmitRequest { actor, request } => {
                let receipt = engine.submit_request(&actor, request).await.map_err(engine_err)?;
                let warnings = joined(&receipt.warnings);
                let (outcome, id, cart_id, position) = match receipt.value {
                    SubmitOutcome::Admitted { cart_id, line_item_id } => {
                        ("admitted", line_item_id, Some(cart_id.to_string()), None)
                    }
                    SubmitOutcome::Waitlisted { entry_id, position } => {
                        ("waitlisted", entry_id, None, Some(i64::from(position)))
                    }
                };
                single_row(submit_schema(), |enc| {
                    enc.encode_field(&outcome)?;
                    enc.encode_field(&id.to_string())?;
                    enc.encode_field(&cart_id)?;
                    enc.encode_field(&position)?;
                    enc.encode_field(&warnings)
                })
            }
            Command::Checkout { actor, cart_id, items, payment } => {
                let receipt = engine
                    .checkout(&actor, cart_id, items, payment)
                    .await
                    .map_err(engine_err)?;
                let warnings = joined(&receipt.warnings);
                let r = receipt.value;
                let ids = r
                    .reservation_ids
                    .iter()
                    .map(Ulid::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                single_row(checkout_schema(), |enc| {
                    enc.encode_field(&r.cart_id.to_string())?;
                    enc.encode_field(&ids)?;
                    enc.encode_field(&r.successor_cart_id.map(|id| id.to_string()))?;
                    enc.encode_field(&r.total)?;
                    enc.encode_field(&warnings)
                })
            }
            Command::Approve { actor, target } => {
                let receipt = engine.approve(&actor, target).await.map_err(engine_err)?;
                let outcome = match receipt.value {
                    ApprovalOutcome::Approved => "approved",
                    ApprovalOutcome::AlreadyApproved => "already_approved",
                };
                outcome_row(outcome, &receipt.warnings)
            }
            Command::Reject { actor, target, reason } => {
                let receipt = engine.reject(&actor, target, reason).await.map_err(engine_err)?;
                let outcome = match receipt.value {
                    RejectionOutcome::Rejected => "rejected",
                    RejectionOutcome::AlreadyRejected => "already_rejected",
                };
                outcome_row(outcome, &receipt.warnings)
            }
            Command::CheckIn { actor, code } => {
                let receipt = engine.check_in(&actor, &code).await.map_err(engine_err)?;
                let warnings = joined(&receipt.warnings);
                let players = i64::from(receipt.value);
                single_row(check_in_schema(), |enc| {
                    enc.encode_field(&players)?;
                    enc.encode_field(&warnings)
                })
            }
            Command::Pay { actor, target, payment } => {
                let receipt = engine
                    .submit_payment(&actor, target, payment)
                    .await
                    .map_err(engine_err)?;
                outcome_row("paid", &receipt.warnings)
            }
            Command::Cancel { actor, target } => {
                let receipt = engine.cancel(&actor, target).await.map_err(engine_err)?;
                outcome_row("cancelled", &receipt.warnings)
            }
            Command::SelectCourts => {
                let courts = engine.list_courts().await;
                rows(courts_schema(), courts, |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.name)?;
                    enc.encode_field(&c.active)
                })
            }
            Command::SelectReservations { court_id } => {
                let reservations = engine.get_reservations(court_id).await.map_err(engine_err)?;
                rows(reservations_schema(), reservations, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.court_id.to_string())?;
                    enc.encode_field(&r.owner.to_string())?;
                    enc.encode_field(&fmt_ms(r.span.start))?;
                    enc.encode_field(&fmt_ms(r.span.end))?;
                    enc.encode_field(&r.status.as_str())?;
                    enc.encode_field(&r.payment.as_str())?;
                    enc.encode_field(&r.price)?;
                    enc.encode_field(&i64::from(r.player_count))?;
                    enc.encode_field(&i64::from(r.attendance.players_checked_in))?;
                    enc.encode_field(&r.check_in_code)?;
                    enc.encode_field(&r.cart_id.map(|id| id.to_string()))?;
                    enc.encode_field(&r.booked_for.map(|b| b.name))
                })
            }
            Command::SelectWaitlist { court_id } => {
                let entries = engine.get_waitlist(court_id).await.map_err(engine_err)?;
                rows(waitlist_schema(), entries, |enc, e| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.court_id.to_string())?;
                    enc.encode_field(&e.requested_by.id.to_string())?;
                    enc.encode_field(&fmt_ms(e.span.start))?;
                    enc.encode_field(&fmt_ms(e.span.end))?;
                    enc.encode_field(&i64::from(e.position))?;
                    enc.encode_field(&e.status.as_str())?;
                    enc.encode_field(&e.blocker_id.to_string())?;
                    enc.encode_field(&e.reservation_id.map(|id| id.to_string()))?;
                    enc.encode_field(&e.expires_at.map(fmt_ms))
                })
            }
            Command::SelectSlots { court_id, date, minutes } => {
                let slots = engine
                    .free_slots(court_id, date, minutes)
                    .await
                    .map_err(engine_err)?;
                rows(slots_schema(), slots, |enc, s| {
                    enc.encode_field(&s.court_id.to_string())?;
                    enc.encode_field(&format_time(s.start))?;
                    enc.encode_field(&format_time(s.end))?;
                    enc.encode_field(&s.span.start)?;
                    enc.encode_field(&s.span.end)?;
                    enc.encode_field(&s.free)
                })
            }
            Command::SelectLineItems { cart_id } => {
                let items = engine.get_line_items(cart_id).await.map_err(engine_err)?;
                rows(line_items_schema(), items, |enc, i| {
                    enc.encode_field(&i.id.to_string())?;
                    enc.encode_field(&i.court_id.to_string())?;
                    enc.encode_field(&i.cart_id.to_string())?;
                    enc.encode_field(&fmt_ms(i.span.start))?;
                    enc.encode_field(&fmt_ms(i.span.end))?;
                    enc.encode_field(&i.price)?;
                    enc.encode_field(&i64::from(i.player_count))?;
                    enc.encode_field(&i.status.as_str())?;
                    enc.encode_field(&i.reservation_id.map(|id| id.to_string()))
                })
            }
            Command::SelectCart { id } => {
                let cart = engine.get_cart(id).await.map_err(engine_err)?;
                rows(carts_schema(), [cart], |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.owner.id.to_string())?;
                    enc.encode_field(&c.status.as_str())?;
                    enc.encode_field(&c.approval.as_str())?;
                    enc.encode_field(&c.payment.as_str())?;
                    enc.encode_field(&c.aggregate_price)?;
                    enc.encode_field(&(c.items.len() as i64))?;
                    enc.encode_field(&c.split_from.map(|id| id.to_string()))
                })
            }
        }
    }
}

fn fmt_ms(ms: Ms) -> String {
    from_ms(ms).map_or_else(|| ms.to_string(), |dt| dt.format("%Y-%m-%d %H:%M").to_string())
}

fn joined(warnings: &[String]) -> Option<String> {
    (!warnings.is_empty()).then(|| warnings.join("; "))
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn single_row(
    schema: Vec<FieldInfo>,
    encode: impl Fn(&mut DataRowEncoder) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    rows(schema, [()], |enc, ()| encode(enc))
}

fn outcome_row(outcome: &'static str, warnings: &[String]) -> PgWireResult<Response> {
    let warnings = joined(warnings);
    single_row(outcome_schema(), |enc| {
        enc.encode_field(&outcome)?;
        enc.encode_field(&warnings)
    })
}

// ── Schemas ──────────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn text(name: &str) -> FieldInfo {
    field(name, Type::VARCHAR)
}

fn submit_schema() -> Vec<FieldInfo> {
    vec![
        text("outcome"),
        text("id"),
        text("cart_id"),
        field("position", Type::INT8),
        text("warnings"),
    ]
}

fn checkout_schema() -> Vec<FieldInfo> {
    vec![
        text("cart_id"),
        text("reservation_ids"),
        text("successor_cart_id"),
        field("total", Type::INT8),
        text("warnings"),
    ]
}

fn outcome_schema() -> Vec<FieldInfo> {
    vec![text("outcome"), text("warnings")]
}

fn check_in_schema() -> Vec<FieldInfo> {
    vec![field("players_checked_in", Type::INT8), text("warnings")]
}

fn courts_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), field("active", Type::BOOL)]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("court_id"),
        text("owner"),
        text("start"),
        text("end"),
        text("status"),
        text("payment"),
        field("price", Type::INT8),
        field("players", Type::INT8),
        field("checked_in", Type::INT8),
        text("check_in_code"),
        text("cart_id"),
        text("booked_for"),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("court_id"),
        text("requested_by"),
        text("start"),
        text("end"),
        field("position", Type::INT8),
        text("status"),
        text("blocker_id"),
        text("reservation_id"),
        text("expires_at"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text("court_id"),
        text("start"),
        text("end"),
        field("start_ms", Type::INT8),
        field("end_ms", Type::INT8),
        field("free", Type::BOOL),
    ]
}

fn line_items_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("court_id"),
        text("cart_id"),
        text("start"),
        text("end"),
        field("price", Type::INT8),
        field("players", Type::INT8),
        text("status"),
        text("reservation_id"),
    ]
}

fn carts_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("owner"),
        text("status"),
        text("approval"),
        text("payment"),
        field("total", Type::INT8),
        field("items", Type::INT8),
        text("split_from"),
    ]
}

/// Table a statement reads from (`FROM x`) or writes to (`INTO x`).
fn statement_table(sql: &str) -> Option<(bool, String)> {
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.trim_matches('"').to_lowercase())
        .collect();
    let is_select = words.first().is_some_and(|w| w == "select");
    let keyword = if is_select { "from" } else { "into" };
    let pos = words.iter().position(|w| w == keyword)?;
    words.get(pos + 1).map(|t| (is_select, t.clone()))
}

/// Result columns for a statement, known before it runs.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match statement_table(sql) {
        Some((true, table)) => match table.as_str() {
            "courts" => courts_schema(),
            "reservations" => reservations_schema(),
            "waitlist" => waitlist_schema(),
            "slots" => slots_schema(),
            "line_items" => line_items_schema(),
            "carts" => carts_schema(),
            _ => vec![],
        },
        Some((false, table)) => match table.as_str() {
            "requests" => submit_schema(),
            "checkouts" => checkout_schema(),
            "approvals" | "rejections" | "payments" | "cancellations" => outcome_schema(),
            "check_ins" => check_in_schema(),
            _ => vec![],
        },
        None => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtsideHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtsideQueryParser;

#[async_trait]
impl QueryParser for CourtsideQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtsideHandler {
    type Statement = String;
    type QueryParser = CourtsideQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so $1 never clobbers the prefix of $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtsideFactory {
    handler: Arc<CourtsideHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CourtsideAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CourtsideFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = CourtsideAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtsideHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtsideFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = CourtsideFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM courts"), 0);
        assert_eq!(count_params("INSERT INTO approvals VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("... $10 ... $2"), 10);
    }

    #[test]
    fn statement_table_reads_from_and_into() {
        assert_eq!(
            statement_table("SELECT * FROM reservations WHERE court_id = $1"),
            Some((true, "reservations".into()))
        );
        assert_eq!(
            statement_table("INSERT INTO requests(actor) VALUES ($1)"),
            Some((false, "requests".into()))
        );
        assert_eq!(statement_table("DELETE FROM courts WHERE id = $1"), None);
    }

    #[test]
    fn schema_matches_statement() {
        assert_eq!(schema_for("SELECT * FROM slots WHERE court_id = $1").len(), 6);
        assert_eq!(schema_for("INSERT INTO checkouts VALUES ($1, $2, $3)").len(), 5);
        assert!(schema_for("INSERT INTO courts VALUES ($1)").is_empty());
    }

    #[test]
    fn engine_errors_keep_their_sqlstate() {
        let err = engine_err(crate::engine::EngineError::NotFound(Ulid::nil()));
        assert!(matches!(err, PgWireError::UserError(_)));
        assert!(format!("{err:?}").contains("P0002"));
    }
}
