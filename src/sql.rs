use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::interval::{parse_date, parse_time};
use crate::model::*;

/// Default slot length for `SELECT ... FROM slots` without `minutes`.
pub const DEFAULT_SLOT_MINUTES: u32 = 60;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCourt {
        id: Ulid,
        name: Option<String>,
    },
    DeactivateCourt {
        id: Ulid,
    },
    SubmitRequest {
        actor: Actor,
        request: TimeSlotRequest,
    },
    Checkout {
        actor: Actor,
        cart_id: Ulid,
        items: Option<Vec<Ulid>>,
        payment: Option<PaymentInfo>,
    },
    Approve {
        actor: Actor,
        target: Ulid,
    },
    Reject {
        actor: Actor,
        target: Ulid,
        reason: Option<String>,
    },
    CheckIn {
        actor: Actor,
        code: String,
    },
    Pay {
        actor: Actor,
        target: Ulid,
        payment: PaymentInfo,
    },
    Cancel {
        actor: Actor,
        target: Ulid,
    },
    SelectCourts,
    SelectReservations {
        court_id: Ulid,
    },
    SelectWaitlist {
        court_id: Ulid,
    },
    SelectSlots {
        court_id: Ulid,
        date: NaiveDate,
        minutes: u32,
    },
    SelectLineItems {
        cart_id: Ulid,
    },
    SelectCart {
        id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column order used when an INSERT names no columns.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "courts" => &["id", "name"],
        "requests" => &[
            "actor", "role", "court_id", "date", "start", "end", "players", "sport", "booked_for",
            "price",
        ],
        "checkouts" => &["actor", "role", "cart_id", "items", "method", "reference", "proof"],
        "approvals" => &["actor", "role", "target"],
        "rejections" => &["actor", "role", "target", "reason"],
        "check_ins" => &["actor", "role", "code"],
        "payments" => &["actor", "role", "target", "method", "reference", "proof"],
        "cancellations" => &["actor", "role", "target"],
        _ => return None,
    })
}

/// One VALUES row keyed by column name. NULLs are dropped so optional
/// columns read the same whether omitted or NULL.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn get(&self, col: &'static str) -> Option<&Expr> {
        self.values.get(col)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.require(col)?)
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.require(col)?)
    }

    fn opt_string(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string_expr).transpose()
    }

    fn actor(&self) -> Result<Actor, SqlError> {
        let id = self.ulid("actor")?;
        let role = match self.opt_string("role")? {
            Some(s) => Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown role: {s}")))?,
            None => Role::Regular,
        };
        Ok(Actor::new(id, role))
    }

    fn payment(&self) -> Result<Option<PaymentInfo>, SqlError> {
        let Some(method) = self.opt_string("method")? else {
            return Ok(None);
        };
        Ok(Some(PaymentInfo {
            method: PaymentMethod::parse(&method),
            reference: self.opt_string("reference")?,
            proof: self.opt_string("proof")?,
        }))
    }
}

fn insert_row(insert: &ast::Insert, table: &'static str) -> Result<Row, SqlError> {
    let exprs = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table)
            .unwrap_or(&[])
            .iter()
            .map(|c| c.to_string())
            .collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if exprs.len() > columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), exprs.len()));
    }
    let values = columns
        .into_iter()
        .zip(exprs)
        .filter(|(_, e)| !matches!(extract_value(e), Some(Value::Null)))
        .collect();
    Ok(Row { table, values })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let Some(table) = static_table(&table) else {
        return Err(SqlError::UnknownTable(table));
    };
    let row = insert_row(insert, table)?;

    match table {
        "courts" => Ok(Command::InsertCourt {
            id: row.ulid("id")?,
            name: row.opt_string("name")?,
        }),
        "requests" => {
            let date = row.string("date")?;
            let start = row.string("start")?;
            let end = row.string("end")?;
            let booked_for = row.opt_string("booked_for")?.map(|name| BookedFor {
                name,
                email: None,
                user_id: None,
            });
            let booked_for = match booked_for {
                Some(mut b) => {
                    b.email = row.opt_string("booked_for_email")?;
                    b.user_id = row.get("booked_for_user").map(parse_ulid_expr).transpose()?;
                    Some(b)
                }
                None => None,
            };
            Ok(Command::SubmitRequest {
                actor: row.actor()?,
                request: TimeSlotRequest {
                    court_id: row.ulid("court_id")?,
                    sport: row.opt_string("sport")?,
                    date: parse_date(&date).ok_or_else(|| SqlError::Parse(format!("bad date: {date}")))?,
                    start: parse_time(&start).ok_or_else(|| SqlError::Parse(format!("bad time: {start}")))?,
                    end: parse_time(&end).ok_or_else(|| SqlError::Parse(format!("bad time: {end}")))?,
                    quoted_price: row.get("price").map(parse_i64_expr).transpose()?,
                    player_count: match row.get("players") {
                        Some(e) => parse_u32(e)?,
                        None => 1,
                    },
                    booked_for,
                },
            })
        }
        "checkouts" => {
            let items = match row.opt_string("items")? {
                Some(list) => Some(parse_ulid_list(&list)?),
                None => None,
            };
            Ok(Command::Checkout {
                actor: row.actor()?,
                cart_id: row.ulid("cart_id")?,
                items,
                payment: row.payment()?,
            })
        }
        "approvals" => Ok(Command::Approve {
            actor: row.actor()?,
            target: row.ulid("target")?,
        }),
        "rejections" => Ok(Command::Reject {
            actor: row.actor()?,
            target: row.ulid("target")?,
            reason: row.opt_string("reason")?,
        }),
        "check_ins" => Ok(Command::CheckIn {
            actor: row.actor()?,
            code: row.string("code")?,
        }),
        "payments" => Ok(Command::Pay {
            actor: row.actor()?,
            target: row.ulid("target")?,
            payment: row.payment()?.ok_or(SqlError::MissingColumn("payments", "method"))?,
        }),
        "cancellations" => Ok(Command::Cancel {
            actor: row.actor()?,
            target: row.ulid("target")?,
        }),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

fn static_table(name: &str) -> Option<&'static str> {
    const TABLES: &[&str] = &[
        "courts",
        "requests",
        "checkouts",
        "approvals",
        "rejections",
        "check_ins",
        "payments",
        "cancellations",
    ];
    TABLES.iter().copied().find(|t| *t == name)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "courts" => Ok(Command::DeactivateCourt { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        extract_eq_filters(selection, &mut filters);
    }
    let ulid_filter = |col: &'static str| -> Result<Ulid, SqlError> {
        parse_ulid_expr(filters.get(col).ok_or(SqlError::MissingFilter(col))?)
    };

    match table.as_str() {
        "courts" => Ok(Command::SelectCourts),
        "reservations" => Ok(Command::SelectReservations { court_id: ulid_filter("court_id")? }),
        "waitlist" => Ok(Command::SelectWaitlist { court_id: ulid_filter("court_id")? }),
        "line_items" => Ok(Command::SelectLineItems { cart_id: ulid_filter("cart_id")? }),
        "carts" => Ok(Command::SelectCart { id: ulid_filter("id")? }),
        "slots" => {
            let date = parse_string_expr(filters.get("date").ok_or(SqlError::MissingFilter("date"))?)?;
            let minutes = match filters.get("minutes") {
                Some(e) => parse_u32(e)?,
                None => DEFAULT_SLOT_MINUTES,
            };
            Ok(Command::SelectSlots {
                court_id: ulid_filter("court_id")?,
                date: parse_date(&date).ok_or_else(|| SqlError::Parse(format!("bad date: {date}")))?,
                minutes,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `col = value` pairs from an AND-tree. Other predicates are ignored.
fn extract_eq_filters(expr: &Expr, out: &mut HashMap<String, Expr>) {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            extract_eq_filters(left, out);
            extract_eq_filters(right, out);
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            if let Some(col) = expr_column_name(left) {
                out.insert(col, right.as_ref().clone());
            }
        }
        Expr::Nested(inner) => extract_eq_filters(inner, out),
        _ => {}
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// Comma-separated ULIDs, e.g. `'01H...,01H...'`.
fn parse_ulid_list(list: &str) -> Result<Vec<Ulid>, SqlError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}"))))
        .collect()
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at most {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_court() {
        let sql = format!("INSERT INTO courts (id, name) VALUES ('{ID}', 'Court 1')");
        match parse_sql(&sql).unwrap() {
            Command::InsertCourt { id, name } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(name.as_deref(), Some("Court 1"));
            }
            cmd => panic!("expected InsertCourt, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_court_positional_without_name() {
        let sql = format!("INSERT INTO courts VALUES ('{ID}')");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertCourt { name: None, .. }
        ));
    }

    #[test]
    fn parse_delete_court() {
        let sql = format!("DELETE FROM courts WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::DeactivateCourt { id } => assert_eq!(id.to_string(), ID),
            cmd => panic!("expected DeactivateCourt, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_request_named_columns() {
        let sql = format!(
            r#"INSERT INTO requests (actor, role, court_id, date, start, "end", players, booked_for, price)
               VALUES ('{ID}', 'user', '{OTHER}', '2024-06-01', '23:00', '00:30', 4, 'Sam', 3000)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SubmitRequest { actor, request } => {
                assert_eq!(actor.role, Role::Regular);
                assert_eq!(request.court_id.to_string(), OTHER);
                assert_eq!(request.date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
                assert_eq!(request.end, chrono::NaiveTime::from_hms_opt(0, 30, 0).unwrap());
                assert_eq!(request.player_count, 4);
                assert_eq!(request.quoted_price, Some(3000));
                assert_eq!(request.booked_for.map(|b| b.name).as_deref(), Some("Sam"));
            }
            cmd => panic!("expected SubmitRequest, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_request_defaults() {
        let sql = format!(
            r#"INSERT INTO requests (actor, court_id, date, start, "end") VALUES ('{ID}', '{OTHER}', '2024-06-01', '09:00', '10:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SubmitRequest { actor, request } => {
                assert_eq!(actor.role, Role::Regular);
                assert_eq!(request.player_count, 1);
                assert_eq!(request.quoted_price, None);
                assert!(request.booked_for.is_none());
            }
            cmd => panic!("expected SubmitRequest, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_request_bad_time() {
        let sql = format!(
            r#"INSERT INTO requests (actor, court_id, date, start, "end") VALUES ('{ID}', '{OTHER}', '2024-06-01', 'noon', '10:00')"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_request_missing_court() {
        let sql = format!(
            r#"INSERT INTO requests (actor, date, start, "end") VALUES ('{ID}', '2024-06-01', '09:00', '10:00')"#
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("requests", "court_id"))
        ));
    }

    #[test]
    fn parse_checkout_with_selection_and_payment() {
        let sql = format!(
            "INSERT INTO checkouts (actor, role, cart_id, items, method, reference, proof) \
             VALUES ('{ID}', 'staff', '{OTHER}', '{ID}, {OTHER}', 'transfer', 'TX-1', 'aGVsbG8=')"
        );
        match parse_sql(&sql).unwrap() {
            Command::Checkout { actor, cart_id, items, payment } => {
                assert_eq!(actor.role, Role::Staff);
                assert_eq!(cart_id.to_string(), OTHER);
                assert_eq!(items.unwrap().len(), 2);
                let payment = payment.unwrap();
                assert_eq!(payment.method, PaymentMethod::BankTransfer);
                assert_eq!(payment.reference.as_deref(), Some("TX-1"));
            }
            cmd => panic!("expected Checkout, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_checkout_null_payment() {
        let sql = format!("INSERT INTO checkouts (actor, cart_id, items, method) VALUES ('{ID}', '{OTHER}', NULL, NULL)");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::Checkout { items: None, payment: None, .. }
        ));
    }

    #[test]
    fn parse_approval_and_rejection() {
        let sql = format!("INSERT INTO approvals (actor, role, target) VALUES ('{ID}', 'admin', '{OTHER}')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::Approve { .. }));

        let sql = format!(
            "INSERT INTO rejections (actor, role, target, reason) VALUES ('{ID}', 'staff', '{OTHER}', 'maintenance')"
        );
        match parse_sql(&sql).unwrap() {
            Command::Reject { reason, .. } => assert_eq!(reason.as_deref(), Some("maintenance")),
            cmd => panic!("expected Reject, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_unknown_role() {
        let sql = format!("INSERT INTO approvals (actor, role, target) VALUES ('{ID}', 'root', '{OTHER}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_payment_requires_method() {
        let sql = format!("INSERT INTO payments (actor, target) VALUES ('{ID}', '{OTHER}')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("payments", "method"))
        ));
    }

    #[test]
    fn parse_check_in_and_cancellation() {
        let sql = format!("INSERT INTO check_ins (actor, role, code) VALUES ('{ID}', 'staff', 'ABC')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::CheckIn { .. }));

        let sql = format!("INSERT INTO cancellations VALUES ('{ID}', 'user', '{OTHER}')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::Cancel { .. }));
    }

    #[test]
    fn parse_too_many_values() {
        let sql = format!("INSERT INTO courts VALUES ('{ID}', 'a', 'b')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("courts", 2, 3))));
    }

    #[test]
    fn parse_select_reservations() {
        let sql = format!("SELECT * FROM reservations WHERE court_id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectReservations { .. }));
    }

    #[test]
    fn parse_select_slots() {
        let sql = format!("SELECT * FROM slots WHERE court_id = '{ID}' AND date = '2024-06-01' AND minutes = 30");
        match parse_sql(&sql).unwrap() {
            Command::SelectSlots { minutes, date, .. } => {
                assert_eq!(minutes, 30);
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
            }
            cmd => panic!("expected SelectSlots, got {cmd:?}"),
        }

        let sql = format!("SELECT * FROM slots WHERE court_id = '{ID}' AND date = '2024-06-01'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectSlots { minutes: DEFAULT_SLOT_MINUTES, .. }
        ));
    }

    #[test]
    fn parse_select_missing_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM waitlist"),
            Err(SqlError::MissingFilter("court_id"))
        ));
    }

    #[test]
    fn parse_select_courts() {
        assert_eq!(parse_sql("SELECT * FROM courts").unwrap(), Command::SelectCourts);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("SELECT * FROM foobar"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
