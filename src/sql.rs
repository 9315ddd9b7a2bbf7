use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    SaveClass {
        id: Ulid,
        tutor_id: Ulid,
        title: String,
        duration_minutes: u32,
        is_active: bool,
    },
    IssueShareLink {
        token: String,
        class_id: Ulid,
        expires_at: Option<Ms>,
    },
    SaveRule {
        id: Ulid,
        tutor_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        timezone: String,
        buffer_minutes: Option<u32>,
    },
    DeleteRule {
        id: Ulid,
    },
    SelectRules {
        tutor_id: Ulid,
    },
    SelectBookedSlots {
        tutor_id: Ulid,
        date: NaiveDate,
    },
    SelectSlots {
        class_id: Ulid,
        date: NaiveDate,
    },
    InsertBooking {
        id: Ulid,
        class_id: Ulid,
        scheduled_at: Ms,
        notes: Option<String>,
    },
    InsertLinkBooking {
        id: Ulid,
        token: String,
        student_name: String,
        student_email: String,
        scheduled_at: Ms,
        notes: Option<String>,
    },
    InsertScheduledBooking {
        id: Ulid,
        class_id: Ulid,
        student_email: String,
        scheduled_at: Ms,
        notes: Option<String>,
    },
    SetBookingStatus {
        booking_id: Ulid,
        status: BookingStatus,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    ProposeReschedule {
        id: Ulid,
        booking_id: Ulid,
        proposed_time: Ms,
    },
    DecideReschedule {
        request_id: Ulid,
        booking_id: Option<Ulid>,
        decision: RescheduleStatus,
    },
    SelectRescheduleRequests {
        booking_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
    Checkpoint,
}

/// Which side of the calendar a `SELECT * FROM bookings` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Tutor(Ulid),
    Student(Ulid),
}

const DEFAULT_TIMEZONE: &str = "UTC";

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().to_string();
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }
    if upper == "CHECKPOINT" {
        return Ok(Command::Checkpoint);
    }

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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "users" => {
            require_arity("users", &values, 4)?;
            let role = parse_string(&values[3])?;
            Ok(Command::InsertUser {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                email: parse_string(&values[2])?,
                role: Role::parse(&role).ok_or_else(|| SqlError::Parse(format!("bad role: {role}")))?,
            })
        }
        "classes" => {
            require_arity("classes", &values, 4)?;
            let is_active = match values.get(4) {
                Some(expr) => parse_bool(expr)?,
                None => true,
            };
            Ok(Command::SaveClass {
                id: parse_ulid(&values[0])?,
                tutor_id: parse_ulid(&values[1])?,
                title: parse_string(&values[2])?,
                duration_minutes: parse_u32(&values[3])?,
                is_active,
            })
        }
        "share_links" => {
            require_arity("share_links", &values, 2)?;
            let expires_at = match values.get(2) {
                Some(expr) => parse_i64_or_null(expr)?,
                None => None,
            };
            Ok(Command::IssueShareLink {
                token: parse_string(&values[0])?,
                class_id: parse_ulid(&values[1])?,
                expires_at,
            })
        }
        "availability_rules" => {
            require_arity("availability_rules", &values, 5)?;
            let timezone = match values.get(5) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            let buffer_minutes = match values.get(6) {
                Some(expr) => parse_i64_or_null(expr)?
                    .map(|v| u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range"))))
                    .transpose()?,
                None => None,
            };
            Ok(Command::SaveRule {
                id: parse_ulid(&values[0])?,
                tutor_id: parse_ulid(&values[1])?,
                day_of_week: parse_u8(&values[2])?,
                start_time: parse_time(&values[3])?,
                end_time: parse_time(&values[4])?,
                timezone: timezone.unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
                buffer_minutes,
            })
        }
        "bookings" => {
            require_arity("bookings", &values, 3)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                class_id: parse_ulid(&values[1])?,
                scheduled_at: parse_i64(&values[2])?,
                notes: optional_string(&values, 3)?,
            })
        }
        "link_bookings" => {
            require_arity("link_bookings", &values, 5)?;
            Ok(Command::InsertLinkBooking {
                id: parse_ulid(&values[0])?,
                token: parse_string(&values[1])?,
                student_name: parse_string(&values[2])?,
                student_email: parse_string(&values[3])?,
                scheduled_at: parse_i64(&values[4])?,
                notes: optional_string(&values, 5)?,
            })
        }
        "scheduled_bookings" => {
            require_arity("scheduled_bookings", &values, 4)?;
            Ok(Command::InsertScheduledBooking {
                id: parse_ulid(&values[0])?,
                class_id: parse_ulid(&values[1])?,
                student_email: parse_string(&values[2])?,
                scheduled_at: parse_i64(&values[3])?,
                notes: optional_string(&values, 4)?,
            })
        }
        "booking_status" => {
            require_arity("booking_status", &values, 2)?;
            let status = parse_string(&values[1])?;
            Ok(Command::SetBookingStatus {
                booking_id: parse_ulid(&values[0])?,
                status: BookingStatus::parse(&status)
                    .ok_or_else(|| SqlError::Parse(format!("bad booking status: {status}")))?,
            })
        }
        "reschedule_requests" => {
            require_arity("reschedule_requests", &values, 3)?;
            Ok(Command::ProposeReschedule {
                id: parse_ulid(&values[0])?,
                booking_id: parse_ulid(&values[1])?,
                proposed_time: parse_i64(&values[2])?,
            })
        }
        "reschedule_decisions" => {
            require_arity("reschedule_decisions", &values, 3)?;
            let decision = parse_string(&values[2])?;
            let decision = match RescheduleStatus::parse(&decision) {
                Some(d @ (RescheduleStatus::Accepted | RescheduleStatus::Declined)) => d,
                _ => return Err(SqlError::Parse(format!("bad decision: {decision}"))),
            };
            Ok(Command::DecideReschedule {
                request_id: parse_ulid(&values[0])?,
                booking_id: parse_ulid_or_null(&values[1])?,
                decision,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "availability_rules" => Ok(Command::DeleteRule { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters);
    }
    let filter = |col: &'static str| find_filter(&filters, col);

    match table.as_str() {
        "availability_rules" => Ok(Command::SelectRules {
            tutor_id: parse_ulid(filter("tutor_id")?)?,
        }),
        "booked_slots" => Ok(Command::SelectBookedSlots {
            tutor_id: parse_ulid(filter("tutor_id")?)?,
            date: parse_date(filter("on_date")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            class_id: parse_ulid(filter("class_id")?)?,
            date: parse_date(filter("on_date")?)?,
        }),
        "bookings" => {
            let booking_filter = if let Ok(expr) = filter("id") {
                BookingFilter::Id(parse_ulid(expr)?)
            } else if let Ok(expr) = filter("tutor_id") {
                BookingFilter::Tutor(parse_ulid(expr)?)
            } else if let Ok(expr) = filter("student_id") {
                BookingFilter::Student(parse_ulid(expr)?)
            } else {
                return Err(SqlError::MissingFilter("id, tutor_id or student_id"));
            };
            Ok(Command::SelectBookings {
                filter: booking_filter,
            })
        }
        "reschedule_requests" => Ok(Command::SelectRescheduleRequests {
            booking_id: parse_ulid(filter("booking_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flattens `a = x AND b = y AND ...` into `(column, value)` pairs. Anything
/// that is not an equality on a column is ignored.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out);
            collect_eq_filters(right, out);
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, right));
            }
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        _ => {}
    }
}

fn find_filter<'a>(filters: &[(String, &'a Expr)], col: &'static str) -> Result<&'a Expr, SqlError> {
    filters
        .iter()
        .find(|(name, _)| name == col)
        .map(|(_, expr)| *expr)
        .ok_or(SqlError::MissingFilter(col))
}

// ── Helpers ───────────────────────────────────────────────────

fn require_arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

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

/// First VALUES row. Multi-row inserts are rejected.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!(
                "multi-row VALUES ({} rows)",
                rows.len()
            ))),
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
                parse_ulid(right)
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_ulid(expr)?)),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
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
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_i64(expr)?)),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_string(expr)?)),
    }
}

/// Trailing optional text column: absent or NULL both mean `None`.
fn optional_string(values: &[Expr], idx: usize) -> Result<Option<String>, SqlError> {
    match values.get(idx) {
        Some(expr) => parse_string_or_null(expr),
        None => Ok(None),
    }
}

/// `'HH:MM'` or `'HH:MM:SS'`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
