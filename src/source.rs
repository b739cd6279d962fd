//! Where the engine gets its snapshot of transactions from
//!
//! A source hands out the complete current set of transactions on every call. Rows are
//! converted as faithfully as possible; values that are present but unreadable become
//! validation errors right here, absent values are passed on as `None` and rejected by
//! the aggregation.
use crate::bucket::BucketKeys;
use crate::db::is_identifier;
use crate::error::{KpiError, OrStore, Result, ValidationError};
use crate::model::Transaction;
use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{types::ValueRef, Connection, OpenFlags, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, trace_span};

pub trait TransactionSource {
    /// The full current set of transactions, in no particular order
    fn fetch_all(&mut self) -> Result<Vec<Transaction>>;
}

impl TransactionSource for Vec<Transaction> {
    fn fetch_all(&mut self) -> Result<Vec<Transaction>> {
        Ok(self.clone())
    }
}

impl<T: TransactionSource + ?Sized> TransactionSource for Box<T> {
    fn fetch_all(&mut self) -> Result<Vec<Transaction>> {
        (**self).fetch_all()
    }
}

/// Which table and columns hold the order data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceColumns {
    pub table: String,
    pub timestamp: String,
    pub revenue: String,
    pub invoice: Option<String>,
}

impl Default for SourceColumns {
    fn default() -> Self {
        Self {
            table: "raw_orders_data".to_owned(),
            timestamp: "date".to_owned(),
            revenue: "net_sales".to_owned(),
            invoice: Some("invoice_no".to_owned()),
        }
    }
}

impl SourceColumns {
    fn query(&self) -> Result<String> {
        let names = std::iter::once(&self.table)
            .chain(Some(&self.timestamp))
            .chain(Some(&self.revenue))
            .chain(self.invoice.as_ref());
        for name in names {
            if !is_identifier(name) {
                return Err(KpiError::store(
                    "configuring source",
                    format!("invalid table or column name '{}'", name),
                ));
            }
        }
        Ok(format!(
            "select {}, {}, {} from {}",
            self.timestamp,
            self.revenue,
            self.invoice.as_deref().unwrap_or("null"),
            self.table
        ))
    }
}

/// Reads transactions from a table in a Sqlite3 database
pub struct SqliteSource {
    conn: Connection,
    query: String,
    keys: BucketKeys,
}

impl SqliteSource {
    /// Open an existing database read-only; `keys` supplies the zone of naive timestamps
    pub fn new(
        path: impl AsRef<Path>,
        columns: &SourceColumns,
        keys: BucketKeys,
    ) -> Result<Self> {
        let query = columns.query()?;
        let conn = connect(path.as_ref()).or_store("connecting to source")?;
        Ok(Self::with_connection(conn, query, keys))
    }

    fn with_connection(conn: Connection, query: String, keys: BucketKeys) -> Self {
        Self { conn, query, keys }
    }

    fn parse_row(
        &self,
        row: &Row,
    ) -> rusqlite::Result<std::result::Result<Transaction, ValidationError>> {
        let invoice_no = match row.get_ref(2)? {
            ValueRef::Null => None,
            ValueRef::Integer(i) => Some(i.to_string()),
            v => Some(text(v)),
        };
        let label = invoice_no.clone().unwrap_or_else(|| "<no invoice>".to_owned());
        let timestamp = match timestamp(row.get_ref(0)?, &self.keys) {
            Ok(ts) => ts,
            Err(value) => {
                return Ok(Err(ValidationError::MalformedTimestamp {
                    invoice: label,
                    value,
                }))
            }
        };
        let net_revenue = match amount(row.get_ref(1)?) {
            Ok(amt) => amt,
            Err(value) => {
                return Ok(Err(ValidationError::MalformedAmount {
                    invoice: label,
                    value,
                }))
            }
        };
        Ok(Ok(Transaction {
            invoice_no,
            timestamp,
            net_revenue,
        }))
    }
}

impl TransactionSource for SqliteSource {
    #[instrument(skip(self), level = "debug")]
    fn fetch_all(&mut self) -> Result<Vec<Transaction>> {
        let mut stmt = self
            .conn
            .prepare_cached(&self.query)
            .or_store("fetching transactions")?;
        let mut rows = stmt.query([]).or_store("fetching transactions")?;
        let mut ret = vec![];
        while let Some(row) = rows.next().or_store("fetching transactions")? {
            ret.push(self.parse_row(row).or_store("fetching transactions")??);
        }
        debug!(rows = ret.len(), "fetched");
        Ok(ret)
    }
}

/// The orders belong to someone else: never create the file or change its journal mode
fn connect(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    trace_span!("connect").in_scope(|| {
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("opening {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        debug!("new source connection");
        Ok(conn)
    })
}

fn text(v: ValueRef) -> String {
    match v {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    }
}

/// Integers are unix seconds, text is RFC 3339 or a local `YYYY-MM-DD HH:MM:SS`
fn timestamp(
    v: ValueRef,
    keys: &BucketKeys,
) -> std::result::Result<Option<DateTime<Utc>>, String> {
    match v {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(secs) => Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(Some)
            .ok_or_else(|| secs.to_string()),
        ValueRef::Text(t) => {
            let s = String::from_utf8_lossy(t);
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(ts.with_timezone(&Utc)));
            }
            ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .and_then(|local| keys.localize(&local))
                .map(Some)
                .ok_or_else(|| s.to_owned())
        }
        v => Err(text(v)),
    }
}

fn amount(v: ValueRef) -> std::result::Result<Option<Decimal>, String> {
    match v {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(i) => Ok(Some(Decimal::from(i))),
        // the shortest representation of the float, not its binary expansion
        ValueRef::Real(f) => {
            let s = f.to_string();
            exact_decimal(&s).map(Some).ok_or(s)
        }
        ValueRef::Text(t) => {
            let s = String::from_utf8_lossy(t);
            let s = s.trim();
            exact_decimal(s).map(Some).ok_or_else(|| s.to_owned())
        }
        v => Err(text(v)),
    }
}

/// Parse decimal text, refusing values that a `Decimal` could only hold rounded
fn exact_decimal(s: &str) -> Option<Decimal> {
    let value = Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()?;
    let written = s.split(|c| c == 'e' || c == 'E').next().unwrap_or_default();
    let written: String = written.chars().filter(char::is_ascii_digit).collect();
    let kept = value.abs().normalize().mantissa().to_string();
    (significant(&written) == significant(&kept)).then_some(value)
}

fn significant(digits: &str) -> &str {
    digits.trim_start_matches('0').trim_end_matches('0')
}
