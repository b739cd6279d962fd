/*
 * Copyright 2020 Actyx AG
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use super::{normalize_prefix, BucketTable, Buckets, DbMechanics, KpiDb, SCHEMA_VERSIONS_TABLE_NAME};
use crate::error::{KpiError, OrStore, Result};
use crate::model::{KpiBucket, PeriodKind};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, instrument, trace_span};

/// Database driver for Sqlite3, based on the rusqlite crate
pub struct SqliteDB {
    conn: Connection,
    mechanics: SqliteDbMechanics,
}

/// Open a connection in WAL mode so that readers on other connections see committed state
fn connect(db_name: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    trace_span!("connect").in_scope(|| {
        let conn = Connection::open_with_flags(db_name, flags)
            .with_context(|| format!("opening {}", db_name.display()))?;

        // `PRAGMA journal_mode = WAL;` https://www.sqlite.org/wal.html
        // This PRAGMA statement returns the new journal mode, so we need to see if it succeeded
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        if mode != "wal" && mode != "memory" {
            anyhow::bail!("cannot switch to WAL journal, got '{}'", mode);
        }
        // `PRAGMA synchronous = NORMAL;` https://www.sqlite.org/pragma.html#pragma_synchronous
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        // wait for a concurrent writer instead of failing right away
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        debug!("new connection");
        Ok(conn)
    })
}

impl SqliteDB {
    pub fn new(prefix: impl Into<String>, db_name: impl AsRef<Path>) -> Result<Self> {
        let conn = connect(db_name.as_ref()).or_store("connecting")?;
        let mut ret = Self {
            conn,
            mechanics: SqliteDbMechanics {
                prefix: normalize_prefix(prefix)?,
            },
        };
        ret.init().or_store("initializing schema")?;
        Ok(ret)
    }

    fn init(&mut self) -> anyhow::Result<()> {
        let schema_versions_table_schema = "table_name text, version int not null".to_owned();
        self.conn.execute_batch(&format!(
            "{};",
            SqliteDbMechanics::create_table(
                SCHEMA_VERSIONS_TABLE_NAME.to_string(),
                schema_versions_table_schema,
            )
        ))?;

        let tx = self.conn.transaction()?;
        let res = {
            let mut stmt = tx.prepare(&self.mechanics.select_table_versions())?;
            let rows =
                stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?)))?;
            rows.collect::<rusqlite::Result<BTreeMap<String, i32>>>()?
        };

        info!("Sqlite, what we got regarding current_table_version: {:?}", &res);

        let expected_versions = self.mechanics.expected_table_versions();
        if res != expected_versions {
            info!(
                "migrating schema from version {:?} to version {:?}",
                res, expected_versions
            );
            for query in self.mechanics.migrate_tables() {
                tx.execute(&query, [])?;
            }
        }

        tx.commit()?;
        info!("initialization complete");
        Ok(())
    }
}

/// Database mechanics definitions for the Sqlite3 driver
pub struct SqliteDbMechanics {
    prefix: String,
}

impl DbMechanics for SqliteDbMechanics {
    fn table_prefix(&self) -> &str {
        &self.prefix
    }
    fn field_iter() -> Box<dyn Iterator<Item = String>> {
        Box::new(std::iter::repeat("?".to_owned()))
    }
    fn column_types() -> [&'static str; 3] {
        // decimals are kept as text to preserve every digit
        ["text", "text", "text"]
    }
}

fn parse_row(kind: PeriodKind, row: &Row) -> rusqlite::Result<KpiBucket> {
    let period_start: NaiveDate = row.get(0)?;
    let total: String = row.get(1)?;
    let total_revenue = Decimal::from_str(&total).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_updated: Option<DateTime<Utc>> = if BucketTable::of(kind).stamped {
        row.get(2)?
    } else {
        None
    };
    Ok(KpiBucket {
        kind,
        period_start,
        total_revenue,
        last_updated,
    })
}

fn find(
    conn: &Connection,
    mechanics: &SqliteDbMechanics,
    kind: PeriodKind,
    period_start: NaiveDate,
) -> Result<Option<KpiBucket>> {
    let mut stmt = conn
        .prepare_cached(&mechanics.select_bucket(BucketTable::of(kind)))
        .or_store("finding bucket")?;
    let mut rows = stmt
        .query_map(params![period_start], |row| parse_row(kind, row))
        .or_store("finding bucket")?;
    rows.next().transpose().or_store("finding bucket")
}

struct SqliteBuckets<'a> {
    conn: &'a Connection,
    mechanics: &'a SqliteDbMechanics,
    written: usize,
}

impl<'a> Buckets for SqliteBuckets<'a> {
    fn find(&mut self, kind: PeriodKind, period_start: NaiveDate) -> Result<Option<KpiBucket>> {
        find(self.conn, self.mechanics, kind, period_start)
    }

    fn save(&mut self, bucket: &KpiBucket) -> Result<()> {
        let table = BucketTable::of(bucket.kind);
        let mut stmt = self
            .conn
            .prepare_cached(&self.mechanics.upsert_bucket(table))
            .or_store("saving bucket")?;
        let total = bucket.total_revenue.to_string();
        let res = if table.stamped {
            stmt.execute(params![bucket.period_start, total, bucket.last_updated])
        } else {
            stmt.execute(params![bucket.period_start, total])
        };
        res.or_store("saving bucket")?;
        self.written += 1;
        Ok(())
    }

    fn clear(&mut self, kind: PeriodKind) -> Result<()> {
        let removed = self
            .conn
            .execute(&self.mechanics.delete_buckets(BucketTable::of(kind)), [])
            .or_store("clearing buckets")?;
        debug!(%kind, removed, "cleared");
        Ok(())
    }
}

impl KpiDb for SqliteDB {
    fn name(&self) -> &'static str {
        "Sqlite3(rusqlite)"
    }

    #[instrument(skip(self, f), level = "trace")]
    fn rebuild(&mut self, f: &mut dyn FnMut(&mut dyn Buckets) -> Result<()>) -> Result<()> {
        let tx = self.conn.transaction().or_store("starting transaction")?;
        let mut buckets = SqliteBuckets {
            conn: &tx,
            mechanics: &self.mechanics,
            written: 0,
        };
        // dropping `tx` on error rolls everything back
        f(&mut buckets)?;
        let written = buckets.written;
        tx.commit().or_store("committing buckets")?;
        debug!(written, "done writing");
        Ok(())
    }

    fn get_bucket(
        &mut self,
        kind: PeriodKind,
        period_start: NaiveDate,
    ) -> Result<Option<KpiBucket>> {
        find(&self.conn, &self.mechanics, kind, period_start)
    }

    fn get_range(
        &mut self,
        kind: PeriodKind,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<KpiBucket>> {
        let mut stmt = self
            .conn
            .prepare_cached(&self.mechanics.select_range(BucketTable::of(kind)))
            .or_store("reading bucket range")?;
        let rows = stmt
            .query_map(params![start, end], |row| parse_row(kind, row))
            .or_store("reading bucket range")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| KpiError::store("reading bucket range", e))
    }
}
