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
//! Keyed bucket stores, one collection per period kind
//!
//! The core is the [`KpiDb`](trait.KpiDb.html) trait, which represents the three bucket
//! tables (day, week, month) within some database. With such an implementation we can
//!
//!  - rebuild all tables inside one scoped transaction via
//!    [`rebuild`](trait.KpiDb.html#method.rebuild), which hands out a
//!    [`Buckets`](trait.Buckets.html) view supporting find, upsert and clear
//!  - read committed buckets by key or by date range
//!
//! Each table holds at most one row per period start; the store enforces this itself
//! (map key in memory, primary key plus `on conflict ... do update` in SQL).
//!
//! # Data storage format
//!
//! Table names follow [`BucketTable`](struct.BucketTable.html), optionally preceded by a common
//! prefix. Amounts are exact decimals: `numeric` in PostgreSQL, text in Sqlite.
//!
//! # Database schema migrations
//!
//! Since the bucket tables are derived data that every recompute rebuilds from scratch, no
//! effort is made to migrate existing rows when the layout changes (as is signaled by
//! incrementing [`TABLE_VERSION`](constant.TABLE_VERSION.html)). The previously used version
//! is stored in the table named by
//! [`SCHEMA_VERSIONS_TABLE_NAME`](constant.SCHEMA_VERSIONS_TABLE_NAME.html);
//! a table with the wrong version is dropped and created anew, and stays empty until the
//! next recompute.
use crate::error::Result;
use crate::model::{KpiBucket, PeriodKind};
use chrono::NaiveDate;
use itertools::Itertools;
use std::collections::BTreeMap;

mod memory;
mod postgre;
mod sqlite;

pub use memory::MemoryDb;
pub use postgre::{PostgresDB, PostgresDbMechanics};
pub use sqlite::{SqliteDB, SqliteDbMechanics};

pub const SCHEMA_VERSIONS_TABLE_NAME: &str = "_schema_versions";
pub const TABLE_VERSION: i32 = 1;

/// Write access to the bucket tables during a rebuild
pub trait Buckets {
    fn find(&mut self, kind: PeriodKind, period_start: NaiveDate) -> Result<Option<KpiBucket>>;
    /// Insert the bucket, or replace the one with the same kind and period start
    fn save(&mut self, bucket: &KpiBucket) -> Result<()>;
    /// Delete every bucket of this kind
    fn clear(&mut self, kind: PeriodKind) -> Result<()>;
}

/// A set of day/week/month bucket tables in a certain kind of database
pub trait KpiDb {
    fn name(&self) -> &'static str;

    /// Run `f` against the tables inside one scoped transaction
    ///
    /// The changes become visible to readers only if `f` returns `Ok`; otherwise all of
    /// them are discarded and the error is passed on unchanged.
    fn rebuild(&mut self, f: &mut dyn FnMut(&mut dyn Buckets) -> Result<()>) -> Result<()>;

    fn get_bucket(&mut self, kind: PeriodKind, period_start: NaiveDate)
        -> Result<Option<KpiBucket>>;

    /// Committed buckets with `start <= period_start <= end`, in ascending order
    fn get_range(
        &mut self,
        kind: PeriodKind,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<KpiBucket>>;
}

impl<T: KpiDb + ?Sized> KpiDb for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn rebuild(&mut self, f: &mut dyn FnMut(&mut dyn Buckets) -> Result<()>) -> Result<()> {
        (**self).rebuild(f)
    }
    fn get_bucket(
        &mut self,
        kind: PeriodKind,
        period_start: NaiveDate,
    ) -> Result<Option<KpiBucket>> {
        (**self).get_bucket(kind, period_start)
    }
    fn get_range(
        &mut self,
        kind: PeriodKind,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<KpiBucket>> {
        (**self).get_range(kind, start, end)
    }
}

/// Layout of the table holding one period kind
#[derive(Debug, PartialEq, Eq)]
pub struct BucketTable {
    pub kind: PeriodKind,
    /// name of the table, before prefixing
    pub name: &'static str,
    /// name of the unique period start column
    pub key: &'static str,
    /// whether rows carry a `last_updated` column
    pub stamped: bool,
}

static TABLES: [BucketTable; 3] = [
    BucketTable {
        kind: PeriodKind::Day,
        name: "daily_kpis",
        key: "report_date",
        stamped: true,
    },
    BucketTable {
        kind: PeriodKind::Week,
        name: "weekly_kpis",
        key: "week_start_date",
        stamped: false,
    },
    BucketTable {
        kind: PeriodKind::Month,
        name: "monthly_kpis",
        key: "month_start_date",
        stamped: false,
    },
];

impl BucketTable {
    pub fn of(kind: PeriodKind) -> &'static BucketTable {
        match kind {
            PeriodKind::Day => &TABLES[0],
            PeriodKind::Week => &TABLES[1],
            PeriodKind::Month => &TABLES[2],
        }
    }

    pub fn all() -> &'static [BucketTable] {
        &TABLES
    }

    /// columns in the order used by all statements below
    fn columns(&self) -> Vec<&'static str> {
        let mut columns = vec![self.key, "total_revenue"];
        if self.stamped {
            columns.push("last_updated");
        }
        columns
    }
}

/// Functions and types needed for constructing the SQL queries for a database driver
pub trait DbMechanics {
    /// A common prefix that is prepended to all table names within this database
    fn table_prefix(&self) -> &str;
    /// A function that computes a final table name; by default prepends the
    /// [`table_prefix`](#method.table_prefix)
    fn table_name(&self, table: &str) -> String {
        format!("{}{}", self.table_prefix(), table)
    }

    /// An iterator emitting parameter placeholder strings for use in prepared statements
    fn field_iter() -> Box<dyn Iterator<Item = String>>;
    /// Compute the SQL statement necessary to create the given table if it does not yet exist
    fn create_table(name: String, definition: String) -> String {
        format!("create table if not exists {} ({})", name, definition)
    }
    /// column types for period start, amount and timestamp, in this order
    fn column_types() -> [&'static str; 3];

    fn create_bucket_table(&self, table: &BucketTable) -> String {
        let [date, decimal, stamp] = Self::column_types();
        let mut definition = vec![
            format!("{} {} primary key", table.key, date),
            format!("total_revenue {} not null", decimal),
        ];
        if table.stamped {
            definition.push(format!("last_updated {}", stamp));
        }
        Self::create_table(self.table_name(table.name), definition.join(", "))
    }

    fn select_bucket(&self, table: &BucketTable) -> String {
        let mut fields = Self::field_iter();
        format!(
            "select {} from {} where {} = {}",
            table.columns().join(", "),
            self.table_name(table.name),
            table.key,
            fields.next().unwrap_or_default()
        )
    }

    fn select_range(&self, table: &BucketTable) -> String {
        let mut fields = Self::field_iter();
        format!(
            "select {cols} from {name} where {key} >= {lo} and {key} <= {hi} order by {key}",
            cols = table.columns().join(", "),
            name = self.table_name(table.name),
            key = table.key,
            lo = fields.next().unwrap_or_default(),
            hi = fields.next().unwrap_or_default(),
        )
    }

    fn upsert_bucket(&self, table: &BucketTable) -> String {
        let columns = table.columns();
        let holes = Self::field_iter().take(columns.len()).join(", ");
        let updates = columns
            .iter()
            .skip(1)
            .map(|col| format!("{col} = excluded.{col}", col = col))
            .join(", ");
        format!(
            "insert into {} ({}) values ({}) on conflict({}) do update set {}",
            self.table_name(table.name),
            columns.join(", "),
            holes,
            table.key,
            updates
        )
    }

    fn delete_buckets(&self, table: &BucketTable) -> String {
        format!("delete from {}", self.table_name(table.name))
    }

    fn select_table_versions(&self) -> String {
        let names = BucketTable::all()
            .iter()
            .map(|t| format!("'{}'", self.table_name(t.name)))
            .join(",");
        format!(
            "select table_name, version from {} where table_name in ({})",
            SCHEMA_VERSIONS_TABLE_NAME, names
        )
    }

    fn expected_table_versions(&self) -> BTreeMap<String, i32> {
        BucketTable::all()
            .iter()
            .map(|t| (self.table_name(t.name), TABLE_VERSION))
            .collect()
    }

    /// Statements that reset version bookkeeping and recreate all bucket tables
    fn migrate_tables(&self) -> Vec<String> {
        BucketTable::all()
            .iter()
            .flat_map(|t| {
                let name = self.table_name(t.name);
                vec![
                    format!(
                        "delete from {} where table_name = '{}'",
                        SCHEMA_VERSIONS_TABLE_NAME, name
                    ),
                    format!(
                        "insert into {} values ('{}', {})",
                        SCHEMA_VERSIONS_TABLE_NAME, name, TABLE_VERSION
                    ),
                    format!("drop table if exists {}", name),
                    self.create_bucket_table(t),
                ]
            })
            .collect()
    }
}

/// Check a configured table prefix or column name before splicing it into SQL
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

pub(crate) fn normalize_prefix(prefix: impl Into<String>) -> Result<String> {
    let mut prefix = prefix.into();
    if !prefix.is_empty() {
        if !is_identifier(&prefix) {
            return Err(crate::error::KpiError::store(
                "opening database",
                format!("invalid table prefix '{}'", prefix),
            ));
        }
        prefix.push('_');
    }
    Ok(prefix)
}
