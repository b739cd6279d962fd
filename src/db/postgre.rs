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
use crate::error::{OrStore, Result};
use crate::model::{KpiBucket, PeriodKind};
use chrono::{DateTime, NaiveDate, Utc};
use native_tls::TlsConnector;
use postgres::{types::ToSql, Client, GenericClient, Row};
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, trace_span};

/// Database driver for PostgreSQL, based on the postgres crate
pub struct PostgresDB {
    conn: Client,
    mechanics: PostgresDbMechanics,
}

impl PostgresDB {
    pub fn new(prefix: impl Into<String>, db_name: &str) -> Result<Self> {
        let tls_mode = MakeTlsConnector::new(TlsConnector::new().or_store("connecting")?);

        let conn = trace_span!("connect").in_scope(|| -> Result<_> {
            let ret = Client::connect(db_name, tls_mode).or_store("connecting")?;
            debug!("new connection");
            Ok(ret)
        })?;

        let mut ret = Self {
            conn,
            mechanics: PostgresDbMechanics {
                prefix: normalize_prefix(prefix)?,
            },
        };
        ret.init().or_store("initializing schema")?;
        Ok(ret)
    }

    fn init(&mut self) -> std::result::Result<(), postgres::Error> {
        let schema_versions_table_schema = "table_name text, version int not null".to_owned();
        let mut tx = self.conn.transaction()?;
        tx.execute(
            PostgresDbMechanics::create_table(
                SCHEMA_VERSIONS_TABLE_NAME.to_string(),
                schema_versions_table_schema,
            )
            .as_str(),
            &[],
        )?;
        let res: BTreeMap<String, i32> = tx
            .query(self.mechanics.select_table_versions().as_str(), &[])?
            .into_iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, i32>(1)))
            .collect();

        info!(
            "Postgres, what we got regarding current_table_version: {:?}",
            &res
        );

        let expected_versions = self.mechanics.expected_table_versions();
        if res != expected_versions {
            info!(
                "migrating schema from version {:?} to version {:?}",
                res, expected_versions
            );
            for query in self.mechanics.migrate_tables() {
                tx.execute(query.as_str(), &[])?;
            }
        }

        tx.commit()?;
        info!("initialization complete");
        Ok(())
    }

    #[cfg(test)]
    fn clear_database(&mut self) -> Result<()> {
        self.rebuild(&mut |b| {
            for kind in PeriodKind::ALL {
                b.clear(kind)?;
            }
            Ok(())
        })
    }
}

/// Database mechanics definitions for the PostgreSQL driver
pub struct PostgresDbMechanics {
    prefix: String,
}

impl DbMechanics for PostgresDbMechanics {
    fn table_prefix(&self) -> &str {
        &self.prefix
    }
    fn field_iter() -> Box<dyn Iterator<Item = String>> {
        Box::new((1..usize::MAX).map(|i| format!("${}", i)))
    }
    fn column_types() -> [&'static str; 3] {
        ["date", "numeric", "timestamp with time zone"]
    }
}

fn parse_row(kind: PeriodKind, row: &Row) -> std::result::Result<KpiBucket, postgres::Error> {
    let period_start: NaiveDate = row.try_get(0)?;
    let total_revenue: Decimal = row.try_get(1)?;
    let last_updated: Option<DateTime<Utc>> = if BucketTable::of(kind).stamped {
        row.try_get(2)?
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
    conn: &mut impl GenericClient,
    mechanics: &PostgresDbMechanics,
    kind: PeriodKind,
    period_start: NaiveDate,
) -> Result<Option<KpiBucket>> {
    let row = conn
        .query_opt(
            mechanics.select_bucket(BucketTable::of(kind)).as_str(),
            &[&period_start],
        )
        .or_store("finding bucket")?;
    row.map(|row| parse_row(kind, &row))
        .transpose()
        .or_store("finding bucket")
}

struct PostgresBuckets<'a, 'b> {
    tx: &'a mut postgres::Transaction<'b>,
    mechanics: &'a PostgresDbMechanics,
    written: usize,
}

impl<'a, 'b> Buckets for PostgresBuckets<'a, 'b> {
    fn find(&mut self, kind: PeriodKind, period_start: NaiveDate) -> Result<Option<KpiBucket>> {
        find(&mut *self.tx, self.mechanics, kind, period_start)
    }

    fn save(&mut self, bucket: &KpiBucket) -> Result<()> {
        let table = BucketTable::of(bucket.kind);
        let mut params: Vec<&(dyn ToSql + Sync)> =
            vec![&bucket.period_start, &bucket.total_revenue];
        if table.stamped {
            params.push(&bucket.last_updated);
        }
        self.tx
            .execute(self.mechanics.upsert_bucket(table).as_str(), &params)
            .or_store("saving bucket")?;
        self.written += 1;
        Ok(())
    }

    fn clear(&mut self, kind: PeriodKind) -> Result<()> {
        let removed = self
            .tx
            .execute(
                self.mechanics.delete_buckets(BucketTable::of(kind)).as_str(),
                &[],
            )
            .or_store("clearing buckets")?;
        debug!(%kind, removed, "cleared");
        Ok(())
    }
}

impl KpiDb for PostgresDB {
    fn name(&self) -> &'static str {
        "PostgreSQL(postgres)"
    }

    #[instrument(skip(self, f), level = "trace")]
    fn rebuild(&mut self, f: &mut dyn FnMut(&mut dyn Buckets) -> Result<()>) -> Result<()> {
        let mut tx = self.conn.transaction().or_store("starting transaction")?;
        let mut buckets = PostgresBuckets {
            tx: &mut tx,
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
        find(&mut self.conn, &self.mechanics, kind, period_start)
    }

    fn get_range(
        &mut self,
        kind: PeriodKind,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<KpiBucket>> {
        self.conn
            .query(
                self.mechanics.select_range(BucketTable::of(kind)).as_str(),
                &[&start, &end],
            )
            .or_store("reading bucket range")?
            .iter()
            .map(|row| parse_row(kind, row))
            .collect::<std::result::Result<Vec<_>, _>>()
            .or_store("reading bucket range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::*;

    #[test]
    fn postgres_must_store() {
        let mut db = if let Ok(conn_str) = std::env::var("POSTGRES_CONNECT") {
            PostgresDB::new("", conn_str.as_str()).unwrap()
        } else {
            return;
        };
        db.clear_database().unwrap();
        check_store_contract(&mut db);
        db.clear_database().unwrap();
    }
}
