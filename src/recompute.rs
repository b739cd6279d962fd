//! The full rebuild of all bucket tables from one transaction snapshot
use crate::aggregate::aggregate;
use crate::bucket::BucketKeys;
use crate::db::KpiDb;
use crate::error::Result;
use crate::model::{KpiBucket, PeriodKind};
use crate::source::TransactionSource;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Where a recompute currently is; runs always move forward through these
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Phase {
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "clearing")]
    Clearing,
    #[display(fmt = "fetching")]
    Fetching,
    #[display(fmt = "aggregating {}", _0)]
    Aggregating(PeriodKind),
}

/// What one successful recompute wrote
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize)]
#[display(
    fmt = "{} transactions into {} day, {} week and {} month buckets",
    transactions,
    day,
    week,
    month
)]
pub struct RecomputeSummary {
    pub transactions: usize,
    pub day: usize,
    pub week: usize,
    pub month: usize,
}

impl RecomputeSummary {
    fn set_buckets(&mut self, kind: PeriodKind, n: usize) {
        match kind {
            PeriodKind::Day => self.day = n,
            PeriodKind::Week => self.week = n,
            PeriodKind::Month => self.month = n,
        }
    }
}

pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Owns the transaction source and the bucket tables it rebuilds
pub struct Recompute<S, D> {
    source: S,
    db: D,
    keys: BucketKeys,
    clock: Clock,
}

impl<S: TransactionSource, D: KpiDb> Recompute<S, D> {
    pub fn new(source: S, db: D, keys: BucketKeys) -> Self {
        Self {
            source,
            db,
            keys,
            clock: Box::new(Utc::now),
        }
    }

    /// Replace the clock that stamps `last_updated` on day buckets
    pub fn with_clock(
        mut self,
        clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut D {
        &mut self.db
    }

    /// Clear all tables, fetch the snapshot and write day, week and month buckets
    ///
    /// Everything happens inside one [`rebuild`](../db/trait.KpiDb.html#method.rebuild), so
    /// either the complete new state is committed or the previous one stays in place. The
    /// first error ends the run and is returned unchanged.
    #[instrument(skip(self), fields(db = self.db.name()))]
    pub fn recompute(&mut self) -> Result<RecomputeSummary> {
        let Self {
            source,
            db,
            keys,
            clock,
        } = self;
        let mut phase = Phase::Idle;
        let mut summary = RecomputeSummary::default();

        let res = db.rebuild(&mut |buckets| {
            summary = RecomputeSummary::default();

            phase = Phase::Clearing;
            debug!(%phase);
            for kind in PeriodKind::ALL {
                buckets.clear(kind)?;
            }

            phase = Phase::Fetching;
            debug!(%phase);
            let transactions = source.fetch_all()?;
            summary.transactions = transactions.len();
            let now = clock();

            for kind in PeriodKind::ALL {
                phase = Phase::Aggregating(kind);
                debug!(%phase);
                let totals = aggregate(keys, kind, &transactions)?;
                for (period_start, total) in &totals {
                    let bucket = match buckets.find(kind, *period_start)? {
                        Some(existing) => existing.replaced(*total, now),
                        None => KpiBucket::new(kind, *period_start, *total, now),
                    };
                    buckets.save(&bucket)?;
                }
                debug!(%kind, buckets = totals.len(), "written");
                summary.set_buckets(kind, totals.len());
            }
            Ok(())
        });

        match res {
            Ok(()) => {
                info!("recomputed {}", summary);
                Ok(summary)
            }
            Err(e) => {
                warn!(%phase, "recompute failed, previous buckets kept: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Buckets, MemoryDb, SqliteDB};
    use crate::error::{KpiError, ValidationError};
    use crate::model::Transaction;
    use crate::source::{SourceColumns, SqliteSource};
    use chrono::{Duration, NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn worked_example() -> Vec<Transaction> {
        vec![
            Transaction::new(at(2024, 1, 1, 10), dec!(100.00)).with_invoice("1"),
            Transaction::new(at(2024, 1, 1, 18), dec!(50.00)).with_invoice("2"),
            Transaction::new(at(2024, 1, 8, 9), dec!(20.00)).with_invoice("3"),
        ]
    }

    /// a clock that advances one minute per reading
    fn ticking() -> impl Fn() -> DateTime<Utc> + Send + Sync + 'static {
        let ticks = Arc::new(AtomicI64::new(0));
        move || at(2024, 2, 1, 0) + Duration::minutes(ticks.fetch_add(1, Ordering::SeqCst))
    }

    fn totals(db: &mut impl KpiDb, kind: PeriodKind) -> Vec<(NaiveDate, Decimal)> {
        db.get_range(kind, date(2000, 1, 1), date(2100, 1, 1))
            .unwrap()
            .into_iter()
            .map(|b| (b.period_start, b.total_revenue))
            .collect()
    }

    #[test_log::test]
    fn must_rebuild_worked_example() {
        let mut engine = Recompute::new(worked_example(), MemoryDb::new(), BucketKeys::default())
            .with_clock(ticking());
        let summary = engine.recompute().unwrap();
        assert_eq!(
            summary,
            RecomputeSummary {
                transactions: 3,
                day: 2,
                week: 2,
                month: 1
            }
        );
        let db = engine.db_mut();
        assert_eq!(
            totals(db, PeriodKind::Day),
            vec![(date(2024, 1, 1), dec!(150.00)), (date(2024, 1, 8), dec!(20.00))]
        );
        assert_eq!(totals(db, PeriodKind::Week), totals(db, PeriodKind::Day));
        assert_eq!(totals(db, PeriodKind::Month), vec![(date(2024, 1, 1), dec!(170.00))]);

        let day = db.get_bucket(PeriodKind::Day, date(2024, 1, 8)).unwrap().unwrap();
        assert_eq!(day.last_updated, Some(at(2024, 2, 1, 0)));
        let month = db.get_bucket(PeriodKind::Month, date(2024, 1, 1)).unwrap().unwrap();
        assert_eq!(month.last_updated, None);
    }

    #[test]
    fn must_be_idempotent_apart_from_stamps() {
        let mut engine = Recompute::new(worked_example(), MemoryDb::new(), BucketKeys::default())
            .with_clock(ticking());
        let first = engine.recompute().unwrap();
        let before: Vec<_> = PeriodKind::ALL
            .iter()
            .map(|k| totals(engine.db_mut(), *k))
            .collect();
        let second = engine.recompute().unwrap();
        let after: Vec<_> = PeriodKind::ALL
            .iter()
            .map(|k| totals(engine.db_mut(), *k))
            .collect();
        assert_eq!(first, second);
        assert_eq!(before, after);

        let day = engine
            .db_mut()
            .get_bucket(PeriodKind::Day, date(2024, 1, 1))
            .unwrap()
            .unwrap();
        assert_eq!(day.last_updated, Some(at(2024, 2, 1, 0) + Duration::minutes(1)));
    }

    #[test]
    fn must_drop_buckets_without_transactions() {
        let db = MemoryDb::new();
        let mut engine = Recompute::new(worked_example(), db.clone(), BucketKeys::default());
        engine.recompute().unwrap();
        assert_eq!(db.count(PeriodKind::Day).unwrap(), 2);

        let nothing = Vec::<Transaction>::new();
        let mut engine = Recompute::new(nothing, db.clone(), BucketKeys::default());
        assert_eq!(engine.recompute().unwrap(), RecomputeSummary::default());
        for kind in PeriodKind::ALL {
            assert_eq!(db.count(kind).unwrap(), 0, "{}", kind);
        }
    }

    #[test]
    fn must_bucket_in_configured_zone() {
        // 20:00 UTC on Sunday is already Monday in Kolkata
        let txs = vec![Transaction::new(at(2024, 1, 7, 20), dec!(5))];
        let keys = BucketKeys::new(chrono_tz::Asia::Kolkata);
        let mut engine = Recompute::new(txs, MemoryDb::new(), keys);
        engine.recompute().unwrap();
        let monday = vec![(date(2024, 1, 8), dec!(5))];
        assert_eq!(totals(engine.db_mut(), PeriodKind::Day), monday);
        assert_eq!(totals(engine.db_mut(), PeriodKind::Week), monday);
    }

    #[test_log::test]
    fn must_keep_previous_buckets_when_a_transaction_is_bad() {
        let db = MemoryDb::new();
        let mut engine = Recompute::new(worked_example(), db.clone(), BucketKeys::default());
        engine.recompute().unwrap();

        let mut txs = worked_example();
        txs.push(Transaction {
            invoice_no: Some("BAD".to_owned()),
            timestamp: None,
            net_revenue: Some(dec!(1)),
        });
        let mut engine = Recompute::new(txs, db.clone(), BucketKeys::default());
        let err = engine.recompute().unwrap_err();
        assert!(matches!(
            err,
            KpiError::Validation(ValidationError::MissingTimestamp { ref invoice })
                if invoice == "BAD"
        ));
        assert_eq!(db.count(PeriodKind::Day).unwrap(), 2);
        assert_eq!(db.count(PeriodKind::Week).unwrap(), 2);
        assert_eq!(db.count(PeriodKind::Month).unwrap(), 1);
    }

    struct Unreachable;

    impl TransactionSource for Unreachable {
        fn fetch_all(&mut self) -> Result<Vec<Transaction>> {
            Err(KpiError::store("fetching transactions", "connection reset"))
        }
    }

    /// Applies every write immediately, as a store without transactions would
    #[derive(Default)]
    struct UnguardedDb(BTreeMap<(PeriodKind, NaiveDate), KpiBucket>);

    impl Buckets for UnguardedDb {
        fn find(&mut self, kind: PeriodKind, start: NaiveDate) -> Result<Option<KpiBucket>> {
            Ok(self.0.get(&(kind, start)).cloned())
        }
        fn save(&mut self, bucket: &KpiBucket) -> Result<()> {
            self.0.insert((bucket.kind, bucket.period_start), bucket.clone());
            Ok(())
        }
        fn clear(&mut self, kind: PeriodKind) -> Result<()> {
            self.0.retain(|(k, _), _| *k != kind);
            Ok(())
        }
    }

    impl KpiDb for UnguardedDb {
        fn name(&self) -> &'static str {
            "unguarded"
        }
        fn rebuild(&mut self, f: &mut dyn FnMut(&mut dyn Buckets) -> Result<()>) -> Result<()> {
            f(self)
        }
        fn get_bucket(&mut self, kind: PeriodKind, start: NaiveDate) -> Result<Option<KpiBucket>> {
            self.find(kind, start)
        }
        fn get_range(
            &mut self,
            kind: PeriodKind,
            start: NaiveDate,
            end: NaiveDate,
        ) -> Result<Vec<KpiBucket>> {
            Ok(self
                .0
                .values()
                .filter(|b| b.kind == kind && b.period_start >= start && b.period_start <= end)
                .cloned()
                .collect())
        }
    }

    #[test]
    fn must_not_expose_cleared_tables_when_the_source_fails() {
        let db = MemoryDb::new();
        Recompute::new(worked_example(), db.clone(), BucketKeys::default())
            .recompute()
            .unwrap();
        let mut engine = Recompute::new(Unreachable, db.clone(), BucketKeys::default());
        let err = engine.recompute().unwrap_err();
        assert_eq!(
            err.to_string(),
            "store error while fetching transactions: connection reset"
        );
        assert_eq!(db.count(PeriodKind::Day).unwrap(), 2);

        // without a transaction the same failure leaves every table empty
        let unguarded = UnguardedDb::default();
        let mut engine = Recompute::new(worked_example(), unguarded, BucketKeys::default());
        engine.recompute().unwrap();
        let unguarded = std::mem::take(engine.db_mut());
        let mut engine = Recompute::new(Unreachable, unguarded, BucketKeys::default());
        assert!(engine.recompute().is_err());
        assert!(engine.db().0.is_empty());
    }

    #[test_log::test]
    fn must_rebuild_from_sqlite_into_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "create table raw_orders_data (invoice_no text, date text, net_sales text);
                 insert into raw_orders_data values ('1', '2024-01-01 10:00:00', '100.00');
                 insert into raw_orders_data values ('2', '2024-01-01 18:00:00', '50.00');
                 insert into raw_orders_data values ('3', '2024-01-08 09:00:00', '20.00');",
            )
            .unwrap();
        }
        let keys = BucketKeys::default();
        let db = SqliteDB::new("", &path).unwrap();
        let source = SqliteSource::new(&path, &SourceColumns::default(), keys).unwrap();
        let mut engine = Recompute::new(source, db, keys).with_clock(ticking());
        let summary = engine.recompute().unwrap();
        assert_eq!(
            summary.to_string(),
            "3 transactions into 2 day, 2 week and 1 month buckets"
        );

        let mut reader = SqliteDB::new("", &path).unwrap();
        assert_eq!(
            totals(&mut reader, PeriodKind::Day),
            vec![(date(2024, 1, 1), dec!(150.00)), (date(2024, 1, 8), dec!(20.00))]
        );
        assert_eq!(
            totals(&mut reader, PeriodKind::Month),
            vec![(date(2024, 1, 1), dec!(170.00))]
        );
    }
}
