//! In-process bucket tables
//!
//! Handles are cheap to clone and share the same tables, so a query handle can read while
//! another handle rebuilds. A rebuild works on a staged copy that replaces the shared
//! tables only on success.
use super::{Buckets, KpiDb};
use crate::error::{KpiError, Result};
use crate::model::{KpiBucket, PeriodKind};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument};

type Tables = BTreeMap<PeriodKind, BTreeMap<NaiveDate, KpiBucket>>;

#[derive(Clone, Debug, Default)]
pub struct MemoryDb {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed buckets of this kind
    pub fn count(&self, kind: PeriodKind) -> Result<usize> {
        self.read(|tables| tables.get(&kind).map_or(0, BTreeMap::len))
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        let tables = self
            .tables
            .read()
            .map_err(|_| KpiError::store("reading buckets", "memory tables poisoned"))?;
        Ok(f(&tables))
    }
}

struct Staged<'a>(&'a mut Tables);

impl<'a> Buckets for Staged<'a> {
    fn find(&mut self, kind: PeriodKind, period_start: NaiveDate) -> Result<Option<KpiBucket>> {
        Ok(self
            .0
            .get(&kind)
            .and_then(|t| t.get(&period_start))
            .cloned())
    }

    fn save(&mut self, bucket: &KpiBucket) -> Result<()> {
        self.0
            .entry(bucket.kind)
            .or_default()
            .insert(bucket.period_start, bucket.clone());
        Ok(())
    }

    fn clear(&mut self, kind: PeriodKind) -> Result<()> {
        self.0.remove(&kind);
        Ok(())
    }
}

impl KpiDb for MemoryDb {
    fn name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, f), level = "trace")]
    fn rebuild(&mut self, f: &mut dyn FnMut(&mut dyn Buckets) -> Result<()>) -> Result<()> {
        let mut staged = self.read(Tables::clone)?;
        f(&mut Staged(&mut staged))?;
        let mut tables = self
            .tables
            .write()
            .map_err(|_| KpiError::store("committing buckets", "memory tables poisoned"))?;
        *tables = staged;
        debug!(
            buckets = tables.values().map(BTreeMap::len).sum::<usize>(),
            "committed"
        );
        Ok(())
    }

    fn get_bucket(
        &mut self,
        kind: PeriodKind,
        period_start: NaiveDate,
    ) -> Result<Option<KpiBucket>> {
        self.read(|tables| {
            tables
                .get(&kind)
                .and_then(|t| t.get(&period_start))
                .cloned()
        })
    }

    fn get_range(
        &mut self,
        kind: PeriodKind,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<KpiBucket>> {
        if start > end {
            return Ok(vec![]);
        }
        self.read(|tables| {
            tables
                .get(&kind)
                .map(|t| t.range(start..=end).map(|(_, b)| b.clone()).collect())
                .unwrap_or_default()
        })
    }
}
