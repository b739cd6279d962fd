//! Read-only access to committed revenue buckets
use crate::db::KpiDb;
use crate::error::Result;
use crate::model::{KpiBucket, PeriodKind};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The revenue of one period, as reported to consumers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenuePoint {
    /// start of the period
    pub date: NaiveDate,
    pub total_revenue: Decimal,
}

impl From<KpiBucket> for RevenuePoint {
    fn from(bucket: KpiBucket) -> Self {
        Self {
            date: bucket.period_start,
            total_revenue: bucket.total_revenue,
        }
    }
}

pub struct KpiQuery<D> {
    db: D,
}

impl<D: KpiDb> KpiQuery<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    /// The bucket starting exactly at `period_start`, if there is one
    pub fn get_bucket(
        &mut self,
        kind: PeriodKind,
        period_start: NaiveDate,
    ) -> Result<Option<RevenuePoint>> {
        Ok(self.db.get_bucket(kind, period_start)?.map(Into::into))
    }

    /// Buckets starting within `start..=end`, oldest first
    pub fn get_range(
        &mut self,
        kind: PeriodKind,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RevenuePoint>> {
        Ok(self
            .db
            .get_range(kind, start, end)?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}
