//! Value records flowing through the engine
use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Calendar granularity of a bucket
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    #[display(fmt = "day")]
    Day,
    #[display(fmt = "week")]
    Week,
    #[display(fmt = "month")]
    Month,
}

impl PeriodKind {
    /// All kinds, in the order a recompute processes them
    pub const ALL: [PeriodKind; 3] = [PeriodKind::Day, PeriodKind::Week, PeriodKind::Month];
}

impl FromStr for PeriodKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(PeriodKind::Day),
            "week" | "weekly" => Ok(PeriodKind::Week),
            "month" | "monthly" => Ok(PeriodKind::Month),
            _ => Err(anyhow!("unknown period kind '{}'", s)),
        }
    }
}

/// One order line as delivered by the transaction source
///
/// Both required fields are optional here so that incomplete rows survive the fetch and
/// are rejected by the engine with a validation error instead of being defaulted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub invoice_no: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub net_revenue: Option<Decimal>,
}

impl Transaction {
    pub fn new(timestamp: DateTime<Utc>, net_revenue: Decimal) -> Self {
        Self {
            invoice_no: None,
            timestamp: Some(timestamp),
            net_revenue: Some(net_revenue),
        }
    }

    pub fn with_invoice(mut self, invoice_no: impl Into<String>) -> Self {
        self.invoice_no = Some(invoice_no.into());
        self
    }

    /// Name used in diagnostics
    pub fn label(&self) -> String {
        self.invoice_no
            .clone()
            .unwrap_or_else(|| "<no invoice>".to_owned())
    }
}

/// One aggregated row: the revenue of a single period
///
/// Only day buckets carry a `last_updated` stamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiBucket {
    pub kind: PeriodKind,
    pub period_start: NaiveDate,
    pub total_revenue: Decimal,
    pub last_updated: Option<DateTime<Utc>>,
}

impl KpiBucket {
    pub fn new(
        kind: PeriodKind,
        period_start: NaiveDate,
        total_revenue: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            period_start,
            total_revenue,
            last_updated: stamp_for(kind, now),
        }
    }

    /// The full replacement of this bucket carrying a new total
    pub fn replaced(&self, total_revenue: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            total_revenue,
            last_updated: stamp_for(self.kind, now),
            ..self.clone()
        }
    }
}

fn stamp_for(kind: PeriodKind, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match kind {
        PeriodKind::Day => Some(now),
        PeriodKind::Week | PeriodKind::Month => None,
    }
}
