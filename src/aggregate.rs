//! Grouping transactions into period buckets and summing their revenue
//!
//! Sums use exact decimal arithmetic. A period only appears in the output if at least one
//! transaction falls into it; gaps between observed periods are never filled with zeros.
use crate::bucket::BucketKeys;
use crate::error::{KpiError, Result, ValidationError};
use crate::model::{PeriodKind, Transaction};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::btree_map::{self, Iter};
use std::collections::BTreeMap;

/// Revenue totals of one period kind, keyed by period start
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Totals {
    kind: PeriodKind,
    map: BTreeMap<NaiveDate, Decimal>,
}

impl Totals {
    pub fn new(kind: PeriodKind) -> Totals {
        Totals {
            kind,
            map: Default::default(),
        }
    }

    pub fn kind(&self) -> PeriodKind {
        self.kind
    }

    /// Add an amount to the bucket starting at `period_start`, creating it if needed
    ///
    /// Fails if the exact sum does not fit into a `Decimal`, including the case where it
    /// would have to be rounded to fewer fractional digits than its operands have.
    pub fn add(&mut self, period_start: NaiveDate, amount: Decimal) -> Result<()> {
        let kind = self.kind;
        let total = self.map.entry(period_start).or_insert(Decimal::ZERO);
        let scale = total.scale().max(amount.scale());
        *total = total
            .checked_add(amount)
            .filter(|sum| sum.scale() >= scale)
            .ok_or(KpiError::Arithmetic { kind, period_start })?;
        Ok(())
    }

    pub fn get(&self, period_start: &NaiveDate) -> Option<&Decimal> {
        self.map.get(period_start)
    }

    /// Sum over all buckets
    pub fn grand_total(&self) -> Option<Decimal> {
        self.map
            .values()
            .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(*v))
    }

    pub fn iter(&self) -> Iter<NaiveDate, Decimal> {
        self.map.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl IntoIterator for Totals {
    type Item = (NaiveDate, Decimal);
    type IntoIter = btree_map::IntoIter<NaiveDate, Decimal>;
    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}

impl<'a> IntoIterator for &'a Totals {
    type Item = (&'a NaiveDate, &'a Decimal);
    type IntoIter = btree_map::Iter<'a, NaiveDate, Decimal>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Day, week and month totals computed from the same snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rollup {
    pub day: Totals,
    pub week: Totals,
    pub month: Totals,
}

impl Rollup {
    pub fn get(&self, kind: PeriodKind) -> &Totals {
        match kind {
            PeriodKind::Day => &self.day,
            PeriodKind::Week => &self.week,
            PeriodKind::Month => &self.month,
        }
    }
}

/// Group the transactions by their `kind` bucket and sum each group
///
/// The first transaction lacking a timestamp or amount aborts the whole aggregation.
pub fn aggregate<'a, I>(keys: &BucketKeys, kind: PeriodKind, transactions: I) -> Result<Totals>
where
    I: IntoIterator<Item = &'a Transaction>,
{
    let mut totals = Totals::new(kind);
    for tx in transactions {
        let period_start = keys.key_of(kind, tx)?;
        let amount = tx
            .net_revenue
            .ok_or_else(|| ValidationError::MissingAmount { invoice: tx.label() })?;
        totals.add(period_start, amount)?;
    }
    Ok(totals)
}

pub fn aggregate_all(keys: &BucketKeys, transactions: &[Transaction]) -> Result<Rollup> {
    Ok(Rollup {
        day: aggregate(keys, PeriodKind::Day, transactions)?,
        week: aggregate(keys, PeriodKind::Week, transactions)?,
        month: aggregate(keys, PeriodKind::Month, transactions)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn worked_example() -> Vec<Transaction> {
        vec![
            Transaction::new(at(2024, 1, 1, 10), dec!(100.00)),
            Transaction::new(at(2024, 1, 1, 18), dec!(50.00)),
            Transaction::new(at(2024, 1, 8, 9), dec!(20.00)),
        ]
    }

    fn as_vec(totals: &Totals) -> Vec<(NaiveDate, Decimal)> {
        totals.iter().map(|(d, v)| (*d, *v)).collect()
    }

    #[test]
    fn must_roll_up_worked_example() {
        let rollup = aggregate_all(&BucketKeys::default(), &worked_example()).unwrap();
        assert_eq!(
            as_vec(&rollup.day),
            vec![(date(2024, 1, 1), dec!(150.00)), (date(2024, 1, 8), dec!(20.00))]
        );
        assert_eq!(
            as_vec(&rollup.week),
            vec![(date(2024, 1, 1), dec!(150.00)), (date(2024, 1, 8), dec!(20.00))]
        );
        assert_eq!(as_vec(&rollup.month), vec![(date(2024, 1, 1), dec!(170.00))]);
    }

    #[test]
    fn must_conserve_revenue_across_kinds() {
        let keys = BucketKeys::new(chrono_tz::Asia::Kolkata);
        let mut txs = vec![];
        let mut ts = at(2023, 11, 28, 0);
        let mut expected = Decimal::ZERO;
        for i in 0..500i64 {
            // cents with a few negative refunds sprinkled in
            let amount = Decimal::new((i * 7919) % 100_003 - 3_000, 2);
            expected += amount;
            txs.push(Transaction::new(ts, amount));
            ts = ts + Duration::minutes(173);
        }
        let rollup = aggregate_all(&keys, &txs).unwrap();
        for kind in PeriodKind::ALL {
            assert_eq!(rollup.get(kind).grand_total(), Some(expected), "{}", kind);
        }
        assert!(rollup.month.len() < rollup.week.len());
        assert!(rollup.week.len() < rollup.day.len());
    }

    #[test]
    fn must_not_depend_on_input_order() {
        let keys = BucketKeys::default();
        let mut txs = worked_example();
        let forward = aggregate_all(&keys, &txs).unwrap();
        txs.reverse();
        assert_eq!(aggregate_all(&keys, &txs).unwrap(), forward);
    }

    #[test]
    fn must_not_fill_gaps() {
        let txs = vec![
            Transaction::new(at(2024, 1, 3, 12), dec!(1)),
            Transaction::new(at(2024, 4, 20, 12), dec!(2)),
        ];
        let rollup = aggregate_all(&BucketKeys::default(), &txs).unwrap();
        assert_eq!(rollup.day.len(), 2);
        assert_eq!(rollup.week.len(), 2);
        assert_eq!(rollup.month.len(), 2);
        assert_eq!(rollup.month.get(&date(2024, 2, 1)), None);
    }

    #[test]
    fn must_keep_buckets_whose_revenue_cancels_out() {
        let txs = vec![
            Transaction::new(at(2024, 2, 1, 12), dec!(12.50)),
            Transaction::new(at(2024, 2, 1, 13), dec!(-12.50)),
        ];
        let totals = aggregate(&BucketKeys::default(), PeriodKind::Day, &txs).unwrap();
        assert_eq!(totals.get(&date(2024, 2, 1)), Some(&Decimal::ZERO));
    }

    #[test]
    fn must_produce_nothing_from_nothing() {
        let rollup = aggregate_all(&BucketKeys::default(), &[]).unwrap();
        assert!(rollup.day.is_empty() && rollup.week.is_empty() && rollup.month.is_empty());
    }

    #[test]
    fn must_fail_on_first_incomplete_transaction() {
        let mut txs = worked_example();
        txs.insert(
            1,
            Transaction {
                invoice_no: Some("X-9".to_owned()),
                timestamp: Some(at(2024, 1, 2, 0)),
                net_revenue: None,
            },
        );
        let err = aggregate_all(&BucketKeys::default(), &txs).unwrap_err();
        assert!(matches!(
            err,
            KpiError::Validation(ValidationError::MissingAmount { ref invoice }) if invoice == "X-9"
        ));
    }

    #[test]
    fn must_report_overflow() {
        let txs = vec![
            Transaction::new(at(2024, 3, 5, 1), Decimal::MAX),
            Transaction::new(at(2024, 3, 5, 2), dec!(1)),
        ];
        let err = aggregate(&BucketKeys::default(), PeriodKind::Month, &txs).unwrap_err();
        assert!(matches!(
            err,
            KpiError::Arithmetic { kind: PeriodKind::Month, period_start }
                if period_start == date(2024, 3, 1)
        ));
    }

    #[test]
    fn must_refuse_to_round_fractions_away() {
        let big = dec!(50000000000000000000.123456789);
        let txs = vec![
            Transaction::new(at(2024, 1, 1, 1), big),
            Transaction::new(at(2024, 1, 1, 2), big),
        ];
        let err = aggregate(&BucketKeys::default(), PeriodKind::Day, &txs).unwrap_err();
        assert!(matches!(
            err,
            KpiError::Arithmetic { kind: PeriodKind::Day, period_start }
                if period_start == date(2024, 1, 1)
        ));

        // digits beyond the operands' scale are fine, and so are differing scales
        let mut totals = Totals::new(PeriodKind::Day);
        totals.add(date(2024, 1, 1), dec!(0.1)).unwrap();
        totals.add(date(2024, 1, 1), dec!(0.25)).unwrap();
        totals.add(date(2024, 1, 1), dec!(-0.35)).unwrap();
        assert_eq!(totals.get(&date(2024, 1, 1)), Some(&dec!(0.00)));
        assert_eq!(totals.grand_total(), Some(Decimal::ZERO));
    }
}
