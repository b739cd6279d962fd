//! Mapping timestamps to the start date of their calendar period
//!
//! All keys are computed in one time zone that is fixed when the
//! [`BucketKeys`](struct.BucketKeys.html) value is created, so bucket boundaries do not
//! depend on the host the process runs on.
use crate::error::ValidationError;
use crate::model::{PeriodKind, Transaction};
use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketKeys {
    zone: Tz,
}

impl Default for BucketKeys {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl BucketKeys {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }

    /// Local calendar date of the instant
    pub fn day_key(&self, ts: &DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.zone).date_naive()
    }

    /// Monday of the ISO week containing the local date
    pub fn week_key(&self, ts: &DateTime<Utc>) -> NaiveDate {
        let day = self.day_key(ts);
        day - Duration::days(day.weekday().num_days_from_monday() as i64)
    }

    /// First day of the month containing the local date
    pub fn month_key(&self, ts: &DateTime<Utc>) -> NaiveDate {
        let day = self.day_key(ts);
        day - Duration::days(day.day0() as i64)
    }

    pub fn key(&self, kind: PeriodKind, ts: &DateTime<Utc>) -> NaiveDate {
        match kind {
            PeriodKind::Day => self.day_key(ts),
            PeriodKind::Week => self.week_key(ts),
            PeriodKind::Month => self.month_key(ts),
        }
    }

    /// Bucket key of a transaction; a transaction without timestamp is rejected
    pub fn key_of(&self, kind: PeriodKind, tx: &Transaction) -> Result<NaiveDate, ValidationError> {
        let ts = tx
            .timestamp
            .as_ref()
            .ok_or_else(|| ValidationError::MissingTimestamp { invoice: tx.label() })?;
        Ok(self.key(kind, ts))
    }

    /// The instant at which the given local date begins
    ///
    /// When midnight is ambiguous the earlier instant is taken; when it falls into a DST gap
    /// the first local time after the gap is used.
    pub fn period_start_instant(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(NaiveTime::MIN);
        // gaps are at most a few hours wide, step forward in quarter hours
        for quarter in 0..=4 * 6 {
            let local = midnight + Duration::minutes(15 * quarter);
            if let Some(instant) = self.localize(&local) {
                return instant;
            }
        }
        let offset = self.zone.offset_from_utc_datetime(&midnight);
        Utc.from_utc_datetime(&(midnight - Duration::seconds(offset_seconds(&offset))))
    }

    /// Interpret a wall-clock time in the configured zone, earliest instant if ambiguous
    pub fn localize(&self, local: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.zone.from_local_datetime(local) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => None,
        }
    }
}

fn offset_seconds(offset: &<Tz as TimeZone>::Offset) -> i64 {
    use chrono::Offset;
    offset.fix().local_minus_utc() as i64
}
