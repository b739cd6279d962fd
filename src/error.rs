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
//! Error kinds surfaced by the aggregation engine
//!
//! Every failure aborts the current recompute; nothing is skipped or retried. The variants
//! tell the caller where the run broke: a bad input record, a collaborator (transaction
//! source or bucket store), or decimal overflow while summing.
use crate::model::PeriodKind;
use chrono::NaiveDate;
use std::error::Error as StdError;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A transaction that cannot be bucketed or summed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("transaction {invoice} has no timestamp")]
    MissingTimestamp { invoice: String },

    #[error("transaction {invoice} has no net revenue")]
    MissingAmount { invoice: String },

    #[error("transaction {invoice}: cannot read timestamp '{value}'")]
    MalformedTimestamp { invoice: String, value: String },

    #[error("transaction {invoice}: cannot read net revenue '{value}'")]
    MalformedAmount { invoice: String, value: String },
}

#[derive(Debug, Error)]
pub enum KpiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("store error while {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("decimal overflow while summing the {kind} bucket starting {period_start}")]
    Arithmetic {
        kind: PeriodKind,
        period_start: NaiveDate,
    },

    #[error("a recompute is already running")]
    Busy,
}

impl KpiError {
    pub fn store(op: &'static str, source: impl Into<BoxError>) -> Self {
        KpiError::Store {
            op,
            source: source.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, KpiError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, KpiError>;

/// Lift driver errors into [`KpiError::Store`](enum.KpiError.html#variant.Store), naming the
/// operation
pub(crate) trait OrStore {
    type Output;
    fn or_store(self, op: &'static str) -> Self::Output;
}

impl<T, E: Into<BoxError>> OrStore for std::result::Result<T, E> {
    type Output = Result<T>;
    fn or_store(self, op: &'static str) -> Self::Output {
        self.map_err(|e| KpiError::store(op, e))
    }
}
