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
//! Revenue KPI tables rebuilt from order data
//!
//! Orders come in as [`Transaction`](model/struct.Transaction.html)s with a timestamp and a
//! net revenue amount. Every recompute takes the complete current set of transactions,
//! groups them into calendar days, ISO weeks (starting Monday) and months of one configured
//! time zone, and replaces the contents of three SQL tables with the exact decimal sums:
//!
//! ```rust
//! use kpi_rollup::{bucket::BucketKeys, db::MemoryDb, model::Transaction, recompute::Recompute};
//! use chrono::{TimeZone, Utc};
//! use rust_decimal::Decimal;
//!
//! let orders = vec![
//!     Transaction::new(
//!         Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
//!         Decimal::new(10000, 2),
//!     ),
//!     Transaction::new(Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap(), Decimal::new(2000, 2)),
//! ];
//! let mut engine = Recompute::new(orders, MemoryDb::new(), BucketKeys::default());
//! let summary = engine.recompute().unwrap();
//! assert_eq!((summary.day, summary.week, summary.month), (2, 2, 1));
//! ```
//!
//! The tables are only ever written inside one transaction per recompute, so readers see
//! either the previous or the new state. Supported stores are Sqlite3, PostgreSQL and an
//! in-process map; see the [`db`](db/index.html) module.

pub mod aggregate;
pub mod bucket;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod query;
pub mod recompute;
pub mod runner;
pub mod source;

pub use error::{KpiError, Result, ValidationError};
pub use model::{KpiBucket, PeriodKind, Transaction};
