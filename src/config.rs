//! Settings of a `kpi-rollup` deployment, read from a TOML file
//!
//! ```toml
//! time_zone = "Asia/Kolkata"
//!
//! [database]
//! driver = "sqlite"        # or "postgres" with `url`, or "memory"
//! path = "kpis.db"
//! prefix = ""
//!
//! [source]
//! path = "kpis.db"
//! table = "raw_orders_data"
//! timestamp = "date"
//! revenue = "net_sales"
//! invoice = "invoice_no"
//!
//! [schedule]
//! interval_secs = 3600
//! ```
//!
//! `KPI_TIME_ZONE` and `KPI_DATABASE_URL` in the environment take precedence over the file.
use crate::bucket::BucketKeys;
use crate::db::{KpiDb, MemoryDb, PostgresDB, SqliteDB};
use crate::source::{SourceColumns, SqliteSource, TransactionSource};
use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const TIME_ZONE_VAR: &str = "KPI_TIME_ZONE";
pub const DATABASE_URL_VAR: &str = "KPI_DATABASE_URL";

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KpiConfig {
    /// IANA zone in which calendar periods are delimited
    pub time_zone: Tz,
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub schedule: ScheduleConfig,
}

impl Default for KpiConfig {
    fn default() -> Self {
        Self {
            time_zone: Tz::UTC,
            database: DatabaseConfig::default(),
            source: SourceConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

/// Where the bucket tables live
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Memory,
    Sqlite {
        path: PathBuf,
        #[serde(default)]
        prefix: String,
    },
    Postgres {
        url: String,
        #[serde(default)]
        prefix: String,
    },
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Sqlite {
            path: "kpis.db".into(),
            prefix: String::new(),
        }
    }
}

impl DatabaseConfig {
    /// Interpret a `KPI_DATABASE_URL` value; a table prefix configured before is kept
    fn from_url(url: &str, prefix: String) -> Result<Self> {
        Ok(if url == "memory" {
            DatabaseConfig::Memory
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseConfig::Postgres {
                url: url.to_owned(),
                prefix,
            }
        } else if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                bail!("no path in database url '{}'", url);
            }
            DatabaseConfig::Sqlite {
                path: path.into(),
                prefix,
            }
        } else {
            bail!("unsupported database url '{}'", url)
        })
    }

    fn prefix(&self) -> String {
        match self {
            DatabaseConfig::Memory => String::new(),
            DatabaseConfig::Sqlite { prefix, .. } | DatabaseConfig::Postgres { prefix, .. } => {
                prefix.clone()
            }
        }
    }
}

/// The Sqlite3 database and table holding the orders
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub columns: SourceColumns,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: "kpis.db".into(),
            columns: SourceColumns::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
        }
    }
}

impl KpiConfig {
    /// Read the file if given, then apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::parse(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(zone) = lookup(TIME_ZONE_VAR) {
            self.time_zone = zone
                .parse()
                .map_err(|e| anyhow!("{}: unknown time zone '{}': {}", TIME_ZONE_VAR, zone, e))?;
        }
        if let Some(url) = lookup(DATABASE_URL_VAR) {
            self.database = DatabaseConfig::from_url(&url, self.database.prefix())
                .with_context(|| format!("reading {}", DATABASE_URL_VAR))?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.schedule.interval_secs == 0 {
            bail!("schedule.interval_secs must be positive");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs)
    }

    pub fn bucket_keys(&self) -> BucketKeys {
        BucketKeys::new(self.time_zone)
    }

    pub fn open_db(&self) -> Result<Box<dyn KpiDb + Send>> {
        let db: Box<dyn KpiDb + Send> = match &self.database {
            DatabaseConfig::Memory => Box::new(MemoryDb::new()),
            DatabaseConfig::Sqlite { path, prefix } => {
                Box::new(SqliteDB::new(prefix.as_str(), path)?)
            }
            DatabaseConfig::Postgres { url, prefix } => {
                Box::new(PostgresDB::new(prefix.as_str(), url)?)
            }
        };
        info!("bucket tables in {}", db.name());
        Ok(db)
    }

    pub fn open_source(&self) -> Result<Box<dyn TransactionSource + Send>> {
        let source =
            SqliteSource::new(&self.source.path, &self.source.columns, self.bucket_keys())?;
        Ok(Box::new(source))
    }
}
