//! Per-subject metric workers served by the CLI
//!
//! - `edit_count`: revisions made by the subject inside the date window
//! - `threshold`: whether a subject registered inside the date window made
//!   `n` revisions within `t` minutes of registering

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::Sqlite;
use usermetrics_common::request::{normalize_date, DATETIME_FORMAT};
use usermetrics_common::{BatchWorker, Error, RequestSignature, Result, SubjectId};

/// Metric output for one subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectValue {
    pub user_id: SubjectId,
    pub value: i64,
}

/// Aggregated metric result kept in the signature cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricResult {
    pub metric: String,
    pub header: Vec<&'static str>,
    pub data: Vec<SubjectValue>,
}

impl MetricResult {
    /// Sort rows by subject id so output does not depend on partitioning
    pub fn new(metric: &str, header: Vec<&'static str>, mut data: Vec<SubjectValue>) -> Self {
        data.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Self {
            metric: metric.to_string(),
            header,
            data,
        }
    }

    pub fn total(&self) -> i64 {
        self.data.iter().map(|d| d.value).sum()
    }
}

fn parse_user_id(subject: &str) -> Result<i64> {
    subject
        .parse()
        .map_err(|_| Error::InvalidInput(format!("subject {:?} is not a user id", subject)))
}

fn int_param(signature: &RequestSignature, name: &str, default: i64) -> Result<i64> {
    match signature.present(name) {
        Some(value) => value
            .parse()
            .map_err(|_| Error::InvalidInput(format!("parameter {}={:?} is not an integer", name, value))),
        None => Ok(default),
    }
}

/// Inclusive `[date_start, date_end]` window in warehouse timestamp format.
/// A missing bound leaves that side open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DateWindow {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl DateWindow {
    const OPEN_START: &'static str = "00000000000000";
    const OPEN_END: &'static str = "99999999999999";

    pub fn from_signature(signature: &RequestSignature) -> Result<Self> {
        Ok(Self {
            start: signature.present("date_start").map(normalize_date).transpose()?,
            end: signature.present("date_end").map(normalize_date).transpose()?,
        })
    }

    pub fn lower(&self) -> &str {
        self.start.as_deref().unwrap_or(Self::OPEN_START)
    }

    pub fn upper(&self) -> &str {
        self.end.as_deref().unwrap_or(Self::OPEN_END)
    }

    pub fn contains(&self, timestamp: &str) -> bool {
        self.lower() <= timestamp && timestamp <= self.upper()
    }
}

/// Arguments shared by every `edit_count` worker
#[derive(Debug, Clone)]
pub struct EditCountArgs {
    pub namespace: Option<i64>,
    pub window: DateWindow,
}

impl EditCountArgs {
    pub fn from_signature(signature: &RequestSignature) -> Result<Self> {
        let namespace = match signature.present("namespace") {
            Some(_) => Some(int_param(signature, "namespace", 0)?),
            None => None,
        };
        Ok(Self {
            namespace,
            window: DateWindow::from_signature(signature)?,
        })
    }
}

pub struct EditCount;

impl EditCount {
    pub const HEADER: [&'static str; 2] = ["user_id", "edit_count"];
}

#[async_trait]
impl BatchWorker for EditCount {
    type Item = SubjectId;
    type Shared = EditCountArgs;
    type Handle = PoolConnection<Sqlite>;
    type Output = SubjectValue;

    async fn process(
        &self,
        conn: &mut PoolConnection<Sqlite>,
        subject: &SubjectId,
        args: &EditCountArgs,
    ) -> Result<Option<SubjectValue>> {
        let user_id = parse_user_id(subject)?;

        let count: i64 = match args.namespace {
            Some(ns) => {
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM revision AS r
                        JOIN page AS p ON r.rev_page = p.page_id
                    WHERE r.rev_user = ? AND p.page_namespace = ?
                        AND r.rev_timestamp >= ? AND r.rev_timestamp <= ?
                    "#,
                )
                .bind(user_id)
                .bind(ns)
                .bind(args.window.lower())
                .bind(args.window.upper())
                .fetch_one(&mut **conn)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM revision
                    WHERE rev_user = ? AND rev_timestamp >= ? AND rev_timestamp <= ?
                    "#,
                )
                .bind(user_id)
                .bind(args.window.lower())
                .bind(args.window.upper())
                .fetch_one(&mut **conn)
                .await?
            }
        };

        Ok(Some(SubjectValue {
            user_id: subject.clone(),
            value: count,
        }))
    }
}

/// Arguments shared by every `threshold` worker
#[derive(Debug, Clone)]
pub struct ThresholdArgs {
    /// Minutes after registration
    pub t: i64,
    /// Revisions needed
    pub n: i64,
    pub namespace: i64,
    /// Registration window
    pub window: DateWindow,
}

impl ThresholdArgs {
    pub fn from_signature(signature: &RequestSignature) -> Result<Self> {
        Ok(Self {
            t: int_param(signature, "t", 1440)?,
            n: int_param(signature, "n", 1)?,
            namespace: int_param(signature, "namespace", 0)?,
            window: DateWindow::from_signature(signature)?,
        })
    }
}

pub struct Threshold;

impl Threshold {
    pub const HEADER: [&'static str; 2] = ["user_id", "has_reached_threshold"];
}

#[async_trait]
impl BatchWorker for Threshold {
    type Item = SubjectId;
    type Shared = ThresholdArgs;
    type Handle = PoolConnection<Sqlite>;
    type Output = SubjectValue;

    async fn process(
        &self,
        conn: &mut PoolConnection<Sqlite>,
        subject: &SubjectId,
        args: &ThresholdArgs,
    ) -> Result<Option<SubjectValue>> {
        let user_id = parse_user_id(subject)?;

        let registration =
            sqlx::query_scalar::<_, Option<String>>("SELECT user_registration FROM user WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&mut **conn)
                .await?
                .flatten();

        // Subjects without a registration record are skipped
        let Some(registration) = registration else {
            return Ok(None);
        };

        let registered = NaiveDateTime::parse_from_str(&registration, DATETIME_FORMAT)
            .map_err(|e| Error::InvalidInput(format!("bad registration {:?}: {}", registration, e)))?;

        // Only subjects registered inside the window are reported
        if !args.window.contains(&registration) {
            return Ok(None);
        }

        let deadline = Duration::try_minutes(args.t)
            .and_then(|t| registered.checked_add_signed(t))
            .ok_or_else(|| {
                Error::InvalidInput(format!("t={} minutes after {} is out of range", args.t, registration))
            })?
            .format(DATETIME_FORMAT)
            .to_string();

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM revision AS r
                JOIN page AS p ON r.rev_page = p.page_id
            WHERE p.page_namespace = ? AND r.rev_timestamp <= ? AND r.rev_user = ?
            "#,
        )
        .bind(args.namespace)
        .bind(deadline)
        .bind(user_id)
        .fetch_one(&mut **conn)
        .await?;

        Ok(Some(SubjectValue {
            user_id: subject.clone(),
            value: i64::from(count >= args.n),
        }))
    }
}
