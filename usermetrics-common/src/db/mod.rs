//! Warehouse access layer
//!
//! [`Warehouse`] wraps the SQLite pool and provides the three collaborator
//! interfaces the pipeline consumes: opaque row queries, cohort membership
//! lookup, and per-worker connection handles.

use crate::cohort::{CohortId, MemberLookup, SubjectId};
use crate::executor::HandleSource;
use crate::request::DATETIME_FORMAT;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::pool::PoolConnection;
use sqlx::{Row as _, Sqlite, SqlitePool};
use std::path::Path;
use tracing::{debug, error};

pub mod init;

pub use init::{create_schema, init_database};

/// One result row; every column rendered as text, NULL as `None`
pub type Row = Vec<Option<String>>;

/// Opaque row-returning query execution
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>>;
}

/// SQLite-backed warehouse
#[derive(Clone)]
pub struct Warehouse {
    pool: SqlitePool,
}

impl Warehouse {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the warehouse file, creating the schema if needed
    pub async fn connect(db_path: &Path) -> Result<Self> {
        Ok(Self::new(init_database(db_path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RowSource for Warehouse {
    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>> {
        debug!("Executing query: {}", sql);
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get_unchecked::<Option<String>, _>(i))
                    .collect::<std::result::Result<Row, sqlx::Error>>()
                    .map_err(Error::from)
            })
            .collect()
    }
}

#[async_trait]
impl MemberLookup for Warehouse {
    async fn resolve_tag(&self, name: &str) -> Result<Option<CohortId>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT utm_id FROM usertags_meta WHERE utm_name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        if id.is_none() {
            error!("Missing utm_id for cohort {}", name);
        }
        Ok(id)
    }

    async fn members_of(&self, id: CohortId) -> Result<Vec<SubjectId>> {
        let members = sqlx::query_scalar::<_, i64>("SELECT ut_user FROM usertags WHERE ut_tag = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        Ok(members.into_iter().map(|m| m.to_string()).collect())
    }

    async fn refreshed_at(&self, id: CohortId) -> Result<Option<NaiveDateTime>> {
        let touched = sqlx::query_scalar::<_, Option<String>>(
            "SELECT utm_touched FROM usertags_meta WHERE utm_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        match touched {
            Some(value) => NaiveDateTime::parse_from_str(&value, DATETIME_FORMAT)
                .map(Some)
                .map_err(|e| {
                    Error::InvalidInput(format!("bad utm_touched {:?} for cohort {}: {}", value, id, e))
                }),
            None => {
                error!("Missing utm_touched for cohort {}", id);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl HandleSource for Warehouse {
    type Handle = PoolConnection<Sqlite>;

    /// A pooled connection, returned to the pool when the handle drops
    async fn open(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seeded() -> (TempDir, Warehouse) {
        let dir = TempDir::new().unwrap();
        let warehouse = Warehouse::connect(&dir.path().join("warehouse.db")).await.unwrap();
        let pool = warehouse.pool();

        sqlx::query(
            "INSERT INTO usertags_meta (utm_id, utm_name, utm_touched) VALUES
             (1, 'pilot', '20130105120000'), (2, 'fellows', NULL)",
        )
        .execute(pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO usertags (ut_user, ut_tag) VALUES (10, 1), (11, 1), (11, 2)")
            .execute(pool)
            .await
            .unwrap();

        (dir, warehouse)
    }

    #[tokio::test]
    async fn test_resolve_tag() {
        let (_dir, warehouse) = seeded().await;
        assert_eq!(warehouse.resolve_tag("pilot").await.unwrap(), Some(1));
        assert_eq!(warehouse.resolve_tag("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_members_of_renders_ids_as_strings() {
        let (_dir, warehouse) = seeded().await;
        let mut members = warehouse.members_of(1).await.unwrap();
        members.sort();
        assert_eq!(members, vec!["10".to_string(), "11".to_string()]);
        assert!(warehouse.members_of(99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refreshed_at() {
        let (_dir, warehouse) = seeded().await;
        let touched = warehouse.refreshed_at(1).await.unwrap().unwrap();
        assert_eq!(touched.format(DATETIME_FORMAT).to_string(), "20130105120000");
        assert_eq!(warehouse.refreshed_at(2).await.unwrap(), None);
        assert_eq!(warehouse.refreshed_at(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_rows_renders_columns_as_text() {
        let (_dir, warehouse) = seeded().await;
        let rows = warehouse
            .query_rows("SELECT utm_id, utm_name, utm_touched FROM usertags_meta ORDER BY utm_id")
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![
                    Some("1".to_string()),
                    Some("pilot".to_string()),
                    Some("20130105120000".to_string())
                ],
                vec![Some("2".to_string()), Some("fellows".to_string()), None],
            ]
        );
    }

    #[tokio::test]
    async fn test_handles_are_independent_connections() {
        let (_dir, warehouse) = seeded().await;
        let mut first = warehouse.open().await.unwrap();
        let mut second = warehouse.open().await.unwrap();
        let a: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usertags")
            .fetch_one(&mut *first)
            .await
            .unwrap();
        let b: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usertags")
            .fetch_one(&mut *second)
            .await
            .unwrap();
        assert_eq!(a, b);
    }
}
