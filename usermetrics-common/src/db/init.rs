//! Warehouse database initialization
//!
//! Creates the tables the pipeline reads when they are missing:
//! - cohort catalog (`usertags_meta`, `usertags`)
//! - per-subject facts used by the sample metrics (`user`, `page`, `revision`)

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the warehouse database and its schema
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new warehouse database: {}", db_path.display());
    } else {
        info!("Opened existing warehouse database: {}", db_path.display());
    }

    // WAL lets batch workers read on their own connections concurrently
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every warehouse table (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_usertags_meta_table(pool).await?;
    create_usertags_table(pool).await?;
    create_user_table(pool).await?;
    create_page_table(pool).await?;
    create_revision_table(pool).await?;
    Ok(())
}

/// Cohort catalog: tag name, id and last refresh (`YYYYMMDDHHMMSS`)
pub async fn create_usertags_meta_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usertags_meta (
            utm_id INTEGER PRIMARY KEY,
            utm_name TEXT NOT NULL UNIQUE,
            utm_touched TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Cohort membership
pub async fn create_usertags_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usertags (
            ut_user INTEGER NOT NULL,
            ut_tag INTEGER NOT NULL,
            PRIMARY KEY (ut_user, ut_tag)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_usertags_tag ON usertags(ut_tag)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_user_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user (
            user_id INTEGER PRIMARY KEY,
            user_name TEXT,
            user_registration TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_page_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS page (
            page_id INTEGER PRIMARY KEY,
            page_namespace INTEGER NOT NULL DEFAULT 0,
            page_title TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_revision_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS revision (
            rev_id INTEGER PRIMARY KEY,
            rev_page INTEGER NOT NULL,
            rev_user INTEGER NOT NULL,
            rev_timestamp TEXT NOT NULL,
            rev_len INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_revision_user ON revision(rev_user, rev_timestamp)")
        .execute(pool)
        .await?;

    Ok(())
}
