//! Database initialization
//!
//! Opens (or creates) the SQLite database and makes sure every table the
//! roster services use exists. All statements are idempotent, so this is
//! safe to call on every startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// How long a connection waits on a locked database before reporting busy
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Connection options apply to every pooled connection, not just the first one
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every roster table (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_classes_table(pool).await?;
    create_students_table(pool).await?;
    create_audit_log_table(pool).await?;
    Ok(())
}

async fn create_classes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            created_by INTEGER,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_by INTEGER,
            deleted_at TIMESTAMP,
            deleted_by INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_students_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS students (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            school_student_id TEXT NOT NULL,
            national_student_id TEXT NOT NULL UNIQUE,
            class_id INTEGER NOT NULL REFERENCES classes(id),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            created_by INTEGER,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_by INTEGER,
            deleted_at TIMESTAMP,
            deleted_by INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_students_class_id ON students(class_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_audit_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            log_type TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata TEXT,
            actor_id INTEGER,
            logged_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_schema_is_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();

        let tables = table_names(&pool).await;
        assert!(tables.contains(&"classes".to_string()));
        assert!(tables.contains(&"students".to_string()));
        assert!(tables.contains(&"audit_log".to_string()));
    }

    #[tokio::test]
    async fn test_student_requires_existing_class() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                "sqlite::memory:"
                    .parse::<SqliteConnectOptions>()
                    .unwrap()
                    .foreign_keys(true),
            )
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO students (name, school_student_id, national_student_id, class_id) VALUES ('Ana', 'S1', '111', 42)",
        )
        .execute(&pool)
        .await;

        assert!(result.is_err(), "Dangling class reference must be rejected");
    }
}
