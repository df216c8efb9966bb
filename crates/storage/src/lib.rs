use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{ApplicationId, RequestId, RequestStatus},
    protocol::{RequestRecord, RequestUpdate},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Form fields captured when an operator opens a new request. The request id
/// and the `Pending` status are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub customer_name: String,
    pub email: String,
    pub website_url: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct StoredApplication {
    pub application_id: ApplicationId,
    pub request_id: RequestId,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_request(&self, input: NewRequest) -> Result<RequestRecord> {
        let id = RequestId(Uuid::new_v4().to_string());
        let row = sqlx::query(
            "INSERT INTO requests (id, customer_name, email, website_url, description, qchatform_status)
             VALUES (?, ?, ?, ?, ?, 'Pending')
             RETURNING id, customer_name, email, website_url, description, qchatform_status, application_id_q, token, created_at",
        )
        .bind(&id.0)
        .bind(&input.customer_name)
        .bind(&input.email)
        .bind(&input.website_url)
        .bind(&input.description)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_request(&row))
    }

    pub async fn get_request(&self, id: &RequestId) -> Result<Option<RequestRecord>> {
        let row = sqlx::query(
            "SELECT id, customer_name, email, website_url, description, qchatform_status, application_id_q, token, created_at
             FROM requests WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_request))
    }

    /// All requests, newest first.
    pub async fn list_requests(&self) -> Result<Vec<RequestRecord>> {
        let rows = sqlx::query(
            "SELECT id, customer_name, email, website_url, description, qchatform_status, application_id_q, token, created_at
             FROM requests
             ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_request).collect())
    }

    /// Applies a completion update keyed by request id. Idempotent: replaying
    /// the same update leaves the row in the same state. Returns `None` when
    /// no such request exists.
    pub async fn update_request(&self, update: &RequestUpdate) -> Result<Option<RequestRecord>> {
        let row = sqlx::query(
            "UPDATE requests
             SET qchatform_status = ?, application_id_q = ?, token = ?
             WHERE id = ?
             RETURNING id, customer_name, email, website_url, description, qchatform_status, application_id_q, token, created_at",
        )
        .bind(update.qchatform_status.as_str())
        .bind(&update.application_id_q.0)
        .bind(&update.token)
        .bind(&update.id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_request))
    }

    pub async fn create_application(&self, request_id: &RequestId) -> Result<StoredApplication> {
        let application_id = ApplicationId(format!("app-{}", Uuid::new_v4()));
        let row = sqlx::query(
            "INSERT INTO applications (application_id, request_id)
             VALUES (?, ?)
             RETURNING application_id, request_id, created_at",
        )
        .bind(&application_id.0)
        .bind(&request_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_application(&row))
    }

    pub async fn get_application(
        &self,
        application_id: &ApplicationId,
    ) -> Result<Option<StoredApplication>> {
        let row = sqlx::query(
            "SELECT application_id, request_id, created_at FROM applications WHERE application_id = ?",
        )
        .bind(&application_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_application))
    }
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> RequestRecord {
    RequestRecord {
        id: RequestId(row.get::<String, _>(0)),
        customer_name: row.get::<String, _>(1),
        email: row.get::<String, _>(2),
        website_url: row.get::<String, _>(3),
        description: row.get::<String, _>(4),
        qchatform_status: RequestStatus::parse(&row.get::<String, _>(5)),
        application_id_q: row.get::<Option<String>, _>(6).map(ApplicationId),
        token: row.get::<Option<String>, _>(7),
        created_at: row.get::<DateTime<Utc>, _>(8),
    }
}

fn row_to_application(row: &sqlx::sqlite::SqliteRow) -> StoredApplication {
    StoredApplication {
        application_id: ApplicationId(row.get::<String, _>(0)),
        request_id: RequestId(row.get::<String, _>(1)),
        created_at: row.get::<DateTime<Utc>, _>(2),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
