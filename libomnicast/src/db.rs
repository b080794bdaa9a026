//! Database operations for Omnicast

use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{
    ContainerStatus, ContentRefs, Credential, Destination, EditStatus, MediaContainer, PostEdit,
    PostEditRecord, PublishRecord, PublishTask, RecordStatus, TaskStatus,
};

/// Filter for task listings
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub owner_id: Option<String>,
    pub account_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub destination: Option<Destination>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

const TASK_COLUMNS: &str = "id, owner_id, account_id, destination, destination_uid, content, options, \
     scheduled_at, status, queue_job_id, error_message, destination_content_id, upload_session, \
     created_at, updated_at";

const RECORD_COLUMNS: &str = "id, task_id, owner_id, account_id, destination, destination_uid, content, \
     queue_job_id, destination_content_id, permalink, status, error_message, published_at";

const EDIT_COLUMNS: &str = "task_id, owner_id, edit, status, error_message, created_at, updated_at";

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database, used by tests and dry runs
    ///
    /// Every pooled connection to `sqlite::memory:` is a separate database,
    /// so the pool is pinned to a single connection that never idles out.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(DbError::MigrationError)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Task records
    // ------------------------------------------------------------------

    pub async fn create_task(&self, task: &PublishTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_tasks (id, owner_id, account_id, destination, destination_uid, content,
                options, scheduled_at, status, queue_job_id, error_message, destination_content_id,
                upload_session, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.owner_id)
        .bind(&task.account_id)
        .bind(task.destination.as_str())
        .bind(&task.destination_uid)
        .bind(to_json(&task.content)?)
        .bind(to_json(&task.options)?)
        .bind(task.scheduled_at)
        .bind(task.status.as_str())
        .bind(&task.queue_job_id)
        .bind(&task.error_message)
        .bind(&task.destination_content_id)
        .bind(&task.upload_session)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<PublishTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM publish_tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn get_task_by_queue_job_id(&self, queue_job_id: &str) -> Result<Option<PublishTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM publish_tasks WHERE queue_job_id = ?",
            TASK_COLUMNS
        ))
        .bind(queue_job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<PublishTask>> {
        let mut clauses = vec!["1=1"];
        if filter.owner_id.is_some() {
            clauses.push("owner_id = ?");
        }
        if filter.account_id.is_some() {
            clauses.push("account_id = ?");
        }
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        if filter.destination.is_some() {
            clauses.push("destination = ?");
        }

        let sql = format!(
            "SELECT {} FROM publish_tasks WHERE {} ORDER BY scheduled_at ASC LIMIT ?",
            TASK_COLUMNS,
            clauses.join(" AND ")
        );

        let mut query = sqlx::query(&sql);
        if let Some(owner_id) = &filter.owner_id {
            query = query.bind(owner_id);
        }
        if let Some(account_id) = &filter.account_id {
            query = query.bind(account_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(destination) = filter.destination {
            query = query.bind(destination.as_str());
        }
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let rows = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(task_from_row).collect()
    }

    /// Waiting tasks scheduled at or before `until`, oldest first
    pub async fn tasks_due(&self, until: i64, limit: usize) -> Result<Vec<PublishTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM publish_tasks WHERE status = 'waiting' AND scheduled_at <= ? \
             ORDER BY scheduled_at ASC LIMIT ?",
            TASK_COLUMNS
        ))
        .bind(until)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(task_from_row).collect()
    }

    /// Change a task's status. Terminal tasks are left untouched.
    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE publish_tasks SET status = ?, updated_at = ? \
             WHERE id = ? AND status NOT IN ('published', 'fail')",
        )
            .bind(status.as_str())
            .bind(now())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the error of a failed attempt without leaving PUBLISHING
    pub async fn set_task_error(&self, task_id: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE publish_tasks SET error_message = ?, updated_at = ? WHERE id = ?")
            .bind(message)
            .bind(now())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Move a task to FAIL. Returns false when the task is gone or already terminal.
    pub async fn fail_task(&self, task_id: &str, message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publish_tasks SET status = 'fail', error_message = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('published', 'fail')
            "#,
        )
        .bind(message)
        .bind(now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a task to a new time. Only the owner may reschedule.
    pub async fn update_task_schedule(&self, task_id: &str, owner_id: &str, scheduled_at: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE publish_tasks SET scheduled_at = ?, updated_at = ? WHERE id = ? AND owner_id = ?",
        )
        .bind(scheduled_at)
        .bind(now())
        .bind(task_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn save_upload_session(&self, task_id: &str, session: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE publish_tasks SET upload_session = ?, updated_at = ? WHERE id = ?")
            .bind(session)
            .bind(now())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn set_destination_content_id(&self, task_id: &str, content_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE publish_tasks SET destination_content_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(content_id)
        .bind(now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Delete a task owned by `owner_id`
    pub async fn delete_task(&self, task_id: &str, owner_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM publish_tasks WHERE id = ? AND owner_id = ?")
            .bind(task_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_tasks_by_status(&self) -> Result<Vec<(TaskStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM publish_tasks GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                let status: String = r.get("status");
                Ok((parse_column(&status)?, r.get::<i64, _>("count")))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Publish records
    // ------------------------------------------------------------------

    /// Write the publish record for a finished task and drop the task row,
    /// in one transaction
    ///
    /// A record already written for the same destination content (for
    /// example by an earlier webhook) is updated in place.
    pub async fn finish_task(&self, record: &PublishRecord) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO publish_records (task_id, owner_id, account_id, destination, destination_uid,
                content, queue_job_id, destination_content_id, permalink, status, error_message,
                published_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (destination, destination_content_id) DO UPDATE SET
                status = excluded.status,
                permalink = COALESCE(excluded.permalink, publish_records.permalink),
                error_message = excluded.error_message,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.owner_id)
        .bind(&record.account_id)
        .bind(record.destination.as_str())
        .bind(&record.destination_uid)
        .bind(to_json(&record.content)?)
        .bind(&record.queue_job_id)
        .bind(&record.destination_content_id)
        .bind(&record.permalink)
        .bind(record.status.as_str())
        .bind(&record.error_message)
        .bind(record.published_at)
        .bind(now())
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM publish_tasks WHERE id = ?")
            .bind(&record.task_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::query("DELETE FROM media_containers WHERE task_id = ?")
            .bind(&record.task_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        Ok(id)
    }

    /// Insert or refresh a publish record without touching the task row
    pub async fn upsert_publish_record(&self, record: &PublishRecord) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO publish_records (task_id, owner_id, account_id, destination, destination_uid,
                content, queue_job_id, destination_content_id, permalink, status, error_message,
                published_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (destination, destination_content_id) DO UPDATE SET
                permalink = COALESCE(excluded.permalink, publish_records.permalink),
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.owner_id)
        .bind(&record.account_id)
        .bind(record.destination.as_str())
        .bind(&record.destination_uid)
        .bind(to_json(&record.content)?)
        .bind(&record.queue_job_id)
        .bind(&record.destination_content_id)
        .bind(&record.permalink)
        .bind(record.status.as_str())
        .bind(&record.error_message)
        .bind(record.published_at)
        .bind(now())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(id)
    }

    pub async fn find_publish_record(
        &self,
        destination: Destination,
        destination_content_id: &str,
    ) -> Result<Option<PublishRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM publish_records WHERE destination = ? AND destination_content_id = ?",
            RECORD_COLUMNS
        ))
        .bind(destination.as_str())
        .bind(destination_content_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn records_for_task(&self, task_id: &str) -> Result<Vec<PublishRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM publish_records WHERE task_id = ? ORDER BY id",
            RECORD_COLUMNS
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_publish_records(&self, owner_id: Option<&str>, limit: usize) -> Result<Vec<PublishRecord>> {
        let rows = match owner_id {
            Some(owner_id) => sqlx::query(&format!(
                "SELECT {} FROM publish_records WHERE owner_id = ? ORDER BY published_at DESC, id DESC LIMIT ?",
                RECORD_COLUMNS
            ))
            .bind(owner_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(&format!(
                "SELECT {} FROM publish_records ORDER BY published_at DESC, id DESC LIMIT ?",
                RECORD_COLUMNS
            ))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(DbError::SqlxError)?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn update_publish_record(
        &self,
        record_id: i64,
        status: RecordStatus,
        permalink: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE publish_records
            SET status = ?,
                permalink = COALESCE(?, permalink),
                error_message = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(permalink)
        .bind(error_message)
        .bind(now())
        .bind(record_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// The published record of a task, if it reached the destination
    pub async fn published_record(&self, task_id: &str) -> Result<Option<PublishRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM publish_records WHERE task_id = ? AND status = 'published' ORDER BY id DESC LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(record_from_row).transpose()
    }

    // ------------------------------------------------------------------
    // Post edits
    // ------------------------------------------------------------------

    /// Store the latest edit for a task, replacing any earlier one and
    /// resetting it to pending
    pub async fn upsert_post_edit(&self, task_id: &str, owner_id: &str, edit: &PostEdit) -> Result<PostEditRecord> {
        let now = now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO post_edits (task_id, owner_id, edit, status, error_message, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', NULL, ?, ?)
            ON CONFLICT (task_id) DO UPDATE SET
                edit = excluded.edit,
                status = 'pending',
                error_message = NULL,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            EDIT_COLUMNS
        ))
        .bind(task_id)
        .bind(owner_id)
        .bind(to_json(edit)?)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        edit_from_row(&row)
    }

    pub async fn get_post_edit(&self, task_id: &str) -> Result<Option<PostEditRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM post_edits WHERE task_id = ?", EDIT_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(edit_from_row).transpose()
    }

    pub async fn finish_post_edit(&self, task_id: &str, status: EditStatus, error_message: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE post_edits SET status = ?, error_message = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Write edited content onto the published record and mark the edit
    /// applied, in one transaction
    pub async fn apply_post_edit(&self, task_id: &str, content: &ContentRefs, permalink: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;
        let now = now();

        sqlx::query(
            r#"
            UPDATE publish_records
            SET content = ?,
                permalink = COALESCE(?, permalink),
                updated_at = ?
            WHERE task_id = ? AND status = 'published'
            "#,
        )
        .bind(to_json(content)?)
        .bind(permalink)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query("UPDATE post_edits SET status = 'applied', error_message = NULL, updated_at = ? WHERE task_id = ?")
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Media containers
    // ------------------------------------------------------------------

    pub async fn create_container(&self, container: &MediaContainer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO media_containers (id, task_id, destination, destination_container_id,
                position, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (task_id, destination_container_id) DO NOTHING
            "#,
        )
        .bind(&container.id)
        .bind(&container.task_id)
        .bind(container.destination.as_str())
        .bind(&container.destination_container_id)
        .bind(container.position)
        .bind(container.status.as_str())
        .bind(container.created_at)
        .bind(container.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn containers_for_task(&self, task_id: &str) -> Result<Vec<MediaContainer>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, destination, destination_container_id, position, status,
                created_at, updated_at
            FROM media_containers WHERE task_id = ? ORDER BY position ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                let destination: String = r.get("destination");
                let status: String = r.get("status");
                Ok(MediaContainer {
                    id: r.get("id"),
                    task_id: r.get("task_id"),
                    destination: parse_column(&destination)?,
                    destination_container_id: r.get("destination_container_id"),
                    position: r.get("position"),
                    status: parse_column(&status)?,
                    created_at: r.get("created_at"),
                    updated_at: r.get("updated_at"),
                })
            })
            .collect()
    }

    /// Persist an observed container status. Terminal containers are never
    /// changed; returns false when nothing was updated.
    pub async fn update_container_status(&self, container_id: &str, status: ContainerStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_containers SET status = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('finished', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(now())
        .bind(container_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_containers_for_task(&self, task_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM media_containers WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub async fn get_credential(&self, account_id: &str, destination: Destination) -> Result<Option<Credential>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, destination, access_token, refresh_token, expires_at,
                refresh_expires_at, updated_at
            FROM credentials WHERE account_id = ? AND destination = ?
            "#,
        )
        .bind(account_id)
        .bind(destination.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| Credential {
            account_id: r.get("account_id"),
            destination,
            access_token: SecretString::from(r.get::<String, _>("access_token")),
            refresh_token: r
                .get::<Option<String>, _>("refresh_token")
                .map(SecretString::from),
            expires_at: r.get("expires_at"),
            refresh_expires_at: r.get("refresh_expires_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// Store a credential; the last write wins
    pub async fn upsert_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (account_id, destination, access_token, refresh_token,
                expires_at, refresh_expires_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (account_id, destination) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                refresh_expires_at = excluded.refresh_expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.account_id)
        .bind(credential.destination.as_str())
        .bind(credential.access_token.expose_secret())
        .bind(credential.refresh_token.as_ref().map(|t| t.expose_secret().to_string()))
        .bind(credential.expires_at)
        .bind(credential.refresh_expires_at)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn delete_credential(&self, account_id: &str, destination: Destination) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE account_id = ? AND destination = ?")
            .bind(account_id)
            .bind(destination.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Activity counters and rewards
    // ------------------------------------------------------------------

    /// Increment the publish counter for `owner_id` on the UTC day containing `at`
    pub async fn record_daily_activity(&self, owner_id: &str, destination: Destination, at: i64) -> Result<i64> {
        let day = at - at.rem_euclid(86_400);

        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO daily_activity (owner_id, destination, day, publish_count)
            VALUES (?, ?, ?, 1)
            ON CONFLICT (owner_id, destination, day) DO UPDATE SET
                publish_count = publish_count + 1
            RETURNING publish_count
            "#,
        )
        .bind(owner_id)
        .bind(destination.as_str())
        .bind(day)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count)
    }

    pub async fn daily_activity(&self, owner_id: &str, destination: Destination, at: i64) -> Result<i64> {
        let day = at - at.rem_euclid(86_400);

        let count: Option<i64> = sqlx::query_scalar(
            "SELECT publish_count FROM daily_activity WHERE owner_id = ? AND destination = ? AND day = ?",
        )
        .bind(owner_id)
        .bind(destination.as_str())
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count.unwrap_or(0))
    }

    /// Grant points for a published task. Returns false if the task was already rewarded.
    pub async fn grant_reward(&self, task_id: &str, owner_id: &str, points: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO reward_grants (task_id, owner_id, points, granted_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(task_id)
        .bind(owner_id)
        .bind(points)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn total_rewards(&self, owner_id: &str) -> Result<i64> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT SUM(points) FROM reward_grants WHERE owner_id = ?")
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(total.unwrap_or(0))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DbError::Corrupt(e.to_string()).into())
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| DbError::Corrupt(format!("{}: {}", column, e)).into())
}

fn parse_column<T: std::str::FromStr>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| DbError::Corrupt(format!("unexpected value '{}'", raw)).into())
}

fn task_from_row(r: &SqliteRow) -> Result<PublishTask> {
    let destination: String = r.get("destination");
    let status: String = r.get("status");
    let content: String = r.get("content");
    let options: String = r.get("options");

    Ok(PublishTask {
        id: r.get("id"),
        owner_id: r.get("owner_id"),
        account_id: r.get("account_id"),
        destination: parse_column(&destination)?,
        destination_uid: r.get("destination_uid"),
        content: from_json(&content, "content")?,
        options: from_json(&options, "options")?,
        scheduled_at: r.get("scheduled_at"),
        status: parse_column(&status)?,
        queue_job_id: r.get("queue_job_id"),
        error_message: r.get("error_message"),
        destination_content_id: r.get("destination_content_id"),
        upload_session: r.get("upload_session"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn record_from_row(r: &SqliteRow) -> Result<PublishRecord> {
    let destination: String = r.get("destination");
    let status: String = r.get("status");
    let content: String = r.get("content");

    Ok(PublishRecord {
        id: r.get("id"),
        task_id: r.get("task_id"),
        owner_id: r.get("owner_id"),
        account_id: r.get("account_id"),
        destination: parse_column(&destination)?,
        destination_uid: r.get("destination_uid"),
        content: from_json(&content, "content")?,
        queue_job_id: r.get("queue_job_id"),
        destination_content_id: r.get("destination_content_id"),
        permalink: r.get("permalink"),
        status: parse_column(&status)?,
        error_message: r.get("error_message"),
        published_at: r.get("published_at"),
    })
}

fn edit_from_row(r: &SqliteRow) -> Result<PostEditRecord> {
    let edit: String = r.get("edit");
    let status: String = r.get("status");

    Ok(PostEditRecord {
        task_id: r.get("task_id"),
        owner_id: r.get("owner_id"),
        edit: from_json(&edit, "edit")?,
        status: parse_column(&status)?,
        error_message: r.get("error_message"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}
