use crate::error::{AppError, Result};
use crate::models::Meeting;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Clone)]
pub struct MeetingService {
    db: PgPool,
}

impl MeetingService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn schedule(
        &self,
        title: &str,
        scheduled_at: DateTime<Utc>,
        created_by: &str,
    ) -> Result<Meeting> {
        let meeting = sqlx::query_as::<_, Meeting>(
            r#"
            INSERT INTO meetings (title, scheduled_at, created_by)
            VALUES ($1, $2, $3)
            RETURNING id, title, scheduled_at, created_by, created_at, updated_at
            "#,
        )
        .bind(title)
        .bind(scheduled_at)
        .bind(created_by)
        .fetch_one(&self.db)
        .await?;

        Ok(meeting)
    }

    pub async fn list(&self) -> Result<Vec<Meeting>> {
        let meetings = sqlx::query_as::<_, Meeting>(
            "SELECT id, title, scheduled_at, created_by, created_at, updated_at
             FROM meetings ORDER BY scheduled_at",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(meetings)
    }

    /// Non-positive ids are forwarded to the store unchanged; the store's
    /// empty result comes back as not-found.
    pub async fn update(
        &self,
        id: i64,
        title: Option<&str>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Meeting> {
        let meeting = sqlx::query_as::<_, Meeting>(
            r#"
            UPDATE meetings
            SET title = COALESCE($2, title),
                scheduled_at = COALESCE($3, scheduled_at),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, title, scheduled_at, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(scheduled_at)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Meeting not found".to_string()))?;

        Ok(meeting)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM meetings WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Meeting not found".to_string()));
        }
        Ok(())
    }
}
