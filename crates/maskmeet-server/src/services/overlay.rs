use crate::error::{AppError, Result};
use crate::models::Overlay;
use sqlx::PgPool;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Clone)]
pub struct OverlayService {
    db: PgPool,
    upload_dir: PathBuf,
    base_url: String,
}

impl OverlayService {
    pub fn new(db: PgPool, upload_dir: PathBuf, base_url: String) -> Self {
        Self {
            db,
            upload_dir,
            base_url,
        }
    }

    pub async fn list(&self) -> Result<Vec<Overlay>> {
        let overlays = sqlx::query_as::<_, Overlay>(
            "SELECT id, name, url, owner_id, created_at FROM overlays ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(overlays)
    }

    /// Store an uploaded overlay image and record it.
    pub async fn save_upload(
        &self,
        owner_id: &str,
        name: &str,
        data: &[u8],
    ) -> Result<Overlay> {
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        let file_name = format!("{}.png", Uuid::new_v4());
        let path = self.upload_dir.join(&file_name);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        let url = format!("{}/overlays/{}", self.base_url, file_name);

        let overlay = sqlx::query_as::<_, Overlay>(
            r#"
            INSERT INTO overlays (name, url, owner_id)
            VALUES ($1, $2, $3)
            RETURNING id, name, url, owner_id, created_at
            "#,
        )
        .bind(name)
        .bind(&url)
        .bind(owner_id)
        .fetch_one(&self.db)
        .await?;

        Ok(overlay)
    }

    pub async fn delete(&self, id: i64) -> Result<Overlay> {
        let overlay = sqlx::query_as::<_, Overlay>(
            "DELETE FROM overlays WHERE id = $1 RETURNING id, name, url, owner_id, created_at",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("Overlay not found".to_string()))?;

        // Best effort: the file may already be gone.
        if let Some(file_name) = overlay.url.rsplit('/').next() {
            let _ = tokio::fs::remove_file(self.upload_dir.join(file_name)).await;
        }

        Ok(overlay)
    }
}
