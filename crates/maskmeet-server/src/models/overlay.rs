use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Overlay {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverlayData {
    pub id: i64,
    pub name: String,
    pub url: String,
}

impl From<Overlay> for OverlayData {
    fn from(overlay: Overlay) -> Self {
        OverlayData {
            id: overlay.id,
            name: overlay.name,
            url: overlay.url,
        }
    }
}
