use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// The stored row: profile fields at rest are AES-CBC ciphertexts.
#[derive(Debug, Clone, FromRow)]
pub struct StoredUser {
    pub id: String,
    pub full_name_enc: Vec<u8>,
    pub email_enc: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted view handed to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub full_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}
