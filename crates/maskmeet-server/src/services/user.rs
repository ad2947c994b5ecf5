use crate::crypto::FieldCipher;
use crate::error::{AppError, Result};
use crate::models::{StoredUser, UserProfile};
use sqlx::PgPool;

#[derive(Clone)]
pub struct UserService {
    db: PgPool,
    cipher: FieldCipher,
}

impl UserService {
    pub fn new(db: PgPool, cipher: FieldCipher) -> Self {
        Self { db, cipher }
    }

    pub async fn create(&self, user_id: &str, full_name: &str, email: &str) -> Result<UserProfile> {
        // Ciphertexts are non-deterministic (fresh IV per call), so the
        // duplicate check decrypts the stored column instead of comparing
        // ciphertext bytes.
        if self.email_exists(email).await? {
            return Err(AppError::Conflict(
                "This email is already registered".to_string(),
            ));
        }

        let stored = sqlx::query_as::<_, StoredUser>(
            r#"
            INSERT INTO users (id, full_name_enc, email_enc)
            VALUES ($1, $2, $3)
            RETURNING id, full_name_enc, email_enc, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(self.cipher.encrypt(full_name))
        .bind(self.cipher.encrypt(email))
        .fetch_one(&self.db)
        .await?;

        self.decrypt_profile(stored)
    }

    pub async fn get_by_id(&self, user_id: &str) -> Result<UserProfile> {
        let stored = sqlx::query_as::<_, StoredUser>(
            "SELECT id, full_name_enc, email_enc, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        self.decrypt_profile(stored)
    }

    pub async fn update_name(&self, user_id: &str, full_name: &str) -> Result<UserProfile> {
        let stored = sqlx::query_as::<_, StoredUser>(
            r#"
            UPDATE users SET full_name_enc = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, full_name_enc, email_enc, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(self.cipher.encrypt(full_name))
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        self.decrypt_profile(stored)
    }

    pub async fn delete(&self, user_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("User not found".to_string()));
        }
        Ok(())
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as("SELECT email_enc FROM users")
            .fetch_all(&self.db)
            .await?;

        for (email_enc,) in rows {
            match self.cipher.decrypt(&email_enc) {
                Ok(stored) if stored.eq_ignore_ascii_case(email) => return Ok(true),
                Ok(_) => {}
                Err(e) => tracing::warn!("undecryptable email field skipped: {e}"),
            }
        }
        Ok(false)
    }

    fn decrypt_profile(&self, stored: StoredUser) -> Result<UserProfile> {
        Ok(UserProfile {
            id: stored.id,
            full_name: self.cipher.decrypt(&stored.full_name_enc)?,
            email: self.cipher.decrypt(&stored.email_enc)?,
            created_at: stored.created_at,
        })
    }
}
