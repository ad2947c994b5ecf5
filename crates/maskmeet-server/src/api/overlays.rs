use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::models::OverlayData;
use crate::state::AppState;
use axum::{
    extract::{Multipart, Path, State},
    Json,
};

/// GET /api/get-all-overlays
pub async fn get_all_overlays(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Vec<OverlayData>>> {
    let overlays = state.overlay_service.list().await?;
    Ok(Json(overlays.into_iter().map(Into::into).collect()))
}

/// POST /api/upload-overlay (multipart: `name` + `file`)
pub async fn upload_overlay(
    State(state): State<AppState>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> Result<Json<OverlayData>> {
    let mut name: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read multipart field: {}", e)))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("name") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read name: {}", e)))?;
                name = Some(value);
            }
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read file data: {}", e)))?;
                data = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let name = name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing required fields: name".to_string()))?;
    let data =
        data.ok_or_else(|| AppError::BadRequest("Missing required fields: file".to_string()))?;

    let overlay = state
        .overlay_service
        .save_upload(&auth.user_id, &name, &data)
        .await?;
    Ok(Json(overlay.into()))
}

/// DELETE /api/delete_overlay/:id
pub async fn delete_overlay(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode> {
    let id: i64 = id
        .parse()
        .map_err(|_| AppError::NotFound("Not found".to_string()))?;

    let overlay = state.overlay_service.delete(id).await?;

    // A deleted overlay must stop showing up in running pipelines.
    state.overlay_cache.evict(Some(&overlay.url)).await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}
