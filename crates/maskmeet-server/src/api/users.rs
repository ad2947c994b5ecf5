use crate::api::validate;
use crate::auth::AuthUser;
use crate::error::Result;
use crate::models::UserProfile;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde_json::Value;

/// POST /api/create-user
pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<Value>,
) -> Result<Json<UserProfile>> {
    validate::require_fields(&body, &["full_name", "email"])?;
    validate::require_strings(&body, &["full_name", "email"])?;
    validate::require_non_empty(&body, &["full_name", "email"])?;

    let full_name = body["full_name"].as_str().expect("validated");
    let email = body["email"].as_str().expect("validated");

    let profile = state
        .user_service
        .create(&auth.user_id, full_name, email)
        .await?;
    Ok(Json(profile))
}

/// GET /api/get-user-data
pub async fn get_user_data(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<UserProfile>> {
    let profile = state.user_service.get_by_id(&auth.user_id).await?;
    Ok(Json(profile))
}

/// PUT /api/update-user-name
pub async fn update_user_name(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<Value>,
) -> Result<Json<UserProfile>> {
    let full_name = validate::required_string(&body, "full_name")?;

    let profile = state
        .user_service
        .update_name(&auth.user_id, full_name)
        .await?;
    Ok(Json(profile))
}

/// DELETE /api/delete-user
pub async fn delete_user(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<axum::http::StatusCode> {
    state.user_service.delete(&auth.user_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
