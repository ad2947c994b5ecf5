use crate::api::validate;
use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::models::MeetingData;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;

/// Meeting ids arrive as raw path segments; anything that does not parse
/// as an integer falls through to 404 (this covers the historical
/// `/api/delete-meeting/ ` request shape). Zero and negative ids parse
/// fine and are forwarded to the store.
fn parse_meeting_id(raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| AppError::NotFound("Not found".to_string()))
}

/// POST /api/schedule-meeting
pub async fn schedule_meeting(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<Value>,
) -> Result<Json<MeetingData>> {
    validate::require_fields(&body, &["title", "scheduled_at"])?;
    validate::require_strings(&body, &["title", "scheduled_at"])?;
    validate::require_non_empty(&body, &["title"])?;
    let scheduled_at = validate::parse_datetime(&body, "scheduled_at")?;

    let title = body["title"].as_str().expect("validated");

    let meeting = state
        .meeting_service
        .schedule(title, scheduled_at, &auth.user_id)
        .await?;
    Ok(Json(meeting.into()))
}

/// GET /api/get-all-meetings
pub async fn get_all_meetings(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Vec<MeetingData>>> {
    let meetings = state.meeting_service.list().await?;
    Ok(Json(meetings.into_iter().map(Into::into).collect()))
}

/// PUT /api/update-meeting/:id
pub async fn update_meeting(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<MeetingData>> {
    let id = parse_meeting_id(&id)?;

    let title = match body.get("title") {
        None | Some(Value::Null) => None,
        Some(_) => {
            validate::require_strings(&body, &["title"])?;
            validate::require_non_empty(&body, &["title"])?;
            body["title"].as_str()
        }
    };

    let scheduled_at = match body.get("scheduled_at") {
        None | Some(Value::Null) => None,
        Some(_) => Some(validate::parse_datetime(&body, "scheduled_at")?),
    };

    let meeting = state
        .meeting_service
        .update(id, title, scheduled_at)
        .await?;
    Ok(Json(meeting.into()))
}

/// DELETE /api/delete-meeting/:id
pub async fn delete_meeting(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode> {
    let id = parse_meeting_id(&id)?;
    state.meeting_service.delete(id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
