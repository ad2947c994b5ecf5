use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Meeting {
    pub id: i64,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeetingData {
    pub id: i64,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    pub created_by: String,
}

impl From<Meeting> for MeetingData {
    fn from(meeting: Meeting) -> Self {
        MeetingData {
            id: meeting.id,
            title: meeting.title,
            scheduled_at: meeting.scheduled_at,
            created_by: meeting.created_by,
        }
    }
}
