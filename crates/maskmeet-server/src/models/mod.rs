mod meeting;
mod overlay;
mod user;

pub use meeting::{Meeting, MeetingData};
pub use overlay::{Overlay, OverlayData};
pub use user::{StoredUser, UserProfile};
