use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One scheduled broadcast, as read from the schedule source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Programme {
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    pub series_id: String,
    pub airing_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub thumbnail: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl Programme {
    /// Scheduled run time in milliseconds.
    pub fn scheduled_duration_ms(&self) -> u64 {
        (self.end_date - self.start_date).num_milliseconds().max(0) as u64
    }

    pub fn is_airing_at(&self, at: DateTime<Utc>) -> bool {
        at > self.start_date && at < self.end_date
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn programme() -> Programme {
        Programme {
            title: "Direct Talk".into(),
            subtitle: "Building Bridges".into(),
            series_id: "2058".into(),
            airing_id: "520".into(),
            description: "An interview".into(),
            content: "Full synopsis".into(),
            thumbnail: "/nhkworld/upld/thumbnails/en/tv/direct_talk.jpg".into(),
            start_date: Utc.with_ymd_and_hms(2020, 11, 17, 23, 30, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2020, 11, 18, 0, 0, 0).unwrap(),
        }
    }
}
