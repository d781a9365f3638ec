use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which index a search runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    Topic,
    Speaker,
    Artist,
    Cast,
    Suggested,
}

impl SearchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Speaker => "speaker",
            Self::Artist => "artist",
            Self::Cast => "cast",
            Self::Suggested => "suggested",
        }
    }
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(default)]
    pub coordinates: Vec<f64>,
}

/// One indexed event/session document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventItem {
    #[serde(alias = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub time_start: Option<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

impl EventItem {
    /// Whether the event can be placed on a map (lon/lat pair present).
    pub fn has_coordinates(&self) -> bool {
        self.geometry
            .as_ref()
            .is_some_and(|g| g.coordinates.len() >= 2)
    }
}

/// One persisted dialog turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogEntry {
    pub name: String,
    pub message: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub new_conversation: bool,
}

/// A user profile row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// One deduplicated prior search, as listed back to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentSearch {
    #[serde(rename = "type")]
    pub kind: SearchKind,
    pub message: String,
}
