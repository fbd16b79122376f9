use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Postgres identity columns are all bigint
pub type Id = i64;

/// One remote source of posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Imageboard {
    pub id: Id,
    pub name: String,
    pub url: String, // homepage
}

/// Identity of a post on an imageboard. Its properties live in revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: Id,
    pub imageboard_id: Id,
    pub local_id: i64, // id assigned by the imageboard
    pub first_detected_at: DateTime<Utc>,
}

/// A local id that was probed and did not exist. Never re-checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MissingPost {
    pub id: Id,
    pub imageboard_id: Id,
    pub local_id: i64,
    pub first_detected_at: DateTime<Utc>,
}

/// A snapshot of some subset of a post's properties.
///
/// A property absent from a revision is unchanged since the newest earlier revision that
/// defines it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostRevision {
    pub id: Id,
    pub post_id: Id,
    pub recorded_at: DateTime<Utc>,
}

/// Global tag vocabulary, shared by all imageboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: Id,
    pub name: String,
}

/// One element of a revision's tag list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RevisionTag {
    pub id: Id,
    pub revision_id: Id,
    pub tag_id: Id,
}

/// Header marking that a revision defines its tag list explicitly.
/// `tag_count == 0` records that the list was cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RevisionTagList {
    pub revision_id: Id,
    pub tag_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRating {
    pub revision_id: Id,
    pub rating: Rating,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RevisionSource {
    pub revision_id: Id,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rating {
    #[serde(rename = "g")] General,
    #[serde(rename = "s")] Sensitive,
    #[serde(rename = "q")] Questionable,
    #[serde(rename = "e")] Explicit,
}

impl Rating {
    pub fn code(self) -> &'static str {
        match self {
            Rating::General => "g",
            Rating::Sensitive => "s",
            Rating::Questionable => "q",
            Rating::Explicit => "e",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "g" => Some(Rating::General),
            "s" => Some(Rating::Sensitive),
            "q" => Some(Rating::Questionable),
            "e" => Some(Rating::Explicit),
            _ => None,
        }
    }
}

/// An encoding for file content, identified by its extension in the image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileType {
    pub id: Id,
    pub mimetype: String,
    pub extension: String,
}

/// Downloaded bytes, addressed by content hash. Shared by every [`Image`] with the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedImage {
    pub id: Id,
    pub sha256: String, // lowercase hex
    pub file_type_id: Id,
    pub file_size: i64,
    pub sample_size: Option<i64>,
    pub thumbnail_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDownloadedImage {
    pub sha256: String,
    pub file_type_id: Id,
    pub file_size: i64,
    pub sample_size: Option<i64>,
    pub thumbnail_size: Option<i64>,
}

/// The file that is the content of a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Image {
    pub post_id: Id,
    pub url: String,
    pub downloaded_image_id: Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum TagCategory {
    General,
    Artist,
    Copyright,
    Character,
    Meta,
}

impl TagCategory {
    pub fn code(self) -> i16 {
        match self {
            TagCategory::General => 0,
            TagCategory::Artist => 1,
            // 2 is unused upstream
            TagCategory::Copyright => 3,
            TagCategory::Character => 4,
            TagCategory::Meta => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TagCategory::General => "general",
            TagCategory::Artist => "artist",
            TagCategory::Copyright => "copyright",
            TagCategory::Character => "character",
            TagCategory::Meta => "meta",
        }
    }
}

impl TryFrom<i16> for TagCategory {
    type Error = String;
    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(TagCategory::General),
            1 => Ok(TagCategory::Artist),
            3 => Ok(TagCategory::Copyright),
            4 => Ok(TagCategory::Character),
            5 => Ok(TagCategory::Meta),
            other => Err(format!("unknown tag category {other}")),
        }
    }
}

impl From<TagCategory> for i16 {
    fn from(c: TagCategory) -> Self { c.code() }
}

impl fmt::Display for TagCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locally cached copy of a remote tag's metadata. `id` is the remote id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTag {
    pub id: Id,
    pub name: String,
    pub category: TagCategory,
    pub post_count: i64,
    pub is_locked: bool,
    pub is_deprecated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When this row was last written from a remote fetch; drives staleness.
    pub record_updated_at: DateTime<Utc>,
}

/// Full row written by a cached-tag upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCachedTag {
    pub id: Id,
    pub name: String,
    pub category: TagCategory,
    pub post_count: i64,
    pub is_locked: bool,
    pub is_deprecated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub record_updated_at: DateTime<Utc>,
}

impl From<NewCachedTag> for CachedTag {
    fn from(n: NewCachedTag) -> Self {
        CachedTag {
            id: n.id,
            name: n.name,
            category: n.category,
            post_count: n.post_count,
            is_locked: n.is_locked,
            is_deprecated: n.is_deprecated,
            created_at: n.created_at,
            updated_at: n.updated_at,
            record_updated_at: n.record_updated_at,
        }
    }
}
