//! Remote imageboard API: record shapes and the client that fetches them.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::models::{Id, NewCachedTag, Rating, TagCategory};
use crate::net::FetchClient;
use crate::revision::PostState;

/// A tag as served by `/tags.json` and `/tags/{id}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TagRecord {
    pub id: Id,
    pub name: String,
    pub category: TagCategory,
    pub post_count: i64,
    pub is_locked: bool,
    pub is_deprecated: bool,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl TagRecord {
    pub fn into_cached(self, record_updated_at: DateTime<Utc>) -> NewCachedTag {
        NewCachedTag {
            id: self.id,
            name: self.name,
            category: self.category,
            post_count: self.post_count,
            is_locked: self.is_locked,
            is_deprecated: self.is_deprecated,
            created_at: self.created_at,
            updated_at: self.updated_at,
            record_updated_at,
        }
    }
}

/// A post as served by `/posts/{id}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostRecord {
    pub id: i64,
    #[serde(deserialize_with = "deserialize_tag_string")]
    pub tag_string: BTreeSet<String>,
    pub rating: Option<Rating>,
    #[serde(default)]
    pub source: String,
}

impl PostRecord {
    /// The tracked properties this observation defines.
    pub fn observed_state(&self) -> PostState {
        PostState {
            tags: Some(self.tag_string.clone()),
            rating: self.rating,
            source: Some(self.source.clone()),
        }
    }
}

/// Space separated tag names; empty fragments are dropped.
fn deserialize_tag_string<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.split_whitespace().map(str::to_string).collect())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// Lenient timestamp parsing. Accepts RFC 3339 and the common variants around it: a space
/// instead of `T`, missing fraction, missing offset (taken as UTC), or a bare date.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f %z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    let naive = s.strip_suffix(" UTC").unwrap_or(s);
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Ok(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("unrecognised timestamp '{raw}'"))
}

/// Source of authoritative records. `Ok(None)` means the remote says the record does not exist.
#[async_trait]
pub trait BooruApi: Send + Sync {
    async fn tag_by_name(&self, name: &str) -> SyncResult<Option<TagRecord>>;
    async fn tag_by_id(&self, id: Id) -> SyncResult<Option<TagRecord>>;
    async fn post_by_id(&self, id: i64) -> SyncResult<Option<PostRecord>>;
}

/// [`BooruApi`] over a Danbooru-compatible JSON API.
#[derive(Clone)]
pub struct DanbooruApi {
    client: FetchClient,
}

impl DanbooruApi {
    pub fn new(client: FetchClient) -> Self { Self { client } }

    /// Decode a successful body, or `None` on 404. Other statuses are errors.
    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> SyncResult<Option<T>> {
        let url = response.url().to_string();
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SyncError::UnexpectedStatus { status: status.as_u16(), url });
        }
        let body = response.bytes().await.map_err(crate::net::FetchError::from)?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| SyncError::Malformed { url, reason: e.to_string() })
    }
}

#[async_trait]
impl BooruApi for DanbooruApi {
    async fn tag_by_name(&self, name: &str) -> SyncResult<Option<TagRecord>> {
        let response = self.client.get("tags.json", &[("search[name]", name)]).await?;
        let found: Option<Vec<TagRecord>> = Self::decode(response).await?;
        let tag = found.and_then(|tags| tags.into_iter().next());
        debug!(tag = name, found = tag.is_some(), "tag search");
        Ok(tag)
    }

    async fn tag_by_id(&self, id: Id) -> SyncResult<Option<TagRecord>> {
        let response = self.client.get_path(&format!("tags/{id}.json")).await?;
        Self::decode(response).await
    }

    async fn post_by_id(&self, id: i64) -> SyncResult<Option<PostRecord>> {
        let response = self.client.get_path(&format!("posts/{id}.json")).await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn deserialize_tag_json() {
        let data = r#"
        {
            "id": 2716,
            "name": "cat",
            "post_count": 53522,
            "category": 0,
            "created_at": "2013-02-28T00:28:48.044-05:00",
            "updated_at": "2019-08-30T17:23:14.479-04:00",
            "is_locked": false,
            "is_deprecated": false,
            "words": ["cat"]
        }
        "#;
        let tag: TagRecord = serde_json::from_str(data).unwrap();
        assert_eq!(tag.id, 2716);
        assert_eq!(tag.name, "cat");
        assert_eq!(tag.category, TagCategory::General);
        assert_eq!(
            tag.created_at,
            Utc.with_ymd_and_hms(2013, 2, 28, 5, 28, 48).unwrap() + Duration::milliseconds(44)
        );
        assert_eq!(
            tag.updated_at,
            Utc.with_ymd_and_hms(2019, 8, 30, 21, 23, 14).unwrap() + Duration::milliseconds(479)
        );
    }

    #[test]
    fn missing_field_is_an_error() {
        let data = r#"{"id": 1, "name": "x", "category": 0, "post_count": 1,
                       "is_deprecated": false,
                       "created_at": "2020-01-01T00:00:00Z", "updated_at": "2020-01-01T00:00:00Z"}"#;
        let err = serde_json::from_str::<TagRecord>(data).unwrap_err();
        assert!(err.to_string().contains("is_locked"), "{err}");
    }

    #[test]
    fn unknown_category_is_an_error() {
        let data = r#"{"id": 1, "name": "x", "category": 2, "post_count": 1,
                       "is_locked": false, "is_deprecated": false,
                       "created_at": "2020-01-01T00:00:00Z", "updated_at": "2020-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<TagRecord>(data).is_err());
    }

    #[test]
    fn timestamps_parse_permissively() {
        let expected = Utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 0).unwrap();
        for raw in [
            "2021-06-01T12:30:00Z",
            "2021-06-01T12:30:00.000+00:00",
            "2021-06-01T08:30:00-04:00",
            "2021-06-01 12:30:00+00:00",
            "2021-06-01 12:30:00 +0000",
            "2021-06-01T12:30:00",
            "2021-06-01 12:30:00",
            " 2021-06-01 12:30:00 UTC ",
        ] {
            assert_eq!(parse_timestamp(raw).unwrap(), expected, "{raw}");
        }
        assert_eq!(
            parse_timestamp("2021-06-01").unwrap(),
            Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn post_tag_string_splits_on_whitespace() {
        let data = r#"{"id": 7, "tag_string": "cat  1girl\tsmile ", "rating": "s", "source": "",
                       "file_url": "https://cdn.example/7.png", "md5": "abc", "file_ext": "png", "file_size": 10}"#;
        // file fields are not tracked and are skipped
        let post: PostRecord = serde_json::from_str(data).unwrap();
        let names: Vec<_> = post.tag_string.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["1girl", "cat", "smile"]);
        assert_eq!(post.rating, Some(Rating::Sensitive));
        let state = post.observed_state();
        assert_eq!(state.source.as_deref(), Some(""));
        assert_eq!(state.tags.unwrap().len(), 3);
    }
}
