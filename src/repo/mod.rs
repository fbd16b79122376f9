use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::*;
use crate::revision::{PostState, RevisionChanges};

#[cfg(feature = "inmem-store")]
pub mod inmem;
#[cfg(feature = "postgres-store")]
pub mod pg;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    /// A uniqueness constraint would be violated.
    #[error("conflict: {0}")] Conflict(String),
    #[error("internal error: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait ImageboardRepo: Send + Sync {
    async fn get_imageboard_by_name(&self, name: &str) -> RepoResult<Option<Imageboard>>;
    /// Get-or-create by name. The url of an existing board is left unchanged.
    async fn ensure_imageboard(&self, name: &str, url: &str) -> RepoResult<Imageboard>;
}

/// Staleness-tracked copies of remote tags, keyed by remote id.
#[async_trait]
pub trait CachedTagRepo: Send + Sync {
    async fn get_cached_tag(&self, id: Id) -> RepoResult<Option<CachedTag>>;
    async fn get_cached_tag_by_name(&self, name: &str) -> RepoResult<Option<CachedTag>>;
    /// Insert-or-update by id in one atomic step. `existed` is what the caller saw before
    /// fetching; the store decides on its own so a racing writer can't cause a duplicate.
    /// `record_updated_at` never moves backwards.
    async fn upsert_cached_tag(&self, tag: NewCachedTag, existed: bool) -> RepoResult<CachedTag>;
}

/// Global tag vocabulary.
#[async_trait]
pub trait TagRepo: Send + Sync {
    async fn get_tag_by_name(&self, name: &str) -> RepoResult<Option<Tag>>;
    async fn intern_tag(&self, name: &str) -> RepoResult<Tag>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn get_post(&self, imageboard_id: Id, local_id: i64) -> RepoResult<Option<Post>>;
    async fn ensure_post(&self, imageboard_id: Id, local_id: i64, detected_at: DateTime<Utc>) -> RepoResult<Post>;
    async fn get_missing_post(&self, imageboard_id: Id, local_id: i64) -> RepoResult<Option<MissingPost>>;
    /// Record that `local_id` was probed and absent. Idempotent.
    async fn mark_missing(&self, imageboard_id: Id, local_id: i64, detected_at: DateTime<Utc>) -> RepoResult<MissingPost>;
}

#[async_trait]
pub trait RevisionRepo: Send + Sync {
    /// Revision with the greatest `recorded_at`.
    async fn latest_revision(&self, post_id: Id) -> RepoResult<Option<PostRevision>>;
    /// All revisions, oldest first.
    async fn revisions_for(&self, post_id: Id) -> RepoResult<Vec<PostRevision>>;
    /// Write a revision and the property rows in `changes` atomically. Tag names are
    /// interned into the vocabulary in the same step.
    async fn record_revision(&self, post_id: Id, recorded_at: DateTime<Utc>, changes: &RevisionChanges) -> RepoResult<PostRevision>;
    /// What a single revision defines, without inheritance.
    async fn revision_changes(&self, revision_id: Id) -> RepoResult<RevisionChanges>;

    async fn tags_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<BTreeSet<String>>>;
    async fn rating_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<Rating>>;
    async fn source_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<String>>;

    async fn state_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<PostState> {
        Ok(PostState {
            tags: self.tags_as_of(post_id, at).await?,
            rating: self.rating_as_of(post_id, at).await?,
            source: self.source_as_of(post_id, at).await?,
        })
    }
}

#[async_trait]
pub trait ImageRepo: Send + Sync {
    /// Get-or-create by mimetype; the extension must match the stored one.
    async fn ensure_file_type(&self, mimetype: &str, extension: &str) -> RepoResult<FileType>;
    /// Get-or-create by content hash.
    async fn ensure_downloaded_image(&self, new: NewDownloadedImage) -> RepoResult<DownloadedImage>;
    /// Link a post to its content. Repeating the same link is a no-op; a different url or
    /// content for the same post, or a url used by another post, is a conflict.
    async fn attach_image(&self, post_id: Id, url: &str, downloaded_image_id: Id) -> RepoResult<Image>;
    async fn get_image(&self, post_id: Id) -> RepoResult<Option<Image>>;
    async fn get_downloaded_image(&self, sha256: &str) -> RepoResult<Option<DownloadedImage>>;
}

pub trait Repo: ImageboardRepo + CachedTagRepo + TagRepo + PostRepo + RevisionRepo + ImageRepo {}

impl<T> Repo for T where T: ImageboardRepo + CachedTagRepo + TagRepo + PostRepo + RevisionRepo + ImageRepo {}
