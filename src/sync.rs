//! Keeps local records in step with the remote source.
//!
//! Tags: a lookup serves the cached row while its `record_updated_at` is within the staleness
//! threshold, and otherwise fetches the authoritative record (by remote id once one is known,
//! since names can be renamed upstream) and upserts it.
//!
//! Posts: each fetch is recorded as a new revision carrying only the properties that changed.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::api::BooruApi;
use crate::content::DownloadedContent;
use crate::error::{SyncError, SyncResult};
use crate::models::*;
use crate::repo::Repo;
use crate::revision::{PostState, RevisionChanges};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// One async mutex per key, so only one sync per key runs at a time in this process.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

pub struct KeyGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self { Self::default() }

    pub async fn lock(&self, key: impl Into<String>) -> KeyGuard {
        let key = key.into();
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard { key, locks: self.locks.clone(), guard: Some(guard) }
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize { self.locks.len() }

    pub fn is_empty(&self) -> bool { self.locks.is_empty() }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // the map and this guard hold the only references when nobody else is waiting
        self.locks.remove_if(&self.key, |_, m| Arc::strong_count(m) <= 2);
        self.guard.take();
    }
}

#[derive(Debug, Clone, Copy)]
enum TagKey<'a> {
    Name(&'a str),
    Id(Id),
}

impl fmt::Display for TagKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagKey::Name(name) => write!(f, "Tag {name}"),
            TagKey::Id(id) => write!(f, "Tag #{id}"),
        }
    }
}

/// Outcome of [`SyncEngine::sync_post`].
#[derive(Debug, Clone, PartialEq)]
pub enum PostSync {
    /// Known absent; no revision written.
    Missing(MissingPost),
    /// The latest revision is recent enough; nothing fetched.
    Fresh { post: Post, revision: PostRevision },
    Recorded { post: Post, revision: PostRevision, changes: RevisionChanges },
}

pub struct SyncEngine {
    repo: Arc<dyn Repo>,
    api: Arc<dyn BooruApi>,
    clock: Arc<dyn Clock>,
    stale_threshold: chrono::Duration,
    locks: KeyedLocks,
}

impl SyncEngine {
    pub fn new(repo: Arc<dyn Repo>, api: Arc<dyn BooruApi>, stale_threshold: chrono::Duration) -> Self {
        Self { repo, api, clock: Arc::new(SystemClock), stale_threshold, locks: KeyedLocks::new() }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn is_stale(&self, recorded: DateTime<Utc>) -> bool {
        // a cutoff before the earliest representable time means nothing is old enough
        match self.clock.now().checked_sub_signed(self.stale_threshold) {
            Some(cutoff) => recorded < cutoff,
            None => false,
        }
    }

    /// Current time, nudged past `previous` so stamps on one record never go backwards.
    fn stamp_after(&self, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let now = self.clock.now();
        match previous {
            Some(prev) if prev >= now => prev + chrono::Duration::microseconds(1),
            _ => now,
        }
    }

    /// Tag by name, fetched when missing or stale. Fails with [`SyncError::NotFound`] when the
    /// remote no longer has it, even if a stale local copy exists.
    pub async fn tag_by_name(&self, name: &str) -> SyncResult<CachedTag> {
        let _guard = self.locks.lock(format!("tag-name:{name}")).await;
        let local = self.repo.get_cached_tag_by_name(name).await?;
        self.refresh_tag(TagKey::Name(name), local).await
    }

    pub async fn tag_by_id(&self, id: Id) -> SyncResult<CachedTag> {
        let _guard = self.locks.lock(format!("tag-id:{id}")).await;
        let local = self.repo.get_cached_tag(id).await?;
        self.refresh_tag(TagKey::Id(id), local).await
    }

    async fn refresh_tag(&self, key: TagKey<'_>, local: Option<CachedTag>) -> SyncResult<CachedTag> {
        if let Some(tag) = local.as_ref().filter(|t| !self.is_stale(t.record_updated_at)) {
            debug!(%key, "cache hit");
            metrics::increment_counter!("booru_tag_sync_total", "outcome" => "cached");
            return Ok(tag.clone());
        }

        // prefer the immutable id once we have one
        let record = match (&local, key) {
            (Some(tag), _) => self.api.tag_by_id(tag.id).await?,
            (None, TagKey::Name(name)) => self.api.tag_by_name(name).await?,
            (None, TagKey::Id(id)) => self.api.tag_by_id(id).await?,
        };
        let Some(record) = record else {
            warn!(%key, had_local = local.is_some(), "tag not found on remote");
            metrics::increment_counter!("booru_tag_sync_total", "outcome" => "not_found");
            return Err(SyncError::NotFound { key: key.to_string() });
        };

        let stamp = self.stamp_after(local.as_ref().map(|t| t.record_updated_at));
        let tag = self.repo
            .upsert_cached_tag(record.into_cached(stamp), local.is_some())
            .await?;
        info!(%key, id = tag.id, tag_name = %tag.name, "tag refreshed");
        metrics::increment_counter!("booru_tag_sync_total", "outcome" => "fetched");
        Ok(tag)
    }

    /// Observe a post and record what changed since its latest revision.
    pub async fn sync_post(&self, imageboard: &Imageboard, local_id: i64) -> SyncResult<PostSync> {
        let _guard = self.locks.lock(format!("post:{}:{local_id}", imageboard.id)).await;

        if let Some(missing) = self.repo.get_missing_post(imageboard.id, local_id).await? {
            debug!(local_id, "post known missing");
            return Ok(PostSync::Missing(missing));
        }

        let post = self.repo.get_post(imageboard.id, local_id).await?;
        let latest = match &post {
            Some(p) => self.repo.latest_revision(p.id).await?,
            None => None,
        };
        if let (Some(post), Some(revision)) = (&post, &latest) {
            if !self.is_stale(revision.recorded_at) {
                return Ok(PostSync::Fresh { post: post.clone(), revision: revision.clone() });
            }
        }

        let Some(record) = self.api.post_by_id(local_id).await? else {
            let missing = self.repo.mark_missing(imageboard.id, local_id, self.clock.now()).await?;
            info!(board = %imageboard.name, local_id, "post missing");
            return Ok(PostSync::Missing(missing));
        };
        if record.id != local_id {
            return Err(SyncError::Malformed {
                url: format!("posts/{local_id}.json"),
                reason: format!("asked for post {local_id}, got {}", record.id),
            });
        }

        let post = match post {
            Some(p) => p,
            None => self.repo.ensure_post(imageboard.id, local_id, self.clock.now()).await?,
        };
        let current = match &latest {
            Some(rev) => self.repo.state_as_of(post.id, rev.recorded_at).await?,
            None => PostState::default(),
        };
        let changes = RevisionChanges::between(&current, &record.observed_state());
        let recorded_at = self.stamp_after(latest.map(|r| r.recorded_at));
        let revision = self.repo.record_revision(post.id, recorded_at, &changes).await?;
        info!(board = %imageboard.name, local_id, revision = revision.id, changed = ?changes.changed_properties(), "post revision recorded");
        Ok(PostSync::Recorded { post, revision, changes })
    }

    /// Link a post to downloaded content, sharing the content row with any other post that
    /// has the same bytes.
    pub async fn record_image(&self, post: &Post, url: &str, content: &DownloadedContent) -> SyncResult<Image> {
        let file_type = self.repo.ensure_file_type(&content.mimetype, &content.extension).await?;
        let downloaded = self.repo
            .ensure_downloaded_image(NewDownloadedImage {
                sha256: content.sha256.clone(),
                file_type_id: file_type.id,
                file_size: content.file_size,
                sample_size: content.sample_size,
                thumbnail_size: content.thumbnail_size,
            })
            .await?;
        let image = self.repo.attach_image(post.id, url, downloaded.id).await?;
        debug!(post = post.id, sha256 = %downloaded.sha256, "image recorded");
        Ok(image)
    }
}
