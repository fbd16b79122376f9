//! In-memory store. Every operation runs under one lock, so each write is atomic.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use super::*;
use crate::content::is_sha256_hex;

#[derive(Default)]
struct State {
    imageboards: HashMap<Id, Imageboard>,
    cached_tags: HashMap<Id, CachedTag>,
    tags: HashMap<Id, Tag>,
    posts: HashMap<Id, Post>,
    missing_posts: HashMap<Id, MissingPost>,
    revisions: HashMap<Id, PostRevision>,
    tag_lists: HashMap<Id, RevisionTagList>, // by revision id
    revision_tags: HashMap<Id, RevisionTag>,
    ratings: HashMap<Id, RevisionRating>,    // by revision id
    sources: HashMap<Id, RevisionSource>,    // by revision id
    file_types: HashMap<Id, FileType>,
    downloaded_images: HashMap<Id, DownloadedImage>,
    images: HashMap<Id, Image>,              // by post id
    next_id: Id,
}

impl State {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn intern(&mut self, name: &str) -> Tag {
        if let Some(t) = self.tags.values().find(|t| t.name == name) {
            return t.clone();
        }
        let tag = Tag { id: self.next_id(), name: name.to_string() };
        self.tags.insert(tag.id, tag.clone());
        tag
    }

    /// Revisions of a post recorded at or before `at`, newest first.
    fn revisions_newest_first(&self, post_id: Id, at: DateTime<Utc>) -> Vec<&PostRevision> {
        let mut v: Vec<_> = self.revisions.values()
            .filter(|r| r.post_id == post_id && r.recorded_at <= at)
            .collect();
        v.sort_by(|a, b| (b.recorded_at, b.id).cmp(&(a.recorded_at, a.id)));
        v
    }

    fn changes_of(&self, revision_id: Id) -> RevisionChanges {
        let tags = self.tag_lists.get(&revision_id).map(|_| {
            self.revision_tags.values()
                .filter(|rt| rt.revision_id == revision_id)
                .filter_map(|rt| self.tags.get(&rt.tag_id))
                .map(|t| t.name.clone())
                .collect::<BTreeSet<_>>()
        });
        RevisionChanges {
            tags,
            rating: self.ratings.get(&revision_id).map(|r| r.rating),
            source: self.sources.get(&revision_id).map(|s| s.source.clone()),
        }
    }

    fn state_as_of(&self, post_id: Id, at: DateTime<Utc>) -> PostState {
        let changes: Vec<_> = self.revisions_newest_first(post_id, at)
            .into_iter()
            .map(|r| self.changes_of(r.id))
            .collect();
        PostState::from_revisions(changes.iter())
    }
}

#[derive(Clone, Default)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
}

impl InMemRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }
}

#[async_trait]
impl ImageboardRepo for InMemRepo {
    async fn get_imageboard_by_name(&self, name: &str) -> RepoResult<Option<Imageboard>> {
        let s = self.read()?;
        Ok(s.imageboards.values().find(|b| b.name == name).cloned())
    }

    async fn ensure_imageboard(&self, name: &str, url: &str) -> RepoResult<Imageboard> {
        let mut s = self.write()?;
        if let Some(b) = s.imageboards.values().find(|b| b.name == name) {
            return Ok(b.clone());
        }
        if s.imageboards.values().any(|b| b.url == url) {
            return Err(RepoError::Conflict(format!("imageboard url '{url}' already registered")));
        }
        let board = Imageboard { id: s.next_id(), name: name.to_string(), url: url.to_string() };
        s.imageboards.insert(board.id, board.clone());
        Ok(board)
    }
}

#[async_trait]
impl CachedTagRepo for InMemRepo {
    async fn get_cached_tag(&self, id: Id) -> RepoResult<Option<CachedTag>> {
        let s = self.read()?;
        Ok(s.cached_tags.get(&id).cloned())
    }

    async fn get_cached_tag_by_name(&self, name: &str) -> RepoResult<Option<CachedTag>> {
        let s = self.read()?;
        Ok(s.cached_tags.values().find(|t| t.name == name).cloned())
    }

    async fn upsert_cached_tag(&self, tag: NewCachedTag, existed: bool) -> RepoResult<CachedTag> {
        let mut s = self.write()?;
        if s.cached_tags.values().any(|t| t.name == tag.name && t.id != tag.id) {
            return Err(RepoError::Conflict(format!("tag name '{}' belongs to another id", tag.name)));
        }
        let previous = s.cached_tags.get(&tag.id).map(|t| t.record_updated_at);
        if previous.is_some() != existed {
            debug!("cached tag {} changed underneath caller (existed={existed})", tag.id);
        }
        let mut row = CachedTag::from(tag);
        if let Some(prev) = previous {
            row.record_updated_at = row.record_updated_at.max(prev);
        }
        s.cached_tags.insert(row.id, row.clone());
        Ok(row)
    }
}

#[async_trait]
impl TagRepo for InMemRepo {
    async fn get_tag_by_name(&self, name: &str) -> RepoResult<Option<Tag>> {
        let s = self.read()?;
        Ok(s.tags.values().find(|t| t.name == name).cloned())
    }

    async fn intern_tag(&self, name: &str) -> RepoResult<Tag> {
        let mut s = self.write()?;
        Ok(s.intern(name))
    }
}

#[async_trait]
impl PostRepo for InMemRepo {
    async fn get_post(&self, imageboard_id: Id, local_id: i64) -> RepoResult<Option<Post>> {
        let s = self.read()?;
        Ok(s.posts.values().find(|p| p.imageboard_id == imageboard_id && p.local_id == local_id).cloned())
    }

    async fn ensure_post(&self, imageboard_id: Id, local_id: i64, detected_at: DateTime<Utc>) -> RepoResult<Post> {
        let mut s = self.write()?;
        if let Some(p) = s.posts.values().find(|p| p.imageboard_id == imageboard_id && p.local_id == local_id) {
            return Ok(p.clone());
        }
        if !s.imageboards.contains_key(&imageboard_id) { return Err(RepoError::NotFound); }
        let post = Post { id: s.next_id(), imageboard_id, local_id, first_detected_at: detected_at };
        s.posts.insert(post.id, post.clone());
        Ok(post)
    }

    async fn get_missing_post(&self, imageboard_id: Id, local_id: i64) -> RepoResult<Option<MissingPost>> {
        let s = self.read()?;
        Ok(s.missing_posts.values().find(|p| p.imageboard_id == imageboard_id && p.local_id == local_id).cloned())
    }

    async fn mark_missing(&self, imageboard_id: Id, local_id: i64, detected_at: DateTime<Utc>) -> RepoResult<MissingPost> {
        let mut s = self.write()?;
        if let Some(p) = s.missing_posts.values().find(|p| p.imageboard_id == imageboard_id && p.local_id == local_id) {
            return Ok(p.clone());
        }
        if !s.imageboards.contains_key(&imageboard_id) { return Err(RepoError::NotFound); }
        let missing = MissingPost { id: s.next_id(), imageboard_id, local_id, first_detected_at: detected_at };
        s.missing_posts.insert(missing.id, missing.clone());
        Ok(missing)
    }
}

#[async_trait]
impl RevisionRepo for InMemRepo {
    async fn latest_revision(&self, post_id: Id) -> RepoResult<Option<PostRevision>> {
        let s = self.read()?;
        Ok(s.revisions.values()
            .filter(|r| r.post_id == post_id)
            .max_by_key(|r| (r.recorded_at, r.id))
            .cloned())
    }

    async fn revisions_for(&self, post_id: Id) -> RepoResult<Vec<PostRevision>> {
        let s = self.read()?;
        let mut v: Vec<_> = s.revisions.values().filter(|r| r.post_id == post_id).cloned().collect();
        v.sort_by_key(|r| (r.recorded_at, r.id));
        Ok(v)
    }

    async fn record_revision(&self, post_id: Id, recorded_at: DateTime<Utc>, changes: &RevisionChanges) -> RepoResult<PostRevision> {
        let mut s = self.write()?;
        if !s.posts.contains_key(&post_id) { return Err(RepoError::NotFound); }
        let revision = PostRevision { id: s.next_id(), post_id, recorded_at };
        s.revisions.insert(revision.id, revision.clone());
        if let Some(tags) = &changes.tags {
            s.tag_lists.insert(revision.id, RevisionTagList { revision_id: revision.id, tag_count: tags.len() as i32 });
            for name in tags {
                let tag = s.intern(name);
                let row = RevisionTag { id: s.next_id(), revision_id: revision.id, tag_id: tag.id };
                s.revision_tags.insert(row.id, row);
            }
        }
        if let Some(rating) = changes.rating {
            s.ratings.insert(revision.id, RevisionRating { revision_id: revision.id, rating });
        }
        if let Some(source) = &changes.source {
            s.sources.insert(revision.id, RevisionSource { revision_id: revision.id, source: source.clone() });
        }
        Ok(revision)
    }

    async fn revision_changes(&self, revision_id: Id) -> RepoResult<RevisionChanges> {
        let s = self.read()?;
        if !s.revisions.contains_key(&revision_id) { return Err(RepoError::NotFound); }
        Ok(s.changes_of(revision_id))
    }

    async fn tags_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<BTreeSet<String>>> {
        Ok(self.read()?.state_as_of(post_id, at).tags)
    }

    async fn rating_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<Rating>> {
        Ok(self.read()?.state_as_of(post_id, at).rating)
    }

    async fn source_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<String>> {
        Ok(self.read()?.state_as_of(post_id, at).source)
    }

    async fn state_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<PostState> {
        Ok(self.read()?.state_as_of(post_id, at))
    }
}

#[async_trait]
impl ImageRepo for InMemRepo {
    async fn ensure_file_type(&self, mimetype: &str, extension: &str) -> RepoResult<FileType> {
        let mut s = self.write()?;
        if let Some(ft) = s.file_types.values().find(|f| f.mimetype == mimetype) {
            if ft.extension != extension {
                return Err(RepoError::Conflict(format!("{mimetype} is stored with extension '{}'", ft.extension)));
            }
            return Ok(ft.clone());
        }
        if s.file_types.values().any(|f| f.extension == extension) {
            return Err(RepoError::Conflict(format!("extension '{extension}' belongs to another type")));
        }
        let ft = FileType { id: s.next_id(), mimetype: mimetype.to_string(), extension: extension.to_string() };
        s.file_types.insert(ft.id, ft.clone());
        Ok(ft)
    }

    async fn ensure_downloaded_image(&self, new: NewDownloadedImage) -> RepoResult<DownloadedImage> {
        if !is_sha256_hex(&new.sha256) {
            return Err(RepoError::Internal(format!("not a sha256 digest: '{}'", new.sha256)));
        }
        let mut s = self.write()?;
        if let Some(d) = s.downloaded_images.values().find(|d| d.sha256 == new.sha256) {
            return Ok(d.clone());
        }
        if !s.file_types.contains_key(&new.file_type_id) { return Err(RepoError::NotFound); }
        let img = DownloadedImage {
            id: s.next_id(),
            sha256: new.sha256,
            file_type_id: new.file_type_id,
            file_size: new.file_size,
            sample_size: new.sample_size,
            thumbnail_size: new.thumbnail_size,
        };
        s.downloaded_images.insert(img.id, img.clone());
        Ok(img)
    }

    async fn attach_image(&self, post_id: Id, url: &str, downloaded_image_id: Id) -> RepoResult<Image> {
        let mut s = self.write()?;
        if let Some(existing) = s.images.get(&post_id) {
            if existing.url == url && existing.downloaded_image_id == downloaded_image_id {
                return Ok(existing.clone());
            }
            return Err(RepoError::Conflict(format!("post {post_id} already has an image")));
        }
        if s.images.values().any(|i| i.url == url) {
            return Err(RepoError::Conflict(format!("image url '{url}' belongs to another post")));
        }
        if !s.posts.contains_key(&post_id) || !s.downloaded_images.contains_key(&downloaded_image_id) {
            return Err(RepoError::NotFound);
        }
        let img = Image { post_id, url: url.to_string(), downloaded_image_id };
        s.images.insert(post_id, img.clone());
        Ok(img)
    }

    async fn get_image(&self, post_id: Id) -> RepoResult<Option<Image>> {
        let s = self.read()?;
        Ok(s.images.get(&post_id).cloned())
    }

    async fn get_downloaded_image(&self, sha256: &str) -> RepoResult<Option<DownloadedImage>> {
        let s = self.read()?;
        Ok(s.downloaded_images.values().find(|d| d.sha256 == sha256).cloned())
    }
}
