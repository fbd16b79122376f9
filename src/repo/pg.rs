//! Postgres store. Every write is a single `INSERT … ON CONFLICT` or one transaction, so
//! concurrent writers can't produce duplicate rows.

use std::collections::BTreeSet;

use log::{debug, error, info};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use super::*;

#[derive(Clone)]
pub struct PgRepo { pool: Pool<Postgres> }

impl PgRepo {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

    /// Lazily connecting pool; the first query opens a connection.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> RepoResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepoError::Internal(format!("migration failed: {e}")))?;
        info!("database schema up to date");
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> RepoError {
    match &e {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(d) if d.is_unique_violation() => RepoError::Conflict(d.message().to_string()),
        sqlx::Error::Database(d) if d.is_foreign_key_violation() => RepoError::NotFound,
        _ => {
            error!("database error: {e}");
            RepoError::Internal(e.to_string())
        }
    }
}

const CACHED_TAG_COLUMNS: &str =
    "id, name, category, post_count, is_locked, is_deprecated, created_at, updated_at, record_updated_at";

#[derive(sqlx::FromRow)]
struct CachedTagRow {
    id: Id,
    name: String,
    category: i16,
    post_count: i64,
    is_locked: bool,
    is_deprecated: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    record_updated_at: DateTime<Utc>,
}

impl TryFrom<CachedTagRow> for CachedTag {
    type Error = RepoError;
    fn try_from(r: CachedTagRow) -> Result<Self, Self::Error> {
        Ok(CachedTag {
            id: r.id,
            name: r.name,
            category: TagCategory::try_from(r.category).map_err(RepoError::Internal)?,
            post_count: r.post_count,
            is_locked: r.is_locked,
            is_deprecated: r.is_deprecated,
            created_at: r.created_at,
            updated_at: r.updated_at,
            record_updated_at: r.record_updated_at,
        })
    }
}

const DOWNLOADED_IMAGE_COLUMNS: &str = "id, sha256, file_type_id, file_size, sample_size, thumbnail_size";

#[derive(sqlx::FromRow)]
struct DownloadedImageRow {
    id: Id,
    sha256: Vec<u8>,
    file_type_id: Id,
    file_size: i64,
    sample_size: Option<i64>,
    thumbnail_size: Option<i64>,
}

impl From<DownloadedImageRow> for DownloadedImage {
    fn from(r: DownloadedImageRow) -> Self {
        DownloadedImage {
            id: r.id,
            sha256: hex::encode(r.sha256),
            file_type_id: r.file_type_id,
            file_size: r.file_size,
            sample_size: r.sample_size,
            thumbnail_size: r.thumbnail_size,
        }
    }
}

fn decode_sha256(s: &str) -> RepoResult<Vec<u8>> {
    match hex::decode(s) {
        Ok(bytes) if bytes.len() == 32 => Ok(bytes),
        _ => Err(RepoError::Internal(format!("not a sha256 digest: '{s}'"))),
    }
}

#[async_trait]
impl ImageboardRepo for PgRepo {
    async fn get_imageboard_by_name(&self, name: &str) -> RepoResult<Option<Imageboard>> {
        sqlx::query_as::<_, Imageboard>("SELECT id, name, url FROM imageboards WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool).await.map_err(db_err)
    }

    async fn ensure_imageboard(&self, name: &str, url: &str) -> RepoResult<Imageboard> {
        sqlx::query_as::<_, Imageboard>(
            "INSERT INTO imageboards (name, url) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, name, url"
        )
        .bind(name).bind(url)
        .fetch_one(&self.pool).await.map_err(db_err)
    }
}

#[async_trait]
impl CachedTagRepo for PgRepo {
    async fn get_cached_tag(&self, id: Id) -> RepoResult<Option<CachedTag>> {
        let row = sqlx::query_as::<_, CachedTagRow>(&format!("SELECT {CACHED_TAG_COLUMNS} FROM cached_tags WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool).await.map_err(db_err)?;
        row.map(CachedTag::try_from).transpose()
    }

    async fn get_cached_tag_by_name(&self, name: &str) -> RepoResult<Option<CachedTag>> {
        let row = sqlx::query_as::<_, CachedTagRow>(&format!("SELECT {CACHED_TAG_COLUMNS} FROM cached_tags WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool).await.map_err(db_err)?;
        row.map(CachedTag::try_from).transpose()
    }

    async fn upsert_cached_tag(&self, tag: NewCachedTag, existed: bool) -> RepoResult<CachedTag> {
        debug!("upserting cached tag {} '{}' (existed={existed})", tag.id, tag.name);
        let row = sqlx::query_as::<_, CachedTagRow>(&format!(
            "INSERT INTO cached_tags ({CACHED_TAG_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                category = EXCLUDED.category,
                post_count = EXCLUDED.post_count,
                is_locked = EXCLUDED.is_locked,
                is_deprecated = EXCLUDED.is_deprecated,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                record_updated_at = GREATEST(cached_tags.record_updated_at, EXCLUDED.record_updated_at)
             RETURNING {CACHED_TAG_COLUMNS}"
        ))
        .bind(tag.id)
        .bind(&tag.name)
        .bind(tag.category.code())
        .bind(tag.post_count)
        .bind(tag.is_locked)
        .bind(tag.is_deprecated)
        .bind(tag.created_at)
        .bind(tag.updated_at)
        .bind(tag.record_updated_at)
        .fetch_one(&self.pool).await.map_err(db_err)?;
        CachedTag::try_from(row)
    }
}

#[async_trait]
impl TagRepo for PgRepo {
    async fn get_tag_by_name(&self, name: &str) -> RepoResult<Option<Tag>> {
        sqlx::query_as::<_, Tag>("SELECT id, name FROM tags WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool).await.map_err(db_err)
    }

    async fn intern_tag(&self, name: &str) -> RepoResult<Tag> {
        sqlx::query_as::<_, Tag>(
            "INSERT INTO tags (name) VALUES ($1)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, name"
        )
        .bind(name)
        .fetch_one(&self.pool).await.map_err(db_err)
    }
}

#[async_trait]
impl PostRepo for PgRepo {
    async fn get_post(&self, imageboard_id: Id, local_id: i64) -> RepoResult<Option<Post>> {
        sqlx::query_as::<_, Post>(
            "SELECT id, imageboard_id, local_id, first_detected_at FROM posts WHERE imageboard_id = $1 AND local_id = $2"
        )
        .bind(imageboard_id).bind(local_id)
        .fetch_optional(&self.pool).await.map_err(db_err)
    }

    async fn ensure_post(&self, imageboard_id: Id, local_id: i64, detected_at: DateTime<Utc>) -> RepoResult<Post> {
        sqlx::query_as::<_, Post>(
            "INSERT INTO posts (imageboard_id, local_id, first_detected_at) VALUES ($1, $2, $3)
             ON CONFLICT (imageboard_id, local_id) DO UPDATE SET local_id = EXCLUDED.local_id
             RETURNING id, imageboard_id, local_id, first_detected_at"
        )
        .bind(imageboard_id).bind(local_id).bind(detected_at)
        .fetch_one(&self.pool).await.map_err(db_err)
    }

    async fn get_missing_post(&self, imageboard_id: Id, local_id: i64) -> RepoResult<Option<MissingPost>> {
        sqlx::query_as::<_, MissingPost>(
            "SELECT id, imageboard_id, local_id, first_detected_at FROM missing_posts WHERE imageboard_id = $1 AND local_id = $2"
        )
        .bind(imageboard_id).bind(local_id)
        .fetch_optional(&self.pool).await.map_err(db_err)
    }

    async fn mark_missing(&self, imageboard_id: Id, local_id: i64, detected_at: DateTime<Utc>) -> RepoResult<MissingPost> {
        sqlx::query_as::<_, MissingPost>(
            "INSERT INTO missing_posts (imageboard_id, local_id, first_detected_at) VALUES ($1, $2, $3)
             ON CONFLICT (imageboard_id, local_id) DO UPDATE SET local_id = EXCLUDED.local_id
             RETURNING id, imageboard_id, local_id, first_detected_at"
        )
        .bind(imageboard_id).bind(local_id).bind(detected_at)
        .fetch_one(&self.pool).await.map_err(db_err)
    }
}

#[async_trait]
impl RevisionRepo for PgRepo {
    async fn latest_revision(&self, post_id: Id) -> RepoResult<Option<PostRevision>> {
        sqlx::query_as::<_, PostRevision>(
            "SELECT id, post_id, recorded_at FROM post_revisions WHERE post_id = $1
             ORDER BY recorded_at DESC, id DESC LIMIT 1"
        )
        .bind(post_id)
        .fetch_optional(&self.pool).await.map_err(db_err)
    }

    async fn revisions_for(&self, post_id: Id) -> RepoResult<Vec<PostRevision>> {
        sqlx::query_as::<_, PostRevision>(
            "SELECT id, post_id, recorded_at FROM post_revisions WHERE post_id = $1 ORDER BY recorded_at, id"
        )
        .bind(post_id)
        .fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn record_revision(&self, post_id: Id, recorded_at: DateTime<Utc>, changes: &RevisionChanges) -> RepoResult<PostRevision> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let revision = sqlx::query_as::<_, PostRevision>(
            "INSERT INTO post_revisions (post_id, recorded_at) VALUES ($1, $2) RETURNING id, post_id, recorded_at"
        )
        .bind(post_id).bind(recorded_at)
        .fetch_one(&mut *tx).await.map_err(db_err)?;

        if let Some(tags) = &changes.tags {
            sqlx::query("INSERT INTO revision_tag_lists (revision_id, tag_count) VALUES ($1, $2)")
                .bind(revision.id).bind(tags.len() as i32)
                .execute(&mut *tx).await.map_err(db_err)?;
            if !tags.is_empty() {
                let names: Vec<String> = tags.iter().cloned().collect();
                sqlx::query("INSERT INTO tags (name) SELECT * FROM unnest($1::text[]) ON CONFLICT (name) DO NOTHING")
                    .bind(&names)
                    .execute(&mut *tx).await.map_err(db_err)?;
                sqlx::query("INSERT INTO revision_tags (revision_id, tag_id) SELECT $1, id FROM tags WHERE name = ANY($2)")
                    .bind(revision.id).bind(&names)
                    .execute(&mut *tx).await.map_err(db_err)?;
            }
        }
        if let Some(rating) = changes.rating {
            sqlx::query("INSERT INTO revision_ratings (revision_id, rating) VALUES ($1, $2)")
                .bind(revision.id).bind(rating.code())
                .execute(&mut *tx).await.map_err(db_err)?;
        }
        if let Some(source) = &changes.source {
            sqlx::query("INSERT INTO revision_sources (revision_id, source) VALUES ($1, $2)")
                .bind(revision.id).bind(source)
                .execute(&mut *tx).await.map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(revision)
    }

    async fn revision_changes(&self, revision_id: Id) -> RepoResult<RevisionChanges> {
        let exists: Option<Id> = sqlx::query_scalar("SELECT id FROM post_revisions WHERE id = $1")
            .bind(revision_id)
            .fetch_optional(&self.pool).await.map_err(db_err)?;
        if exists.is_none() { return Err(RepoError::NotFound); }

        let has_list: Option<Id> = sqlx::query_scalar("SELECT revision_id FROM revision_tag_lists WHERE revision_id = $1")
            .bind(revision_id)
            .fetch_optional(&self.pool).await.map_err(db_err)?;
        let tags = match has_list {
            Some(id) => Some(self.tag_names(id).await?),
            None => None,
        };
        let rating: Option<String> = sqlx::query_scalar("SELECT rating FROM revision_ratings WHERE revision_id = $1")
            .bind(revision_id)
            .fetch_optional(&self.pool).await.map_err(db_err)?;
        let source: Option<String> = sqlx::query_scalar("SELECT source FROM revision_sources WHERE revision_id = $1")
            .bind(revision_id)
            .fetch_optional(&self.pool).await.map_err(db_err)?;
        Ok(RevisionChanges { tags, rating: rating.map(|r| parse_rating(&r)).transpose()?, source })
    }

    async fn tags_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<BTreeSet<String>>> {
        let defining: Option<Id> = sqlx::query_scalar(
            "SELECT l.revision_id FROM post_revisions r
             JOIN revision_tag_lists l ON l.revision_id = r.id
             WHERE r.post_id = $1 AND r.recorded_at <= $2
             ORDER BY r.recorded_at DESC, r.id DESC LIMIT 1"
        )
        .bind(post_id).bind(at)
        .fetch_optional(&self.pool).await.map_err(db_err)?;
        match defining {
            Some(revision_id) => Ok(Some(self.tag_names(revision_id).await?)),
            None => Ok(None),
        }
    }

    async fn rating_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<Rating>> {
        let rating: Option<String> = sqlx::query_scalar(
            "SELECT p.rating FROM post_revisions r
             JOIN revision_ratings p ON p.revision_id = r.id
             WHERE r.post_id = $1 AND r.recorded_at <= $2
             ORDER BY r.recorded_at DESC, r.id DESC LIMIT 1"
        )
        .bind(post_id).bind(at)
        .fetch_optional(&self.pool).await.map_err(db_err)?;
        rating.map(|r| parse_rating(&r)).transpose()
    }

    async fn source_as_of(&self, post_id: Id, at: DateTime<Utc>) -> RepoResult<Option<String>> {
        sqlx::query_scalar(
            "SELECT p.source FROM post_revisions r
             JOIN revision_sources p ON p.revision_id = r.id
             WHERE r.post_id = $1 AND r.recorded_at <= $2
             ORDER BY r.recorded_at DESC, r.id DESC LIMIT 1"
        )
        .bind(post_id).bind(at)
        .fetch_optional(&self.pool).await.map_err(db_err)
    }
}

impl PgRepo {
    async fn tag_names(&self, revision_id: Id) -> RepoResult<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT t.name FROM revision_tags rt JOIN tags t ON t.id = rt.tag_id WHERE rt.revision_id = $1"
        )
        .bind(revision_id)
        .fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(names.into_iter().collect())
    }
}

fn parse_rating(code: &str) -> RepoResult<Rating> {
    Rating::from_code(code).ok_or_else(|| RepoError::Internal(format!("unknown rating '{code}'")))
}

#[async_trait]
impl ImageRepo for PgRepo {
    async fn ensure_file_type(&self, mimetype: &str, extension: &str) -> RepoResult<FileType> {
        let ft = sqlx::query_as::<_, FileType>(
            "INSERT INTO file_types (mimetype, extension) VALUES ($1, $2)
             ON CONFLICT (mimetype) DO UPDATE SET mimetype = EXCLUDED.mimetype
             RETURNING id, mimetype, extension"
        )
        .bind(mimetype).bind(extension)
        .fetch_one(&self.pool).await.map_err(db_err)?;
        if ft.extension != extension {
            return Err(RepoError::Conflict(format!("{mimetype} is stored with extension '{}'", ft.extension)));
        }
        Ok(ft)
    }

    async fn ensure_downloaded_image(&self, new: NewDownloadedImage) -> RepoResult<DownloadedImage> {
        let sha = decode_sha256(&new.sha256)?;
        let row = sqlx::query_as::<_, DownloadedImageRow>(&format!(
            "INSERT INTO downloaded_images (sha256, file_type_id, file_size, sample_size, thumbnail_size)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (sha256) DO UPDATE SET sha256 = EXCLUDED.sha256
             RETURNING {DOWNLOADED_IMAGE_COLUMNS}"
        ))
        .bind(sha)
        .bind(new.file_type_id)
        .bind(new.file_size)
        .bind(new.sample_size)
        .bind(new.thumbnail_size)
        .fetch_one(&self.pool).await.map_err(db_err)?;
        Ok(row.into())
    }

    async fn attach_image(&self, post_id: Id, url: &str, downloaded_image_id: Id) -> RepoResult<Image> {
        let inserted = sqlx::query_as::<_, Image>(
            "INSERT INTO images (post_id, url, downloaded_image_id) VALUES ($1, $2, $3)
             ON CONFLICT (post_id) DO NOTHING
             RETURNING post_id, url, downloaded_image_id"
        )
        .bind(post_id).bind(url).bind(downloaded_image_id)
        .fetch_optional(&self.pool).await.map_err(db_err)?;
        if let Some(img) = inserted {
            return Ok(img);
        }
        match self.get_image(post_id).await? {
            Some(existing) if existing.url == url && existing.downloaded_image_id == downloaded_image_id => Ok(existing),
            _ => Err(RepoError::Conflict(format!("post {post_id} already has an image"))),
        }
    }

    async fn get_image(&self, post_id: Id) -> RepoResult<Option<Image>> {
        sqlx::query_as::<_, Image>("SELECT post_id, url, downloaded_image_id FROM images WHERE post_id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool).await.map_err(db_err)
    }

    async fn get_downloaded_image(&self, sha256: &str) -> RepoResult<Option<DownloadedImage>> {
        let sha = decode_sha256(sha256)?;
        let row = sqlx::query_as::<_, DownloadedImageRow>(&format!(
            "SELECT {DOWNLOADED_IMAGE_COLUMNS} FROM downloaded_images WHERE sha256 = $1"
        ))
        .bind(sha)
        .fetch_optional(&self.pool).await.map_err(db_err)?;
        Ok(row.map(Into::into))
    }
}
