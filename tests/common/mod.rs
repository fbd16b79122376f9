#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use booru_mirror::api::{BooruApi, PostRecord, TagRecord};
use booru_mirror::models::{Id, TagCategory};
use booru_mirror::sync::Clock;
use booru_mirror::SyncResult;
use chrono::{DateTime, TimeZone, Utc};

/// Clock the test moves by hand.
pub struct TestClock(Mutex<DateTime<Utc>>);

impl TestClock {
    pub fn at(start: DateTime<Utc>) -> Self { Self(Mutex::new(start)) }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> { *self.0.lock().unwrap() }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn tag_record(id: Id, name: &str, post_count: i64) -> TagRecord {
    TagRecord {
        id,
        name: name.to_string(),
        category: TagCategory::General,
        post_count,
        is_locked: false,
        is_deprecated: false,
        created_at: Utc.with_ymd_and_hms(2013, 2, 28, 5, 28, 48).unwrap(),
        updated_at: Utc.with_ymd_and_hms(2019, 8, 30, 21, 23, 14).unwrap(),
    }
}

pub fn post_record(id: i64, tags: &[&str], source: &str) -> PostRecord {
    PostRecord {
        id,
        tag_string: tags.iter().map(|t| t.to_string()).collect(),
        rating: Some(booru_mirror::models::Rating::General),
        source: source.to_string(),
    }
}

/// Remote that serves whatever the test put in it and counts every call.
#[derive(Default)]
pub struct MockApi {
    pub tags: Mutex<HashMap<Id, TagRecord>>,
    pub posts: Mutex<HashMap<i64, PostRecord>>,
    pub calls: AtomicUsize,
    /// Added to every call, to widen race windows.
    pub latency: Option<Duration>,
}

impl MockApi {
    pub fn put_tag(&self, tag: TagRecord) {
        self.tags.lock().unwrap().insert(tag.id, tag);
    }

    pub fn remove_tag(&self, id: Id) {
        self.tags.lock().unwrap().remove(&id);
    }

    pub fn put_post(&self, post: PostRecord) {
        self.posts.lock().unwrap().insert(post.id, post);
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }

    async fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait::async_trait]
impl BooruApi for MockApi {
    async fn tag_by_name(&self, name: &str) -> SyncResult<Option<TagRecord>> {
        self.hit().await;
        Ok(self.tags.lock().unwrap().values().find(|t| t.name == name).cloned())
    }

    async fn tag_by_id(&self, id: Id) -> SyncResult<Option<TagRecord>> {
        self.hit().await;
        Ok(self.tags.lock().unwrap().get(&id).cloned())
    }

    async fn post_by_id(&self, id: i64) -> SyncResult<Option<PostRecord>> {
        self.hit().await;
        Ok(self.posts.lock().unwrap().get(&id).cloned())
    }
}
