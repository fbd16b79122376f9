#![cfg(feature = "inmem-store")]

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use booru_mirror::content::DownloadedContent;
use booru_mirror::models::{Imageboard, Rating};
use booru_mirror::repo::inmem::InMemRepo;
use booru_mirror::repo::{ImageRepo, ImageboardRepo, PostRepo, RepoError, RevisionRepo, TagRepo};
use booru_mirror::revision::RevisionChanges;
use booru_mirror::{PostSync, SyncEngine, SyncError};
use common::{post_record, t0, MockApi, TestClock};

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

struct Harness {
    repo: Arc<InMemRepo>,
    api: Arc<MockApi>,
    clock: Arc<TestClock>,
    engine: SyncEngine,
    board: Imageboard,
}

async fn harness() -> Harness {
    let repo = Arc::new(InMemRepo::new());
    let api = Arc::new(MockApi::default());
    let clock = Arc::new(TestClock::at(t0()));
    let engine = SyncEngine::new(repo.clone(), api.clone(), chrono::Duration::days(7)).with_clock(clock.clone());
    let board = repo.ensure_imageboard("Danbooru", "https://danbooru.donmai.us/").await.unwrap();
    Harness { repo, api, clock, engine, board }
}

#[tokio::test]
async fn unchanged_tags_are_inherited() {
    let h = harness().await;
    let post = h.repo.ensure_post(h.board.id, 100, t0()).await.unwrap();
    let t1 = t0();
    let t2 = t0() + chrono::Duration::hours(1);

    h.repo
        .record_revision(post.id, t1, &RevisionChanges { tags: Some(set(&["a", "b"])), ..Default::default() })
        .await
        .unwrap();
    h.repo
        .record_revision(post.id, t2, &RevisionChanges { rating: Some(Rating::Sensitive), ..Default::default() })
        .await
        .unwrap();

    assert_eq!(h.repo.tags_as_of(post.id, t2).await.unwrap(), Some(set(&["a", "b"])));
    assert_eq!(h.repo.rating_as_of(post.id, t2).await.unwrap(), Some(Rating::Sensitive));
    assert_eq!(h.repo.rating_as_of(post.id, t1).await.unwrap(), None);
    // nothing recorded yet
    assert_eq!(h.repo.tags_as_of(post.id, t1 - chrono::Duration::seconds(1)).await.unwrap(), None);
}

#[tokio::test]
async fn explicit_empty_tag_list_clears() {
    let h = harness().await;
    let post = h.repo.ensure_post(h.board.id, 101, t0()).await.unwrap();
    let t1 = t0();
    let t2 = t0() + chrono::Duration::hours(1);
    let t3 = t0() + chrono::Duration::hours(2);

    h.repo.record_revision(post.id, t1, &RevisionChanges { tags: Some(set(&["a"])), ..Default::default() }).await.unwrap();
    let cleared = h.repo.record_revision(post.id, t2, &RevisionChanges { tags: Some(BTreeSet::new()), ..Default::default() }).await.unwrap();
    h.repo.record_revision(post.id, t3, &RevisionChanges { source: Some("pixiv".into()), ..Default::default() }).await.unwrap();

    assert_eq!(h.repo.tags_as_of(post.id, t3).await.unwrap(), Some(BTreeSet::new()));
    assert_eq!(h.repo.revision_changes(cleared.id).await.unwrap().tags, Some(BTreeSet::new()));
    assert_eq!(h.repo.revisions_for(post.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn sync_records_only_changed_properties() {
    let h = harness().await;
    h.api.put_post(post_record(5, &["a", "b"], "https://example.com/1"));

    let first = h.engine.sync_post(&h.board, 5).await.unwrap();
    let PostSync::Recorded { post, changes, .. } = first else { panic!("expected a revision") };
    assert_eq!(changes.tags, Some(set(&["a", "b"])));
    assert_eq!(changes.rating, Some(Rating::General));
    assert_eq!(changes.source.as_deref(), Some("https://example.com/1"));
    // the vocabulary picked up the names
    assert!(h.repo.get_tag_by_name("a").await.unwrap().is_some());

    // fresh: nothing fetched
    h.clock.advance(chrono::Duration::days(1));
    let again = h.engine.sync_post(&h.board, 5).await.unwrap();
    assert!(matches!(again, PostSync::Fresh { .. }));
    assert_eq!(h.api.calls(), 1);

    // stale and the tags moved; rating and source did not
    h.api.put_post(post_record(5, &["a", "c"], "https://example.com/1"));
    h.clock.advance(chrono::Duration::days(10));
    let second = h.engine.sync_post(&h.board, 5).await.unwrap();
    let PostSync::Recorded { revision, changes, .. } = second else { panic!("expected a revision") };
    assert_eq!(changes, RevisionChanges { tags: Some(set(&["a", "c"])), rating: None, source: None });
    assert_eq!(changes.changed_properties(), vec!["tags"]);

    let state = h.repo.state_as_of(post.id, revision.recorded_at).await.unwrap();
    assert_eq!(state.tags, Some(set(&["a", "c"])));
    assert_eq!(state.rating, Some(Rating::General));
    assert_eq!(state.source.as_deref(), Some("https://example.com/1"));

    // unchanged observation still leaves a dated revision behind
    h.clock.advance(chrono::Duration::days(10));
    let third = h.engine.sync_post(&h.board, 5).await.unwrap();
    let PostSync::Recorded { changes, .. } = third else { panic!("expected a revision") };
    assert!(changes.is_empty());
    assert_eq!(h.repo.revisions_for(post.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn absent_post_is_remembered_as_missing() {
    let h = harness().await;

    let first = h.engine.sync_post(&h.board, 404).await.unwrap();
    assert!(matches!(first, PostSync::Missing(_)));
    assert!(h.repo.get_missing_post(h.board.id, 404).await.unwrap().is_some());
    assert!(h.repo.get_post(h.board.id, 404).await.unwrap().is_none());

    // never re-checked, even once it appears upstream
    h.api.put_post(post_record(404, &["late"], ""));
    h.clock.advance(chrono::Duration::days(30));
    assert!(matches!(h.engine.sync_post(&h.board, 404).await.unwrap(), PostSync::Missing(_)));
    assert_eq!(h.api.calls(), 1);
}

#[tokio::test]
async fn mismatched_post_id_is_rejected() {
    let h = harness().await;
    // remote answers for 9 with the body of 8
    h.api.posts.lock().unwrap().insert(9, post_record(8, &["a"], ""));

    let err = h.engine.sync_post(&h.board, 9).await.unwrap_err();
    assert!(matches!(err, SyncError::Malformed { .. }), "{err:?}");
    assert!(h.repo.get_post(h.board.id, 9).await.unwrap().is_none());
}

#[tokio::test]
async fn identical_content_shares_one_download() {
    let h = harness().await;
    let p1 = h.repo.ensure_post(h.board.id, 1, t0()).await.unwrap();
    let p2 = h.repo.ensure_post(h.board.id, 2, t0()).await.unwrap();

    let png: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
        0x89,
    ];
    let content = DownloadedContent::from_bytes(png).with_thumbnail_size(12);
    assert_eq!(content.mimetype, "image/png");

    let i1 = h.engine.record_image(&p1, "https://cdn.example/1.png", &content).await.unwrap();
    let i2 = h.engine.record_image(&p2, "https://cdn.example/2.png", &content).await.unwrap();
    assert_eq!(i1.downloaded_image_id, i2.downloaded_image_id);

    let dl = h.repo.get_downloaded_image(&content.sha256).await.unwrap().unwrap();
    assert_eq!(dl.file_size, png.len() as i64);
    assert_eq!(dl.thumbnail_size, Some(12));

    // same link again is fine; a second url for the same post is not
    h.engine.record_image(&p1, "https://cdn.example/1.png", &content).await.unwrap();
    let err = h.engine.record_image(&p1, "https://cdn.example/other.png", &content).await.unwrap_err();
    assert!(matches!(err, SyncError::Repo(RepoError::Conflict(_))), "{err:?}");
    assert_eq!(h.repo.get_image(p2.id).await.unwrap().unwrap(), i2);
}
