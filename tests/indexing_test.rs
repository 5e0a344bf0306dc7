mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::MockResolver;
use repohost::indexer::plugins::{
    FOLLOW_COLLECTION, LIKE_COLLECTION, POST_COLLECTION, REPOST_COLLECTION,
};
use repohost::{
    AtUri, Cid, Database, Did, Error, IndexingService, RecordWrite, Repo, RepoStorage,
    StorageConfig, WriteOpAction,
};

fn in_memory(resolver: Arc<MockResolver>) -> IndexingService {
    IndexingService::new(
        Database::open_in_memory().unwrap().into_connection(),
        RepoStorage::new(
            Database::open_in_memory().unwrap().into_connection(),
            StorageConfig::default(),
        ),
        resolver,
    )
}

fn cid_of(value: &Value) -> Cid {
    Cid::for_bytes(value.to_string().as_bytes())
}

async fn create(svc: &IndexingService, uri: &AtUri, value: Value) {
    svc.index_record(uri, &cid_of(&value), value, WriteOpAction::Create, 1_000)
        .await
        .unwrap();
}

fn alice() -> Did {
    Did::new("did:example:alice")
}

fn bob() -> Did {
    Did::new("did:example:bob")
}

#[tokio::test]
async fn reindexing_the_same_record_changes_nothing() {
    let svc = in_memory(Arc::default());
    let post = AtUri::new(bob(), POST_COLLECTION, "p1");
    let like = AtUri::new(alice(), LIKE_COLLECTION, "l1");

    create(&svc, &post, common::post("hi")).await;
    for _ in 0..3 {
        create(&svc, &like, common::like(&post.to_string())).await;
    }

    assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 1);
    assert_eq!(svc.list_notifications(&bob(), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn collapsed_likes_count_once_and_promote_on_delete() {
    let svc = in_memory(Arc::default());
    let post = AtUri::new(bob(), POST_COLLECTION, "p1");
    let first = AtUri::new(alice(), LIKE_COLLECTION, "l1");
    let second = AtUri::new(alice(), LIKE_COLLECTION, "l2");

    create(&svc, &post, common::post("hi")).await;
    create(&svc, &first, common::like(&post.to_string())).await;
    create(&svc, &second, common::like(&post.to_string())).await;
    assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 1);

    // The duplicate takes over; the like still counts and still notifies.
    svc.delete_record(&first, true).await.unwrap();
    assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 1);
    let notifs = svc.list_notifications(&bob(), 10).await.unwrap();
    assert_eq!(notifs.len(), 1);
    assert_eq!(notifs[0].record_uri, second.to_string());

    svc.delete_record(&second, true).await.unwrap();
    assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 0);
    assert!(svc.list_notifications(&bob(), 10).await.unwrap().is_empty());
}

/// Like count, repost count of `post`, and bob's follower count.
async fn collapse_counts(svc: &IndexingService, post: &AtUri) -> (u64, u64, u64) {
    let aggs = svc.get_post_aggregates(post).await.unwrap();
    let followers = svc.get_profile_aggregates(&bob()).await.unwrap().followers_count;
    (aggs.like_count, aggs.repost_count, followers)
}

#[tokio::test]
async fn five_duplicates_collapse_for_every_collapsible_kind() {
    let svc = in_memory(Arc::default());
    let post = AtUri::new(bob(), POST_COLLECTION, "p1");
    create(&svc, &post, common::post("hi")).await;

    let kinds = [
        (LIKE_COLLECTION, common::like(&post.to_string()), (1, 0, 0)),
        (REPOST_COLLECTION, common::repost(&post.to_string()), (0, 1, 0)),
        (FOLLOW_COLLECTION, common::follow(&bob()), (0, 0, 1)),
    ];
    for (collection, value, one) in kinds {
        let uris: Vec<AtUri> = (1..=5)
            .map(|i| AtUri::new(alice(), collection, &format!("d{}", i)))
            .collect();
        for uri in &uris {
            create(&svc, uri, value.clone()).await;
        }
        assert_eq!(collapse_counts(&svc, &post).await, one, "{}", collection);

        // Non-canonical duplicates go without touching the count.
        for uri in &uris[1..4] {
            svc.delete_record(uri, true).await.unwrap();
        }
        assert_eq!(collapse_counts(&svc, &post).await, one, "{}", collection);

        // The canonical one goes and the last duplicate takes over.
        svc.delete_record(&uris[0], true).await.unwrap();
        assert_eq!(collapse_counts(&svc, &post).await, one, "{}", collection);

        svc.delete_record(&uris[4], true).await.unwrap();
        assert_eq!(collapse_counts(&svc, &post).await, (0, 0, 0), "{}", collection);
    }
    assert_eq!(svc.get_profile_aggregates(&alice()).await.unwrap().follows_count, 0);
}

#[tokio::test]
async fn undecodable_duplicate_is_passed_over_on_promotion() {
    let (_dir, path) = common::create_temp_db_file("promote.db");
    let svc = IndexingService::open(&path, Arc::new(MockResolver::default())).unwrap();
    let post = AtUri::new(bob(), POST_COLLECTION, "p1");
    let likes: Vec<AtUri> = (1..=3)
        .map(|i| AtUri::new(alice(), LIKE_COLLECTION, &format!("l{}", i)))
        .collect();

    create(&svc, &post, common::post("hi")).await;
    for like in &likes {
        create(&svc, like, common::like(&post.to_string())).await;
    }

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute(
        "UPDATE record SET json = '{' WHERE uri = ?",
        [likes[1].to_string()],
    )
    .unwrap();

    svc.delete_record(&likes[0], true).await.unwrap();
    assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 1);
    let notifs = svc.list_notifications(&bob(), 10).await.unwrap();
    assert_eq!(notifs.len(), 1);
    assert_eq!(notifs[0].record_uri, likes[2].to_string());

    svc.delete_record(&likes[2], true).await.unwrap();
    assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 0);
}

#[tokio::test]
async fn out_of_order_events_converge() {
    let svc = in_memory(Arc::default());
    let post = AtUri::new(bob(), POST_COLLECTION, "p1");
    let reply = AtUri::new(alice(), POST_COLLECTION, "r1");
    let like = AtUri::new(alice(), LIKE_COLLECTION, "l1");
    let repost = AtUri::new(alice(), REPOST_COLLECTION, "rp1");
    let strong = json!({ "uri": post.to_string(), "cid": "unused" });

    // Interactions first, subject last.
    create(
        &svc,
        &reply,
        json!({
            "text": "reply",
            "createdAt": "2024-01-01T00:00:00Z",
            "reply": { "root": strong, "parent": strong }
        }),
    )
    .await;
    create(&svc, &like, common::like(&post.to_string())).await;
    create(&svc, &repost, common::repost(&post.to_string())).await;
    assert!(matches!(svc.get_post_aggregates(&post).await, Err(Error::NotFound(_))));

    create(&svc, &post, common::post("root")).await;
    let aggs = svc.get_post_aggregates(&post).await.unwrap();
    assert_eq!(aggs.like_count, 1);
    assert_eq!(aggs.repost_count, 1);
    assert_eq!(aggs.reply_count, 1);

    // Deleting something never indexed is a no-op.
    svc.delete_record(&AtUri::new(alice(), LIKE_COLLECTION, "missing"), true)
        .await
        .unwrap();
    assert_eq!(svc.get_post_aggregates(&post).await.unwrap().like_count, 1);
}

#[tokio::test]
async fn tombstones_only_delete_unhosted_actors() {
    let resolver = Arc::new(MockResolver::default());
    let svc = in_memory(resolver.clone());
    resolver.set_handle(&alice(), "alice.test");
    svc.index_handle(&alice(), 1_000, true).await.unwrap();
    create(&svc, &AtUri::new(alice(), FOLLOW_COLLECTION, "f1"), common::follow(&bob())).await;

    resolver.set_hosted(&alice(), Some(true));
    assert!(!svc.delete_actor(&alice()).await.unwrap());
    resolver.set_hosted(&alice(), None);
    assert!(!svc.delete_actor(&alice()).await.unwrap());
    assert_eq!(svc.get_profile_aggregates(&bob()).await.unwrap().followers_count, 1);

    resolver.set_hosted(&alice(), Some(false));
    assert!(svc.delete_actor(&alice()).await.unwrap());
    assert!(matches!(svc.get_actor(&alice()).await, Err(Error::NotFound(_))));
    assert_eq!(svc.get_profile_aggregates(&bob()).await.unwrap().followers_count, 0);
}

#[tokio::test]
async fn handle_moves_to_the_account_it_resolves_to() {
    let resolver = Arc::new(MockResolver::default());
    let svc = in_memory(resolver.clone());

    resolver.set_handle(&alice(), "shared.test");
    svc.index_handle(&alice(), 1_000, true).await.unwrap();
    assert_eq!(svc.get_actor(&alice()).await.unwrap().handle.as_deref(), Some("shared.test"));

    resolver.clear_handle(&alice());
    resolver.set_handle(&bob(), "shared.test");
    svc.index_handle(&bob(), 2_000, true).await.unwrap();

    assert_eq!(svc.get_actor(&bob()).await.unwrap().handle.as_deref(), Some("shared.test"));
    assert_eq!(svc.get_actor(&alice()).await.unwrap().handle, None);
}

#[tokio::test]
async fn takedowns_hide_subjects_until_reversed() {
    let svc = in_memory(Arc::default());
    let post = AtUri::new(bob(), POST_COLLECTION, "p1");
    create(&svc, &post, common::post("hi")).await;
    svc.index_handle(&bob(), 1_000, true).await.unwrap();

    svc.takedown_record(&post, Some("mod-1".into())).await.unwrap();
    assert!(matches!(svc.get_record(&post).await, Err(Error::NotFound(_))));
    svc.takedown_record(&post, None).await.unwrap();
    assert!(svc.get_record(&post).await.is_ok());

    svc.takedown_actor(&bob(), Some("mod-2".into())).await.unwrap();
    assert!(matches!(svc.get_actor(&bob()).await, Err(Error::NotFound(_))));
    assert!(matches!(svc.get_record(&post).await, Err(Error::NotFound(_))));
    svc.takedown_actor(&bob(), None).await.unwrap();
    assert!(svc.get_actor(&bob()).await.is_ok());

    assert!(matches!(
        svc.takedown_record(&AtUri::new(bob(), POST_COLLECTION, "nope"), None).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn index_repo_makes_the_index_match_the_store() {
    let (_dir, path) = common::create_temp_db_file("backfill.db");
    let did = alice();

    let mut storage = RepoStorage::open(&path, StorageConfig::default()).unwrap();
    let init = Repo::format_init_commit(
        &did,
        &[
            RecordWrite::create(POST_COLLECTION, "p1", common::post("one")),
            RecordWrite::create(POST_COLLECTION, "p2", common::post("two")),
            RecordWrite::create(FOLLOW_COLLECTION, "f1", common::follow(&bob())),
            RecordWrite::create(POST_COLLECTION, "bad", json!({ "createdAt": "t" })),
        ],
    )
    .unwrap();
    storage.commit_staged(&did, &init, None).unwrap();

    let svc = IndexingService::open(&path, Arc::new(MockResolver::default())).unwrap();
    let report = svc.index_repo(&did, None).await.unwrap();
    assert_eq!(report.created, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(svc.get_profile_aggregates(&did).await.unwrap().posts_count, 2);

    // Running it again is a no-op.
    let again = svc.index_repo(&did, None).await.unwrap();
    assert_eq!((again.created, again.updated, again.deleted), (0, 0, 0));

    let repo = Repo::load(&storage, &did).unwrap().unwrap();
    let next = repo
        .format_commit(&[
            RecordWrite::delete(POST_COLLECTION, "p1"),
            RecordWrite::update(POST_COLLECTION, "p2", common::post("two, edited")),
        ])
        .unwrap();
    storage.commit_staged(&did, &next, Some(repo.head())).unwrap();

    let report = svc.index_repo(&did, None).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(svc.get_profile_aggregates(&did).await.unwrap().posts_count, 1);

    let edited = svc.get_record(&AtUri::new(did.clone(), POST_COLLECTION, "p2")).await.unwrap();
    assert_eq!(edited.value["text"], "two, edited");
    assert!(svc.get_actor_sync(&did).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_are_served_while_a_backfill_runs() {
    const POSTS: usize = 400;
    let (_dir, path) = common::create_temp_db_file("long_backfill.db");
    let did = alice();

    let writes: Vec<RecordWrite> = (0..POSTS)
        .map(|i| RecordWrite::create(POST_COLLECTION, format!("p{:04}", i), common::post("bulk")))
        .collect();
    let mut storage = RepoStorage::open(&path, StorageConfig::default()).unwrap();
    let init = Repo::format_init_commit(&did, &writes).unwrap();
    storage.commit_staged(&did, &init, None).unwrap();

    let svc = IndexingService::open(&path, Arc::new(MockResolver::default())).unwrap();
    let backfill = {
        let (svc, did) = (svc.clone(), did.clone());
        tokio::spawn(async move { svc.index_repo(&did, None).await })
    };

    // Some read lands between two records of the pass.
    let mut saw_partial = false;
    while !backfill.is_finished() {
        if let Ok(aggs) = svc.get_profile_aggregates(&did).await {
            saw_partial |= aggs.posts_count > 0 && (aggs.posts_count as usize) < POSTS;
        }
    }
    let report = backfill.await.unwrap().unwrap();
    assert_eq!(report.created, POSTS);
    assert!(saw_partial);
}
