mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use repohost::codec::read_car;
use repohost::{Cid, Did, Error, RecordWrite, Repo, RepoStorage, Rev, StorageConfig};

fn storage(path: &std::path::Path) -> RepoStorage {
    RepoStorage::open(path, StorageConfig::default()).unwrap()
}

fn write(storage: &mut RepoStorage, did: &Did, writes: Vec<RecordWrite>) -> Cid {
    let commit = match Repo::load(storage, did).unwrap() {
        Some(repo) => {
            let commit = repo.format_commit(&writes).unwrap();
            storage.commit_staged(did, &commit, Some(repo.head())).unwrap();
            commit
        }
        None => {
            let commit = Repo::format_init_commit(did, &writes).unwrap();
            storage.commit_staged(did, &commit, None).unwrap();
            commit
        }
    };
    commit.cid
}

#[test]
fn concurrent_writers_on_one_head_exactly_one_wins() {
    let (_dir, path) = common::create_temp_db_file("cas.db");
    let did = Did::new("did:example:alice");
    write(&mut storage(&path), &did, vec![]);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let path = path.clone();
            let did = did.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut storage = storage(&path);
                let repo = Repo::load(&storage, &did).unwrap().unwrap();
                let commit = repo
                    .format_commit(&[RecordWrite::create(
                        "app.bsky.feed.post",
                        format!("p{}", i),
                        common::post("race"),
                    )])
                    .unwrap();
                barrier.wait();
                storage.commit_staged(&did, &commit, Some(repo.head()))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(Error::Misordered { .. }))));

    // The loser's blocks were rolled back with its commit.
    let repo = Repo::load(&storage(&path), &did).unwrap().unwrap();
    assert_eq!(repo.index().len(), 1);
}

#[test]
fn commit_path_and_export_cover_commits_after_since() {
    let (_dir, path) = common::create_temp_db_file("path.db");
    let mut store = storage(&path);
    let did = Did::new("did:example:alice");

    let first = write(&mut store, &did, vec![]);
    let second = write(
        &mut store,
        &did,
        vec![RecordWrite::create("app.bsky.feed.post", "a", common::post("one"))],
    );
    let third = write(
        &mut store,
        &did,
        vec![RecordWrite::create("app.bsky.feed.post", "b", common::post("two"))],
    );

    let path_all = store.get_commit_path(&did, &third, None).unwrap();
    assert_eq!(path_all, vec![first, second, third]);

    let path_since = store.get_commit_path(&did, &third, Some(&first)).unwrap();
    assert_eq!(path_since, vec![second, third]);

    let (root, blocks) = read_car(&store.export_car(&did, Some(&second)).unwrap()).unwrap();
    assert_eq!(root, third);
    assert!(blocks.contains(&third));
    assert!(!blocks.contains(&second));
}

#[test]
fn commit_path_rejects_foreign_bounds() {
    let (_dir, path) = common::create_temp_db_file("bounds.db");
    let mut store = storage(&path);
    let alice = Did::new("did:example:alice");
    let bob = Did::new("did:example:bob");

    let alice_head = write(&mut store, &alice, vec![]);
    let bob_head = write(&mut store, &bob, vec![]);

    assert!(matches!(
        store.get_commit_path(&alice, &alice_head, Some(&bob_head)),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.get_commit_path(&alice, &bob_head, None),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.get_commit_path(&Did::new("did:example:nobody"), &alice_head, None),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn blocks_are_scoped_to_their_creator() {
    let (_dir, path) = common::create_temp_db_file("scope.db");
    let mut store = storage(&path);
    let alice = Did::new("did:example:alice");
    let bob = Did::new("did:example:bob");

    let bytes = b"shared bytes".to_vec();
    let cid = Cid::for_bytes(&bytes);
    let rev = Rev::now();
    store.put_block(&alice, &cid, &bytes, &rev).unwrap();

    assert!(store.has_saved_block(&alice, &cid).unwrap());
    assert!(!store.has_saved_block(&bob, &cid).unwrap());
    assert_eq!(store.get_saved_bytes(&bob, &cid).unwrap(), None);

    store.put_block(&bob, &cid, &bytes, &rev).unwrap();
    store.destroy_repo(&alice).unwrap();
    assert_eq!(store.get_saved_bytes(&bob, &cid).unwrap(), Some(bytes));
    assert_eq!(store.get_saved_bytes(&alice, &cid).unwrap(), None);
}

#[test]
fn second_process_sees_committed_head() {
    let (_dir, path) = common::create_temp_db_file("visibility.db");
    let did = Did::new("did:example:alice");
    let head = write(&mut storage(&path), &did, vec![]);

    let reader = common::open_read_only(&path);
    let stored: String = reader
        .query_row("SELECT cid FROM repo_root WHERE did = ?", [did.as_str()], |row| row.get(0))
        .unwrap();
    assert_eq!(stored, head.to_string());

    let other = storage(&path);
    assert_eq!(other.get_head(&did, false).unwrap(), Some(head));
    let roots = other.list_repos().unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].did, did);
}
