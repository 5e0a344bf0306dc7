#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Value};

use repohost::{Database, Did, IdResolver, Result};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Like [`eventually`], for conditions that have to await.
pub async fn eventually_async<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn post(text: &str) -> Value {
    json!({ "$type": "app.bsky.feed.post", "text": text, "createdAt": "2024-01-01T00:00:00Z" })
}

pub fn like(subject_uri: &str) -> Value {
    json!({
        "$type": "app.bsky.feed.like",
        "subject": { "uri": subject_uri, "cid": "unused" },
        "createdAt": "2024-01-01T00:00:00Z"
    })
}

pub fn repost(subject_uri: &str) -> Value {
    json!({
        "$type": "app.bsky.feed.repost",
        "subject": { "uri": subject_uri, "cid": "unused" },
        "createdAt": "2024-01-01T00:00:00Z"
    })
}

pub fn follow(subject: &Did) -> Value {
    json!({
        "$type": "app.bsky.graph.follow",
        "subject": subject.as_str(),
        "createdAt": "2024-01-01T00:00:00Z"
    })
}

/// Resolver with settable answers.
#[derive(Default)]
pub struct MockResolver {
    handles: Mutex<HashMap<Did, String>>,
    hosted: Mutex<HashMap<Did, Option<bool>>>,
}

impl MockResolver {
    pub fn set_handle(&self, did: &Did, handle: &str) {
        self.handles.lock().unwrap().insert(did.clone(), handle.to_string());
    }

    pub fn clear_handle(&self, did: &Did) {
        self.handles.lock().unwrap().remove(did);
    }

    /// Unset accounts answer `Some(true)`.
    pub fn set_hosted(&self, did: &Did, hosted: Option<bool>) {
        self.hosted.lock().unwrap().insert(did.clone(), hosted);
    }
}

#[async_trait]
impl IdResolver for MockResolver {
    async fn resolve_handle(&self, did: &Did) -> Result<Option<String>> {
        Ok(self.handles.lock().unwrap().get(did).cloned())
    }

    async fn resolve_did(&self, handle: &str) -> Result<Option<Did>> {
        Ok(self
            .handles
            .lock()
            .unwrap()
            .iter()
            .find(|(_, h)| h.as_str() == handle)
            .map(|(did, _)| did.clone()))
    }

    async fn is_hosted(&self, did: &Did) -> Result<Option<bool>> {
        Ok(self.hosted.lock().unwrap().get(did).copied().unwrap_or(Some(true)))
    }
}
