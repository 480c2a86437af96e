//! In-memory fixtures shared by the unit tests.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use zip::write::SimpleFileOptions;

use crate::error::{Result, UpdaterError};
use crate::fetcher::Fetcher;

/// Serves canned bodies keyed by URL. Unknown URLs fail like a 404.
#[derive(Default)]
pub struct MockFetcher {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    delay: Mutex<Option<Duration>>,
    requests: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, body: Vec<u8>) {
        self.entries.lock().insert(url.to_string(), body);
    }

    pub fn insert_json(&self, url: &str, value: serde_json::Value) {
        self.insert(url, serde_json::to_vec(&value).unwrap());
    }

    pub fn remove(&self, url: &str) {
        self.entries.lock().remove(url);
    }

    /// Hold every response for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch_bytes(&self, url: &Url, _timeout: Duration) -> Result<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.entries
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| UpdaterError::Fetch {
                url: url.to_string(),
                reason: "HTTP status client error (404 Not Found)".into(),
            })
    }
}

/// Build a zip archive from `(name, contents)` pairs. Names ending in `/` are
/// added as directories.
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, contents) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}
