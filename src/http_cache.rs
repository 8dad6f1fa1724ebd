use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const CACHE_VERSION: u32 = 1;
const CACHE_DIR: &str = "gridiron_sync";
const CACHE_FILE: &str = "http_cache.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct HttpCacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub body: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetched_at: u64,
}

/// Conditional-request cache keyed by URL. Historical schedule pages rarely
/// change, so a 304 costs one round trip and no parsing of a fresh body.
pub struct HttpCache {
    path: Option<PathBuf>,
    file: Mutex<Option<HttpCacheFile>>,
}

impl HttpCache {
    pub fn at_default_location() -> Self {
        Self {
            path: app_cache_dir().map(|dir| dir.join(CACHE_FILE)),
            file: Mutex::new(None),
        }
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            file: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(Some(HttpCacheFile::default())),
        }
    }

    pub fn lookup(&self, url: &str) -> Option<CacheEntry> {
        let mut guard = self.file.lock().ok()?;
        let cache = guard.get_or_insert_with(|| self.load());
        cache.entries.get(url).cloned()
    }

    pub fn store(&self, url: &str, body: &str, etag: Option<String>, last_modified: Option<String>) {
        if etag.is_none() && last_modified.is_none() {
            return;
        }
        let entry = CacheEntry {
            body: body.to_string(),
            etag,
            last_modified,
            fetched_at: system_time_to_secs(SystemTime::now()).unwrap_or_default(),
        };
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        let cache = guard.get_or_insert_with(|| self.load());
        cache.version = CACHE_VERSION;
        cache.entries.insert(url.to_string(), entry);
        if let Err(err) = self.save(cache) {
            debug!(error = %err, "http cache not persisted");
        }
    }

    fn load(&self) -> HttpCacheFile {
        let Some(path) = self.path.as_ref() else {
            return HttpCacheFile::default();
        };
        let Ok(raw) = fs::read_to_string(path) else {
            return HttpCacheFile::default();
        };
        let cache = serde_json::from_str::<HttpCacheFile>(&raw).unwrap_or_default();
        if cache.version != CACHE_VERSION {
            return HttpCacheFile::default();
        }
        cache
    }

    fn save(&self, cache: &HttpCacheFile) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let Some(dir) = path.parent() else {
            return Ok(());
        };
        fs::create_dir_all(dir).ok();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string(cache).context("serialize http cache")?;
        fs::write(&tmp, json).context("write http cache")?;
        fs::rename(&tmp, path).context("swap http cache")?;
        Ok(())
    }
}

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(CACHE_DIR));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR))
}

fn system_time_to_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::HttpCache;

    #[test]
    fn disabled_cache_keeps_entries_in_memory() {
        let cache = HttpCache::disabled();
        assert!(cache.lookup("https://x/1").is_none());
        cache.store("https://x/1", "{}", Some("\"abc\"".to_string()), None);
        let hit = cache.lookup("https://x/1").expect("entry stored");
        assert_eq!(hit.etag.as_deref(), Some("\"abc\""));
        assert_eq!(hit.body, "{}");
    }

    #[test]
    fn bodies_without_validators_are_not_cached() {
        let cache = HttpCache::disabled();
        cache.store("https://x/2", "{}", None, None);
        assert!(cache.lookup("https://x/2").is_none());
    }
}
