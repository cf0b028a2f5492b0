use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::pipeline::{Asset, Transform};

/// A stored transformation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: Utf8PathBuf,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
    path: String,
}

/// Hit and miss counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

/// Cross-run cache for expensive transforms.
///
/// Entries are keyed by the input file (path and contents) together with the
/// transform's name and parameters, so changing an option never reuses a
/// stale result. Entries live in memory for the lifetime of the process and,
/// for a persistent cache, also on disk as `<hash>` plus `<hash>.meta.cbor`.
/// Nothing is evicted except by [`Cache::clear`].
#[derive(Debug, Default)]
pub struct Cache {
    dir: Option<Utf8PathBuf>,
    entries: RwLock<HashMap<Hash32, Arc<Entry>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Cache {
    /// A cache that forgets everything when the process exits.
    pub fn memory() -> Self {
        Self::default()
    }

    /// A cache that also persists entries under `dir`.
    pub fn persistent(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Cache key for running `transform` over `asset`.
    pub fn key(transform: &dyn Transform, asset: &Asset) -> Hash32 {
        let params = transform.params();
        let content = Hash32::hash(&asset.data).to_hex();

        Hash32::hash_fields([
            transform.name().as_bytes(),
            params.as_bytes(),
            asset.path.as_str().as_bytes(),
            content.as_bytes(),
        ])
    }

    pub fn get(&self, key: Hash32) -> Option<Arc<Entry>> {
        if let Some(entry) = self.entries.read().unwrap().get(&key) {
            return Some(entry.clone());
        }

        let dir = self.dir.as_ref()?;
        let entry = Arc::new(read_entry(dir, key)?);

        self.entries.write().unwrap().insert(key, entry.clone());
        Some(entry)
    }

    pub fn put(&self, key: Hash32, entry: Entry) {
        if let Some(dir) = &self.dir
            && let Err(e) = write_entry(dir, key, &entry)
        {
            tracing::warn!("couldn't persist cache entry {}: {e}", key.to_hex());
        }

        self.entries.write().unwrap().insert(key, Arc::new(entry));
    }

    /// Runs `transform` over `asset`, reusing a stored result when the same
    /// input was already processed with the same parameters.
    pub fn apply(&self, transform: &dyn Transform, asset: Asset) -> anyhow::Result<Asset> {
        let key = Self::key(transform, &asset);

        if let Some(entry) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(file = %asset.path, "cache hit");

            return Ok(Asset {
                path: entry.path.clone(),
                origin: asset.origin,
                data: entry.data.clone(),
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let output = transform.apply(asset)?;

        self.put(
            key,
            Entry {
                path: output.path.clone(),
                data: output.data.clone(),
            },
        );

        Ok(output)
    }

    /// Drops every entry, in memory and on disk.
    pub fn clear(&self) -> std::io::Result<()> {
        self.entries.write().unwrap().clear();

        if let Some(dir) = &self.dir
            && dir.exists()
        {
            fs::remove_dir_all(dir)?;
        }

        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn read_entry(dir: &Utf8Path, key: Hash32) -> Option<Entry> {
    let hex = key.to_hex();
    let path_data = dir.join(&hex);
    let path_meta = dir.join(format!("{hex}.meta.cbor"));

    let meta = File::open(&path_meta).ok()?;
    let meta: EntryMetadata = ciborium::from_reader(BufReader::new(meta)).ok()?;
    let data = fs::read(&path_data).ok()?;

    Some(Entry {
        path: meta.path.into(),
        data,
    })
}

fn write_entry(dir: &Utf8Path, key: Hash32, entry: &Entry) -> std::io::Result<()> {
    let hex = key.to_hex();
    fs::create_dir_all(dir)?;

    // data first, so a reader that finds the metadata always finds the data
    fs::write(dir.join(&hex), &entry.data)?;

    let meta = EntryMetadata {
        path: entry.path.to_string(),
    };
    let file = File::create(dir.join(format!("{hex}.meta.cbor")))?;
    ciborium::into_writer(&meta, file).map_err(std::io::Error::other)?;

    Ok(())
}
