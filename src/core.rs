use std::sync::Arc;

use crate::config::Settings;
use crate::engine::reload::{Hub, Reloader};
use crate::notifier::{Notifier, Terminal};
use crate::pipeline::Cache;

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// Keys the transformation cache and names its files on disk, so a change in
/// either the input bytes or the transform parameters yields a different
/// entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes a sequence of fields, each terminated so that `("ab", "c")`
    /// and `("a", "bc")` never collide.
    pub fn hash_fields<'a>(fields: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();

        for field in fields {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }

        hasher.finalize().into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Process-scoped state shared by every task.
///
/// Created once by the caller and handed to the [`Scheduler`](crate::Scheduler),
/// which passes it by reference to pipelines and actions. Each collaborator can
/// be substituted, e.g. a [`Recorder`](crate::notifier::Recorder) notifier or a
/// channel-backed [`Reloader`] in tests.
#[derive(Clone)]
pub struct Environment {
    /// Typed configuration.
    pub settings: Arc<Settings>,
    /// Failure and completion alerts.
    pub notifier: Arc<dyn Notifier>,
    /// Cross-run transformation cache.
    pub cache: Arc<Cache>,
    /// Live-reload signal sender.
    pub reload: Reloader,
    pub(crate) hub: Option<Arc<Hub>>,
}

impl Environment {
    /// Full environment: terminal alerts, persistent cache under
    /// `cache_dir`, and a live-reload hub ready to accept browsers.
    pub fn new(settings: Settings) -> Self {
        let (reload, signals) = Reloader::channel(settings.inject_changes);
        let hub = Hub::start(signals);
        let cache = Cache::persistent(settings.cache_dir.clone());

        Self {
            settings: Arc::new(settings),
            notifier: Arc::new(Terminal),
            cache: Arc::new(cache),
            reload,
            hub: Some(Arc::new(hub)),
        }
    }

    /// Environment without a live-reload hub and with an in-memory cache.
    pub fn offline(settings: Settings) -> Self {
        Self {
            reload: Reloader::disabled(),
            settings: Arc::new(settings),
            notifier: Arc::new(Terminal),
            cache: Arc::new(Cache::memory()),
            hub: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = cache;
        self
    }

    /// Starts accepting browsers on `reload_port`, or on any free port when it
    /// is taken. Returns `None` when this environment has no hub.
    pub fn start_live_reload(&self) -> std::io::Result<Option<u16>> {
        match &self.hub {
            Some(hub) => hub.listen(self.settings.reload_port).map(Some),
            None => Ok(None),
        }
    }

    /// Replaces the reload channel. The previous hub, if any, is detached.
    pub fn with_reloader(mut self, reload: Reloader) -> Self {
        self.reload = reload;
        self.hub = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_and_full_length() {
        let hex = Hash32::hash(b"nagare").to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fields_are_delimited() {
        let a = Hash32::hash_fields([b"ab".as_slice(), b"c".as_slice()]);
        let b = Hash32::hash_fields([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }
}
