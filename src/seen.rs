//! Time-bounded set of already-forwarded message digests.
//!
//! Digests are computed over the exact on-the-wire bytes, never a
//! re-serialised form, so every relay observing the same forwarded message
//! produces the same digest.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// How long an observed digest suppresses rebroadcast.
pub const SEEN_TTL: Duration = Duration::from_secs(30);

/// Upper bound on tracked digests. Oldest entries are evicted when at
/// capacity, bounding memory regardless of traffic volume.
const MAX_SEEN_ENTRIES: usize = 8_192;

type Digest = [u8; 32];

/// Seen-cache suppressing rebroadcast loops in the relay mesh.
pub struct SeenCache {
    ttl: Duration,
    entries: Mutex<LruCache<Digest, Instant>>,
}

impl SeenCache {
    pub fn new() -> Self {
        Self::with_ttl(SEEN_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(MAX_SEEN_ENTRIES).expect("capacity must be non-zero");
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Record the message bytes. Returns `true` if an unexpired entry was
    /// already present. An expired entry counts as absent and is
    /// refreshed.
    pub fn observe(&self, bytes: &[u8]) -> bool {
        let digest: Digest = *blake3::hash(bytes).as_bytes();
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("seen cache poisoned");
        if let Some(at) = entries.get(&digest) {
            if now.duration_since(*at) <= self.ttl {
                return true;
            }
        }
        entries.put(digest, now);
        false
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new()
    }
}
