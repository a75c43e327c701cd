// Checksums computed for a layer that arrived before its claimed checksum.
// They wait here, keyed by image id, until the checksum call or expiry.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::checksum::LayerChecksums;

struct Pending {
    checksums: LayerChecksums,
    recorded: Instant,
}

pub struct PendingUploads {
    ttl: Duration,
    entries: Mutex<HashMap<String, Pending>>,
}

impl PendingUploads {
    pub fn new(ttl: Duration) -> PendingUploads {
        PendingUploads {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces whatever was recorded for `image_id`.
    pub fn record(&self, image_id: &str, checksums: LayerChecksums) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let ttl = self.ttl;
        entries.retain(|_, pending| now.duration_since(pending.recorded) < ttl);
        entries.insert(
            image_id.to_string(),
            Pending {
                checksums,
                recorded: now,
            },
        );
    }

    pub fn get(&self, image_id: &str) -> Option<LayerChecksums> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(image_id) {
            None => return None,
            Some(pending) => pending.recorded.elapsed() >= self.ttl,
        };
        if expired {
            entries.remove(image_id);
            return None;
        }
        entries.get(image_id).map(|pending| pending.checksums.clone())
    }

    pub fn clear(&self, image_id: &str) {
        self.entries.lock().remove(image_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sums(content: &str) -> LayerChecksums {
        LayerChecksums {
            content: content.to_string(),
            archive: None,
        }
    }

    #[test]
    fn record_get_clear() {
        let pending = PendingUploads::new(Duration::from_secs(60));
        assert!(pending.get("a").is_none());
        pending.record("a", sums("sha256:1"));
        pending.record("a", sums("sha256:2"));
        assert_eq!(pending.get("a").unwrap().content, "sha256:2");
        pending.clear("a");
        assert!(pending.get("a").is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn expired_records_are_gone() {
        let pending = PendingUploads::new(Duration::from_millis(0));
        pending.record("a", sums("sha256:1"));
        assert!(pending.get("a").is_none());

        let pending = PendingUploads::new(Duration::from_millis(20));
        pending.record("a", sums("sha256:1"));
        std::thread::sleep(Duration::from_millis(40));
        pending.record("b", sums("sha256:2"));
        assert_eq!(pending.len(), 1);
        assert!(pending.get("b").is_some());
    }
}
