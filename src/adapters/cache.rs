use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::DataPoint;

/// Response cache keyed by endpoint string, single-task scope.
///
/// A read returns the stored point iff it is younger than the TTL;
/// stale entries are evicted on read.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (DataPoint, Instant)>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<DataPoint> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((point, stored_at)) => {
                if stored_at.elapsed() < self.ttl {
                    Some(point.clone())
                } else {
                    entries.remove(key);
                    None
                }
            }
            None => None,
        }
    }

    pub async fn set(&self, key: &str, point: DataPoint) {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (point, Instant::now()));
    }
}
