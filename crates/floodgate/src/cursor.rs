// Server-side cursors. A find whose result exceeds the first batch parks
// the remainder here; getMore drains it in batches. The manager enforces
// a population cap (admission evicts the oldest cursor), idle-timeout
// eviction via a periodic sweep, and connection-close cleanup.

use bson::Document;
use indexmap::IndexMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct Cursor {
    pub id: u64,
    pub namespace: String,
    buffer: VecDeque<Document>,
    pub documents_sent: usize,
    pub is_exhausted: bool,
    pub is_closed: bool,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub connection_id: u64,
}

impl Cursor {
    fn next_batch(&mut self, size: usize) -> Vec<Document> {
        if self.is_closed || self.is_exhausted {
            return Vec::new();
        }
        let size = size.max(1);
        let batch: Vec<Document> = (0..size).filter_map(|_| self.buffer.pop_front()).collect();
        self.documents_sent += batch.len();
        self.last_accessed = Instant::now();
        // Exhaustion is discovered on the pull that finds nothing: a batch
        // that exactly drains the buffer still reports a live cursor, and
        // the client's next getMore sees the empty batch with id zero.
        if batch.is_empty() {
            self.is_exhausted = true;
        }
        batch
    }
}

/// A batch handed back to the session, with the id to report: zero once
/// the cursor has nothing more to deliver.
pub struct Batch {
    pub documents: Vec<Document>,
    pub cursor_id: u64,
}

pub struct CursorManager {
    cursors: Mutex<IndexMap<u64, Cursor>>,
    max_cursors: usize,
    timeout: Duration,
    last_sweep: Mutex<Instant>,
}

impl CursorManager {
    pub fn new(max_cursors: usize, timeout: Duration) -> Self {
        Self {
            cursors: Mutex::new(IndexMap::new()),
            max_cursors: max_cursors.max(1),
            timeout,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Park `remainder` under a fresh non-zero cursor id. Admission over
    /// the population cap evicts the oldest open cursor.
    pub fn create(
        &self,
        namespace: String,
        remainder: Vec<Document>,
        connection_id: u64,
    ) -> u64 {
        let mut cursors = self.cursors.lock().unwrap();
        while cursors.len() >= self.max_cursors {
            if let Some((id, _)) = cursors.shift_remove_index(0) {
                tracing::debug!(cursor = id, "evicted oldest cursor under population pressure");
            }
        }

        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u64 = rng.gen();
            if candidate != 0 && !cursors.contains_key(&candidate) {
                break candidate;
            }
        };
        let now = Instant::now();
        cursors.insert(
            id,
            Cursor {
                id,
                namespace,
                buffer: remainder.into(),
                documents_sent: 0,
                is_exhausted: false,
                is_closed: false,
                created_at: now,
                last_accessed: now,
                connection_id,
            },
        );
        id
    }

    /// Pull the next batch. `None` means the cursor is unknown (or timed
    /// out, which is the same thing to the client).
    pub fn next_batch(&self, id: u64, size: usize) -> Option<Batch> {
        self.maybe_sweep();
        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors.get_mut(&id)?;
        if cursor.is_closed {
            return None;
        }
        let documents = cursor.next_batch(size);
        let finished = cursor.is_exhausted;
        if finished {
            cursors.shift_remove(&id);
        }
        Some(Batch {
            documents,
            cursor_id: if finished { 0 } else { id },
        })
    }

    /// Kill cursors synchronously; returns (killed, not found).
    pub fn kill(&self, ids: &[u64]) -> (Vec<u64>, Vec<u64>) {
        let mut cursors = self.cursors.lock().unwrap();
        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in ids {
            match cursors.shift_remove(id) {
                Some(mut cursor) => {
                    cursor.is_closed = true;
                    killed.push(*id);
                }
                None => not_found.push(*id),
            }
        }
        (killed, not_found)
    }

    /// Closing a connection closes every cursor it owns.
    pub fn close_connection(&self, connection_id: u64) {
        let mut cursors = self.cursors.lock().unwrap();
        cursors.retain(|_, cursor| cursor.connection_id != connection_id);
    }

    pub fn len(&self) -> usize {
        self.cursors.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict idle cursors. Runs at most once per minute no matter how
    /// often it is called; the server also ticks it from a timer.
    pub fn maybe_sweep(&self) {
        {
            let mut last = self.last_sweep.lock().unwrap();
            if last.elapsed() < Duration::from_secs(60) {
                return;
            }
            *last = Instant::now();
        }
        self.sweep();
    }

    pub fn sweep(&self) {
        let timeout = self.timeout;
        let mut cursors = self.cursors.lock().unwrap();
        let before = cursors.len();
        cursors.retain(|_, cursor| cursor.last_accessed.elapsed() < timeout);
        let evicted = before - cursors.len();
        if evicted > 0 {
            tracing::info!(evicted, "closed idle cursors");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    fn docs(n: usize) -> Vec<Document> {
        (0..n).map(|i| doc! { "i": i as i64 }).collect()
    }

    #[test]
    fn batches_conserve_documents() {
        let manager = CursorManager::new(10, Duration::from_secs(600));
        let id = manager.create("db.c".into(), docs(187), 1);
        assert_ne!(id, 0);

        let mut seen = 0;
        let mut sizes = Vec::new();
        let mut id_now = id;
        while id_now != 0 {
            let batch = manager.next_batch(id_now, 50).unwrap();
            seen += batch.documents.len();
            sizes.push(batch.documents.len());
            id_now = batch.cursor_id;
        }
        assert_eq!(seen, 187);
        // The final pull finds nothing and reports exhaustion with id 0.
        assert_eq!(sizes, vec![50, 50, 50, 37, 0]);
        // The cursor is gone once exhausted.
        assert!(manager.next_batch(id, 50).is_none());
    }

    #[test]
    fn kill_and_unknown_ids() {
        let manager = CursorManager::new(10, Duration::from_secs(600));
        let id = manager.create("db.c".into(), docs(10), 1);

        let (killed, not_found) = manager.kill(&[id, 9999]);
        assert_eq!(killed, vec![id]);
        assert_eq!(not_found, vec![9999]);
        assert!(manager.next_batch(id, 10).is_none());
    }

    #[test]
    fn population_cap_evicts_oldest() {
        let manager = CursorManager::new(3, Duration::from_secs(600));
        let first = manager.create("db.c".into(), docs(5), 1);
        for _ in 0..3 {
            manager.create("db.c".into(), docs(5), 1);
        }
        assert_eq!(manager.len(), 3);
        assert!(manager.next_batch(first, 1).is_none());
    }

    #[test]
    fn connection_close_reaps_owned_cursors() {
        let manager = CursorManager::new(10, Duration::from_secs(600));
        let mine = manager.create("db.c".into(), docs(5), 7);
        let other = manager.create("db.c".into(), docs(5), 8);

        manager.close_connection(7);
        assert!(manager.next_batch(mine, 1).is_none());
        assert!(manager.next_batch(other, 1).is_some());
    }

    #[test]
    fn sweep_evicts_idle_cursors() {
        let manager = CursorManager::new(10, Duration::from_millis(0));
        manager.create("db.c".into(), docs(5), 1);
        manager.sweep();
        assert!(manager.is_empty());
    }
}
