//! Blocking queues shared by the buffer pool's producers and consumers.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

// ── BlockingQueue ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
}

/// Unbounded FIFO whose `get` blocks until an item arrives or the queue stops.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn put(&self, item: T) {
        let mut s = self.state.lock();
        s.items.push_back(item);
        self.cond.notify_one();
    }

    /// `None` once the queue has been stopped.
    pub fn get(&self) -> Option<T> {
        let mut s = self.state.lock();
        loop {
            if s.stopped {
                return None;
            }
            if let Some(item) = s.items.pop_front() {
                return Some(item);
            }
            self.cond.wait(&mut s);
        }
    }

    /// Never blocks. Still drains after stop so owners can reclaim items.
    pub fn try_get(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn stop(&self) {
        let mut s = self.state.lock();
        s.stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

// ── KeyedBlockingQueue ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot<T> {
    items: VecDeque<T>,
    waiters: usize,
    cond: Arc<Condvar>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            waiters: 0,
            cond: Arc::new(Condvar::new()),
        }
    }
}

#[derive(Debug)]
struct KeyedState<K, T> {
    slots: HashMap<K, Slot<T>>,
    stopped: bool,
}

/// Handoff queue where `get(key)` waits only for items carrying that key.
///
/// Each key owns its own wait slot, so a `put` wakes just the consumers of
/// that key and lookups never scan unrelated items.
#[derive(Debug)]
pub struct KeyedBlockingQueue<K, T> {
    state: Mutex<KeyedState<K, T>>,
}

impl<K: Eq + Hash + Clone, T> Default for KeyedBlockingQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, T> KeyedBlockingQueue<K, T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KeyedState {
                slots: HashMap::new(),
                stopped: false,
            }),
        }
    }

    pub fn put(&self, key: K, item: T) {
        let mut s = self.state.lock();
        let slot = s.slots.entry(key).or_default();
        slot.items.push_back(item);
        slot.cond.notify_one();
    }

    /// Block until an item with `key` exists. `None` once stopped.
    pub fn get(&self, key: &K) -> Option<T> {
        let mut s = self.state.lock();
        loop {
            if s.stopped {
                return None;
            }
            let slot = s.slots.entry(key.clone()).or_default();
            if let Some(item) = slot.items.pop_front() {
                if slot.items.is_empty() && slot.waiters == 0 {
                    s.slots.remove(key);
                }
                return Some(item);
            }
            slot.waiters += 1;
            let cond = slot.cond.clone();
            cond.wait(&mut s);
            if let Some(slot) = s.slots.get_mut(key) {
                slot.waiters -= 1;
            }
        }
    }

    /// Total items across all keys.
    pub fn len(&self) -> usize {
        self.state.lock().slots.values().map(|s| s.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop(&self) {
        let mut s = self.state.lock();
        s.stopped = true;
        for slot in s.slots.values() {
            slot.cond.notify_all();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q = BlockingQueue::new();
        q.put(1);
        q.put(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.get(), Some(1));
        assert_eq!(q.try_get(), Some(2));
        assert_eq!(q.try_get(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn get_blocks_until_put() {
        let q = Arc::new(BlockingQueue::new());
        let handle = {
            let q = q.clone();
            thread::spawn(move || q.get())
        };
        thread::sleep(Duration::from_millis(10));
        q.put("hello");
        assert_eq!(handle.join().unwrap(), Some("hello"));
    }

    #[test]
    fn stop_wakes_all_getters() {
        let q: Arc<BlockingQueue<u32>> = Arc::new(BlockingQueue::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || q.get())
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        q.stop();
        q.stop();
        for h in handles {
            assert_eq!(h.join().unwrap(), None);
        }
        assert!(q.is_stopped());
    }

    #[test]
    fn keyed_get_matches_key_only() {
        let q = Arc::new(KeyedBlockingQueue::new());
        let handle = {
            let q = q.clone();
            thread::spawn(move || q.get(&7u64))
        };
        q.put(3u64, "three");
        thread::sleep(Duration::from_millis(10));
        assert!(!handle.is_finished());

        q.put(7u64, "seven");
        assert_eq!(handle.join().unwrap(), Some("seven"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(&3), Some("three"));
        assert!(q.is_empty());
    }

    #[test]
    fn keyed_stop_releases_waiters() {
        let q: Arc<KeyedBlockingQueue<u64, u8>> = Arc::new(KeyedBlockingQueue::new());
        let handle = {
            let q = q.clone();
            thread::spawn(move || q.get(&1))
        };
        thread::sleep(Duration::from_millis(10));
        q.stop();
        assert_eq!(handle.join().unwrap(), None);
    }
}
