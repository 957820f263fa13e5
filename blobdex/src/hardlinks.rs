//! Restore-time table of files that were already written.
//!
//! When several restored files share a (device, inode) pair, only the
//! first is written out; the rest become hard links to its path.
use dashmap::DashMap;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct HardlinkKey {
    device: u64,
    inode: u64,
}

/// Concurrent (device, inode) -> `T` map. Never persisted.
pub struct HardlinkIndex<T = PathBuf> {
    index: DashMap<HardlinkKey, T>,
}

impl<T> Default for HardlinkIndex<T> {
    fn default() -> Self {
        HardlinkIndex {
            index: DashMap::new(),
        }
    }
}

impl<T> HardlinkIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `value` for the pair, replacing any previous one.
    pub fn add(&self, device: u64, inode: u64, value: T) {
        self.index.insert(HardlinkKey { device, inode }, value);
    }

    pub fn has(&self, device: u64, inode: u64) -> bool {
        self.index.contains_key(&HardlinkKey { device, inode })
    }

    pub fn remove(&self, device: u64, inode: u64) -> Option<T> {
        self.index
            .remove(&HardlinkKey { device, inode })
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl<T: Clone> HardlinkIndex<T> {
    pub fn get_filename(&self, device: u64, inode: u64) -> Option<T> {
        self.index
            .get(&HardlinkKey { device, inode })
            .map(|value| value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_get_remove() {
        let index = HardlinkIndex::<&str>::new();

        index.add(1, 2, "inode1");
        index.add(2, 3, "inode2");
        index.add(3, 4, "inode3");
        index.add(4, 5, "inode4");

        assert!(index.has(1, 2));
        assert!(index.has(2, 3));
        assert!(!index.has(1, 3));
        assert_eq!(index.get_filename(1, 2), Some("inode1"));
        assert_eq!(index.get_filename(2, 3), Some("inode2"));
        assert_eq!(index.get_filename(5, 5), None);

        index.remove(1, 2);
        assert!(!index.has(1, 2));
        assert_eq!(index.get_filename(1, 2), None);
        assert_eq!(index.len(), 3);

        // adding again overwrites
        index.add(2, 3, "moved");
        assert_eq!(index.get_filename(2, 3), Some("moved"));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn shared_between_threads() {
        let index = Arc::new(HardlinkIndex::new());

        let workers: Vec<_> = (0..4u64)
            .map(|worker| {
                let index = index.clone();
                std::thread::spawn(move || {
                    for inode in 0..100 {
                        index.add(worker, inode, PathBuf::from(format!("{worker}/{inode}")));
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(index.len(), 400);
        assert_eq!(
            index.get_filename(3, 42),
            Some(PathBuf::from("3/42"))
        );
    }
}
