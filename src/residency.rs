//! LRU bookkeeping of which pages currently hold a materialized payload.

use lru::LruCache;

/// Resident page numbers ordered by last use. Not synchronized: it lives
/// inside the cache state lock.
pub(crate) struct Residency {
    order: LruCache<usize, ()>,
}

impl Residency {
    pub fn new() -> Self {
        Self {
            order: LruCache::unbounded(),
        }
    }

    /// Record `num` as resident and most recently used.
    pub fn insert(&mut self, num: usize) {
        self.order.put(num, ());
    }

    /// Mark `num` as used, if it is resident.
    pub fn touch(&mut self, num: usize) {
        self.order.promote(&num);
    }

    pub fn remove(&mut self, num: usize) {
        self.order.pop(&num);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }

    /// Least recently used page for which `keep` is false.
    pub fn victim<F>(&self, keep: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        self.order.iter().rev().map(|(num, _)| *num).find(|num| !keep(*num))
    }

    /// Resident pages in ascending order.
    pub fn pages(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.order.iter().map(|(num, _)| *num).collect();
        pages.sort_unstable();
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_is_least_recent() {
        let mut res = Residency::new();
        res.insert(1);
        res.insert(2);
        res.insert(3);
        assert_eq!(res.victim(|_| false), Some(1));

        res.touch(1);
        assert_eq!(res.victim(|_| false), Some(2));
    }

    #[test]
    fn test_victim_skips_kept_pages() {
        let mut res = Residency::new();
        for num in 1..=4 {
            res.insert(num);
        }
        assert_eq!(res.victim(|n| n <= 2), Some(3));
        assert_eq!(res.victim(|_| true), None);
    }

    #[test]
    fn test_touch_missing_page_is_noop() {
        let mut res = Residency::new();
        res.touch(7);
        assert_eq!(res.len(), 0);

        res.insert(5);
        res.insert(2);
        res.remove(5);
        assert_eq!(res.pages(), vec![2]);
        res.clear();
        assert!(res.pages().is_empty());
    }
}
