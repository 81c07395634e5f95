//! # LRU Replacer
//!
//! Victim policy over the buffer pool's currently-unpinned frames. The
//! replacer tracks frame indexes only; the pool decides when a frame
//! becomes eligible (`unpin`, pin count reached zero) or ineligible
//! (`pin`, first reference taken).
//!
//! The ordering store is an unbounded `lru::LruCache<usize, ()>` whose
//! operations map one-to-one onto the policy:
//!
//! | policy            | cache call  |
//! |-------------------|-------------|
//! | make eligible     | `put`       |
//! | make ineligible   | `pop`       |
//! | pick victim (LRU) | `pop_lru`   |
//!
//! The replacer has no lock of its own; it lives inside the buffer pool's
//! metadata mutex and inherits its serialization.

use lru::LruCache;

pub struct LruReplacer {
    frames: LruCache<usize, ()>,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self {
            frames: LruCache::unbounded(),
        }
    }

    /// Pops the least-recently-unpinned frame, if any frame is eligible.
    pub fn victim(&mut self) -> Option<usize> {
        self.frames.pop_lru().map(|(frame_id, ())| frame_id)
    }

    /// Removes a frame from the eligible set. A no-op if it is not there.
    pub fn pin(&mut self, frame_id: usize) {
        self.frames.pop(&frame_id);
    }

    /// Marks a frame eligible, as the most recently unpinned.
    pub fn unpin(&mut self, frame_id: usize) {
        self.frames.put(frame_id, ());
    }

    /// Number of frames currently eligible for eviction.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for LruReplacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victim_is_least_recently_unpinned() {
        let mut r = LruReplacer::new();
        r.unpin(1);
        r.unpin(2);
        r.unpin(3);

        assert_eq!(r.victim(), Some(1));
        assert_eq!(r.victim(), Some(2));
        assert_eq!(r.victim(), Some(3));
        assert_eq!(r.victim(), None);
    }

    #[test]
    fn re_unpin_moves_to_back() {
        let mut r = LruReplacer::new();
        r.unpin(1);
        r.unpin(2);
        r.unpin(1);

        assert_eq!(r.victim(), Some(2));
        assert_eq!(r.victim(), Some(1));
    }

    #[test]
    fn pin_removes_from_eligible_set() {
        let mut r = LruReplacer::new();
        r.unpin(1);
        r.unpin(2);
        r.pin(1);

        assert_eq!(r.len(), 1);
        assert_eq!(r.victim(), Some(2));
        assert_eq!(r.victim(), None);
    }

    #[test]
    fn pin_absent_frame_is_noop() {
        let mut r = LruReplacer::new();
        r.pin(9);
        assert!(r.is_empty());
    }
}
