//! Size-bucketed reuse cache and timed mmap cache.
//!
//! Ported from the bucket-ladder algorithm in the upstream `tegra_bo_cache`
//! implementation: a handful of small fixed sizes, then powers of two with
//! optional quarter-step refinements, each holding a free list of recently
//! released buffer handles. The free-list shape (a `VecDeque` per bucket,
//! pushed/popped from opposite ends) follows the same pattern as this
//! crate's own lease-style pooling predecessor.

use std::collections::VecDeque;

/// How long (in seconds) a reuse-cache entry may sit unclaimed before
/// `cache_cleanup` truly frees it.
const BO_CACHE_RETENTION_SECONDS: u64 = 1;

/// How long (in seconds) an mmap-cache entry may sit unclaimed before
/// `mmap_cleanup` unmaps it.
const MMAP_CACHE_RETENTION_SECONDS: u64 = 3;

#[derive(Debug)]
struct Bucket {
    size: u64,
    free: VecDeque<u32>,
}

/// Size-bucketed free list of recently released, reuse-eligible BOs.
#[derive(Debug)]
pub(crate) struct ReuseCache {
    buckets: Vec<Bucket>,
    last_cleanup: Option<u64>,
}

impl ReuseCache {
    /// Builds the bucket ladder: 4 KiB, 8 KiB, 12 KiB (skipped when
    /// `coarse`), then powers of two from 16 KiB to 64 MiB, each with
    /// +1/4, +1/2, +3/4 refinements (also skipped when `coarse`).
    pub fn new(coarse: bool) -> Self {
        let mut buckets = Vec::new();
        let mut add_bucket = |size: u64| {
            buckets.push(Bucket {
                size,
                free: VecDeque::new(),
            });
        };

        add_bucket(4 * 1024);
        add_bucket(8 * 1024);

        if !coarse {
            add_bucket(12 * 1024);
        }

        let mut size: u64 = 16 * 1024;
        while size <= 64 * 1024 * 1024 {
            add_bucket(size);

            if !coarse {
                add_bucket(size + size / 4);
                add_bucket(size + size / 2);
                add_bucket(size + size * 3 / 4);
            }

            size *= 2;
        }

        Self {
            buckets,
            last_cleanup: None,
        }
    }

    /// Finds the first bucket whose size is `>= size`, returning its index
    /// and threshold. Buckets are constructed in ascending order so this is
    /// a first-fit linear scan, matching the source's `get_bucket`.
    fn bucket_for(&self, size: u64) -> Option<(usize, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .find(|(_, bucket)| bucket.size >= size)
            .map(|(idx, bucket)| (idx, bucket.size))
    }

    /// Rounds `size` up to the nearest bucket, returning `(handle, size)` of
    /// a reusable entry if one is idle at the head of that bucket's free
    /// list, or `None` (along with the bucket's nominal size) on a miss.
    ///
    /// The `is_idle` callback stands in for probing whether the BO's last
    /// associated fence, if any, has signaled; the source treats this as a
    /// placeholder returning `true` unconditionally (see design note on the
    /// reuse-bucket idle check), which this crate also does by default.
    pub fn alloc(
        &mut self,
        size: u64,
        mut is_idle: impl FnMut(u32) -> bool,
    ) -> (Option<u32>, u64) {
        let rounded = round_up(size, 4096);

        let Some((idx, bucket_size)) = self.bucket_for(rounded) else {
            return (None, rounded);
        };

        let bucket = &mut self.buckets[idx];
        let handle = match bucket.free.front().copied() {
            Some(handle) if is_idle(handle) => bucket.free.pop_front(),
            _ => None,
        };

        (handle, bucket_size)
    }

    /// Stamps `free_time = now` on the caller (done by [`Device`] before
    /// calling this) and appends `handle` to the tail of the bucket sized
    /// for `size`. Returns `false` if `size` exceeds every bucket, in which
    /// case the caller must truly free the BO instead.
    ///
    /// [`Device`]: super::device::Device
    pub fn free(&mut self, handle: u32, size: u64) -> bool {
        match self.bucket_for(size) {
            Some((idx, _)) => {
                self.buckets[idx].free.push_back(handle);
                true
            }
            None => false,
        }
    }

    /// Sweeps every bucket from the head, evicting (and returning for real
    /// freeing) entries whose `free_time` is more than
    /// [`BO_CACHE_RETENTION_SECONDS`] old, stopping at the first entry that
    /// is still within the retention window. A no-op when called twice
    /// within the same second, matching the source's idempotence check.
    pub fn cleanup(&mut self, now: u64, free_time_of: impl Fn(u32) -> u64) -> Vec<u32> {
        if self.last_cleanup == Some(now) {
            return Vec::new();
        }

        self.last_cleanup = Some(now);

        let mut evicted = Vec::new();

        for bucket in &mut self.buckets {
            while let Some(&handle) = bucket.free.front() {
                let age = now.saturating_sub(free_time_of(handle));

                if now != 0 && age <= BO_CACHE_RETENTION_SECONDS {
                    break;
                }

                bucket.free.pop_front();
                evicted.push(handle);
            }
        }

        evicted
    }

    /// Removes `handle` from whichever bucket currently holds it, if any.
    /// Used when a cached BO is claimed directly by handle (e.g. by
    /// `from_name` reclaiming an entry that was about to be recycled).
    pub fn remove(&mut self, handle: u32) {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.free.iter().position(|&h| h == handle) {
                bucket.free.remove(pos);
                break;
            }
        }
    }
}

/// Timed cache of BO mappings pending unmap.
#[derive(Debug, Default)]
pub(crate) struct MmapCache {
    pending: VecDeque<u32>,
    last_cleanup: Option<u64>,
}

impl MmapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handle` to the pending-unmap list; the caller is
    /// responsible for stamping `unmap_time` and stashing `map_cached`
    /// before calling this.
    pub fn push(&mut self, handle: u32) {
        self.pending.push_back(handle);
    }

    /// Splices `handle` out of the pending list if present, signalling the
    /// caller may reuse its still-live mapping instead of re-`mmap`ing.
    pub fn take(&mut self, handle: u32) -> bool {
        if let Some(pos) = self.pending.iter().position(|&h| h == handle) {
            self.pending.remove(pos);
            true
        } else {
            false
        }
    }

    /// Sweeps from the head, evicting entries older than
    /// [`MMAP_CACHE_RETENTION_SECONDS`]; the caller must `munmap` each
    /// returned handle's cached mapping.
    pub fn cleanup(&mut self, now: u64, unmap_time_of: impl Fn(u32) -> u64) -> Vec<u32> {
        if self.last_cleanup == Some(now) {
            return Vec::new();
        }

        self.last_cleanup = Some(now);

        let mut evicted = Vec::new();

        while let Some(&handle) = self.pending.front() {
            let age = now.saturating_sub(unmap_time_of(handle));

            if now != 0 && age <= MMAP_CACHE_RETENTION_SECONDS {
                break;
            }

            self.pending.pop_front();
            evicted.push(handle);
        }

        evicted
    }

    /// Drains every pending entry unconditionally, for use at device close.
    pub fn drain_all(&mut self) -> Vec<u32> {
        self.pending.drain(..).collect()
    }
}

fn round_up(size: u64, align: u64) -> u64 {
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_ladder_includes_fine_steps() {
        let cache = ReuseCache::new(false);
        let sizes: Vec<u64> = cache.buckets.iter().map(|b| b.size).collect();

        assert_eq!(sizes[0], 4096);
        assert_eq!(sizes[1], 8192);
        assert_eq!(sizes[2], 12288);
        assert_eq!(sizes[3], 16384);
        assert_eq!(sizes[4], 16384 + 16384 / 4);
        assert!(sizes.contains(&(64 * 1024 * 1024)));
    }

    #[test]
    fn coarse_ladder_skips_refinements() {
        let cache = ReuseCache::new(true);
        let sizes: Vec<u64> = cache.buckets.iter().map(|b| b.size).collect();

        assert_eq!(sizes[0], 4096);
        assert_eq!(sizes[1], 8192);
        assert_eq!(sizes[2], 16384);
    }

    #[test]
    fn alloc_rounds_up_to_bucket_size() {
        let mut cache = ReuseCache::new(false);
        let (handle, size) = cache.alloc(5000, |_| true);

        assert!(handle.is_none());
        assert_eq!(size, 8192);
    }

    #[test]
    fn free_then_alloc_reuses_handle() {
        let mut cache = ReuseCache::new(false);
        assert!(cache.free(42, 5000));

        let (handle, size) = cache.alloc(5000, |_| true);
        assert_eq!(handle, Some(42));
        assert_eq!(size, 8192);
    }

    #[test]
    fn alloc_skips_non_idle_head() {
        let mut cache = ReuseCache::new(false);
        cache.free(7, 4096);

        let (handle, _) = cache.alloc(4096, |_| false);
        assert_eq!(handle, None);
    }

    #[test]
    fn cleanup_is_idempotent_within_a_second() {
        let mut cache = ReuseCache::new(false);
        cache.free(1, 4096);

        let evicted_first = cache.cleanup(10, |_| 5);
        assert_eq!(evicted_first, vec![1]);

        let evicted_second = cache.cleanup(10, |_| 5);
        assert!(evicted_second.is_empty());
    }

    #[test]
    fn mmap_cache_round_trip() {
        let mut cache = MmapCache::new();
        cache.push(3);
        assert!(cache.take(3));
        assert!(!cache.take(3));
    }
}
