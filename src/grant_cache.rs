//! Per-frontend bounded LRU of grant reference → mapped page.
//!
//! Modeled as a slab of nodes plus an index from gref to slab handle, per the
//! "(b) slab/arena ... referenced by integer handles" option: promotion is
//! pure link surgery on `prev`/`next` fields, never a copy of the mapped
//! pointer or a re-walk of a generic list type. Grounded in
//! `BlkCmdRingBuffer`'s `std::list<GntPage> + unordered_map<grant_ref_t,
//! iterator>` pairing from the original source, reshaped into safe Rust as
//! an arena instead of raw list iterators.

use std::collections::HashMap;

use crate::gnttab::GrantMap;

pub const MAX_PGRANTS_PER_FRONTEND: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("grant map failed for gref {gref}")]
    MapFailed { gref: u32 },
    #[error("grant unmap failed for gref {gref}")]
    UnmapFailed { gref: u32 },
}

const NIL: usize = usize::MAX;

struct Node {
    gref: u32,
    page: *mut u8,
    prev: usize,
    next: usize,
}

/// A bounded LRU cache of mapped grant pages, generic over the grant-mapping
/// collaborator so the cache logic never touches `/dev/xen/gntdev` directly.
pub struct GrantCache<M: GrantMap> {
    map: M,
    capacity: usize,
    eviction_size: usize,
    nodes: Vec<Node>,
    free: Vec<usize>,
    index: HashMap<u32, usize>,
    head: usize,
    tail: usize,
}

fn default_eviction_size(capacity: usize) -> usize {
    ((capacity as f64) * 0.05).ceil() as usize
}

impl<M: GrantMap> GrantCache<M> {
    pub fn new(map: M) -> GrantCache<M> {
        GrantCache::with_capacity(map, MAX_PGRANTS_PER_FRONTEND)
    }

    pub fn with_capacity(map: M, capacity: usize) -> GrantCache<M> {
        GrantCache {
            map,
            capacity,
            eviction_size: default_eviction_size(capacity).max(1),
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn unlink(&mut self, handle: usize) {
        let (prev, next) = (self.nodes[handle].prev, self.nodes[handle].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, handle: usize) {
        self.nodes[handle].prev = NIL;
        self.nodes[handle].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = handle;
        }
        self.head = handle;
        if self.tail == NIL {
            self.tail = handle;
        }
    }

    fn move_to_front(&mut self, handle: usize) {
        if self.head == handle {
            return;
        }
        self.unlink(handle);
        self.push_front(handle);
    }

    /// Resolve `gref` to a mapped page, mapping it on first use. Promotes the
    /// entry to most-recently-used before any mapping call that could
    /// trigger eviction, so the request in progress can never be evicted by
    /// its own cache miss.
    pub fn get_or_map(&mut self, gref: u32) -> Result<*mut u8, Error> {
        if let Some(&handle) = self.index.get(&gref) {
            self.move_to_front(handle);
            return Ok(self.nodes[handle].page);
        }

        if self.index.len() >= self.capacity {
            self.evict_batch();
        }

        let page = self
            .map
            .map(gref)
            .map_err(|_| Error::MapFailed { gref })?;

        let handle = if let Some(h) = self.free.pop() {
            self.nodes[h] = Node {
                gref,
                page,
                prev: NIL,
                next: NIL,
            };
            h
        } else {
            self.nodes.push(Node {
                gref,
                page,
                prev: NIL,
                next: NIL,
            });
            self.nodes.len() - 1
        };

        self.push_front(handle);
        self.index.insert(gref, handle);
        Ok(page)
    }

    /// Map a gref directly through the underlying collaborator, bypassing
    /// the LRU index entirely. Used for pages that must never be evicted
    /// while still resident (the ring's own control page), which are
    /// mapped and unmapped outside the recency list.
    pub fn map_untracked(&mut self, gref: u32) -> Result<*mut u8, Error> {
        self.map.map(gref).map_err(|_| Error::MapFailed { gref })
    }

    /// Unmap a page obtained from `map_untracked`. Does not touch the index
    /// or recency list.
    pub fn unmap_untracked(&mut self, gref: u32, page: *mut u8) -> Result<(), Error> {
        self.map
            .unmap(gref, page)
            .map_err(|_| Error::UnmapFailed { gref })
    }

    /// Evict from the tail until the cache is below `capacity - eviction_size`.
    pub fn evict_batch(&mut self) {
        let target = self.capacity.saturating_sub(self.eviction_size);
        while self.index.len() > target {
            let handle = self.tail;
            if handle == NIL {
                break;
            }
            self.unlink(handle);
            let gref = self.nodes[handle].gref;
            let page = self.nodes[handle].page;
            self.index.remove(&gref);
            self.free.push(handle);
            if let Err(e) = self.map.unmap(gref, page) {
                log::warn!("unmap failed for gref {gref} during eviction: {e}");
            }
        }
    }
}

impl<M: GrantMap> Drop for GrantCache<M> {
    fn drop(&mut self) {
        for (&gref, &handle) in self.index.iter() {
            let page = self.nodes[handle].page;
            if let Err(e) = self.map.unmap(gref, page) {
                log::warn!("unmap failed for gref {gref} during teardown: {e}");
            }
        }
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnttab::tests::FakeGrantMap;

    #[test]
    fn hit_promotes_without_remapping() {
        let mut cache = GrantCache::with_capacity(FakeGrantMap::new(), 4);
        let p1 = cache.get_or_map(1).unwrap();
        let p1_again = cache.get_or_map(1).unwrap();
        assert_eq!(p1, p1_again);
        assert_eq!(cache.map.map_calls(), 1);
    }

    #[test]
    fn eviction_keeps_cache_under_capacity() {
        let mut cache = GrantCache::with_capacity(FakeGrantMap::new(), 10);
        for gref in 1..=10u32 {
            cache.get_or_map(gref).unwrap();
        }
        assert_eq!(cache.len(), 10);

        // One more distinct gref must trigger eviction before mapping.
        cache.get_or_map(11).unwrap();
        assert!(cache.len() <= 10);
        assert!(cache.len() < 10 + 1);
    }

    #[test]
    fn index_and_list_stay_in_lockstep() {
        let mut cache = GrantCache::with_capacity(FakeGrantMap::new(), 20);
        for gref in 1..=2000u32 {
            cache.get_or_map(gref % 50 + 1).unwrap();
            assert!(cache.len() <= 20);
            let mut seen = std::collections::HashSet::new();
            let mut cur = cache.head;
            let mut count = 0;
            while cur != NIL {
                assert!(seen.insert(cache.nodes[cur].gref), "duplicate gref in list");
                cur = cache.nodes[cur].next;
                count += 1;
            }
            assert_eq!(count, cache.index.len());
        }
    }

    #[test]
    fn drop_unmaps_all_resident_entries() {
        let map = FakeGrantMap::new();
        let unmap_calls = map.unmap_calls_handle();
        {
            let mut cache = GrantCache::with_capacity(map, 10);
            for gref in 1..=5u32 {
                cache.get_or_map(gref).unwrap();
            }
        }
        assert_eq!(unmap_calls.get(), 5);
    }
}
