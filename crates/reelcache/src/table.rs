//! Entry table: arena-backed storage with insertion chains
//!
//! Entries live in slots and chain links are slot indices, so a link can
//! never dangle into freed memory; slots are recycled through a free list.
//! Chain walks still validate back-pointers before trusting a link, because
//! a reused slot may hold an unrelated entry: a neighbor that no longer
//! points back means "detached", never an error.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

use crate::frame::FrameBuffer;
use crate::key::{CacheKey, CacheStage, TaskId};

/// One cached entry: payload plus chain and reclaim bookkeeping.
pub(crate) struct Entry {
    pub(crate) key: CacheKey,
    pub(crate) frame: Arc<FrameBuffer>,
    pub(crate) is_temp: bool,
    pub(crate) task_id: TaskId,
    pub(crate) link_prev: Option<usize>,
    pub(crate) link_next: Option<usize>,
}

/// Key→slot map plus the slot arena. Only ever touched under the store
/// mutex.
pub(crate) struct EntryTable {
    map: HashMap<CacheKey, usize, RandomState>,
    slots: Vec<Option<Entry>>,
    free_list: Vec<usize>,
    /// Chain tail: the most recent permanent insert, which the next
    /// permanent insert links onto. Reset by every FinalOutput insert.
    pub(crate) last_key: Option<usize>,
}

impl EntryTable {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::new()),
            slots: Vec::new(),
            free_list: Vec::new(),
            last_key: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn lookup(&self, key: &CacheKey) -> Option<&Entry> {
        self.map.get(key).and_then(|&idx| self.slots[idx].as_ref())
    }

    pub(crate) fn entry(&self, idx: usize) -> Option<&Entry> {
        self.slots.get(idx).and_then(|slot| slot.as_ref())
    }

    /// Occupied slots, in arena order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &Entry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|e| (idx, e)))
    }

    /// Insert an entry, linking permanent ones onto the chain.
    ///
    /// A duplicate key is a caller error (`put` pre-checks); debug builds
    /// assert, release builds keep the existing entry untouched and report
    /// `None` so the caller discards the new payload.
    pub(crate) fn insert(
        &mut self,
        key: CacheKey,
        frame: Arc<FrameBuffer>,
        is_temp: bool,
        task_id: TaskId,
    ) -> Option<usize> {
        if self.map.contains_key(&key) {
            debug_assert!(false, "duplicate cache key insert");
            return None;
        }

        let stage = key.stage();
        let idx = self.alloc_slot();
        let link_prev = if is_temp { None } else { self.last_key };
        // The map and the entry each hold the key; the clone is one Arc
        // bump plus copies.
        self.map.insert(key.clone(), idx);
        self.slots[idx] = Some(Entry {
            key,
            frame,
            is_temp,
            task_id,
            link_prev,
            link_next: None,
        });

        if !is_temp {
            if let Some(tail) = self.last_key {
                if let Some(tail_entry) = self.slots[tail].as_mut() {
                    tail_entry.link_next = Some(idx);
                }
            }
            self.last_key = Some(idx);
        }
        // A finished frame closes its chain; the next insert starts fresh.
        if stage == CacheStage::FinalOutput {
            self.last_key = None;
        }

        Some(idx)
    }

    /// Detach `idx` from its chain, patching both neighbors.
    pub(crate) fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(e) => (e.link_prev, e.link_next),
            None => return,
        };

        if let Some(n) = next {
            if let Some(next_entry) = self.slots[n].as_mut() {
                debug_assert!(
                    next_entry.link_prev == Some(idx),
                    "chain neighbor lost its back-pointer"
                );
                next_entry.link_prev = prev;
            }
        }
        if let Some(p) = prev {
            if let Some(prev_entry) = self.slots[p].as_mut() {
                debug_assert!(
                    prev_entry.link_next == Some(idx),
                    "chain neighbor lost its back-pointer"
                );
                prev_entry.link_next = next;
            }
        }
        if let Some(e) = self.slots[idx].as_mut() {
            e.link_prev = None;
            e.link_next = None;
        }
    }

    /// Drop a single entry. Does not touch its chain neighbors; callers
    /// unlink first when the entry might be linked.
    pub(crate) fn remove(&mut self, idx: usize) -> Option<Entry> {
        let entry = self.slots[idx].take()?;
        self.map.remove(&entry.key);
        self.free_slot(idx);
        if self.last_key == Some(idx) {
            self.last_key = None;
        }
        Some(entry)
    }

    /// Remove `base` and every entry chained to it, in both directions.
    ///
    /// Returns the number of entries removed. Either walk stops early at a
    /// vacant slot or at a neighbor that no longer points back; such an
    /// entry is detached in place and kept.
    pub(crate) fn remove_chain(&mut self, base: usize) -> usize {
        let mut removed = 0;
        let next_side = self.slots[base].as_ref().and_then(|e| e.link_next);

        let mut cur = Some(base);
        while let Some(idx) = cur {
            let Some(entry) = self.slots[idx].as_ref() else {
                break;
            };
            let prev = entry.link_prev;
            if let Some(p) = prev {
                let points_back = self.slots[p]
                    .as_ref()
                    .is_some_and(|pe| pe.link_next == Some(idx));
                if !points_back {
                    if let Some(e) = self.slots[idx].as_mut() {
                        e.link_prev = None;
                    }
                    break;
                }
            }
            self.unlink(idx);
            self.remove(idx);
            removed += 1;
            cur = prev;
        }

        let mut cur = next_side;
        while let Some(idx) = cur {
            let Some(entry) = self.slots[idx].as_ref() else {
                break;
            };
            let next = entry.link_next;
            if let Some(n) = next {
                let points_back = self.slots[n]
                    .as_ref()
                    .is_some_and(|ne| ne.link_prev == Some(idx));
                if !points_back {
                    if let Some(e) = self.slots[idx].as_mut() {
                        e.link_next = None;
                    }
                    break;
                }
            }
            self.unlink(idx);
            self.remove(idx);
            removed += 1;
            cur = next;
        }

        removed
    }

    /// Mark `base` and everything chained to it temporary, detaching the
    /// whole run from the chain. The entries stay in the table for
    /// `free_temp_cache` to reclaim.
    pub(crate) fn demote_chain(&mut self, base: usize) -> usize {
        let mut ids = Vec::new();

        let mut cur = Some(base);
        while let Some(idx) = cur {
            let Some(entry) = self.slots[idx].as_ref() else {
                break;
            };
            ids.push(idx);
            cur = entry.link_prev;
        }
        let mut cur = self.slots[base].as_ref().and_then(|e| e.link_next);
        while let Some(idx) = cur {
            let Some(entry) = self.slots[idx].as_ref() else {
                break;
            };
            ids.push(idx);
            cur = entry.link_next;
        }

        for &idx in &ids {
            self.unlink(idx);
            if let Some(e) = self.slots[idx].as_mut() {
                e.is_temp = true;
            }
        }
        ids.len()
    }

    /// Drop everything at once. No unlinking needed; nothing survives.
    pub(crate) fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free_list.clear();
        self.last_key = None;
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.slots.len();
            self.slots.push(None);
            idx
        }
    }

    fn free_slot(&mut self, idx: usize) {
        self.free_list.push(idx);
    }

    /// Every invariant a healthy table upholds; test support.
    #[cfg(test)]
    pub(crate) fn assert_chain_consistent(&self) {
        for (idx, entry) in self.iter() {
            if entry.is_temp {
                assert!(
                    entry.link_prev.is_none() && entry.link_next.is_none(),
                    "temporary entry is chained"
                );
            }
            if let Some(n) = entry.link_next {
                let next = self.entry(n).expect("link_next into vacant slot");
                assert_eq!(next.link_prev, Some(idx), "next.prev != self");
            }
            if let Some(p) = entry.link_prev {
                let prev = self.entry(p).expect("link_prev into vacant slot");
                assert_eq!(prev.link_next, Some(idx), "prev.next != self");
            }
            // Walking forward terminates without revisiting.
            let mut steps = 0;
            let mut cur = entry.link_next;
            while let Some(n) = cur {
                steps += 1;
                assert!(steps <= self.len(), "chain cycle detected");
                cur = self.entry(n).and_then(|e| e.link_next);
            }
        }
        if let Some(tail) = self.last_key {
            assert!(self.entry(tail).is_some(), "chain tail points at vacancy");
        }
    }
}
