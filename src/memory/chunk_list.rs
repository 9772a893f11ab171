//! Fixed-size pooled allocator.
//!
//! Elements live in chunks of `CHUNK` slots. Every unused slot, across all
//! chunks, is threaded onto a single intrusive free list, so `insert` and
//! `remove` are O(1). When a chunk becomes entirely free while more than
//! `THRESHOLD` chunks are resident, its slots are excised from the free list
//! and the chunk is released.
//!
//! ```text
//!   head ─► [chunk 3] ◄─► [chunk 1] ◄─► [chunk 0]
//!              │ ▲            │             │
//!   free_list ─┘ └────────────┼─────────────┘  (slots of any chunk)
//! ```

use std::fmt;

/// Handle to an element stored in a [`MemoryChunkList`].
///
/// Ids carry a generation so that a handle to a removed element never
/// resolves to whatever later reuses the slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId {
    chunk: u32,
    slot: u32,
    generation: u32,
}

impl ElementId {
    fn slot_ref(self) -> SlotRef {
        SlotRef {
            chunk: self.chunk,
            slot: self.slot,
        }
    }
}

impl fmt::Debug for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElementId({}:{}#{})", self.chunk, self.slot, self.generation)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct SlotRef {
    chunk: u32,
    slot: u32,
}

enum Slot<T> {
    Free { next: Option<SlotRef> },
    Occupied(T),
}

struct SlotEntry<T> {
    generation: u32,
    state: Slot<T>,
}

struct MemoryChunk<T> {
    prev: Option<u32>,
    next: Option<u32>,
    free_count: usize,
    slots: Box<[SlotEntry<T>]>,
}

impl<T> MemoryChunk<T> {
    /// Builds a chunk whose slots form a free list in index order.
    fn new(index: u32, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|slot| {
                let next = (slot + 1 < capacity).then(|| SlotRef {
                    chunk: index,
                    slot: (slot + 1) as u32,
                });
                SlotEntry {
                    generation: 0,
                    state: Slot::Free { next },
                }
            })
            .collect();

        Self {
            prev: None,
            next: None,
            free_count: capacity,
            slots,
        }
    }

    #[inline]
    fn can_be_freed(&self) -> bool {
        self.free_count == self.slots.len()
    }
}

/// Slab allocator with chunk reclamation.
///
/// `CHUNK` is the number of slots per chunk and `THRESHOLD` the number of
/// resident chunks below which empty chunks are kept around.
pub struct MemoryChunkList<T, const CHUNK: usize = 8, const THRESHOLD: usize = 10> {
    /// Chunk storage indexed by `ElementId::chunk`; released chunks leave `None`.
    chunks: Vec<Option<MemoryChunk<T>>>,

    /// Indexes of released chunks, reused before growing `chunks`.
    vacant: Vec<u32>,

    head: Option<u32>,
    free_list: Option<SlotRef>,
    chunk_count: usize,
    live: usize,
    next_generation: u32,
}

impl<T, const CHUNK: usize, const THRESHOLD: usize> Default for MemoryChunkList<T, CHUNK, THRESHOLD> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const CHUNK: usize, const THRESHOLD: usize> MemoryChunkList<T, CHUNK, THRESHOLD> {
    const VALID_CHUNK: () = assert!(CHUNK >= 2, "a chunk needs at least two slots");

    /// Create a list with one chunk already allocated.
    pub fn new() -> Self {
        let () = Self::VALID_CHUNK;

        let mut list = Self {
            chunks: Vec::new(),
            vacant: Vec::new(),
            head: None,
            free_list: None,
            chunk_count: 0,
            live: 0,
            next_generation: 1,
        };
        list.allocate_chunk();
        list
    }

    /// Store `value` in a free slot, allocating a chunk if none is left.
    pub fn insert(&mut self, value: T) -> ElementId {
        if self.free_list.is_none() {
            self.allocate_chunk();
        }

        let Some(at) = self.free_list else {
            crate::jsvm_fatal!("free list empty after chunk allocation");
        };

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);

        let chunk = self.chunk_mut(at.chunk);
        chunk.free_count -= 1;
        let entry = &mut chunk.slots[at.slot as usize];
        let next = match std::mem::replace(&mut entry.state, Slot::Occupied(value)) {
            Slot::Free { next } => next,
            Slot::Occupied(_) => crate::jsvm_fatal!("free list points at a live element"),
        };
        entry.generation = generation;

        self.free_list = next;
        self.live += 1;

        ElementId {
            chunk: at.chunk,
            slot: at.slot,
            generation,
        }
    }

    /// Remove the element behind `id` and return it.
    ///
    /// Returns `None` for ids that are stale or were never issued here.
    pub fn remove(&mut self, id: ElementId) -> Option<T> {
        if self.get(id).is_none() {
            return None;
        }

        let free_list = self.free_list;
        let chunk = self.chunk_mut(id.chunk);
        let entry = &mut chunk.slots[id.slot as usize];
        let value = match std::mem::replace(&mut entry.state, Slot::Free { next: free_list }) {
            Slot::Occupied(value) => value,
            Slot::Free { .. } => return None,
        };
        chunk.free_count += 1;
        let reclaim = chunk.can_be_freed();
        self.live -= 1;

        if self.chunk_count > THRESHOLD && reclaim {
            self.free_chunk(id.chunk);
        } else {
            self.free_list = Some(id.slot_ref());
        }

        Some(value)
    }

    pub fn get(&self, id: ElementId) -> Option<&T> {
        let chunk = self.chunks.get(id.chunk as usize)?.as_ref()?;
        let entry = chunk.slots.get(id.slot as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        match &entry.state {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, id: ElementId) -> Option<&mut T> {
        let chunk = self.chunks.get_mut(id.chunk as usize)?.as_mut()?;
        let entry = chunk.slots.get_mut(id.slot as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        match &mut entry.state {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    #[inline]
    pub fn contains(&self, id: ElementId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of resident chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    fn chunk_mut(&mut self, index: u32) -> &mut MemoryChunk<T> {
        match self.chunks.get_mut(index as usize).and_then(Option::as_mut) {
            Some(chunk) => chunk,
            None => crate::jsvm_fatal!("chunk {} is not resident", index),
        }
    }

    fn allocate_chunk(&mut self) {
        crate::jsvm_check!(self.free_list.is_none(), "allocating a chunk with free slots left");

        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.chunks.push(None);
                (self.chunks.len() - 1) as u32
            }
        };

        let mut chunk = MemoryChunk::new(index, CHUNK);
        chunk.next = self.head;
        if let Some(head) = self.head {
            self.chunk_mut(head).prev = Some(index);
        }
        self.chunks[index as usize] = Some(chunk);
        self.head = Some(index);
        self.chunk_count += 1;

        self.free_list = Some(SlotRef {
            chunk: index,
            slot: 0,
        });

        log::trace!("allocated chunk {} ({} resident)", index, self.chunk_count);
    }

    /// Release a fully free chunk.
    ///
    /// The slot just removed has not been pushed onto the free list, so only
    /// the other `CHUNK - 1` slots of the chunk are excised from it.
    fn free_chunk(&mut self, index: u32) {
        let mut excised = 0;
        let mut prev: Option<SlotRef> = None;
        let mut current = self.free_list;

        while excised < CHUNK - 1 {
            let Some(at) = current else { break };
            let next = self.free_next(at);

            if at.chunk == index {
                match prev {
                    Some(p) => self.set_free_next(p, next),
                    None => self.free_list = next,
                }
                excised += 1;
            } else {
                prev = Some(at);
            }
            current = next;
        }
        crate::jsvm_check!(
            excised == CHUNK - 1,
            "chunk {} has {} slots missing from the free list",
            index,
            CHUNK - 1 - excised
        );

        let (prev, next) = {
            let chunk = self.chunk_mut(index);
            (chunk.prev, chunk.next)
        };
        if let Some(next) = next {
            self.chunk_mut(next).prev = prev;
        }
        match prev {
            Some(prev) => self.chunk_mut(prev).next = next,
            None => {
                crate::jsvm_check!(self.head == Some(index), "unlinked chunk is not the head");
                self.head = next;
            }
        }

        self.chunks[index as usize] = None;
        self.vacant.push(index);
        self.chunk_count -= 1;

        log::trace!("released chunk {} ({} resident)", index, self.chunk_count);
    }

    fn free_next(&self, at: SlotRef) -> Option<SlotRef> {
        let chunk = self.chunks[at.chunk as usize].as_ref();
        match chunk.map(|c| &c.slots[at.slot as usize].state) {
            Some(Slot::Free { next }) => *next,
            _ => crate::jsvm_fatal!("free list points at a live element"),
        }
    }

    fn set_free_next(&mut self, at: SlotRef, value: Option<SlotRef>) {
        if let Slot::Free { next } = &mut self.chunk_mut(at.chunk).slots[at.slot as usize].state {
            *next = value;
        }
    }
}

impl<T, const CHUNK: usize, const THRESHOLD: usize> Drop for MemoryChunkList<T, CHUNK, THRESHOLD> {
    fn drop(&mut self) {
        // Already unwinding from another fatal error.
        if std::thread::panicking() {
            return;
        }

        let mut cursor = self.head;
        while let Some(index) = cursor {
            let Some(chunk) = self.chunks[index as usize].as_ref() else {
                break;
            };
            if !chunk.can_be_freed() {
                log::error!(
                    "Memory is in use when free: chunk {} ({} of {} slots live)",
                    index,
                    CHUNK - chunk.free_count,
                    CHUNK
                );
                crate::jsvm_fatal!("MemoryChunk can not free");
            }
            cursor = chunk.next;
        }
    }
}

impl<T, const CHUNK: usize, const THRESHOLD: usize> fmt::Debug for MemoryChunkList<T, CHUNK, THRESHOLD> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChunkList")
            .field("chunk_size", &CHUNK)
            .field("threshold", &THRESHOLD)
            .field("chunk_count", &self.chunk_count)
            .field("live", &self.live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    /// Small geometry so reclamation kicks in quickly.
    type SmallList<T> = MemoryChunkList<T, 4, 2>;

    fn drain<T, const C: usize, const H: usize>(list: &mut MemoryChunkList<T, C, H>, ids: Vec<ElementId>) {
        for id in ids {
            assert!(list.remove(id).is_some());
        }
    }

    #[test]
    fn test_new_list_has_one_chunk() {
        let list: MemoryChunkList<u64> = MemoryChunkList::new();
        assert_eq!(list.chunk_count(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_ids_unique_among_live_elements() {
        let mut list: SmallList<usize> = MemoryChunkList::new();
        let mut live = Vec::new();
        let mut seen = HashSet::new();

        for i in 0..64 {
            let id = list.insert(i);
            assert!(seen.insert((id.chunk, id.slot)), "slot handed out twice: {:?}", id);
            live.push(id);

            // Free every third element to exercise reuse.
            if i % 3 == 0 {
                let victim = live.remove(0);
                seen.remove(&(victim.chunk, victim.slot));
                list.remove(victim);
            }
        }

        for id in &live {
            assert!(list.contains(*id));
        }
        assert_eq!(list.len(), live.len());
        drain(&mut list, live);
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut list: MemoryChunkList<&str> = MemoryChunkList::new();
        let a = list.insert("a");
        let b = list.insert("b");

        assert_eq!(list.remove(a), Some("a"));
        let c = list.insert("c");

        assert_eq!((c.chunk, c.slot), (a.chunk, a.slot));
        assert_ne!(c.generation, a.generation);
        assert_eq!(list.get(c), Some(&"c"));

        list.remove(c);
        list.remove(b);
    }

    #[test]
    fn test_stale_id_does_not_resolve() {
        let mut list: MemoryChunkList<String> = MemoryChunkList::new();
        let id = list.insert("first".to_string());
        list.remove(id);
        let reused = list.insert("second".to_string());

        assert!(list.get(id).is_none());
        assert!(list.get_mut(id).is_none());
        assert!(list.remove(id).is_none());
        assert_eq!(list.get(reused).map(String::as_str), Some("second"));

        list.remove(reused);
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut list: MemoryChunkList<Vec<u8>> = MemoryChunkList::new();
        let id = list.insert(Vec::new());
        list.get_mut(id).unwrap().push(7);
        assert_eq!(list.get(id), Some(&vec![7]));
        list.remove(id);
    }

    #[test]
    fn test_chunks_grow_on_demand() {
        let mut list: SmallList<u32> = MemoryChunkList::new();
        let ids: Vec<_> = (0..9).map(|i| list.insert(i)).collect();
        assert_eq!(list.chunk_count(), 3);
        drain(&mut list, ids);
    }

    #[test]
    fn test_chunk_reclaimed_above_threshold() {
        let mut list: SmallList<u32> = MemoryChunkList::new();
        let ids: Vec<_> = (0..16).map(|i| list.insert(i)).collect();
        assert_eq!(list.chunk_count(), 4);

        let mut by_chunk: HashMap<u32, Vec<ElementId>> = HashMap::new();
        for id in &ids {
            by_chunk.entry(id.chunk).or_default().push(*id);
        }
        let (&victim, victim_ids) = by_chunk.iter().next().unwrap();
        let victim_ids = victim_ids.clone();

        for id in &victim_ids {
            list.remove(*id);
        }
        assert_eq!(list.chunk_count(), 3);

        // Elements of the other chunks are untouched.
        for id in ids.iter().filter(|id| id.chunk != victim) {
            assert_eq!(list.get(*id).copied(), Some(ids.iter().position(|x| x == id).unwrap() as u32));
        }

        // The released slots must not linger on the free list.
        let refill: Vec<_> = (0..4).map(|i| list.insert(100 + i)).collect();
        assert_eq!(list.chunk_count(), 4);

        drain(&mut list, refill);
        drain(&mut list, ids.into_iter().filter(|id| id.chunk != victim).collect());
    }

    #[test]
    fn test_chunk_kept_at_threshold() {
        let mut list: SmallList<u32> = MemoryChunkList::new();
        let ids: Vec<_> = (0..8).map(|i| list.insert(i)).collect();
        assert_eq!(list.chunk_count(), 2);

        drain(&mut list, ids);
        assert_eq!(list.chunk_count(), 2);
        assert!(list.is_empty());
    }

    #[test]
    fn test_reclaim_down_to_threshold() {
        let mut list: SmallList<u32> = MemoryChunkList::new();
        let ids: Vec<_> = (0..24).map(|i| list.insert(i)).collect();
        assert_eq!(list.chunk_count(), 6);

        drain(&mut list, ids);
        assert_eq!(list.chunk_count(), 2);

        let again: Vec<_> = (0..24).map(|i| list.insert(i)).collect();
        assert_eq!(list.len(), 24);
        drain(&mut list, again);
    }

    #[test]
    #[should_panic(expected = "MemoryChunk can not free")]
    fn test_drop_with_live_element_is_fatal() {
        let mut list: MemoryChunkList<u32> = MemoryChunkList::new();
        list.insert(1);
        drop(list);
    }
}
