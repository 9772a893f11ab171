//! Intrusive doubly linked lists of live reference trackers.
//!
//! Links are slot ids into the owning [`MemoryChunkList`], never owning
//! pointers: the list records who is alive, the allocator owns them.

use crate::memory::{ElementId, MemoryChunkList};

/// The two per-environment lists a tracker can sit on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    UserReferences,
    Finalizers,
}

/// Link fields embedded in every tracker.
///
/// `list == None` is the unlinked state.
#[derive(Debug, Default)]
pub struct RefLink {
    list: Option<ListKind>,
    prev: Option<ElementId>,
    next: Option<ElementId>,
}

impl RefLink {
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.list.is_some()
    }

    #[inline]
    pub fn next(&self) -> Option<ElementId> {
        self.next
    }
}

/// Anything that can sit on a [`RefList`].
pub trait RefTracker {
    fn link(&self) -> &RefLink;

    fn link_mut(&mut self) -> &mut RefLink;
}

/// Sentinel of one tracker list.
#[derive(Debug)]
pub struct RefList {
    kind: ListKind,
    head: Option<ElementId>,
    len: usize,
}

impl RefList {
    pub fn new(kind: ListKind) -> Self {
        Self {
            kind,
            head: None,
            len: 0,
        }
    }

    #[inline]
    pub fn kind(&self) -> ListKind {
        self.kind
    }

    /// The tracker right after the sentinel.
    #[inline]
    pub fn first(&self) -> Option<ElementId> {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Insert `id` immediately after the sentinel.
    pub fn link<T: RefTracker, const C: usize, const H: usize>(
        &mut self,
        store: &mut MemoryChunkList<T, C, H>,
        id: ElementId,
    ) {
        let next = self.head;
        let Some(node) = store.get_mut(id) else {
            crate::jsvm_fatal!("linking a tracker that is not allocated: {:?}", id);
        };
        let link = node.link_mut();
        crate::jsvm_check!(!link.is_linked(), "tracker {:?} is already linked", id);
        link.list = Some(self.kind);
        link.prev = None;
        link.next = next;

        if let Some(next) = next {
            if let Some(next) = store.get_mut(next) {
                next.link_mut().prev = Some(id);
            }
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Remove `id` from this list.
    ///
    /// Unlinked or unknown trackers are ignored.
    pub fn unlink<T: RefTracker, const C: usize, const H: usize>(
        &mut self,
        store: &mut MemoryChunkList<T, C, H>,
        id: ElementId,
    ) {
        let Some(node) = store.get_mut(id) else {
            return;
        };
        let link = node.link_mut();
        if link.list != Some(self.kind) {
            return;
        }
        let (prev, next) = (link.prev.take(), link.next.take());
        link.list = None;

        match prev {
            Some(prev) => {
                if let Some(prev) = store.get_mut(prev) {
                    prev.link_mut().next = next;
                }
            }
            None => self.head = next,
        }
        if let Some(next) = next {
            if let Some(next) = store.get_mut(next) {
                next.link_mut().prev = prev;
            }
        }
        self.len -= 1;
    }

    /// Ids from the sentinel onwards.
    pub fn ids<T: RefTracker, const C: usize, const H: usize>(
        &self,
        store: &MemoryChunkList<T, C, H>,
    ) -> Vec<ElementId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = store.get(id).and_then(|node| node.link().next());
        }
        ids
    }
}
