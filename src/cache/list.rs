//! State lists for the ARC engine.
//!
//! All cache entries live in one slot arena and are linked into at most one of
//! four size-accounted lists by `SlotId`. Each list keeps its MRU entry at the
//! head and its LRU entry at the tail, so promotion and victim selection are
//! O(1) without raw back-pointers.
//!
//! ```text
//!   arena: [ slot0 | slot1 | slot2 | ... ]      (free slots are reused)
//!
//!   Mru      head ─► slot2 ◄──► slot0 ◄── tail   size = s2 + s0
//!   Mfu      head ─► slot1 ◄── tail              size = s1
//!   GhostMru (empty)
//!   GhostMfu (empty)
//! ```

/// Which of the four ARC lists an entry is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Recently used once (T1).
    Mru,
    /// Used more than once (T2).
    Mfu,
    /// Keys recently evicted from `Mru` (B1).
    GhostMru,
    /// Keys recently evicted from `Mfu` (B2).
    GhostMfu,
}

impl ListKind {
    /// Ghost lists hold metadata only; their values have been evicted.
    pub fn is_ghost(self) -> bool {
        matches!(self, ListKind::GhostMru | ListKind::GhostMfu)
    }

    fn index(self) -> usize {
        match self {
            ListKind::Mru => 0,
            ListKind::Mfu => 1,
            ListKind::GhostMru => 2,
            ListKind::GhostMfu => 3,
        }
    }
}

impl std::fmt::Display for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListKind::Mru => write!(f, "MRU"),
            ListKind::Mfu => write!(f, "MFU"),
            ListKind::GhostMru => write!(f, "ghost-MRU"),
            ListKind::GhostMfu => write!(f, "ghost-MFU"),
        }
    }
}

/// Stable handle to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

#[derive(Debug)]
struct Node<T> {
    value: T,
    size: usize,
    list: Option<ListKind>,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ListHead {
    head: Option<SlotId>,
    tail: Option<SlotId>,
    size: usize,
    len: usize,
}

/// Arena of entries plus the four state lists linking them.
#[derive(Debug)]
pub struct StateLists<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    lists: [ListHead; 4],
}

impl<T> StateLists<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            lists: [ListHead::default(); 4],
        }
    }

    /// Store a value in the arena without linking it into any list.
    pub fn insert(&mut self, value: T, size: usize) -> SlotId {
        let node = Node {
            value,
            size,
            list: None,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                SlotId(idx)
            }
            None => {
                self.slots.push(Some(node));
                SlotId(self.slots.len() - 1)
            }
        }
    }

    /// Unlink the slot (if linked) and release it, returning its value.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        self.unlink(id);
        let node = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(node.value)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.node(id).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.node_mut(id).map(|node| &mut node.value)
    }

    /// List the slot is currently linked into.
    pub fn list_of(&self, id: SlotId) -> Option<ListKind> {
        self.node(id).and_then(|node| node.list)
    }

    /// Accounted size of the slot.
    pub fn size_of(&self, id: SlotId) -> usize {
        self.node(id).map_or(0, |node| node.size)
    }

    /// Change the accounted size of an unlinked slot.
    pub fn set_size(&mut self, id: SlotId, size: usize) {
        if let Some(node) = self.node_mut(id) {
            debug_assert!(node.list.is_none(), "resizing a linked slot");
            node.size = size;
        }
    }

    /// Sum of the sizes of every slot linked into `kind`.
    pub fn size(&self, kind: ListKind) -> usize {
        self.lists[kind.index()].size
    }

    pub fn len(&self, kind: ListKind) -> usize {
        self.lists[kind.index()].len
    }

    /// Least recently used slot of `kind`.
    pub fn lru(&self, kind: ListKind) -> Option<SlotId> {
        self.lists[kind.index()].tail
    }

    /// Link an unlinked slot at the head (MRU end) of `kind`.
    pub fn push_front(&mut self, id: SlotId, kind: ListKind) {
        let old_head = self.lists[kind.index()].head;
        let size = match self.node_mut(id) {
            Some(node) => {
                debug_assert!(node.list.is_none(), "slot linked twice");
                node.list = Some(kind);
                node.prev = None;
                node.next = old_head;
                node.size
            }
            None => return,
        };
        match old_head {
            Some(head) => {
                if let Some(node) = self.node_mut(head) {
                    node.prev = Some(id);
                }
            }
            None => self.lists[kind.index()].tail = Some(id),
        }
        let list = &mut self.lists[kind.index()];
        list.head = Some(id);
        list.size += size;
        list.len += 1;
    }

    /// Detach a slot from whatever list it is in, returning that list.
    pub fn unlink(&mut self, id: SlotId) -> Option<ListKind> {
        let (kind, prev, next, size) = {
            let node = self.node_mut(id)?;
            let kind = node.list.take()?;
            let links = (node.prev.take(), node.next.take());
            (kind, links.0, links.1, node.size)
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.lists[kind.index()].head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.lists[kind.index()].tail = prev,
        }
        let list = &mut self.lists[kind.index()];
        list.size -= size;
        list.len -= 1;
        Some(kind)
    }

    /// Slots of `kind` from MRU to LRU.
    pub fn iter(&self, kind: ListKind) -> impl Iterator<Item = SlotId> + '_ {
        let mut cursor = self.lists[kind.index()].head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.node(id).and_then(|node| node.next);
            Some(id)
        })
    }

    /// Drop every slot, linked or not.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.lists = [ListHead::default(); 4];
    }

    fn node(&self, id: SlotId) -> Option<&Node<T>> {
        self.slots.get(id.0).and_then(|slot| slot.as_ref())
    }

    fn node_mut(&mut self, id: SlotId) -> Option<&mut Node<T>> {
        self.slots.get_mut(id.0).and_then(|slot| slot.as_mut())
    }
}

impl<T> Default for StateLists<T> {
    fn default() -> Self {
        Self::new()
    }
}
