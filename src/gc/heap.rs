//! Deterministic mark/sweep heap implementing [`Engine`].
//!
//! Cells (objects, symbols, templates) live in generation-checked slots.
//! Roots are the locals of every open handle scope plus every strong
//! persistent handle. Weak handles follow V8's rules: a plain weak handle
//! to an unreachable target is cleared, one with a callback is marked
//! pending and keeps its target alive until the callback resets it.

use std::fmt;

use super::engine::{Engine, PendingWeakCallback, WeakCallback};

/// Generation-checked index of a heap cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellId({}#{})", self.index, self.generation)
    }
}

/// A value as seen from native code.
#[derive(Clone, Debug, PartialEq)]
pub enum Local {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Object(CellId),
    Symbol(CellId),
    /// Engine data that is not a JS value.
    Template(CellId),
}

impl Local {
    fn cell(&self) -> Option<CellId> {
        match self {
            Local::Object(id) | Local::Symbol(id) | Local::Template(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for PersistentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentId({}#{})", self.index, self.generation)
    }
}

enum Cell {
    Object { edges: Vec<CellId> },
    Symbol,
    Template,
}

struct CellSlot {
    generation: u32,
    cell: Option<Cell>,
}

#[derive(Clone, Copy, Debug)]
enum PersistentState {
    Strong,
    Weak(Option<WeakCallback>),
    /// Callback queued by the last collection, not yet reset.
    Pending,
    /// Weak target collected without a callback.
    Cleared,
}

struct PersistentEntry {
    target: Local,
    state: PersistentState,
}

struct PersistentSlot {
    generation: u32,
    entry: Option<PersistentEntry>,
}

#[derive(Default)]
pub struct Heap {
    cells: Vec<CellSlot>,
    free_cells: Vec<u32>,
    scopes: Vec<Vec<CellId>>,
    persistents: Vec<PersistentSlot>,
    free_persistents: Vec<u32>,
    gc_runs: u64,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_object(&mut self) -> Local {
        Local::Object(self.alloc(Cell::Object { edges: Vec::new() }))
    }

    pub fn new_symbol(&mut self) -> Local {
        Local::Symbol(self.alloc(Cell::Symbol))
    }

    pub fn new_template(&mut self) -> Local {
        Local::Template(self.alloc(Cell::Template))
    }

    /// Make `holder` reference `value`, as a property store would.
    ///
    /// Returns `false` when `holder` is not a live object.
    pub fn add_edge(&mut self, holder: &Local, value: &Local) -> bool {
        let (Local::Object(holder), Some(target)) = (holder, value.cell()) else {
            return false;
        };
        match self.cell_mut(*holder) {
            Some(Cell::Object { edges }) => {
                edges.push(target);
                true
            }
            _ => false,
        }
    }

    /// Whether the cell behind `value` survived every collection so far.
    ///
    /// Primitives are always alive.
    pub fn is_alive(&self, value: &Local) -> bool {
        match value.cell() {
            Some(id) => self.cell(id).is_some(),
            None => true,
        }
    }

    pub fn live_cells(&self) -> usize {
        self.cells.iter().filter(|slot| slot.cell.is_some()).count()
    }

    pub fn live_persistents(&self) -> usize {
        self.persistents.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn gc_runs(&self) -> u64 {
        self.gc_runs
    }

    fn alloc(&mut self, cell: Cell) -> CellId {
        let Some(scope) = self.scopes.last_mut() else {
            crate::jsvm_fatal!("Cannot create a handle without a HandleScope");
        };

        let index = match self.free_cells.pop() {
            Some(index) => index,
            None => {
                self.cells.push(CellSlot {
                    generation: 0,
                    cell: None,
                });
                (self.cells.len() - 1) as u32
            }
        };
        let slot = &mut self.cells[index as usize];
        slot.cell = Some(cell);
        let id = CellId {
            index,
            generation: slot.generation,
        };
        scope.push(id);
        id
    }

    fn cell(&self, id: CellId) -> Option<&Cell> {
        let slot = self.cells.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.cell.as_ref()
    }

    fn cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        let slot = self.cells.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.cell.as_mut()
    }

    fn entry(&self, id: PersistentId) -> Option<&PersistentEntry> {
        let slot = self.persistents.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: PersistentId) -> Option<&mut PersistentEntry> {
        let slot = self.persistents.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn mark(&self, marks: &mut [bool], mut work: Vec<CellId>) {
        while let Some(id) = work.pop() {
            let Some(cell) = self.cell(id) else {
                continue;
            };
            let index = id.index as usize;
            if marks[index] {
                continue;
            }
            marks[index] = true;

            if let Cell::Object { edges } = cell {
                work.extend(edges.iter().copied());
            }
        }
    }
}

impl Engine for Heap {
    type Local = Local;
    type Persistent = PersistentId;

    fn open_handle_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn close_handle_scope(&mut self) {
        if self.scopes.pop().is_none() {
            crate::jsvm_fatal!("HandleScope closed without a matching open");
        }
    }

    fn can_be_held_weakly(&self, value: &Local) -> bool {
        matches!(value, Local::Object(_) | Local::Symbol(_))
    }

    fn is_object(&self, value: &Local) -> bool {
        matches!(value, Local::Object(_))
    }

    fn new_persistent(&mut self, value: &Local) -> PersistentId {
        let index = match self.free_persistents.pop() {
            Some(index) => index,
            None => {
                self.persistents.push(PersistentSlot {
                    generation: 0,
                    entry: None,
                });
                (self.persistents.len() - 1) as u32
            }
        };
        let slot = &mut self.persistents[index as usize];
        slot.entry = Some(PersistentEntry {
            target: value.clone(),
            state: PersistentState::Strong,
        });
        PersistentId {
            index,
            generation: slot.generation,
        }
    }

    fn persistent_get(&mut self, handle: PersistentId) -> Option<Local> {
        let target = match self.entry(handle) {
            Some(PersistentEntry {
                state: PersistentState::Cleared,
                ..
            })
            | None => return None,
            Some(entry) => entry.target.clone(),
        };

        if let Some(cell) = target.cell() {
            let Some(scope) = self.scopes.last_mut() else {
                crate::jsvm_fatal!("Cannot create a handle without a HandleScope");
            };
            scope.push(cell);
        }
        Some(target)
    }

    fn persistent_reset(&mut self, handle: PersistentId) {
        let Some(slot) = self.persistents.get_mut(handle.index as usize) else {
            return;
        };
        if slot.generation != handle.generation || slot.entry.is_none() {
            return;
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_persistents.push(handle.index);
    }

    fn persistent_set_weak(&mut self, handle: PersistentId, callback: Option<WeakCallback>) {
        if let Some(entry) = self.entry_mut(handle) {
            if matches!(entry.state, PersistentState::Strong | PersistentState::Weak(_)) {
                entry.state = PersistentState::Weak(callback);
            }
        }
    }

    fn persistent_clear_weak(&mut self, handle: PersistentId) {
        if let Some(entry) = self.entry_mut(handle) {
            if matches!(entry.state, PersistentState::Weak(_)) {
                entry.state = PersistentState::Strong;
            }
        }
    }

    fn persistent_is_weak(&self, handle: PersistentId) -> bool {
        matches!(
            self.entry(handle),
            Some(PersistentEntry {
                state: PersistentState::Weak(_),
                ..
            })
        )
    }

    fn persistent_is_empty(&self, handle: PersistentId) -> bool {
        matches!(
            self.entry(handle),
            None | Some(PersistentEntry {
                state: PersistentState::Cleared,
                ..
            })
        )
    }

    fn collect_garbage(&mut self) -> Vec<PendingWeakCallback<PersistentId>> {
        self.gc_runs += 1;

        let mut marks = vec![false; self.cells.len()];
        let mut roots: Vec<CellId> = self.scopes.iter().flatten().copied().collect();
        for slot in &self.persistents {
            let Some(entry) = &slot.entry else { continue };
            match entry.state {
                PersistentState::Strong => roots.extend(entry.target.cell()),
                PersistentState::Pending => {
                    crate::jsvm_fatal!("weak callback did not reset its handle before the next collection")
                }
                PersistentState::Weak(_) | PersistentState::Cleared => {}
            }
        }
        self.mark(&mut marks, roots);

        // Weak handles whose targets were not reached.
        let mut pending = Vec::new();
        let mut resurrected = Vec::new();
        for (index, slot) in self.persistents.iter_mut().enumerate() {
            let Some(entry) = &mut slot.entry else { continue };
            let PersistentState::Weak(callback) = entry.state else {
                continue;
            };
            let Some(cell) = entry.target.cell() else {
                continue;
            };
            if marks.get(cell.index as usize).copied().unwrap_or(false) {
                continue;
            }

            match callback {
                None => {
                    entry.state = PersistentState::Cleared;
                    entry.target = Local::Undefined;
                }
                Some(callback) => {
                    entry.state = PersistentState::Pending;
                    resurrected.push(cell);
                    pending.push(PendingWeakCallback {
                        handle: PersistentId {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        callback,
                    });
                }
            }
        }
        self.mark(&mut marks, resurrected);

        let mut freed = 0usize;
        for (index, slot) in self.cells.iter_mut().enumerate() {
            if slot.cell.is_none() || marks[index] {
                continue;
            }
            slot.cell = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free_cells.push(index as u32);
            freed += 1;
        }

        log::trace!(
            "gc #{}: freed {} cells, {} weak callbacks pending",
            self.gc_runs,
            freed,
            pending.len()
        );

        pending
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live_cells", &self.live_cells())
            .field("live_persistents", &self.live_persistents())
            .field("scopes", &self.scopes.len())
            .field("gc_runs", &self.gc_runs)
            .finish()
    }
}
