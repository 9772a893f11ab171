//! The engine surface the reference core relies on.
//!
//! Only persistent handles, handle scopes and weak callbacks are needed.
//! Everything else about the engine (object model, compilation, the GC
//! algorithm itself) stays behind this trait.

use std::fmt;

use crate::memory::ElementId;

/// Which first-pass handler a weak callback was registered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeakCallbackKind {
    /// Reset the handle and run the finalizer (two-pass registration).
    WithFinalizer,
    /// Reset the handle and delete the reference.
    WithoutFinalizer,
}

/// Registration data passed to [`Engine::persistent_set_weak`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeakCallback {
    /// Slot of the reference that owns the handle.
    pub parameter: ElementId,
    pub kind: WeakCallbackKind,
}

/// A weak callback the collector queued during a collection.
///
/// While queued, the handle is no longer weak and its target is kept alive.
/// The first-pass handler must reset `handle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingWeakCallback<P> {
    pub handle: P,
    pub callback: WeakCallback,
}

pub trait Engine: 'static {
    /// A value rooted in the current handle scope.
    type Local: Clone + fmt::Debug;

    /// A handle that outlives handle scopes.
    type Persistent: Copy + Eq + fmt::Debug;

    fn open_handle_scope(&mut self);

    fn close_handle_scope(&mut self);

    /// Objects and symbols can be held weakly; primitives and data cannot.
    fn can_be_held_weakly(&self, value: &Self::Local) -> bool;

    fn is_object(&self, value: &Self::Local) -> bool;

    fn new_persistent(&mut self, value: &Self::Local) -> Self::Persistent;

    /// Root the target of `handle` in the current handle scope.
    ///
    /// Returns `None` once the handle is empty.
    fn persistent_get(&mut self, handle: Self::Persistent) -> Option<Self::Local>;

    fn persistent_reset(&mut self, handle: Self::Persistent);

    /// Make `handle` weak.
    ///
    /// Without a callback the collector simply clears the handle. With one,
    /// it queues the callback instead and keeps the target until the
    /// callback resets the handle.
    fn persistent_set_weak(&mut self, handle: Self::Persistent, callback: Option<WeakCallback>);

    fn persistent_clear_weak(&mut self, handle: Self::Persistent);

    fn persistent_is_weak(&self, handle: Self::Persistent) -> bool;

    fn persistent_is_empty(&self, handle: Self::Persistent) -> bool;

    /// Run a full collection and hand back the weak callbacks it queued.
    fn collect_garbage(&mut self) -> Vec<PendingWeakCallback<Self::Persistent>>;
}
