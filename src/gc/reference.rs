//! Reference trackers stored in the environment's chunk list.

use std::any::Any;
use std::fmt;

use super::engine::{Engine, WeakCallback, WeakCallbackKind};
use super::env::Env;
use super::ref_tracker::{RefLink, RefTracker};
use crate::memory::ElementId;

/// Opaque native payload handed back to a finalizer.
pub type Payload = Box<dyn Any>;

/// Finalizer callback. Receives the environment, the data and the hint.
pub type Finalize<E> = Box<dyn FnOnce(&mut Env<E>, Option<Payload>, Option<Payload>)>;

/// A finalizer with its payloads, taken out of a tracker to be called.
pub(crate) struct PendingFinalizer<E: Engine> {
    pub finalize: Finalize<E>,
    pub data: Option<Payload>,
    pub hint: Option<Payload>,
}

/// Ref-counted handle to a value or to engine data.
///
/// At refcount zero the handle is weak when the target can be held weakly,
/// otherwise it is reset. Above zero it is always strong.
pub struct UserReference<P> {
    link: RefLink,
    persistent: P,
    refcount: u32,
    is_value: bool,
    can_be_weak: bool,
}

impl<P: Copy + Eq + fmt::Debug> UserReference<P> {
    pub(crate) fn new<E>(engine: &mut E, value: &E::Local, is_value: bool, initial_refcount: u32) -> Self
    where
        E: Engine<Persistent = P>,
    {
        let can_be_weak = is_value && engine.can_be_held_weakly(value);
        let mut reference = Self {
            link: RefLink::default(),
            persistent: engine.new_persistent(value),
            refcount: initial_refcount,
            is_value,
            can_be_weak,
        };
        if initial_refcount == 0 {
            reference.set_weak(engine);
        }
        reference
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    #[inline]
    pub fn is_value(&self) -> bool {
        self.is_value
    }

    #[inline]
    pub fn can_be_weak(&self) -> bool {
        self.can_be_weak
    }

    /// Increment the count. Returns 0 if the collector already cleared the handle.
    pub fn ref_<E: Engine<Persistent = P>>(&mut self, engine: &mut E) -> u32 {
        if engine.persistent_is_empty(self.persistent) {
            return 0;
        }

        self.refcount = match self.refcount.checked_add(1) {
            Some(count) => count,
            None => crate::jsvm_fatal!("reference count overflow"),
        };
        if self.refcount == 1 {
            // Non-weakable handles were reset at zero and are empty by now.
            crate::jsvm_check!(self.can_be_weak, "strengthening a reference that cannot be weak");
            engine.persistent_clear_weak(self.persistent);
        }
        self.refcount
    }

    /// Decrement the count. Returns 0 if already cleared or already at zero.
    pub fn unref<E: Engine<Persistent = P>>(&mut self, engine: &mut E) -> u32 {
        if engine.persistent_is_empty(self.persistent) || self.refcount == 0 {
            return 0;
        }

        self.refcount -= 1;
        if self.refcount == 0 {
            self.set_weak(engine);
        }
        self.refcount
    }

    /// The target rooted in the current handle scope, if still alive.
    pub fn get<E: Engine<Persistent = P>>(&self, engine: &mut E) -> Option<E::Local> {
        engine.persistent_get(self.persistent)
    }

    pub(crate) fn reset<E: Engine<Persistent = P>>(&mut self, engine: &mut E) {
        engine.persistent_reset(self.persistent);
    }

    fn set_weak<E: Engine<Persistent = P>>(&mut self, engine: &mut E) {
        if self.can_be_weak {
            engine.persistent_set_weak(self.persistent, None);
        } else {
            engine.persistent_reset(self.persistent);
        }
    }
}

impl<P> RefTracker for UserReference<P> {
    fn link(&self) -> &RefLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut RefLink {
        &mut self.link
    }
}

impl<P: fmt::Debug> fmt::Debug for UserReference<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserReference")
            .field("persistent", &self.persistent)
            .field("refcount", &self.refcount)
            .field("is_value", &self.is_value)
            .field("can_be_weak", &self.can_be_weak)
            .finish()
    }
}

/// A finalizer callback with its two payloads.
///
/// Calling the finalizer takes all three out first, so it runs at most once
/// and a later reset or drop is a no-op.
pub struct FinalizerTracker<E: Engine> {
    link: RefLink,
    finalize: Option<Finalize<E>>,
    data: Option<Payload>,
    hint: Option<Payload>,
}

impl<E: Engine> FinalizerTracker<E> {
    pub(crate) fn new(finalize: Option<Finalize<E>>, data: Option<Payload>, hint: Option<Payload>) -> Self {
        Self {
            link: RefLink::default(),
            finalize,
            data,
            hint,
        }
    }

    #[inline]
    pub fn has_finalizer(&self) -> bool {
        self.finalize.is_some()
    }

    pub fn data(&self) -> Option<&dyn Any> {
        self.data.as_deref()
    }

    pub fn reset_finalizer(&mut self) {
        self.finalize = None;
        self.data = None;
        self.hint = None;
    }

    /// Take the finalizer out for calling, leaving the tracker reset.
    pub(crate) fn take_finalizer(&mut self) -> Option<PendingFinalizer<E>> {
        let finalize = self.finalize.take();
        let data = self.data.take();
        let hint = self.hint.take();

        Some(PendingFinalizer {
            finalize: finalize?,
            data,
            hint,
        })
    }
}

impl<E: Engine> RefTracker for FinalizerTracker<E> {
    fn link(&self) -> &RefLink {
        &self.link
    }

    fn link_mut(&mut self) -> &mut RefLink {
        &mut self.link
    }
}

impl<E: Engine> fmt::Debug for FinalizerTracker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizerTracker")
            .field("has_finalizer", &self.finalize.is_some())
            .field("has_data", &self.data.is_some())
            .field("has_hint", &self.hint.is_some())
            .finish()
    }
}

/// How a runtime reference registered its weak callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeakMode {
    /// No finalizer: the first pass deletes the reference.
    OnePass,
    /// Finalizer present: the finalizer runs before deletion.
    TwoPass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    Armed(WeakMode),
    /// First pass done, finalizer queued for the second pass.
    Finalizing,
}

/// A finalizer tied to the lifetime of an object.
pub struct RuntimeReference<E: Engine> {
    tracker: FinalizerTracker<E>,
    persistent: E::Persistent,
    state: RuntimeState,
}

impl<E: Engine> RuntimeReference<E> {
    pub(crate) fn new(engine: &mut E, value: &E::Local, tracker: FinalizerTracker<E>) -> Self {
        crate::jsvm_check!(
            engine.can_be_held_weakly(value),
            "runtime reference target cannot be held weakly"
        );
        let mode = if tracker.has_finalizer() {
            WeakMode::TwoPass
        } else {
            WeakMode::OnePass
        };

        Self {
            tracker,
            persistent: engine.new_persistent(value),
            state: RuntimeState::Armed(mode),
        }
    }

    /// Register the weak callback for the slot this reference now occupies.
    pub(crate) fn arm(&self, engine: &mut E, parameter: ElementId) {
        let kind = match self.state {
            RuntimeState::Armed(WeakMode::TwoPass) => WeakCallbackKind::WithFinalizer,
            RuntimeState::Armed(WeakMode::OnePass) => WeakCallbackKind::WithoutFinalizer,
            RuntimeState::Finalizing => return,
        };
        engine.persistent_set_weak(self.persistent, Some(WeakCallback { parameter, kind }));
    }

    #[inline]
    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RuntimeState) {
        self.state = state;
    }

    #[inline]
    pub fn persistent(&self) -> E::Persistent {
        self.persistent
    }

    pub fn tracker(&self) -> &FinalizerTracker<E> {
        &self.tracker
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut FinalizerTracker<E> {
        &mut self.tracker
    }
}

impl<E: Engine> RefTracker for RuntimeReference<E> {
    fn link(&self) -> &RefLink {
        self.tracker.link()
    }

    fn link_mut(&mut self) -> &mut RefLink {
        self.tracker.link_mut()
    }
}

impl<E: Engine> fmt::Debug for RuntimeReference<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeReference")
            .field("persistent", &self.persistent)
            .field("state", &self.state)
            .field("tracker", &self.tracker)
            .finish()
    }
}

/// Every kind of tracker, as stored in one chunk list.
pub enum Reference<E: Engine> {
    User(UserReference<E::Persistent>),
    Finalizer(FinalizerTracker<E>),
    Runtime(RuntimeReference<E>),
}

impl<E: Engine> RefTracker for Reference<E> {
    fn link(&self) -> &RefLink {
        match self {
            Reference::User(r) => r.link(),
            Reference::Finalizer(r) => r.link(),
            Reference::Runtime(r) => r.link(),
        }
    }

    fn link_mut(&mut self) -> &mut RefLink {
        match self {
            Reference::User(r) => r.link_mut(),
            Reference::Finalizer(r) => r.link_mut(),
            Reference::Runtime(r) => r.link_mut(),
        }
    }
}

impl<E: Engine> fmt::Debug for Reference<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::User(r) => fmt::Debug::fmt(r, f),
            Reference::Finalizer(r) => fmt::Debug::fmt(r, f),
            Reference::Runtime(r) => fmt::Debug::fmt(r, f),
        }
    }
}
