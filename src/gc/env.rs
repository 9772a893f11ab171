//! Per-environment reference bookkeeping.
//!
//! Every tracker lives in one [`MemoryChunkList`] and is linked on one of
//! two lists: user references, or finalizers (plain finalizer trackers and
//! runtime references). Tearing the environment down drains the finalizer
//! list first, then the user references.

use std::any::Any;
use std::fmt;

use super::engine::{Engine, PendingWeakCallback, WeakCallbackKind};
use super::heap::Heap;
use super::ref_tracker::{ListKind, RefList};
use super::reference::{
    FinalizerTracker, Payload, PendingFinalizer, Reference, RuntimeReference, RuntimeState,
    UserReference,
};
use crate::error::{JsvmError, Result};
use crate::memory::{ElementId, MemoryChunkList};

/// Environment configuration.
#[derive(Clone, Debug, Default)]
pub struct EnvOptions {
    /// Run finalizers after every first-pass callback of a collection
    /// instead of inside their own first pass.
    pub second_pass_finalizers: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserReferenceId(ElementId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RuntimeReferenceId(ElementId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FinalizerId(ElementId);

/// Per-environment reference bookkeeping over an [`Engine`].
///
/// [`Heap`] is the in-crate reference engine used by the tests and benches;
/// embedders supply their own engine.
pub struct Env<E: Engine> {
    engine: E,
    options: EnvOptions,
    references: MemoryChunkList<Reference<E>>,
    user_references: RefList,
    finalizers: RefList,
}

impl Default for Env<Heap> {
    fn default() -> Self {
        Self::new(Heap::new(), EnvOptions::default())
    }
}

impl<E: Engine> Env<E> {
    pub fn new(engine: E, options: EnvOptions) -> Self {
        Self {
            engine,
            options,
            references: MemoryChunkList::new(),
            user_references: RefList::new(ListKind::UserReferences),
            finalizers: RefList::new(ListKind::Finalizers),
        }
    }

    #[inline]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[inline]
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    #[inline]
    pub fn options(&self) -> &EnvOptions {
        &self.options
    }

    /// Run `f` inside a fresh handle scope.
    pub fn handle_scope<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.engine.open_handle_scope();
        let result = f(self);
        self.engine.close_handle_scope();
        result
    }

    // User references

    pub fn create_reference(&mut self, value: &E::Local, initial_refcount: u32) -> UserReferenceId {
        self.new_user_reference(value, true, initial_refcount)
    }

    /// Reference engine data that is not a JS value. Never held weakly.
    pub fn create_data_reference(&mut self, data: &E::Local, initial_refcount: u32) -> UserReferenceId {
        self.new_user_reference(data, false, initial_refcount)
    }

    pub fn reference_ref(&mut self, id: UserReferenceId) -> Result<u32> {
        let (engine, reference) = self.user_parts(id)?;
        Ok(reference.ref_(engine))
    }

    pub fn reference_unref(&mut self, id: UserReferenceId) -> Result<u32> {
        let (engine, reference) = self.user_parts(id)?;
        Ok(reference.unref(engine))
    }

    pub fn reference_count(&self, id: UserReferenceId) -> Result<u32> {
        match self.references.get(id.0) {
            Some(Reference::User(reference)) => Ok(reference.refcount()),
            _ => Err(JsvmError::StaleReference),
        }
    }

    /// The referenced value, or `None` once the collector cleared it.
    pub fn get_reference_value(&mut self, id: UserReferenceId) -> Result<Option<E::Local>> {
        let (engine, reference) = self.user_parts(id)?;
        if !reference.is_value() {
            return Err(JsvmError::InvalidArg("reference holds data, not a value"));
        }
        Ok(reference.get(engine))
    }

    pub fn get_reference_data(&mut self, id: UserReferenceId) -> Result<Option<E::Local>> {
        let (engine, reference) = self.user_parts(id)?;
        Ok(reference.get(engine))
    }

    pub fn delete_reference(&mut self, id: UserReferenceId) -> Result<()> {
        match self.references.get(id.0) {
            Some(Reference::User(_)) => {
                self.destroy(id.0);
                Ok(())
            }
            _ => Err(JsvmError::StaleReference),
        }
    }

    // Runtime references and finalizers

    /// Attach `data` to `object` for as long as the object lives.
    ///
    /// The reference deletes itself in the first weak pass; no finalizer runs.
    pub fn wrap(&mut self, object: &E::Local, data: Payload) -> Result<RuntimeReferenceId> {
        if !self.engine.is_object(object) {
            return Err(JsvmError::ObjectExpected);
        }
        Ok(self.new_runtime_reference(object, FinalizerTracker::new(None, Some(data), None)))
    }

    /// Run `finalize` once `value` has been collected.
    pub fn add_finalizer<F>(
        &mut self,
        value: &E::Local,
        finalize: F,
        data: Option<Payload>,
        hint: Option<Payload>,
    ) -> Result<RuntimeReferenceId>
    where
        F: FnOnce(&mut Env<E>, Option<Payload>, Option<Payload>) + 'static,
    {
        if !self.engine.can_be_held_weakly(value) {
            return Err(JsvmError::CannotBeHeldWeakly);
        }
        let tracker = FinalizerTracker::new(Some(Box::new(finalize)), data, hint);
        Ok(self.new_runtime_reference(value, tracker))
    }

    /// Delete a runtime reference.
    ///
    /// A reference whose handle is still weak is destroyed now. Once the
    /// collector has queued its callback, only the finalizer is dropped and
    /// the callback destroys the reference. Already destroyed references are
    /// ignored.
    pub fn delete_runtime_reference(&mut self, id: RuntimeReferenceId) -> Result<()> {
        let Some(Reference::Runtime(reference)) = self.references.get_mut(id.0) else {
            log::debug!("runtime reference {:?} already finalized", id.0);
            return Ok(());
        };

        if self.engine.persistent_is_weak(reference.persistent()) {
            self.destroy(id.0);
        } else {
            reference.tracker_mut().reset_finalizer();
        }
        Ok(())
    }

    /// Data attached by [`Env::wrap`], while the reference is alive.
    pub fn runtime_reference_data(&self, id: RuntimeReferenceId) -> Option<&dyn Any> {
        match self.references.get(id.0) {
            Some(Reference::Runtime(reference)) => reference.tracker().data(),
            _ => None,
        }
    }

    pub fn runtime_reference_state(&self, id: RuntimeReferenceId) -> Option<RuntimeState> {
        match self.references.get(id.0) {
            Some(Reference::Runtime(reference)) => Some(reference.state()),
            _ => None,
        }
    }

    /// Run `finalize` when the environment is torn down.
    pub fn add_env_finalizer<F>(&mut self, finalize: F, data: Option<Payload>, hint: Option<Payload>) -> FinalizerId
    where
        F: FnOnce(&mut Env<E>, Option<Payload>, Option<Payload>) + 'static,
    {
        let tracker = FinalizerTracker::new(Some(Box::new(finalize)), data, hint);
        let id = self.references.insert(Reference::Finalizer(tracker));
        self.finalizers.link(&mut self.references, id);
        FinalizerId(id)
    }

    // Collection

    /// Collect garbage and run every weak callback it queued.
    pub fn collect_garbage(&mut self) {
        let pending = self.engine.collect_garbage();
        self.dispatch_weak_callbacks(pending);
    }

    /// Run the first pass of each queued callback, then any second passes.
    pub fn dispatch_weak_callbacks(&mut self, pending: Vec<PendingWeakCallback<E::Persistent>>) {
        let mut second_pass = Vec::new();

        for PendingWeakCallback { handle, callback } in pending {
            let id = callback.parameter;
            self.engine.persistent_reset(handle);

            match callback.kind {
                WeakCallbackKind::WithoutFinalizer => self.destroy(id),
                WeakCallbackKind::WithFinalizer if self.options.second_pass_finalizers => {
                    if let Some(Reference::Runtime(reference)) = self.references.get_mut(id) {
                        reference.set_state(RuntimeState::Finalizing);
                        second_pass.push(id);
                    }
                }
                WeakCallbackKind::WithFinalizer => self.finalize_tracker(id),
            }
        }

        for id in second_pass {
            self.finalize_tracker(id);
        }
    }

    /// Finalize every tracker on `kind`, head first, until the list is empty.
    pub fn finalize_all(&mut self, kind: ListKind) {
        while let Some(id) = self.list(kind).first() {
            self.finalize_tracker(id);
            crate::jsvm_check!(
                self.list(kind).first() != Some(id),
                "reference tracker {:?} stayed linked after finalization",
                id
            );
        }
    }

    // Observability

    /// Trackers of every kind currently allocated.
    #[inline]
    pub fn live_references(&self) -> usize {
        self.references.len()
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.references.chunk_count()
    }

    pub fn list_len(&self, kind: ListKind) -> usize {
        self.list(kind).len()
    }

    fn list(&self, kind: ListKind) -> &RefList {
        match kind {
            ListKind::UserReferences => &self.user_references,
            ListKind::Finalizers => &self.finalizers,
        }
    }

    fn new_user_reference(&mut self, value: &E::Local, is_value: bool, initial_refcount: u32) -> UserReferenceId {
        let reference = UserReference::new(&mut self.engine, value, is_value, initial_refcount);
        let id = self.references.insert(Reference::User(reference));
        self.user_references.link(&mut self.references, id);
        UserReferenceId(id)
    }

    fn new_runtime_reference(&mut self, value: &E::Local, tracker: FinalizerTracker<E>) -> RuntimeReferenceId {
        let reference = RuntimeReference::new(&mut self.engine, value, tracker);
        let id = self.references.insert(Reference::Runtime(reference));
        if let Some(Reference::Runtime(reference)) = self.references.get(id) {
            reference.arm(&mut self.engine, id);
        }
        self.finalizers.link(&mut self.references, id);
        RuntimeReferenceId(id)
    }

    fn user_parts(&mut self, id: UserReferenceId) -> Result<(&mut E, &mut UserReference<E::Persistent>)> {
        match self.references.get_mut(id.0) {
            Some(Reference::User(reference)) => Ok((&mut self.engine, reference)),
            _ => Err(JsvmError::StaleReference),
        }
    }

    /// Finalize one tracker. Every tracker ends up unlinked and freed.
    fn finalize_tracker(&mut self, id: ElementId) {
        let pending = match self.references.get_mut(id) {
            Some(Reference::User(_)) => None,
            Some(Reference::Finalizer(tracker)) => tracker.take_finalizer(),
            Some(Reference::Runtime(reference)) => reference.tracker_mut().take_finalizer(),
            None => return,
        };

        if let Some(pending) = pending {
            self.call_finalizer(pending);
        }
        self.destroy(id);
    }

    fn call_finalizer(&mut self, pending: PendingFinalizer<E>) {
        let PendingFinalizer { finalize, data, hint } = pending;
        self.handle_scope(|env| finalize(env, data, hint));
    }

    /// Unlink, reset and free a tracker. Unknown ids are ignored.
    fn destroy(&mut self, id: ElementId) {
        let list = match self.references.get(id) {
            Some(Reference::User(_)) => &mut self.user_references,
            Some(_) => &mut self.finalizers,
            None => return,
        };
        list.unlink(&mut self.references, id);

        match self.references.remove(id) {
            Some(Reference::User(mut reference)) => reference.reset(&mut self.engine),
            Some(Reference::Runtime(reference)) => self.engine.persistent_reset(reference.persistent()),
            Some(Reference::Finalizer(_)) | None => {}
        }
    }
}

impl<E: Engine> Drop for Env<E> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        log::debug!(
            "tearing down env: {} finalizers, {} user references",
            self.finalizers.len(),
            self.user_references.len()
        );
        self.finalize_all(ListKind::Finalizers);
        self.finalize_all(ListKind::UserReferences);
    }
}

impl<E: Engine + fmt::Debug> fmt::Debug for Env<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("engine", &self.engine)
            .field("options", &self.options)
            .field("user_references", &self.user_references.len())
            .field("finalizers", &self.finalizers.len())
            .field("chunks", &self.references.chunk_count())
            .finish()
    }
}
