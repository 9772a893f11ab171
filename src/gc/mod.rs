//! Reference and finalizer tracking for GC-managed handles.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Env                                                        │
//! │  ├── MemoryChunkList<Reference>  (owns every tracker)       │
//! │  ├── RefList: user references                               │
//! │  └── RefList: finalizers + runtime references               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Reference                                                  │
//! │  ├── UserReference      refcounted, weak at zero            │
//! │  ├── FinalizerTracker   callback + data + hint, once        │
//! │  └── RuntimeReference   finalizer tied to an object         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Engine (trait)                                             │
//! │  ├── persistent handles, strong or weak                     │
//! │  ├── handle scopes                                          │
//! │  └── collect_garbage() → queued weak callbacks              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Weak callbacks
//!
//! A runtime reference arms a weak callback carrying its own slot id. When
//! the collector finds the target unreachable it queues the callback and
//! the handle stops being weak. [`Env::dispatch_weak_callbacks`] then resets
//! the handle and either deletes the reference (no finalizer) or runs the
//! finalizer and deletes it.
//!
//! [`Env::delete_runtime_reference`] uses the weak bit to tell the two
//! situations apart: still weak means nothing is queued and the reference
//! can go now; not weak means a callback owns it and only the finalizer is
//! dropped.
//!
//! ## Usage
//!
//! ```ignore
//! use jsvm_runtime::gc::{Env, Heap};
//!
//! let mut env: Env<Heap> = Env::default();
//! env.handle_scope(|env| {
//!     let obj = env.engine_mut().new_object();
//!     env.add_finalizer(&obj, |_, _, _| println!("collected"), None, None)
//! })?;
//! env.collect_garbage();
//! ```

mod engine;
mod env;
mod heap;
mod ref_tracker;
mod reference;

pub use engine::{Engine, PendingWeakCallback, WeakCallback, WeakCallbackKind};
pub use env::{Env, EnvOptions, FinalizerId, RuntimeReferenceId, UserReferenceId};
pub use heap::{CellId, Heap, Local, PersistentId};
pub use ref_tracker::{ListKind, RefLink, RefList, RefTracker};
pub use reference::{
    Finalize, FinalizerTracker, Payload, Reference, RuntimeReference, RuntimeState, UserReference, WeakMode,
};
