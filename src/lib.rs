pub mod error;
pub mod gc;
pub mod inspector;
pub mod memory;
pub mod platform;
pub mod sourcemap;

// Core API
pub use error::{InspectorError, JsvmError, Result};
pub use gc::{Engine, Env, EnvOptions, FinalizerId, Heap, Local, RuntimeReferenceId, UserReferenceId};
pub use inspector::{InspectPublishUid, InspectorSocketServer, ServerHandle, ServerOptions, SocketServerDelegate};
pub use memory::{ElementId, MemoryChunkList};
pub use sourcemap::SourceMap;
