//! Pooled storage for reference trackers.

mod chunk_list;

pub use chunk_list::{ElementId, MemoryChunkList};
