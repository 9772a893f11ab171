//! Process-wide glue: fatal errors, process and version queries.
//!
//! Programmer errors in the reference core (freeing a chunk with live
//! elements, a tracker that never unlinks itself, a weak callback that
//! leaves its handle armed) cannot be continued past. They all funnel
//! through [`fatal_error`], which logs the location and message and then
//! panics so the failure is observable from tests.

/// Report a fatal error at the current source location.
///
/// ```ignore
/// jsvm_fatal!("MemoryChunk can not free");
/// ```
#[macro_export]
macro_rules! jsvm_fatal {
    ($($arg:tt)+) => {
        $crate::platform::fatal_error(
            concat!(file!(), ":", line!()),
            &format!($($arg)+),
        )
    };
}

/// Check a condition that must hold for memory safety of the embedding.
#[macro_export]
macro_rules! jsvm_check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::jsvm_fatal!($($arg)+);
        }
    };
}

/// Log a fatal error and abort the current thread of execution.
#[cold]
#[inline(never)]
pub fn fatal_error(location: &str, message: &str) -> ! {
    log::error!("JSVM Fatal Error Position : {}", location);
    log::error!("JSVM Fatal Error Message : {}", message);

    panic!("JSVM Fatal Error: {}: {}", location, message);
}

/// Id of the current process, used to name the local discovery socket.
pub fn process_id() -> u32 {
    std::process::id()
}

/// Version reported as `jsvm/<version>` by the discovery endpoint.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
