pub mod config;
pub mod error;
pub mod security;
pub mod cookies;
pub mod backend;
pub mod identity;
pub mod realtime;
pub mod server;

// Debug-only printing helper: expands to eprintln! during tests and debug builds and is absent otherwise.
// Usage: tprintln!("session.issue user={}", user_id);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In non-test builds, provide a no-op tprintln! so calls compile without effect.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        // Preserve formatting checks in release without producing code
        if false { let _ = format!($($arg)*); }
    });
}
