//! Test-only logging setup, shared by every module's `#[cfg(test)]` suite.
//!
//! `RUST_LOG=trace cargo test -- --nocapture` then shows every `log::trace!`
//! call this crate makes (staging/commit timestamps, active-ref transitions)
//! alongside a failing test's assertions.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes `env_logger` exactly once per test binary. Idempotent and
/// cheap to call at the top of every test.
pub(crate) fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
