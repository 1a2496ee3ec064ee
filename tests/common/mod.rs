//! Shared test harness bits. Not a test binary itself — `tests/common/` is a
//! subdirectory, so cargo doesn't compile it as its own integration-test
//! crate, the same trick the teacher avoids needing since its own tests
//! live one-per-protocol rather than sharing fixtures.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing-subscriber` fmt layer once per test binary, writing
/// to the test harness's captured output (`cargo test -- --nocapture` to
/// see it) rather than forcing a global subscriber on library consumers —
/// library code only ever emits `tracing` events, never initializes a
/// subscriber itself (SPEC_FULL.md's ambient-stack logging section).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init()
            .ok();
    });
}
