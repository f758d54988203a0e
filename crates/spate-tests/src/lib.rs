//! Test harness for the Spate transaction sync engine: an in-process
//! network emulator plus shared transaction builders.

pub mod emulator;
pub mod helpers;

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a tracing subscriber honoring `RUST_LOG`. Call from tests that
/// need engine logs; safe to call repeatedly.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
