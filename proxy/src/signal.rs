//! Signal handling for graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Install a ctrl-c handler and return the shutdown flag it flips.
pub fn install() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .expect("failed to set signal handler");

    shutdown
}
