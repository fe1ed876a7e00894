//! Stable numeric thread identities.
//!
//! `std::thread::ThreadId` has no stable integer form, so every thread that
//! touches the engine is assigned a small positive id on first use. Id 0 is
//! never assigned and means "no thread".

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Id of the calling thread.
pub fn current_thread_id() -> u64 {
    CURRENT_THREAD_ID.with(|id| *id)
}
