//! Project-wide object identifiers
//!
//! Clips, sources, tracks and sheets are referenced by `i64` ids; children
//! store only ids, never pointers to their parents, so the object graph
//! stays acyclic across threads.

use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicI64 = AtomicI64::new(0);

/// Create a fresh positive id.
///
/// Ids mix wall-clock seconds, a process-wide counter and random bits so
/// they remain unique across sessions of the same project.
pub fn new_id() -> i64 {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFF;
    let random: i64 = rand::thread_rng().gen_range(0..0x000F_FFFF);
    ((seconds << 32) | (count << 20) | random).abs()
}
