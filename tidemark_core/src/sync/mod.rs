//! Incremental synchronization: poll a source, keep only what the destination has not
//! seen yet, and append it in chronological order.
//!
//! Pieces, in pipeline order:
//! - `cursor`: rebuild the high-water mark from the destination's latest record
//! - `retry`: fetch through the adapter with bounded retry and rate-limit skips
//! - `filter`: drop everything at or behind the cursor
//! - `commit`: write survivors oldest first, aborting at the first failed write
//! - `engine`: drives the above for every configured source

pub mod commit;
pub mod cursor;
pub mod engine;
pub mod filter;
pub mod memory;
pub mod retry;
pub mod traits;
