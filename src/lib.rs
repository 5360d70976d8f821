//! A concurrent hash map for many readers and writers.
//!
//! [`HashMap`] supports fully concurrent lookups and a high expected degree
//! of concurrency for updates, with throughput close to a single-threaded
//! map. Reads never take a lock. Writes lock only the one bucket they touch,
//! and table growth is cooperative: threads that notice a resize in progress
//! migrate a range of buckets instead of waiting for it to finish.
//!
//! # Guards
//!
//! The map manages the memory of its entries itself, so that removing an
//! entry while another thread is reading it never frees memory out from
//! under the reader. Every operation therefore takes a [`Guard`], obtained
//! from [`HashMap::guard`], and references returned by the map are tied to
//! the lifetime of that guard:
//!
//! ```
//! let map = shoal::HashMap::new();
//! let guard = map.guard();
//! map.insert(1, "a", &guard);
//! assert_eq!(map.get(&1, &guard), Some(&"a"));
//! ```
//!
//! Anything the map unlinks is reclaimed only once all guards pinned at the
//! time of the unlink are gone. Holding a guard for a long time therefore
//! delays reclamation; drop it between batches of operations. Guards are
//! tied to the map that created them; using another map's guard panics.
//!
//! For call sites where threading a guard around is noise, [`HashMap::pin`]
//! returns a [`HashMapRef`] that owns a guard and exposes the same API
//! without the extra argument.
//!
//! # Growth and collision handling
//!
//! The table doubles when it passes 75% occupancy. Buckets whose chain
//! grows unusually long (at least eight entries in a table of at least 64
//! buckets) are converted into red-black trees, bounding worst-case lookup
//! cost for pathological hash distributions; buckets that shrink back
//! revert to chains.
//!
//! # Compute-family caveat
//!
//! The `compute`-family methods run their callback while the key's bucket
//! is claimed. The callback must not call back into the same map: if it
//! touches a key in the same bucket, the call deadlocks. This mirrors the
//! contract of the design this map is modeled on and is not detected at
//! runtime.

#![deny(missing_docs, missing_debug_implementations, unreachable_pub)]
#![warn(rust_2018_idioms)]

mod counter;
mod iter;
mod map;
mod map_ref;
mod node;
mod reclaim;
mod table;

pub use iter::{Iter, Keys, Values};
pub use map::{HashMap, TryInsertError};
pub use map_ref::HashMapRef;

/// A [`Guard`](seize::Guard) pins the memory the map hands out references
/// into; see the crate-level documentation.
pub use seize::Guard;

/// The default [`BuildHasher`](std::hash::BuildHasher) for [`HashMap`].
///
/// aHash keyed by compile-time randomness: meaningfully collision-resistant
/// without imposing runtime random number generation on every consumer.
pub type DefaultHashBuilder = ahash::RandomState;
