use arc_swap::{ArcSwap, ArcSwapOption};
use std::sync::Arc;

/// A read-copy-update cell for a value that may not yet exist.
///
/// Readers on the hot path call [`ArcSwapOption::load`] (re-exported through
/// this alias) which never blocks. Writers publish a new value with
/// [`ArcSwapOption::store`]; in-flight readers keep whatever snapshot they
/// already dereferenced.
pub type AtomicOption<T> = Arc<ArcSwapOption<T>>;

/// Same as [`AtomicOption`] but for a value that always exists.
pub type Atomic<T> = Arc<ArcSwap<T>>;
