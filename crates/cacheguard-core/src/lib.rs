//! Building blocks shared by the cacheguard engine: the remote store
//! contract, an in-memory store, key generation, payload codecs and the
//! Fibonacci retry schedule.

pub mod codec;
pub mod error;
pub mod key;
pub mod memory;
pub mod retry;
pub mod store;

pub use codec::{Codec, NULL_SENTINEL, is_null_sentinel};
pub use error::{CodecError, StoreError, StoreResult};
pub use key::{CacheKey, InvocationContext, KeyExpr, KeyGenerator, KeyResolver};
pub use memory::MemoryStore;
pub use retry::{FibonacciBackoff, RetryBudget};
pub use store::{DynStore, MAX_TTL, RemoteStore, glob_match, window_secs};
