//! # TierCache - Tiered Read-Through Cache
//!
//! A read-through cache that serves lookups from a bounded in-memory hot
//! tier, falls back to an authoritative repository, and survives repository
//! outages through a persistent local disk tier. Entries evicted from the
//! hot tier are spilled to the disk tier, so a lookup during an outage can
//! recover what the hot tier no longer holds.
//!
//! ## Architecture
//!
//! - `coordinator`: public entry point resolving lookups across the tiers
//! - `hot`: bounded in-memory tier with write-age expiry and an eviction
//!   sink observing every departure
//! - `disk`: persistent, compressed local key-value tier with periodic
//!   wipe-and-rebuild cleanup
//! - `codec`: type-tagged binary codec with pooled encode buffers
//! - `repository`: the authoritative-store contract and an in-memory fake
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiercache::{InMemoryRepository, Repository, TierCoordinator};
//!
//! # fn main() -> Result<(), tiercache::CacheError> {
//! let repository = Arc::new(InMemoryRepository::new());
//! repository
//!     .save("greeting".to_string(), "hello".to_string())
//!     .unwrap();
//!
//! let cache = TierCoordinator::builder()
//!     .store_path("./tier_cache_db")
//!     .max_cache_size(10_000)
//!     .repository(repository.clone())
//!     .build()?;
//!
//! assert_eq!(cache.get(&"greeting".to_string())?, Some("hello".to_string()));
//! cache.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Binary object codec
pub mod codec;

// Tier coordinator and builder
pub mod coordinator;

// Persistent disk tier
pub mod disk;

// Bounded in-memory hot tier
pub mod hot;

// Authoritative-store contract
pub mod repository;

// Re-export commonly used types
pub use codec::{CodecError, ObjectCodec};
pub use coordinator::{CacheError, TierCoordinator, TierCoordinatorBuilder, TierStats};
pub use disk::{DiskError, DiskStore, DiskStoreConfig};
pub use hot::{EvictionCause, EvictionSink, HotTier};
pub use repository::{InMemoryRepository, Repository, RepositoryError};

/// Default directory for the disk tier database.
pub const DEFAULT_STORE_PATH: &str = "./tier_cache_db";

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
