//! SQLite-backed local persistence for the sync engine.

mod cache;

pub use cache::LocalCacheRepository;
