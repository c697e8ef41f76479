//! Mintling core: offline-first state synchronization for the Mintling app.
//!
//! The crate is organized around four pieces: a durable namespaced local
//! store ([`store::LocalStore`], implemented by `mintling-storage-sqlite`),
//! a debounced per-entity [`sync::WriteCoordinator`], a fan-out
//! [`sync::SnapshotAssembler`], and the top-level [`sync::SyncOrchestrator`]
//! that reconciles local state against the remote authoritative store.

pub mod errors;
pub mod store;
pub mod sync;
