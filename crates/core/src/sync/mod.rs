//! Sync domain models and services.

mod assembler;
mod coordinator;
mod model;
mod orchestrator;
mod remote;

pub use assembler::*;
pub use coordinator::*;
pub use model::*;
pub use orchestrator::*;
pub use remote::*;

#[cfg(test)]
pub(crate) mod test_support;
