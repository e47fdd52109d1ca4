pub mod compress;
pub mod config;
pub mod crypto;
pub mod repo;
pub mod snapshot;

pub use arca_types::error;

pub use repo::{PackSetKind, Repo};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
