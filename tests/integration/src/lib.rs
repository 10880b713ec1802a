//! End-to-end tests for the shoal cluster client.
//!
//! The system under test is the client, so instead of spawning server
//! binaries these tests run an in-process mock cluster (see [`helpers`])
//! whose topology and failure behavior the tests control directly.

pub mod helpers;

#[cfg(test)]
mod locking;
#[cfg(test)]
mod scripts;
