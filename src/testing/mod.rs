//! End-to-end scenarios and shared fixtures.
//!
//! Everything here runs hermetically: backing nodes come from
//! [`crate::backend::memory::MemoryBackend`] and the coordination
//! service from [`crate::coord::memory::MemoryCoordination`], so the
//! full stack (facade, router, checkers, fleet) is exercised without
//! external processes.

mod cache_e2e_tests;
mod fixtures;

pub use fixtures::wait_until;
