//! Test support: canned structures, simulated outputs, a calculations
//! directory builder and an in-memory scheduler.

pub mod fixtures;
mod mocks;

pub use fixtures::Workspace;
pub use mocks::FakeScheduler;
