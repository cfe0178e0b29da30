//! Ops commands for the ground store

pub mod repair;
pub mod verify;

pub use repair::{repair_ground, RepairReport};
pub use verify::{verify_ground, VerifyReport};
