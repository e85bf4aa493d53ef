pub mod adapter;
pub mod config;
pub mod consumer;
pub mod diagnostic;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod license;
pub mod logs;
pub mod orchestrator;
pub mod planner;
pub mod platform;
pub mod registry;
pub mod stamp;
pub mod toolchain;
pub mod verify;
pub mod workspace;

pub use error::{Error, Result};
