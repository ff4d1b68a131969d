//! dozlab-operator: Kubernetes controller for ephemeral microVM lab sessions

pub mod builder;
pub mod client;
pub mod config;
pub mod controllers;
pub mod error;
pub mod gc;
pub mod health;
pub mod labsession;
pub mod phase;
pub mod reaper;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::OperatorConfig;
pub use labsession::{LabSession, LabSessionSpec, LabSessionStatus, Phase};
