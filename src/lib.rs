//! Sandbox fleet: provisions, monitors, reverts and tears down VM-backed
//! sandbox containers on demand.
//!
//! The [`manager::SandboxManager`] owns all mutable state. It reserves host
//! ports through [`ports::PortAllocator`], drives containers through an
//! [`engine::ContainerEngine`] and waits on [`probe::ReadinessProber`] before
//! handing connection details back. [`api`] exposes it over HTTP.

pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod ports;
pub mod probe;
pub mod retry;

pub use config::FleetConfig;
pub use error::{ErrorKind, FleetError, Result};
pub use manager::SandboxManager;
