//! Core functionality shared by the Aegis sovereign attestation crates.
//!
//! This crate provides configuration loading, the ambient error type and
//! logging initialisation used by the node daemon and the verifier.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    Config, DeviceKind, LogFormat, NodeConfig, RenewalConfig, TpmConfig, VerifierConfig,
};
pub use error::{CoreError, Error, Result};
