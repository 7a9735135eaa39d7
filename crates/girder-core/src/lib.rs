//! Core domain types for the Girder CI/CD control plane.
//!
//! This crate contains:
//! - Resource identifiers
//! - Build and worker status enums with their transition rules
//! - The dynamic build-config document
//! - The shared error taxonomy

pub mod build;
pub mod config;
pub mod error;
pub mod id;
pub mod worker;

pub use build::BuildStatus;
pub use config::BuildConfig;
pub use error::{Error, Result};
pub use id::ResourceId;
pub use worker::WorkerStatus;
