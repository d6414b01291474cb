//! Core error types

use thiserror::Error;

use crate::release::Status;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("Invalid manifest {path}: {message}")]
    InvalidManifest { path: String, message: String },

    #[error("Invalid hook {path}: {message}")]
    InvalidHook { path: String, message: String },

    #[error("Invalid status transition for release {name}: {from} -> {to}")]
    InvalidTransition { name: String, from: Status, to: Status },

    #[error("Render error: {message}")]
    Render { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Values error: {message}")]
    Values { message: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
