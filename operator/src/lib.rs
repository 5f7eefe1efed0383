//! Provides API for the operator and related tooling.
#![warn(missing_docs)]

/// Config module for the runtime settings of the operator.
#[cfg(feature = "controller")]
pub mod config;
/// Deployment module for reconciling BOSH deployments.
pub mod deployment;
/// Labels module for the naming conventions of derived resources.
#[cfg(feature = "controller")]
pub(crate) mod labels;
/// Manifest module for the typed view of BOSH manifests.
#[cfg(feature = "controller")]
pub mod manifest;
/// Meltdown module for rate limiting reconciles.
#[cfg(feature = "controller")]
pub mod meltdown;
/// Quarks module for the custom resources consumed by the operator.
pub mod quarks;
/// Utils module for shared utility functions.
#[cfg(feature = "controller")]
pub mod utils;

/// Field manager of the objects written by the controller
#[cfg(feature = "controller")]
const CONTROLLER_NAME: &str = "quarks-operator";
