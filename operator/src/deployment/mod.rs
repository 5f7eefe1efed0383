//! BOSHDeployment is a k8s custom resource that describes a BOSH deployment.

// Export all spec types
mod spec;
pub use spec::*;

// All other mods are behind the controller flag to keep the deps to a minimum
#[cfg(feature = "controller")]
pub(crate) mod bpm;
#[cfg(feature = "controller")]
pub(crate) mod controller;
#[cfg(feature = "controller")]
pub mod job_factory;
#[cfg(feature = "controller")]
pub mod links;
#[cfg(feature = "controller")]
pub mod resolver;
#[cfg(feature = "controller")]
pub mod variables;

#[cfg(feature = "controller")]
pub use controller::run;
