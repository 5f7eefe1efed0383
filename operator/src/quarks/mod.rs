//! Resources owned by the companion quarks-secret and quarks-job operators.
//!
//! The deployment controller only creates and updates these objects. Generating secrets and
//! running jobs is left to the operators that own the definitions.
mod quarksjob;
mod quarkssecret;

pub use quarksjob::*;
pub use quarkssecret::*;
