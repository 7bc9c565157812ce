//! Secondary-device linking.

pub mod coordinator;
pub mod session;
pub mod uri;

#[cfg(test)]
mod tests;

pub use coordinator::{LinkingCoordinator, LinkingEvent};
pub use session::{LinkingSession, LinkingState};
pub use uri::{provisioning_uri, ProvisioningUri};
