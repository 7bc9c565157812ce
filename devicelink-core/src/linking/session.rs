//! State of a single linking attempt.

use crate::crypto::{generate_ephemeral_identity, EphemeralIdentity};
use crate::{LinkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkingState {
    Initiated,
    HandlePublished,
    AwaitingPrimaryConfirmation,
    Completed,
    Failed,
}

impl LinkingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_advance_to(&self, next: LinkingState) -> bool {
        use LinkingState::*;
        match (self, next) {
            (Initiated, HandlePublished)
            | (HandlePublished, AwaitingPrimaryConfirmation)
            | (AwaitingPrimaryConfirmation, Completed) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Ephemeral material and progress of one attempt. Dropped when the attempt
/// ends, whatever the outcome.
#[derive(Debug)]
pub struct LinkingSession {
    ephemeral: EphemeralIdentity,
    provisioning_handle: Option<String>,
    state: LinkingState,
}

impl LinkingSession {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ephemeral: generate_ephemeral_identity()?,
            provisioning_handle: None,
            state: LinkingState::Initiated,
        })
    }

    pub fn state(&self) -> LinkingState {
        self.state
    }

    pub fn ephemeral(&self) -> &EphemeralIdentity {
        &self.ephemeral
    }

    pub fn provisioning_handle(&self) -> Option<&str> {
        self.provisioning_handle.as_deref()
    }

    pub fn publish_handle(&mut self, handle: String) -> Result<()> {
        self.advance(LinkingState::HandlePublished)?;
        self.provisioning_handle = Some(handle);
        Ok(())
    }

    pub fn await_confirmation(&mut self) -> Result<()> {
        self.advance(LinkingState::AwaitingPrimaryConfirmation)
    }

    pub fn complete(&mut self) -> Result<()> {
        self.advance(LinkingState::Completed)
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = LinkingState::Failed;
        }
    }

    fn advance(&mut self, next: LinkingState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(LinkError::InvalidInput(format!(
                "linking cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut session = LinkingSession::new().unwrap();
        assert_eq!(session.state(), LinkingState::Initiated);
        session.publish_handle("abc".to_string()).unwrap();
        assert_eq!(session.provisioning_handle(), Some("abc"));
        session.await_confirmation().unwrap();
        session.complete().unwrap();
        assert_eq!(session.state(), LinkingState::Completed);
    }

    #[test]
    fn steps_cannot_be_skipped() {
        let mut session = LinkingSession::new().unwrap();
        assert!(session.await_confirmation().is_err());
        assert!(session.complete().is_err());
        assert_eq!(session.state(), LinkingState::Initiated);
    }

    #[test]
    fn failure_is_terminal() {
        let mut session = LinkingSession::new().unwrap();
        session.publish_handle("abc".to_string()).unwrap();
        session.fail();
        assert_eq!(session.state(), LinkingState::Failed);
        assert!(session.await_confirmation().is_err());
    }

    #[test]
    fn completed_session_does_not_fail() {
        let mut session = LinkingSession::new().unwrap();
        session.publish_handle("abc".to_string()).unwrap();
        session.await_confirmation().unwrap();
        session.complete().unwrap();
        session.fail();
        assert_eq!(session.state(), LinkingState::Completed);
    }
}
