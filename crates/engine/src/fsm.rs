use quorum_types::{ErrorKind, ProposalId, ProposalStatus, Result, WalletError};
use tracing::info;

/// Proposal lifecycle state machine.
///
/// Valid transitions:
/// - Temporary -> Pending (publish)
/// - Pending -> Accepted (quorum of accepts)
/// - Pending -> Rejected (quorum no longer reachable)
/// - Accepted -> Broadcast (submitted to the network)
/// - Broadcast -> Confirmed (mined)
/// - Temporary|Pending -> Expired (removed)
pub struct ProposalFsm {
    current_state: ProposalStatus,
    proposal_id: ProposalId,
}

impl ProposalFsm {
    pub fn new(proposal_id: ProposalId, state: ProposalStatus) -> Self {
        Self {
            current_state: state,
            proposal_id,
        }
    }

    pub fn current_state(&self) -> ProposalStatus {
        self.current_state
    }

    pub fn publish(&mut self) -> Result<ProposalStatus> {
        self.transition(
            ProposalStatus::Pending,
            &[ProposalStatus::Temporary],
            ErrorKind::TxNotPending,
        )
    }

    pub fn accept(&mut self) -> Result<ProposalStatus> {
        self.transition(
            ProposalStatus::Accepted,
            &[ProposalStatus::Pending],
            ErrorKind::TxNotPending,
        )
    }

    pub fn reject(&mut self) -> Result<ProposalStatus> {
        self.transition(
            ProposalStatus::Rejected,
            &[ProposalStatus::Pending],
            ErrorKind::TxNotPending,
        )
    }

    pub fn broadcast(&mut self) -> Result<ProposalStatus> {
        self.transition(
            ProposalStatus::Broadcast,
            &[ProposalStatus::Accepted],
            ErrorKind::TxNotAccepted,
        )
    }

    pub fn confirm(&mut self) -> Result<ProposalStatus> {
        self.transition(
            ProposalStatus::Confirmed,
            &[ProposalStatus::Broadcast],
            ErrorKind::InvalidRequest,
        )
    }

    pub fn expire(&mut self) -> Result<ProposalStatus> {
        self.transition(
            ProposalStatus::Expired,
            &[ProposalStatus::Temporary, ProposalStatus::Pending],
            ErrorKind::TxNotPending,
        )
    }

    fn transition(
        &mut self,
        new_state: ProposalStatus,
        allowed_from: &[ProposalStatus],
        kind: ErrorKind,
    ) -> Result<ProposalStatus> {
        if !allowed_from.contains(&self.current_state) {
            return Err(WalletError::new(
                kind,
                format!(
                    "Invalid state transition for proposal_id={}: {} -> {}",
                    self.proposal_id, self.current_state, new_state
                ),
            ));
        }

        info!(
            "State transition for proposal_id={}: {} -> {}",
            self.proposal_id, self.current_state, new_state
        );

        self.current_state = new_state;
        Ok(new_state)
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    pub fn can_accept_votes(&self) -> bool {
        self.current_state == ProposalStatus::Pending
    }
}
