//! Dual-approval emergency recovery.

use super::guards;
use super::{
    check_text, release, store_text, AllocationState, EscrowEngine, EscrowError, EscrowResult,
    Ledger, JUSTIFICATION_LEN,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryOutcome {
    /// One approval is still missing; no funds moved.
    Pending,
    /// Both approvals present; `amount` went back to the provider.
    Recovered { amount: u64 },
}

impl EscrowEngine {
    /// Record the caller's approval. Once overseer and provider have both
    /// approved, the unreleased remainder goes back to the provider.
    pub fn request_asset_recovery<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
        justification: &[u8],
    ) -> EscrowResult<RecoveryOutcome> {
        let caller = ledger.caller_identity();
        let slot = self.slot(id)?;
        let a = &slot.allocation;
        let as_overseer = guards::is_overseer(&self.overseer, &caller);
        let as_provider = a.provider == caller;
        if !as_overseer && !as_provider {
            return Err(EscrowError::AccessDenied);
        }
        check_text(justification, JUSTIFICATION_LEN)?;
        if a.is_terminal() {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }

        let mut request = slot.recovery;
        request.justification_len = store_text(&mut request.justification, justification)?;
        request.opened = 1;
        if as_overseer {
            request.overseer_approved = 1;
        }
        if as_provider {
            request.provider_approved = 1;
        }

        if !request.is_approved() {
            self.slot_mut(id)?.recovery = request;
            return Ok(RecoveryOutcome::Pending);
        }

        let amount = a.remaining()?;
        let provider = a.provider;

        release(ledger, &provider, amount)?;

        let slot = self.slot_mut(id)?;
        slot.recovery = request;
        slot.allocation.state = AllocationState::Recovered as u8;
        Ok(RecoveryOutcome::Recovered { amount })
    }
}
