//! Anomaly flagging, provider velocity limiting, the pause switch and the
//! verified-beneficiary initiation path built on them.

use super::guards;
use super::registry::check_allocation_terms;
use super::{
    check_text, store_text, AllocationState, EscrowEngine, EscrowError, EscrowResult, Identity,
    Ledger, ProviderActivity, VerifiedBeneficiary, INDICATOR_LEN, MAX_PROVIDERS,
    MAX_VERIFIED_BENEFICIARIES,
};

impl EscrowEngine {
    /// Overseer or beneficiary marks the allocation as flagged.
    pub fn flag_anomalous_allocation<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
        indicator: &[u8],
    ) -> EscrowResult<bool> {
        let caller = ledger.caller_identity();
        let a = self.allocation(id)?;
        if !guards::is_overseer(&self.overseer, &caller) && a.beneficiary != caller {
            return Err(EscrowError::AccessDenied);
        }
        check_text(indicator, INDICATOR_LEN)?;
        if a.is_terminal() {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }

        let slot = self.slot_mut(id)?;
        slot.flag.indicator_len = store_text(&mut slot.flag.indicator, indicator)?;
        slot.flag.detected_by = caller;
        slot.flag.addressed = 0;
        slot.flag.flagged = 1;
        slot.allocation.state = AllocationState::Flagged as u8;
        Ok(true)
    }

    /// Overseer marks an existing flag as dealt with. Allocation state is left alone.
    pub fn address_anomaly_flag<L: Ledger>(&mut self, ledger: &mut L, id: u64) -> EscrowResult<bool> {
        self.require_overseer(&ledger.caller_identity())?;
        let slot = self.slot_mut(id)?;
        if slot.flag.flagged == 0 {
            return Err(EscrowError::ResourceNotFound);
        }
        slot.flag.addressed = 1;
        Ok(true)
    }

    pub fn set_system_operational_state<L: Ledger>(
        &mut self,
        ledger: &mut L,
        paused: bool,
    ) -> EscrowResult<bool> {
        self.require_overseer(&ledger.caller_identity())?;
        self.system_paused = paused as u8;
        Ok(true)
    }

    pub fn set_beneficiary_verification<L: Ledger>(
        &mut self,
        ledger: &mut L,
        beneficiary: Identity,
        verified: bool,
    ) -> EscrowResult<bool> {
        self.require_overseer(&ledger.caller_identity())?;
        let idx = match self.find_verified(&beneficiary) {
            Some(idx) => idx,
            // Nothing to revoke.
            None if !verified => return Ok(true),
            None => {
                let idx = self.verified_count as usize;
                if idx >= MAX_VERIFIED_BENEFICIARIES {
                    return Err(EscrowError::RegistryFull);
                }
                self.verified_count += 1;
                idx
            }
        };
        self.verified[idx] = VerifiedBeneficiary {
            beneficiary,
            verified: verified as u8,
            _padding: [0; 7],
        };
        Ok(true)
    }

    /// Allocation path gated on the pause switch and beneficiary verification.
    pub fn secure_allocation_initiation<L: Ledger>(
        &mut self,
        ledger: &mut L,
        beneficiary: Identity,
        quantity: u64,
        achievements: &[u64],
    ) -> EscrowResult<u64> {
        let caller = ledger.caller_identity();
        if self.is_paused() {
            return Err(EscrowError::AccessDenied);
        }
        if !self.is_verified(&beneficiary) {
            return Err(EscrowError::AccessDenied);
        }
        check_allocation_terms(&caller, &beneficiary, quantity, achievements)?;
        self.open_allocation(ledger, caller, beneficiary, quantity, achievements)
    }

    /// Rate-limited front of [`EscrowEngine::secure_allocation_initiation`].
    /// The provider's window counter is only committed when the allocation is.
    pub fn velocity_limited_allocation<L: Ledger>(
        &mut self,
        ledger: &mut L,
        beneficiary: Identity,
        quantity: u64,
        achievements: &[u64],
    ) -> EscrowResult<u64> {
        let caller = ledger.caller_identity();
        let now = ledger.current_sequence();
        let existing = self.find_provider(&caller);
        let monitor_idx = match existing {
            Some(idx) => idx,
            None if (self.provider_count as usize) < MAX_PROVIDERS => self.provider_count as usize,
            None => return Err(EscrowError::RegistryFull),
        };
        let (last, count) = match existing {
            Some(idx) => (
                self.providers[idx].last_allocation_sequence,
                self.providers[idx].allocations_in_window,
            ),
            None => (0, 0),
        };
        let count = guards::next_window_count(last, count, now, self.params.velocity_window);
        if count > self.params.max_allocations_per_window {
            return Err(EscrowError::VelocityLimitExceeded);
        }

        let id = self.secure_allocation_initiation(ledger, beneficiary, quantity, achievements)?;

        self.providers[monitor_idx] = ProviderActivity {
            provider: caller,
            last_allocation_sequence: now,
            allocations_in_window: count,
        };
        if existing.is_none() {
            self.provider_count += 1;
        }
        Ok(id)
    }
}
