//! Single-beneficiary allocation lifecycle.

use super::guards::{self, Capability};
use super::{
    deposit, release, AllocationState, EscrowEngine, EscrowError, EscrowResult, Identity, Ledger,
    MAX_ALLOCATIONS,
};

/// Checks shared by every allocation-creating entry point.
pub(crate) fn check_allocation_terms(
    provider: &Identity,
    beneficiary: &Identity,
    quantity: u64,
    achievements: &[u64],
) -> EscrowResult<()> {
    if quantity == 0 {
        return Err(EscrowError::InvalidAssetQuantity);
    }
    if !guards::valid_beneficiary(beneficiary, provider) {
        return Err(EscrowError::AccessDenied);
    }
    if !guards::valid_achievement_count(achievements.len()) {
        return Err(EscrowError::InvalidAchievement);
    }
    Ok(())
}

impl EscrowEngine {
    pub fn initiate_allocation<L: Ledger>(
        &mut self,
        ledger: &mut L,
        beneficiary: Identity,
        quantity: u64,
        achievements: &[u64],
    ) -> EscrowResult<u64> {
        let caller = ledger.caller_identity();
        check_allocation_terms(&caller, &beneficiary, quantity, achievements)?;
        self.open_allocation(ledger, caller, beneficiary, quantity, achievements)
    }

    /// Take custody of `quantity` and record a fresh active allocation.
    /// Terms must already be checked.
    pub(crate) fn open_allocation<L: Ledger>(
        &mut self,
        ledger: &mut L,
        provider: Identity,
        beneficiary: Identity,
        quantity: u64,
        achievements: &[u64],
    ) -> EscrowResult<u64> {
        let id = self
            .latest_allocation_id
            .checked_add(1)
            .ok_or(EscrowError::Overflow)?;
        if id as usize > MAX_ALLOCATIONS {
            return Err(EscrowError::RegistryFull);
        }
        let now = ledger.current_sequence();
        let expires_at = now
            .checked_add(self.params.allocation_lifespan)
            .ok_or(EscrowError::Overflow)?;

        deposit(ledger, &provider, quantity)?;

        let a = &mut self.allocations[(id - 1) as usize].allocation;
        a.provider = provider;
        a.beneficiary = beneficiary;
        a.quantity = quantity;
        a.initialized_at = now;
        a.expires_at = expires_at;
        a.achievements = [0; super::MAX_ACHIEVEMENTS];
        a.achievements[..achievements.len()].copy_from_slice(achievements);
        a.achievement_count = achievements.len() as u8;
        a.validated_achievements = 0;
        a.state = AllocationState::Active as u8;
        self.latest_allocation_id = id;
        Ok(id)
    }

    /// Release one achievement's share to the beneficiary. Overseer only.
    pub fn validate_achievement<L: Ledger>(&mut self, ledger: &mut L, id: u64) -> EscrowResult<bool> {
        self.require_overseer(&ledger.caller_identity())?;
        self.release_next_achievement(ledger, id)
    }

    /// Allocation that can release another achievement once `pending` earlier
    /// releases in the same call have landed.
    pub(crate) fn check_releasable(&self, id: u64, pending: usize) -> EscrowResult<()> {
        if id > self.latest_allocation_id {
            return Err(EscrowError::InvalidAllocationId);
        }
        let a = self.allocation(id)?;
        if a.is_terminal() {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        if a.validated_achievements as usize + pending >= a.achievement_count as usize {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        Ok(())
    }

    pub(crate) fn release_next_achievement<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
    ) -> EscrowResult<bool> {
        self.check_releasable(id, 0)?;
        let a = self.allocation(id)?;
        let amount = a.release_per_achievement();
        let beneficiary = a.beneficiary;

        release(ledger, &beneficiary, amount)?;

        self.slot_mut(id)?.allocation.validated_achievements += 1;
        Ok(true)
    }

    /// Provider (or a proxy with the terminate capability) pulls back the
    /// unreleased remainder before expiry. Returns the amount returned.
    pub fn terminate_allocation<L: Ledger>(&mut self, ledger: &mut L, id: u64) -> EscrowResult<u64> {
        let caller = ledger.caller_identity();
        let now = ledger.current_sequence();
        let slot = self.slot(id)?;
        let a = &slot.allocation;
        if a.provider != caller && !guards::proxy_may(&slot.delegate, &caller, now, Capability::Terminate) {
            return Err(EscrowError::AccessDenied);
        }
        if now >= a.expires_at {
            return Err(EscrowError::AlreadyLapsed);
        }
        if a.state() != Some(AllocationState::Active) {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        let remaining = a.remaining()?;
        let provider = a.provider;

        release(ledger, &provider, remaining)?;

        self.slot_mut(id)?.allocation.state = AllocationState::Terminated as u8;
        Ok(remaining)
    }

    /// Overseer returns the full quantity to the provider after expiry.
    pub fn return_assets<L: Ledger>(&mut self, ledger: &mut L, id: u64) -> EscrowResult<u64> {
        self.require_overseer(&ledger.caller_identity())?;
        let now = ledger.current_sequence();
        let a = self.allocation(id)?;
        if now <= a.expires_at {
            return Err(EscrowError::AllocationLapsed);
        }
        if a.is_terminal() {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        let quantity = a.quantity;
        let provider = a.provider;

        release(ledger, &provider, quantity)?;

        self.slot_mut(id)?.allocation.state = AllocationState::Returned as u8;
        Ok(quantity)
    }

    /// Push expiry out by `extension`. Returns the new expiry.
    pub fn extend_allocation_timeframe<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
        extension: u64,
    ) -> EscrowResult<u64> {
        let caller = ledger.caller_identity();
        let now = ledger.current_sequence();
        let slot = self.slot(id)?;
        let a = &slot.allocation;
        if a.provider != caller && !guards::proxy_may(&slot.delegate, &caller, now, Capability::Prolong) {
            return Err(EscrowError::AccessDenied);
        }
        if extension > self.params.max_extension_time {
            return Err(EscrowError::InvalidAssetQuantity);
        }
        if now >= a.expires_at {
            return Err(EscrowError::AlreadyLapsed);
        }
        if a.is_terminal() {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        let expires_at = a
            .expires_at
            .checked_add(extension)
            .ok_or(EscrowError::Overflow)?;

        self.slot_mut(id)?.allocation.expires_at = expires_at;
        Ok(expires_at)
    }

    /// Top up the allocation from the caller. Returns the new quantity.
    pub fn augment_allocation_quantity<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
        additional: u64,
    ) -> EscrowResult<u64> {
        let caller = ledger.caller_identity();
        let now = ledger.current_sequence();
        let slot = self.slot(id)?;
        let a = &slot.allocation;
        if a.provider != caller && !guards::proxy_may(&slot.delegate, &caller, now, Capability::Augment) {
            return Err(EscrowError::AccessDenied);
        }
        if additional == 0 {
            return Err(EscrowError::InvalidAssetQuantity);
        }
        if now >= a.expires_at {
            return Err(EscrowError::AlreadyLapsed);
        }
        if a.is_terminal() {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        let quantity = a
            .quantity
            .checked_add(additional)
            .ok_or(EscrowError::Overflow)?;

        deposit(ledger, &caller, additional)?;

        self.slot_mut(id)?.allocation.quantity = quantity;
        Ok(quantity)
    }
}
