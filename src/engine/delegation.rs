//! Time-bounded proxy control over an allocation.

use super::{AllocationDelegate, AllocationState, EscrowEngine, EscrowError, EscrowResult, Identity, Ledger};

/// Capabilities handed to a proxy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DelegateGrant {
    pub can_terminate: bool,
    pub can_prolong: bool,
    pub can_augment: bool,
}

impl EscrowEngine {
    /// Provider grants `proxy` the given capabilities for `duration` slots.
    /// Returns the access expiry.
    pub fn delegate_allocation_control<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
        proxy: Identity,
        grant: DelegateGrant,
        duration: u64,
    ) -> EscrowResult<u64> {
        let caller = ledger.caller_identity();
        let now = ledger.current_sequence();
        let slot = self.slot(id)?;
        let a = &slot.allocation;
        if a.provider != caller {
            return Err(EscrowError::AccessDenied);
        }
        if duration == 0 {
            return Err(EscrowError::InvalidAssetQuantity);
        }
        if a.state() != Some(AllocationState::Active) {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        if now >= a.expires_at {
            return Err(EscrowError::AlreadyLapsed);
        }
        if slot.delegate.is_live(now) {
            return Err(EscrowError::DelegationExists);
        }
        let expiry = now.checked_add(duration).ok_or(EscrowError::Overflow)?;

        self.slot_mut(id)?.delegate = AllocationDelegate {
            proxy,
            proxy_access_expiry: expiry,
            can_terminate: grant.can_terminate as u8,
            can_prolong: grant.can_prolong as u8,
            can_augment: grant.can_augment as u8,
            present: 1,
            _padding: [0; 4],
        };
        Ok(expiry)
    }
}
