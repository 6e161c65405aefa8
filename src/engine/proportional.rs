//! Multi-beneficiary allocations split by percentage.

use super::guards;
use super::{
    deposit, AllocationState, EscrowEngine, EscrowError, EscrowResult, Identity, Ledger,
    Recipient, MAX_PROPORTIONAL_ALLOCATIONS,
};

impl EscrowEngine {
    /// Take custody of `quantity` for a set of `(beneficiary, percentage)`
    /// recipients. Funds stay in custody: no payout path exists for these.
    pub fn create_proportional_allocation<L: Ledger>(
        &mut self,
        ledger: &mut L,
        recipients: &[(Identity, u8)],
        quantity: u64,
    ) -> EscrowResult<u64> {
        let caller = ledger.caller_identity();
        if quantity == 0 {
            return Err(EscrowError::InvalidAssetQuantity);
        }
        if !guards::valid_recipient_count(recipients.len()) {
            return Err(EscrowError::BeneficiaryLimitExceeded);
        }
        if !guards::percentages_balanced(recipients.iter().map(|&(_, pct)| pct)) {
            return Err(EscrowError::InvalidAssetDistribution);
        }
        let id = self
            .latest_multi_allocation_id
            .checked_add(1)
            .ok_or(EscrowError::Overflow)?;
        if id as usize > MAX_PROPORTIONAL_ALLOCATIONS {
            return Err(EscrowError::RegistryFull);
        }
        let now = ledger.current_sequence();

        deposit(ledger, &caller, quantity)?;

        let p = &mut self.proportional[(id - 1) as usize];
        p.provider = caller;
        p.total_quantity = quantity;
        p.initialized_at = now;
        for (dst, &(beneficiary, percentage)) in p.recipients.iter_mut().zip(recipients) {
            *dst = Recipient {
                beneficiary,
                percentage,
                _padding: [0; 7],
            };
        }
        p.recipient_count = recipients.len() as u8;
        p.state = AllocationState::Active as u8;
        self.latest_multi_allocation_id = id;
        Ok(id)
    }
}
