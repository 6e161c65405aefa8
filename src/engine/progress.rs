//! Beneficiary-reported achievement progress.
//!
//! Progress reports never release funds and `validate_achievement` never reads
//! them; the two are independent records.

use super::{
    check_text, store_text, AllocationState, EscrowEngine, EscrowError, EscrowResult, Ledger,
    DESCRIPTION_LEN, FULL_COMPLETION,
};

impl EscrowEngine {
    pub fn record_achievement_progress<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
        achievement_index: u8,
        completion_percentage: u8,
        description: &[u8],
        verification_hash: [u8; 32],
    ) -> EscrowResult<bool> {
        let caller = ledger.caller_identity();
        let now = ledger.current_sequence();
        let slot = self.slot(id)?;
        let a = &slot.allocation;
        if a.beneficiary != caller {
            return Err(EscrowError::AccessDenied);
        }
        if completion_percentage > FULL_COMPLETION {
            return Err(EscrowError::InvalidAssetQuantity);
        }
        check_text(description, DESCRIPTION_LEN)?;
        if achievement_index >= a.achievement_count {
            return Err(EscrowError::InvalidAchievement);
        }
        if a.state() == Some(AllocationState::Returned) {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        if now >= a.expires_at {
            return Err(EscrowError::AlreadyLapsed);
        }
        // Locked once a report reached 100.
        if slot.progress[achievement_index as usize].is_complete() {
            return Err(EscrowError::EnhancementAlreadyRecorded);
        }

        let p = &mut self.slot_mut(id)?.progress[achievement_index as usize];
        p.description_len = store_text(&mut p.description, description)?;
        p.completion_percentage = completion_percentage;
        p.recorded_at = now;
        p.verification_hash = verification_hash;
        p.recorded = 1;
        Ok(true)
    }
}
