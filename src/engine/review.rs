//! Stake-backed community reviews.

use super::{
    check_text, deposit, release, store_text, EscrowEngine, EscrowError, EscrowResult, Ledger,
    RATIONALE_LEN,
};

impl EscrowEngine {
    /// Lock the review stake from the caller and open a review on `id`.
    pub fn submit_allocation_review<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
        rationale: &[u8],
    ) -> EscrowResult<bool> {
        let caller = ledger.caller_identity();
        let now = ledger.current_sequence();
        let slot = self.slot(id)?;
        if slot.review.submitted != 0 {
            return Err(EscrowError::ReviewExists);
        }
        check_text(rationale, RATIONALE_LEN)?;
        let stake = self.params.review_stake;

        deposit(ledger, &caller, stake)?;

        let review = &mut self.slot_mut(id)?.review;
        review.rationale_len = store_text(&mut review.rationale, rationale)?;
        review.reviewer = caller;
        review.review_stake = stake;
        review.submission_sequence = now;
        review.concluded = 0;
        review.review_validated = 0;
        review.submitted = 1;
        Ok(true)
    }

    /// Overseer settles a review inside its window: a valid review refunds the
    /// stake to the reviewer, an invalid one forfeits it to the overseer.
    pub fn resolve_allocation_review<L: Ledger>(
        &mut self,
        ledger: &mut L,
        id: u64,
        is_valid: bool,
    ) -> EscrowResult<bool> {
        let caller = ledger.caller_identity();
        self.require_overseer(&caller)?;
        let now = ledger.current_sequence();
        let review = &self.slot(id)?.review;
        if review.submitted == 0 {
            return Err(EscrowError::ResourceNotFound);
        }
        if review.concluded != 0 {
            return Err(EscrowError::AssetsAlreadyDisbursed);
        }
        if now.saturating_sub(review.submission_sequence) >= self.params.review_timeframe {
            return Err(EscrowError::ReviewPeriodEnded);
        }
        let recipient = if is_valid { review.reviewer } else { self.overseer };
        let stake = review.review_stake;

        release(ledger, &recipient, stake)?;

        let review = &mut self.slot_mut(id)?.review;
        review.concluded = 1;
        review.review_validated = is_valid as u8;
        Ok(true)
    }
}
