//! Batch achievement validation.

use super::{EscrowEngine, EscrowError, EscrowResult, Ledger, MAX_BATCH};

impl EscrowEngine {
    /// Validate one achievement per listed id, left to right, stopping at the
    /// first failure. A pre-flight pass rejects the batch before any release
    /// when an entry would fail on engine state; only a ledger refusal midway
    /// can leave earlier releases in place, and the host rolls those back.
    pub fn batch_validate_achievements<L: Ledger>(
        &mut self,
        ledger: &mut L,
        ids: &[u64],
    ) -> EscrowResult<bool> {
        self.require_overseer(&ledger.caller_identity())?;
        if ids.len() > MAX_BATCH {
            return Err(EscrowError::InvalidAssetQuantity);
        }

        for (i, &id) in ids.iter().enumerate() {
            let pending = ids[..i].iter().filter(|&&prev| prev == id).count();
            self.check_releasable(id, pending)?;
        }

        for &id in ids {
            self.release_next_achievement(ledger, id)?;
        }
        Ok(true)
    }
}
