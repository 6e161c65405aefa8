//! Fixed-layout records stored in the engine tables.
//!
//! Every record is `Pod`: flags are `u8`, text is a byte array plus a length,
//! and explicit padding keeps the layout free of implicit gaps.

use bytemuck::{Pod, Zeroable};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::{
    guards, EscrowError, EscrowResult, Identity, DESCRIPTION_LEN, INDICATOR_LEN,
    JUSTIFICATION_LEN, MAX_ACHIEVEMENTS, MAX_BENEFICIARIES, RATIONALE_LEN,
};

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum AllocationState {
    Active = 1,
    Returned = 2,
    Terminated = 3,
    Flagged = 4,
    Recovered = 5,
}

impl AllocationState {
    /// Terminal states are final markers: nothing moves an allocation out of them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AllocationState::Returned | AllocationState::Terminated | AllocationState::Recovered
        )
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Allocation {
    pub provider: Identity,
    pub beneficiary: Identity,
    pub quantity: u64,
    pub initialized_at: u64,
    pub expires_at: u64,
    pub achievements: [u64; MAX_ACHIEVEMENTS],
    pub achievement_count: u8,
    pub validated_achievements: u8,
    pub state: u8,
    pub _padding: [u8; 5],
}

impl Allocation {
    pub fn state(&self) -> Option<AllocationState> {
        AllocationState::from_u8(self.state)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().map(AllocationState::is_terminal).unwrap_or(false)
    }

    pub fn achievements(&self) -> &[u64] {
        &self.achievements[..self.achievement_count as usize]
    }

    pub fn is_fully_validated(&self) -> bool {
        self.validated_achievements >= self.achievement_count
    }

    /// Amount released per validated achievement. The division remainder is
    /// only ever returned through termination, expiry or recovery.
    pub fn release_per_achievement(&self) -> u64 {
        guards::release_per_achievement(self.quantity, self.achievement_count)
    }

    pub fn remaining(&self) -> EscrowResult<u64> {
        guards::remaining_after(
            self.quantity,
            self.achievement_count,
            self.validated_achievements,
        )
        .ok_or(EscrowError::Overflow)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct AchievementProgress {
    pub recorded_at: u64,
    pub verification_hash: [u8; 32],
    pub completion_percentage: u8,
    pub recorded: u8,
    pub description_len: u8,
    pub _padding: [u8; 5],
    pub description: [u8; DESCRIPTION_LEN],
}

impl AchievementProgress {
    pub fn description(&self) -> &[u8] {
        &self.description[..self.description_len as usize]
    }

    pub fn is_complete(&self) -> bool {
        self.recorded != 0 && self.completion_percentage == super::FULL_COMPLETION
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct AllocationDelegate {
    pub proxy: Identity,
    pub proxy_access_expiry: u64,
    pub can_terminate: u8,
    pub can_prolong: u8,
    pub can_augment: u8,
    pub present: u8,
    pub _padding: [u8; 4],
}

impl AllocationDelegate {
    pub fn is_live(&self, now: u64) -> bool {
        self.present != 0 && self.proxy_access_expiry > now
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct AnomalousAllocationFlag {
    pub detected_by: Identity,
    pub indicator: [u8; INDICATOR_LEN],
    pub indicator_len: u8,
    pub flagged: u8,
    pub addressed: u8,
    pub _padding: [u8; 5],
}

impl AnomalousAllocationFlag {
    pub fn indicator(&self) -> &[u8] {
        &self.indicator[..self.indicator_len as usize]
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct AllocationReview {
    pub reviewer: Identity,
    pub review_stake: u64,
    pub submission_sequence: u64,
    pub rationale: [u8; RATIONALE_LEN],
    pub rationale_len: u8,
    pub submitted: u8,
    pub concluded: u8,
    pub review_validated: u8,
    pub _padding: [u8; 4],
}

impl AllocationReview {
    pub fn rationale(&self) -> &[u8] {
        &self.rationale[..self.rationale_len as usize]
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RecoveryRequest {
    pub justification: [u8; JUSTIFICATION_LEN],
    pub justification_len: u8,
    pub overseer_approved: u8,
    pub provider_approved: u8,
    pub opened: u8,
    pub _padding: [u8; 4],
}

impl RecoveryRequest {
    pub fn justification(&self) -> &[u8] {
        &self.justification[..self.justification_len as usize]
    }

    pub fn is_approved(&self) -> bool {
        self.overseer_approved != 0 && self.provider_approved != 0
    }
}

/// Everything keyed by one allocation id.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct AllocationSlot {
    pub allocation: Allocation,
    pub progress: [AchievementProgress; MAX_ACHIEVEMENTS],
    pub delegate: AllocationDelegate,
    pub review: AllocationReview,
    pub flag: AnomalousAllocationFlag,
    pub recovery: RecoveryRequest,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Recipient {
    pub beneficiary: Identity,
    pub percentage: u8,
    pub _padding: [u8; 7],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ProportionalAllocation {
    pub provider: Identity,
    pub total_quantity: u64,
    pub initialized_at: u64,
    pub recipients: [Recipient; MAX_BENEFICIARIES],
    pub recipient_count: u8,
    pub state: u8,
    pub _padding: [u8; 6],
}

impl ProportionalAllocation {
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients[..self.recipient_count as usize]
    }

    pub fn state(&self) -> Option<AllocationState> {
        AllocationState::from_u8(self.state)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ProviderActivity {
    pub provider: Identity,
    pub last_allocation_sequence: u64,
    pub allocations_in_window: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct VerifiedBeneficiary {
    pub beneficiary: Identity,
    pub verified: u8,
    pub _padding: [u8; 7],
}
