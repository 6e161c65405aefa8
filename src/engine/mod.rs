//! Milestone escrow engine.
//!
//! Pure state machine over fixed-capacity tables. The engine never touches
//! accounts directly: every movement of funds goes through a [`Ledger`], and
//! every public operation orders its work as validate, transfer, write so that
//! a failed call leaves the tables untouched.

use bytemuck::{Pod, Zeroable};
use num_derive::FromPrimitive;
use thiserror::Error;

pub mod guards;
pub mod records;

mod batch;
mod delegation;
mod progress;
mod proportional;
mod protection;
mod recovery;
mod registry;
mod review;

pub use delegation::DelegateGrant;
pub use recovery::RecoveryOutcome;
pub use records::*;

/// Principal identity (a 32-byte public key).
pub type Identity = [u8; 32];

/// The all-zero identity marks an empty table entry.
pub const NO_IDENTITY: Identity = [0u8; 32];

pub const MAX_ACHIEVEMENTS: usize = 5;
pub const MAX_BENEFICIARIES: usize = 5;
pub const MAX_BATCH: usize = 10;

#[cfg(feature = "test")]
pub const MAX_ALLOCATIONS: usize = 64;
#[cfg(not(feature = "test"))]
pub const MAX_ALLOCATIONS: usize = 256;

pub const MAX_PROPORTIONAL_ALLOCATIONS: usize = 64;
pub const MAX_PROVIDERS: usize = 64;
pub const MAX_VERIFIED_BENEFICIARIES: usize = 64;

pub const DESCRIPTION_LEN: usize = 200;
pub const RATIONALE_LEN: usize = 200;
pub const JUSTIFICATION_LEN: usize = 120;
pub const INDICATOR_LEN: usize = 48;

pub const FULL_COMPLETION: u8 = 100;

// Declared for off-chain monitors; flagging stays manual.
pub const ANOMALOUS_QUANTITY_THRESHOLD: u64 = 1_000_000_000_000;
pub const ANOMALOUS_VELOCITY_THRESHOLD: u64 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
pub enum EscrowError {
    #[error("caller lacks the required role")]
    AccessDenied,
    #[error("no record exists for the given id")]
    ResourceNotFound,
    #[error("allocation id exceeds the highest issued id")]
    InvalidAllocationId,
    #[error("quantity or bound out of range")]
    InvalidAssetQuantity,
    #[error("achievement list or index out of range")]
    InvalidAchievement,
    #[error("allocation is fully disbursed or in a terminal state")]
    AssetsAlreadyDisbursed,
    #[error("ledger refused the transfer")]
    AssetTransferFailed,
    #[error("allocation has not lapsed yet")]
    AllocationLapsed,
    #[error("allocation has already lapsed")]
    AlreadyLapsed,
    #[error("recipient count out of range")]
    BeneficiaryLimitExceeded,
    #[error("recipient percentages do not sum to 100")]
    InvalidAssetDistribution,
    #[error("provider exceeded its allocation rate")]
    VelocityLimitExceeded,
    #[error("a review already exists for this allocation")]
    ReviewExists,
    #[error("review window has closed")]
    ReviewPeriodEnded,
    #[error("a live delegation already exists")]
    DelegationExists,
    #[error("achievement already reported complete")]
    EnhancementAlreadyRecorded,
    #[error("registry table is full")]
    RegistryFull,
    #[error("arithmetic overflow")]
    Overflow,
}

pub type EscrowResult<T> = Result<T, EscrowError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum TransferError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("no account is known for the identity")]
    UnknownAccount,
    #[error("source authority did not sign")]
    MissingAuthority,
    #[error("transfer rejected by the ledger")]
    Rejected,
}

/// Boundary to the hosting ledger.
pub trait Ledger {
    /// Atomically move `amount` from `from` to `to`.
    fn transfer(&mut self, amount: u64, from: &Identity, to: &Identity) -> Result<(), TransferError>;

    /// Monotonically non-decreasing sequence (slot height).
    fn current_sequence(&self) -> u64;

    /// Authenticated principal of the current invocation.
    fn caller_identity(&self) -> Identity;

    /// Identity custody funds are held under.
    fn custody_identity(&self) -> Identity;
}

/// Tunables fixed at registry creation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
pub struct EscrowParams {
    pub allocation_lifespan: u64,
    pub max_extension_time: u64,
    pub review_stake: u64,
    pub review_timeframe: u64,
    pub velocity_window: u64,
    pub max_allocations_per_window: u64,
}

impl EscrowParams {
    pub const DEFAULT: EscrowParams = EscrowParams {
        allocation_lifespan: 1008,
        max_extension_time: 1008,
        review_stake: 1_000_000,
        review_timeframe: 144,
        velocity_window: 144,
        max_allocations_per_window: 5,
    };

    pub fn is_valid(&self) -> bool {
        self.allocation_lifespan > 0
            && self.review_timeframe > 0
            && self.max_allocations_per_window > 0
    }
}

impl Default for EscrowParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// All persistent escrow state. Lives in place inside the registry account,
/// so it is never moved by value.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct EscrowEngine {
    pub params: EscrowParams,
    pub overseer: Identity,
    pub latest_allocation_id: u64,
    pub latest_multi_allocation_id: u64,
    pub provider_count: u64,
    pub verified_count: u64,
    pub system_paused: u8,
    pub _padding: [u8; 7],
    pub allocations: [AllocationSlot; MAX_ALLOCATIONS],
    pub proportional: [ProportionalAllocation; MAX_PROPORTIONAL_ALLOCATIONS],
    pub providers: [ProviderActivity; MAX_PROVIDERS],
    pub verified: [VerifiedBeneficiary; MAX_VERIFIED_BENEFICIARIES],
}

impl EscrowEngine {
    /// Reset every table and install the overseer and params.
    pub fn init(&mut self, overseer: Identity, params: EscrowParams) {
        bytemuck::bytes_of_mut(self).fill(0);
        self.overseer = overseer;
        self.params = params;
    }

    pub fn is_paused(&self) -> bool {
        self.system_paused != 0
    }

    pub fn allocation(&self, id: u64) -> EscrowResult<&Allocation> {
        Ok(&self.slot(id)?.allocation)
    }

    pub fn achievement_progress(&self, id: u64, index: usize) -> EscrowResult<Option<&AchievementProgress>> {
        let slot = self.slot(id)?;
        Ok(slot.progress.get(index).filter(|p| p.recorded != 0))
    }

    pub fn delegate(&self, id: u64) -> EscrowResult<Option<&AllocationDelegate>> {
        let slot = self.slot(id)?;
        Ok(Some(&slot.delegate).filter(|d| d.present != 0))
    }

    pub fn anomaly_flag(&self, id: u64) -> EscrowResult<Option<&AnomalousAllocationFlag>> {
        let slot = self.slot(id)?;
        Ok(Some(&slot.flag).filter(|f| f.flagged != 0))
    }

    pub fn review(&self, id: u64) -> EscrowResult<Option<&AllocationReview>> {
        let slot = self.slot(id)?;
        Ok(Some(&slot.review).filter(|r| r.submitted != 0))
    }

    pub fn recovery_request(&self, id: u64) -> EscrowResult<Option<&RecoveryRequest>> {
        let slot = self.slot(id)?;
        Ok(Some(&slot.recovery).filter(|r| r.opened != 0))
    }

    pub fn proportional_allocation(&self, id: u64) -> EscrowResult<&ProportionalAllocation> {
        if !guards::valid_allocation_id(id, self.latest_multi_allocation_id) {
            return Err(EscrowError::ResourceNotFound);
        }
        self.proportional
            .get((id - 1) as usize)
            .ok_or(EscrowError::ResourceNotFound)
    }

    pub fn provider_activity(&self, provider: &Identity) -> Option<&ProviderActivity> {
        self.find_provider(provider).map(|i| &self.providers[i])
    }

    pub fn is_verified(&self, beneficiary: &Identity) -> bool {
        self.find_verified(beneficiary)
            .map(|i| self.verified[i].verified != 0)
            .unwrap_or(false)
    }

    /// Quantity still held in custody for the allocation.
    pub fn remaining_quantity(&self, id: u64) -> EscrowResult<u64> {
        self.allocation(id)?.remaining()
    }

    pub(crate) fn slot(&self, id: u64) -> EscrowResult<&AllocationSlot> {
        if !guards::valid_allocation_id(id, self.latest_allocation_id) {
            return Err(EscrowError::ResourceNotFound);
        }
        self.allocations
            .get((id - 1) as usize)
            .ok_or(EscrowError::ResourceNotFound)
    }

    pub(crate) fn slot_mut(&mut self, id: u64) -> EscrowResult<&mut AllocationSlot> {
        if !guards::valid_allocation_id(id, self.latest_allocation_id) {
            return Err(EscrowError::ResourceNotFound);
        }
        self.allocations
            .get_mut((id - 1) as usize)
            .ok_or(EscrowError::ResourceNotFound)
    }

    pub(crate) fn find_provider(&self, provider: &Identity) -> Option<usize> {
        self.providers[..self.provider_count as usize]
            .iter()
            .position(|p| p.provider == *provider)
    }

    pub(crate) fn find_verified(&self, beneficiary: &Identity) -> Option<usize> {
        self.verified[..self.verified_count as usize]
            .iter()
            .position(|v| v.beneficiary == *beneficiary)
    }

    pub(crate) fn require_overseer(&self, caller: &Identity) -> EscrowResult<()> {
        if !guards::is_overseer(&self.overseer, caller) {
            return Err(EscrowError::AccessDenied);
        }
        Ok(())
    }
}

/// Move `amount` from `from` into custody.
pub(crate) fn deposit<L: Ledger>(ledger: &mut L, from: &Identity, amount: u64) -> EscrowResult<()> {
    let custody = ledger.custody_identity();
    ledger
        .transfer(amount, from, &custody)
        .map_err(|_| EscrowError::AssetTransferFailed)
}

/// Move `amount` out of custody to `to`.
pub(crate) fn release<L: Ledger>(ledger: &mut L, to: &Identity, amount: u64) -> EscrowResult<()> {
    let custody = ledger.custody_identity();
    ledger
        .transfer(amount, &custody, to)
        .map_err(|_| EscrowError::AssetTransferFailed)
}

/// Copy `src` into a fixed text field, returning the stored length.
pub(crate) fn store_text(dst: &mut [u8], src: &[u8]) -> EscrowResult<u8> {
    if src.len() > dst.len() || src.len() > u8::MAX as usize {
        return Err(EscrowError::InvalidAssetQuantity);
    }
    dst.fill(0);
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len() as u8)
}

pub(crate) fn check_text(src: &[u8], max: usize) -> EscrowResult<()> {
    if src.len() > max {
        return Err(EscrowError::InvalidAssetQuantity);
    }
    Ok(())
}
