//! Identity and policy guards.
//!
//! Pure predicates shared by the engine operations and the proof harnesses.

use super::{AllocationDelegate, Identity, MAX_ACHIEVEMENTS, MAX_BENEFICIARIES, NO_IDENTITY};

/// Capability a proxy can be granted over an allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Capability {
    Terminate,
    Prolong,
    Augment,
}

/// Overseer must be set (not burned) and match the caller.
#[inline]
pub fn is_overseer(overseer: &Identity, caller: &Identity) -> bool {
    *overseer != NO_IDENTITY && overseer == caller
}

/// A beneficiary is a real identity distinct from the provider.
#[inline]
pub fn valid_beneficiary(beneficiary: &Identity, provider: &Identity) -> bool {
    *beneficiary != NO_IDENTITY && beneficiary != provider
}

/// Ids are dense from 1 up to the latest issued id.
#[inline]
pub fn valid_allocation_id(id: u64, latest: u64) -> bool {
    id >= 1 && id <= latest
}

#[inline]
pub fn valid_achievement_count(count: usize) -> bool {
    (1..=MAX_ACHIEVEMENTS).contains(&count)
}

#[inline]
pub fn valid_recipient_count(count: usize) -> bool {
    (1..=MAX_BENEFICIARIES).contains(&count)
}

/// Percentages must sum to exactly 100. Summed wide so no input can wrap.
#[inline]
pub fn percentages_balanced<I: IntoIterator<Item = u8>>(percentages: I) -> bool {
    percentages.into_iter().map(u64::from).sum::<u64>() == 100
}

/// A live delegation whose proxy is the caller and carries the capability.
#[inline]
pub fn proxy_may(
    delegate: &AllocationDelegate,
    caller: &Identity,
    now: u64,
    capability: Capability,
) -> bool {
    if !delegate.is_live(now) || delegate.proxy != *caller {
        return false;
    }
    let flag = match capability {
        Capability::Terminate => delegate.can_terminate,
        Capability::Prolong => delegate.can_prolong,
        Capability::Augment => delegate.can_augment,
    };
    flag != 0
}

#[inline]
pub fn release_per_achievement(quantity: u64, achievement_count: u8) -> u64 {
    if achievement_count == 0 {
        return 0;
    }
    quantity / achievement_count as u64
}

/// `quantity - per_achievement * validated`; `None` on underflow.
#[inline]
pub fn remaining_after(quantity: u64, achievement_count: u8, validated: u8) -> Option<u64> {
    let released = release_per_achievement(quantity, achievement_count).checked_mul(validated as u64)?;
    quantity.checked_sub(released)
}

/// A new velocity window starts once the gap strictly exceeds the window.
#[inline]
pub fn window_elapsed(last: u64, now: u64, window: u64) -> bool {
    now.saturating_sub(last) > window
}

/// Window counter after one more allocation at `now`.
#[inline]
pub fn next_window_count(last: u64, count: u64, now: u64, window: u64) -> u64 {
    if window_elapsed(last, now, window) {
        1
    } else {
        count.saturating_add(1)
    }
}
