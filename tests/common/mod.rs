//! In-memory ledger shared by the engine-level test suites.

#![allow(dead_code)]

use std::collections::HashMap;

use milestone_escrow_prog::engine::{EscrowEngine, EscrowParams, Identity, Ledger, TransferError};

pub const OVERSEER: Identity = [0xAA; 32];
pub const CUSTODY: Identity = [0xCC; 32];

pub fn id(n: u8) -> Identity {
    [n; 32]
}

pub struct MockLedger {
    pub balances: HashMap<Identity, u64>,
    pub sequence: u64,
    pub caller: Identity,
    /// When set, every transfer is refused.
    pub refuse: bool,
    pub transfers: usize,
}

impl MockLedger {
    pub fn new(sequence: u64) -> Self {
        Self {
            balances: HashMap::new(),
            sequence,
            caller: OVERSEER,
            refuse: false,
            transfers: 0,
        }
    }

    pub fn fund(&mut self, who: Identity, amount: u64) {
        *self.balances.entry(who).or_insert(0) += amount;
    }

    pub fn balance(&self, who: &Identity) -> u64 {
        self.balances.get(who).copied().unwrap_or(0)
    }

    pub fn custody(&self) -> u64 {
        self.balance(&CUSTODY)
    }

    pub fn total(&self) -> u128 {
        self.balances.values().map(|&b| b as u128).sum()
    }

    pub fn as_caller(&mut self, who: Identity) -> &mut Self {
        self.caller = who;
        self
    }

    pub fn at(&mut self, sequence: u64) -> &mut Self {
        self.sequence = sequence;
        self
    }
}

impl Ledger for MockLedger {
    fn transfer(&mut self, amount: u64, from: &Identity, to: &Identity) -> Result<(), TransferError> {
        if self.refuse {
            return Err(TransferError::Rejected);
        }
        let src = self.balance(from);
        if src < amount {
            return Err(TransferError::InsufficientFunds);
        }
        self.balances.insert(*from, src - amount);
        *self.balances.entry(*to).or_insert(0) += amount;
        self.transfers += 1;
        Ok(())
    }

    fn current_sequence(&self) -> u64 {
        self.sequence
    }

    fn caller_identity(&self) -> Identity {
        self.caller
    }

    fn custody_identity(&self) -> Identity {
        CUSTODY
    }
}

/// Engine on the heap, initialized with `params` and the shared overseer.
pub fn new_engine(params: EscrowParams) -> Box<EscrowEngine> {
    let mut engine: Box<EscrowEngine> = bytemuck::zeroed_box();
    engine.init(OVERSEER, params);
    engine
}
