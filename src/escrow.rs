//! Milestone Escrow: single-file Solana program wrapping the escrow engine.

pub mod engine;

// 1. mod constants
pub mod constants {
    use crate::engine::EscrowEngine;
    use crate::state::{RegistryConfig, RegistryHeader};
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x4d53455343524f57; // "MSESCROW"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = size_of::<RegistryHeader>();
    pub const CONFIG_LEN: usize = size_of::<RegistryConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<EscrowEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<EscrowEngine>();
    pub const REGISTRY_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    pub const VAULT_SEED: &[u8] = b"vault";
}

// 2. mod error
pub mod error {
    use crate::engine::EscrowError;
    use num_derive::FromPrimitive;
    use solana_program::{decode_error::DecodeError, program_error::ProgramError};
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
    pub enum EscrowProgramError {
        #[error("registry version mismatch")]
        InvalidVersion,
        #[error("registry already initialized")]
        AlreadyInitialized,
        #[error("registry not initialized")]
        NotInitialized,
        #[error("registry account has the wrong length")]
        InvalidRegistryLen,
        #[error("vault is not the registry's token vault")]
        InvalidVault,
        #[error("token account mint mismatch")]
        InvalidMint,
        #[error("registry parameters out of range")]
        InvalidConfigParam,
        #[error("account must sign")]
        ExpectedSigner,
        #[error("account must be writable")]
        ExpectedWritable,
        // Engine errors mapped:
        #[error("access denied")]
        EngineAccessDenied,
        #[error("resource not found")]
        EngineResourceNotFound,
        #[error("invalid allocation id")]
        EngineInvalidAllocationId,
        #[error("invalid asset quantity")]
        EngineInvalidAssetQuantity,
        #[error("invalid achievement")]
        EngineInvalidAchievement,
        #[error("assets already disbursed")]
        EngineAssetsAlreadyDisbursed,
        #[error("asset transfer failed")]
        EngineAssetTransferFailed,
        #[error("allocation has not lapsed")]
        EngineAllocationLapsed,
        #[error("allocation already lapsed")]
        EngineAlreadyLapsed,
        #[error("beneficiary limit exceeded")]
        EngineBeneficiaryLimitExceeded,
        #[error("invalid asset distribution")]
        EngineInvalidAssetDistribution,
        #[error("velocity limit exceeded")]
        EngineVelocityLimitExceeded,
        #[error("review exists")]
        EngineReviewExists,
        #[error("review period ended")]
        EngineReviewPeriodEnded,
        #[error("delegation exists")]
        EngineDelegationExists,
        #[error("enhancement already recorded")]
        EngineEnhancementAlreadyRecorded,
        #[error("registry full")]
        EngineRegistryFull,
        #[error("arithmetic overflow")]
        EngineOverflow,
    }

    impl From<EscrowProgramError> for ProgramError {
        fn from(e: EscrowProgramError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for EscrowProgramError {
        fn type_of() -> &'static str {
            "EscrowProgramError"
        }
    }

    pub fn map_escrow_error(e: EscrowError) -> ProgramError {
        let err = match e {
            EscrowError::AccessDenied => EscrowProgramError::EngineAccessDenied,
            EscrowError::ResourceNotFound => EscrowProgramError::EngineResourceNotFound,
            EscrowError::InvalidAllocationId => EscrowProgramError::EngineInvalidAllocationId,
            EscrowError::InvalidAssetQuantity => EscrowProgramError::EngineInvalidAssetQuantity,
            EscrowError::InvalidAchievement => EscrowProgramError::EngineInvalidAchievement,
            EscrowError::AssetsAlreadyDisbursed => EscrowProgramError::EngineAssetsAlreadyDisbursed,
            EscrowError::AssetTransferFailed => EscrowProgramError::EngineAssetTransferFailed,
            EscrowError::AllocationLapsed => EscrowProgramError::EngineAllocationLapsed,
            EscrowError::AlreadyLapsed => EscrowProgramError::EngineAlreadyLapsed,
            EscrowError::BeneficiaryLimitExceeded => EscrowProgramError::EngineBeneficiaryLimitExceeded,
            EscrowError::InvalidAssetDistribution => EscrowProgramError::EngineInvalidAssetDistribution,
            EscrowError::VelocityLimitExceeded => EscrowProgramError::EngineVelocityLimitExceeded,
            EscrowError::ReviewExists => EscrowProgramError::EngineReviewExists,
            EscrowError::ReviewPeriodEnded => EscrowProgramError::EngineReviewPeriodEnded,
            EscrowError::DelegationExists => EscrowProgramError::EngineDelegationExists,
            EscrowError::EnhancementAlreadyRecorded => EscrowProgramError::EngineEnhancementAlreadyRecorded,
            EscrowError::RegistryFull => EscrowProgramError::EngineRegistryFull,
            EscrowError::Overflow => EscrowProgramError::EngineOverflow,
        };
        ProgramError::Custom(err as u32)
    }
}

// 3. mod ix
//
// Wire format: one tag byte, then little-endian fixed-width fields. Pubkeys
// are 32 raw bytes. Lists and text carry a one-byte length prefix.
pub mod ix {
    use crate::engine::{DelegateGrant, EscrowParams, Identity, MAX_BATCH, MAX_BENEFICIARIES};
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    /// Up to `MAX_BATCH` u64 values (achievement ids or allocation ids).
    #[derive(Clone, Copy, Debug)]
    pub struct IdList {
        items: [u64; MAX_BATCH],
        len: usize,
    }

    impl IdList {
        pub fn as_slice(&self) -> &[u64] {
            &self.items[..self.len]
        }
    }

    #[derive(Clone, Copy, Debug)]
    pub struct RecipientList {
        items: [(Identity, u8); MAX_BENEFICIARIES],
        len: usize,
    }

    impl RecipientList {
        pub fn as_slice(&self) -> &[(Identity, u8)] {
            &self.items[..self.len]
        }
    }

    pub const DELEGATE_TERMINATE: u8 = 1 << 0;
    pub const DELEGATE_PROLONG: u8 = 1 << 1;
    pub const DELEGATE_AUGMENT: u8 = 1 << 2;

    #[derive(Debug)]
    pub enum Instruction<'a> {
        InitRegistry { params: EscrowParams },
        InitiateAllocation { beneficiary: Pubkey, quantity: u64, achievements: IdList },
        ValidateAchievement { allocation_id: u64 },
        TerminateAllocation { allocation_id: u64 },
        ReturnAssets { allocation_id: u64 },
        ExtendAllocationTimeframe { allocation_id: u64, extension: u64 },
        AugmentAllocationQuantity { allocation_id: u64, additional: u64 },
        CreateProportionalAllocation { recipients: RecipientList, quantity: u64 },
        RecordAchievementProgress {
            allocation_id: u64,
            achievement_index: u8,
            completion_percentage: u8,
            verification_hash: [u8; 32],
            description: &'a [u8],
        },
        FlagAnomalousAllocation { allocation_id: u64, indicator: &'a [u8] },
        VelocityLimitedAllocation { beneficiary: Pubkey, quantity: u64, achievements: IdList },
        SetSystemOperationalState { paused: bool },
        SecureAllocationInitiation { beneficiary: Pubkey, quantity: u64, achievements: IdList },
        SubmitAllocationReview { allocation_id: u64, rationale: &'a [u8] },
        ResolveAllocationReview { allocation_id: u64, is_valid: bool },
        DelegateAllocationControl {
            allocation_id: u64,
            proxy: Pubkey,
            grant: DelegateGrant,
            duration: u64,
        },
        RequestAssetRecovery { allocation_id: u64, justification: &'a [u8] },
        BatchValidateAchievements { allocation_ids: IdList },
        SetBeneficiaryVerification { beneficiary: Pubkey, verified: bool },
        AddressAnomalyFlag { allocation_id: u64 },
    }

    impl<'a> Instruction<'a> {
        pub fn decode(input: &'a [u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            let ix = match tag {
                0 => {
                    let params = EscrowParams {
                        allocation_lifespan: read_u64(&mut rest)?,
                        max_extension_time: read_u64(&mut rest)?,
                        review_stake: read_u64(&mut rest)?,
                        review_timeframe: read_u64(&mut rest)?,
                        velocity_window: read_u64(&mut rest)?,
                        max_allocations_per_window: read_u64(&mut rest)?,
                    };
                    Instruction::InitRegistry { params }
                }
                1 | 10 | 12 => {
                    let beneficiary = read_pubkey(&mut rest)?;
                    let quantity = read_u64(&mut rest)?;
                    let achievements = read_id_list(&mut rest)?;
                    match tag {
                        1 => Instruction::InitiateAllocation { beneficiary, quantity, achievements },
                        10 => Instruction::VelocityLimitedAllocation { beneficiary, quantity, achievements },
                        _ => Instruction::SecureAllocationInitiation { beneficiary, quantity, achievements },
                    }
                }
                2 => Instruction::ValidateAchievement { allocation_id: read_u64(&mut rest)? },
                3 => Instruction::TerminateAllocation { allocation_id: read_u64(&mut rest)? },
                4 => Instruction::ReturnAssets { allocation_id: read_u64(&mut rest)? },
                5 => {
                    let allocation_id = read_u64(&mut rest)?;
                    let extension = read_u64(&mut rest)?;
                    Instruction::ExtendAllocationTimeframe { allocation_id, extension }
                }
                6 => {
                    let allocation_id = read_u64(&mut rest)?;
                    let additional = read_u64(&mut rest)?;
                    Instruction::AugmentAllocationQuantity { allocation_id, additional }
                }
                7 => {
                    let recipients = read_recipients(&mut rest)?;
                    let quantity = read_u64(&mut rest)?;
                    Instruction::CreateProportionalAllocation { recipients, quantity }
                }
                8 => {
                    let allocation_id = read_u64(&mut rest)?;
                    let achievement_index = read_u8(&mut rest)?;
                    let completion_percentage = read_u8(&mut rest)?;
                    let verification_hash = read_array32(&mut rest)?;
                    let description = read_text(&mut rest)?;
                    Instruction::RecordAchievementProgress {
                        allocation_id,
                        achievement_index,
                        completion_percentage,
                        verification_hash,
                        description,
                    }
                }
                9 => {
                    let allocation_id = read_u64(&mut rest)?;
                    let indicator = read_text(&mut rest)?;
                    Instruction::FlagAnomalousAllocation { allocation_id, indicator }
                }
                11 => Instruction::SetSystemOperationalState { paused: read_bool(&mut rest)? },
                13 => {
                    let allocation_id = read_u64(&mut rest)?;
                    let rationale = read_text(&mut rest)?;
                    Instruction::SubmitAllocationReview { allocation_id, rationale }
                }
                14 => {
                    let allocation_id = read_u64(&mut rest)?;
                    let is_valid = read_bool(&mut rest)?;
                    Instruction::ResolveAllocationReview { allocation_id, is_valid }
                }
                15 => {
                    let allocation_id = read_u64(&mut rest)?;
                    let proxy = read_pubkey(&mut rest)?;
                    let flags = read_u8(&mut rest)?;
                    if flags & !(DELEGATE_TERMINATE | DELEGATE_PROLONG | DELEGATE_AUGMENT) != 0 {
                        return Err(ProgramError::InvalidInstructionData);
                    }
                    let duration = read_u64(&mut rest)?;
                    let grant = DelegateGrant {
                        can_terminate: flags & DELEGATE_TERMINATE != 0,
                        can_prolong: flags & DELEGATE_PROLONG != 0,
                        can_augment: flags & DELEGATE_AUGMENT != 0,
                    };
                    Instruction::DelegateAllocationControl { allocation_id, proxy, grant, duration }
                }
                16 => {
                    let allocation_id = read_u64(&mut rest)?;
                    let justification = read_text(&mut rest)?;
                    Instruction::RequestAssetRecovery { allocation_id, justification }
                }
                17 => Instruction::BatchValidateAchievements { allocation_ids: read_id_list(&mut rest)? },
                18 => {
                    let beneficiary = read_pubkey(&mut rest)?;
                    let verified = read_bool(&mut rest)?;
                    Instruction::SetBeneficiaryVerification { beneficiary, verified }
                }
                19 => Instruction::AddressAnomalyFlag { allocation_id: read_u64(&mut rest)? },
                _ => return Err(ProgramError::InvalidInstructionData),
            };

            if !rest.is_empty() {
                return Err(ProgramError::InvalidInstructionData);
            }
            Ok(ix)
        }
    }

    fn read_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        if input.len() < n {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_bool(input: &mut &[u8]) -> Result<bool, ProgramError> {
        match read_u8(input)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ProgramError::InvalidInstructionData),
        }
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        let bytes = read_bytes(input, 8)?;
        let arr: [u8; 8] = bytes.try_into().map_err(|_| ProgramError::InvalidInstructionData)?;
        Ok(u64::from_le_bytes(arr))
    }

    fn read_array32(input: &mut &[u8]) -> Result<[u8; 32], ProgramError> {
        let bytes = read_bytes(input, 32)?;
        bytes.try_into().map_err(|_| ProgramError::InvalidInstructionData)
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        Ok(Pubkey::new_from_array(read_array32(input)?))
    }

    fn read_text<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], ProgramError> {
        let len = read_u8(input)? as usize;
        read_bytes(input, len)
    }

    fn read_id_list(input: &mut &[u8]) -> Result<IdList, ProgramError> {
        let len = read_u8(input)? as usize;
        if len > MAX_BATCH {
            return Err(ProgramError::InvalidInstructionData);
        }
        let mut list = IdList { items: [0; MAX_BATCH], len };
        for item in list.items.iter_mut().take(len) {
            *item = read_u64(input)?;
        }
        Ok(list)
    }

    fn read_recipients(input: &mut &[u8]) -> Result<RecipientList, ProgramError> {
        let len = read_u8(input)? as usize;
        if len > MAX_BENEFICIARIES {
            return Err(ProgramError::InvalidInstructionData);
        }
        let mut list = RecipientList { items: [([0; 32], 0); MAX_BENEFICIARIES], len };
        for item in list.items.iter_mut().take(len) {
            let beneficiary = read_array32(input)?;
            let percentage = read_u8(input)?;
            *item = (beneficiary, percentage);
        }
        Ok(list)
    }
}

// 4. mod accounts
pub mod accounts {
    use crate::constants::VAULT_SEED;
    use crate::error::EscrowProgramError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(EscrowProgramError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(EscrowProgramError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    /// Custody authority: the PDA that owns the vault token account.
    pub fn derive_vault_authority(program_id: &Pubkey, registry_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[VAULT_SEED, registry_key.as_ref()], program_id)
    }
}

// 5. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct RegistryHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub overseer: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct RegistryConfig {
        pub mint: [u8; 32],
        pub vault: [u8; 32],
        pub vault_authority_bump: u8,
        pub _padding: [u8; 7],
    }

    pub fn registry_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> RegistryHeader {
        let mut h = RegistryHeader::zeroed();
        bytemuck::bytes_of_mut(&mut h).copy_from_slice(&data[..HEADER_LEN]);
        h
    }

    pub fn write_header(data: &mut [u8], h: &RegistryHeader) {
        data[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(h));
    }

    pub fn read_config(data: &[u8]) -> RegistryConfig {
        let mut c = RegistryConfig::zeroed();
        bytemuck::bytes_of_mut(&mut c).copy_from_slice(&data[HEADER_LEN..HEADER_LEN + CONFIG_LEN]);
        c
    }

    pub fn write_config(data: &mut [u8], c: &RegistryConfig) {
        data[HEADER_LEN..HEADER_LEN + CONFIG_LEN].copy_from_slice(bytemuck::bytes_of(c));
    }
}

// 6. mod zc (zero-copy engine views)
pub mod zc {
    use crate::constants::{ENGINE_LEN, ENGINE_OFF};
    use crate::engine::EscrowEngine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref(data: &[u8]) -> Result<&EscrowEngine, ProgramError> {
        let bytes = data
            .get(ENGINE_OFF..ENGINE_OFF + ENGINE_LEN)
            .ok_or(ProgramError::InvalidAccountData)?;
        bytemuck::try_from_bytes(bytes).map_err(|_| ProgramError::InvalidAccountData)
    }

    #[inline]
    pub fn engine_mut(data: &mut [u8]) -> Result<&mut EscrowEngine, ProgramError> {
        let bytes = data
            .get_mut(ENGINE_OFF..ENGINE_OFF + ENGINE_LEN)
            .ok_or(ProgramError::InvalidAccountData)?;
        bytemuck::try_from_bytes_mut(bytes).map_err(|_| ProgramError::InvalidAccountData)
    }
}

// 7. mod custody (SPL Token ledger adapter)
pub mod custody {
    use crate::constants::VAULT_SEED;
    use crate::engine::{Identity, Ledger, TransferError};
    use solana_program::{account_info::AccountInfo, program_pack::Pack, pubkey::Pubkey};
    use spl_token::state::Account as TokenAccount;

    #[cfg(not(test))]
    use solana_program::{program::invoke_signed, program_error::ProgramError};

    /// Resolves engine identities to token accounts: custody is the vault,
    /// everyone else is matched by token-account owner among `parties`.
    pub struct TokenLedger<'a, 'b> {
        pub token_program: &'b AccountInfo<'a>,
        pub vault: &'b AccountInfo<'a>,
        pub vault_authority: &'b AccountInfo<'a>,
        pub caller: &'b AccountInfo<'a>,
        pub parties: &'b [AccountInfo<'a>],
        pub mint: Pubkey,
        pub registry: Pubkey,
        pub bump: u8,
        pub slot: u64,
    }

    impl<'a, 'b> TokenLedger<'a, 'b> {
        fn token_owner(&self, ai: &AccountInfo) -> Option<Identity> {
            if ai.owner != &spl_token::ID || !ai.is_writable {
                return None;
            }
            let data = ai.try_borrow_data().ok()?;
            let tok = TokenAccount::unpack(&data).ok()?;
            (tok.mint == self.mint).then(|| tok.owner.to_bytes())
        }

        fn party_account(&self, owner: &Identity) -> Result<&'b AccountInfo<'a>, TransferError> {
            self.parties
                .iter()
                .find(|ai| self.token_owner(ai).as_ref() == Some(owner))
                .ok_or(TransferError::UnknownAccount)
        }
    }

    impl<'a, 'b> Ledger for TokenLedger<'a, 'b> {
        fn transfer(&mut self, amount: u64, from: &Identity, to: &Identity) -> Result<(), TransferError> {
            if amount == 0 {
                return Ok(());
            }
            let custody = self.custody_identity();
            let dest = if *to == custody { self.vault } else { self.party_account(to)? };

            if *from == custody {
                let bump_arr: [u8; 1] = [self.bump];
                let seeds: [&[u8]; 3] = [VAULT_SEED, self.registry.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                move_tokens(self.token_program, self.vault, dest, self.vault_authority, amount, &signer_seeds)
            } else {
                if self.caller.key.to_bytes() != *from || !self.caller.is_signer {
                    return Err(TransferError::MissingAuthority);
                }
                let source = self.party_account(from)?;
                move_tokens(self.token_program, source, dest, self.caller, amount, &[])
            }
        }

        fn current_sequence(&self) -> u64 {
            self.slot
        }

        fn caller_identity(&self) -> Identity {
            self.caller.key.to_bytes()
        }

        fn custody_identity(&self) -> Identity {
            self.vault_authority.key.to_bytes()
        }
    }

    fn move_tokens<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), TransferError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )
            .map_err(|_| TransferError::Rejected)?;
            invoke_signed(
                &ix,
                &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()],
                _signer_seeds,
            )
            .map_err(|e| match e {
                ProgramError::Custom(code) if code == spl_token::error::TokenError::InsufficientFunds as u32 => {
                    TransferError::InsufficientFunds
                }
                _ => TransferError::Rejected,
            })
        }
        #[cfg(test)]
        {
            let mut src_data = source.try_borrow_mut_data().map_err(|_| TransferError::Rejected)?;
            let mut src_state = TokenAccount::unpack(&src_data).map_err(|_| TransferError::Rejected)?;
            src_state.amount = src_state.amount.checked_sub(amount).ok_or(TransferError::InsufficientFunds)?;

            let mut dst_data = dest.try_borrow_mut_data().map_err(|_| TransferError::Rejected)?;
            let mut dst_state = TokenAccount::unpack(&dst_data).map_err(|_| TransferError::Rejected)?;
            dst_state.amount = dst_state.amount.checked_add(amount).ok_or(TransferError::Rejected)?;

            TokenAccount::pack(src_state, &mut src_data).map_err(|_| TransferError::Rejected)?;
            TokenAccount::pack(dst_state, &mut dst_data).map_err(|_| TransferError::Rejected)?;
            Ok(())
        }
    }
}

// 8. mod processor
pub mod processor {
    use crate::{
        accounts,
        constants::{MAGIC, REGISTRY_LEN, VERSION},
        custody::TokenLedger,
        engine::{EscrowEngine, EscrowParams, Ledger, RecoveryOutcome},
        error::{map_escrow_error, EscrowProgramError},
        ix::Instruction,
        state::{self, RegistryConfig, RegistryHeader},
        zc,
    };
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        log::sol_log_64,
        msg,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    fn registry_guard(program_id: &Pubkey, registry: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(registry, program_id)?;
        if data.len() != REGISTRY_LEN {
            return Err(EscrowProgramError::InvalidRegistryLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(EscrowProgramError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(EscrowProgramError::InvalidVersion.into());
        }
        Ok(())
    }

    fn verify_vault(
        a_vault: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
        expected_pubkey: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey {
            return Err(EscrowProgramError::InvalidVault.into());
        }
        if a_vault.owner != &spl_token::ID {
            return Err(EscrowProgramError::InvalidVault.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(EscrowProgramError::InvalidVault.into());
        }
        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(EscrowProgramError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(EscrowProgramError::InvalidVault.into());
        }
        Ok(())
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitRegistry { params } => init_registry(program_id, accounts, params),
            other => execute(program_id, accounts, other),
        }
    }

    /// Accounts: `[overseer (signer), registry (writable), vault, mint]`.
    fn init_registry<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        params: EscrowParams,
    ) -> ProgramResult {
        accounts::expect_len(accounts, 4)?;
        let a_overseer = &accounts[0];
        let a_registry = &accounts[1];
        let a_vault = &accounts[2];
        let a_mint = &accounts[3];

        accounts::expect_signer(a_overseer)?;
        accounts::expect_writable(a_registry)?;
        if !params.is_valid() {
            return Err(EscrowProgramError::InvalidConfigParam.into());
        }

        let mut data = state::registry_data_mut(a_registry)?;
        registry_guard(program_id, a_registry, &data)?;

        let header = state::read_header(&data);
        if header.magic == MAGIC {
            return Err(EscrowProgramError::AlreadyInitialized.into());
        }

        let (auth, bump) = accounts::derive_vault_authority(program_id, a_registry.key);
        verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

        data.fill(0);
        zc::engine_mut(&mut data)?.init(a_overseer.key.to_bytes(), params);

        let config = RegistryConfig {
            mint: a_mint.key.to_bytes(),
            vault: a_vault.key.to_bytes(),
            vault_authority_bump: bump,
            _padding: [0; 7],
        };
        state::write_config(&mut data, &config);

        let new_header = RegistryHeader {
            magic: MAGIC,
            version: VERSION,
            bump,
            _padding: [0; 3],
            overseer: a_overseer.key.to_bytes(),
            _reserved: [0; 16],
        };
        state::write_header(&mut data, &new_header);
        msg!("InitRegistry");
        Ok(())
    }

    /// Accounts: `[caller (signer), registry (writable), vault (writable),
    /// vault authority, token program, clock, party token accounts...]`.
    fn execute<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction: Instruction,
    ) -> ProgramResult {
        accounts::expect_len(accounts, 6)?;
        let a_caller = &accounts[0];
        let a_registry = &accounts[1];
        let a_vault = &accounts[2];
        let a_vault_pda = &accounts[3];
        let a_token = &accounts[4];
        let a_clock = &accounts[5];

        accounts::expect_signer(a_caller)?;
        accounts::expect_writable(a_registry)?;
        accounts::expect_writable(a_vault)?;

        let mut data = state::registry_data_mut(a_registry)?;
        registry_guard(program_id, a_registry, &data)?;
        require_initialized(&data)?;
        let config = state::read_config(&data);

        let (auth, _) = accounts::derive_vault_authority(program_id, a_registry.key);
        accounts::expect_key(a_vault_pda, &auth)?;
        let mint = Pubkey::new_from_array(config.mint);
        verify_vault(a_vault, &auth, &mint, &Pubkey::new_from_array(config.vault))?;
        accounts::expect_key(a_token, &spl_token::ID)?;

        let clock = Clock::from_account_info(a_clock)?;

        let mut ledger = TokenLedger {
            token_program: a_token,
            vault: a_vault,
            vault_authority: a_vault_pda,
            caller: a_caller,
            parties: &accounts[6..],
            mint,
            registry: *a_registry.key,
            bump: config.vault_authority_bump,
            slot: clock.slot,
        };

        let engine = zc::engine_mut(&mut data)?;
        dispatch(engine, &mut ledger, instruction)
    }

    fn dispatch<L: Ledger>(engine: &mut EscrowEngine, ledger: &mut L, instruction: Instruction) -> ProgramResult {
        match instruction {
            Instruction::InitRegistry { .. } => {
                return Err(EscrowProgramError::AlreadyInitialized.into());
            }
            Instruction::InitiateAllocation { beneficiary, quantity, achievements } => {
                let id = engine
                    .initiate_allocation(ledger, beneficiary.to_bytes(), quantity, achievements.as_slice())
                    .map_err(map_escrow_error)?;
                msg!("InitiateAllocation");
                sol_log_64(id, quantity, achievements.as_slice().len() as u64, 0, 0);
            }
            Instruction::ValidateAchievement { allocation_id } => {
                engine
                    .validate_achievement(ledger, allocation_id)
                    .map_err(map_escrow_error)?;
                msg!("ValidateAchievement");
                sol_log_64(allocation_id, 0, 0, 0, 0);
            }
            Instruction::TerminateAllocation { allocation_id } => {
                let returned = engine
                    .terminate_allocation(ledger, allocation_id)
                    .map_err(map_escrow_error)?;
                msg!("TerminateAllocation");
                sol_log_64(allocation_id, returned, 0, 0, 0);
            }
            Instruction::ReturnAssets { allocation_id } => {
                let returned = engine
                    .return_assets(ledger, allocation_id)
                    .map_err(map_escrow_error)?;
                msg!("ReturnAssets");
                sol_log_64(allocation_id, returned, 0, 0, 0);
            }
            Instruction::ExtendAllocationTimeframe { allocation_id, extension } => {
                let expires_at = engine
                    .extend_allocation_timeframe(ledger, allocation_id, extension)
                    .map_err(map_escrow_error)?;
                msg!("ExtendAllocationTimeframe");
                sol_log_64(allocation_id, expires_at, 0, 0, 0);
            }
            Instruction::AugmentAllocationQuantity { allocation_id, additional } => {
                let quantity = engine
                    .augment_allocation_quantity(ledger, allocation_id, additional)
                    .map_err(map_escrow_error)?;
                msg!("AugmentAllocationQuantity");
                sol_log_64(allocation_id, quantity, 0, 0, 0);
            }
            Instruction::CreateProportionalAllocation { recipients, quantity } => {
                let id = engine
                    .create_proportional_allocation(ledger, recipients.as_slice(), quantity)
                    .map_err(map_escrow_error)?;
                msg!("CreateProportionalAllocation");
                sol_log_64(id, quantity, recipients.as_slice().len() as u64, 0, 0);
            }
            Instruction::RecordAchievementProgress {
                allocation_id,
                achievement_index,
                completion_percentage,
                verification_hash,
                description,
            } => {
                engine
                    .record_achievement_progress(
                        ledger,
                        allocation_id,
                        achievement_index,
                        completion_percentage,
                        description,
                        verification_hash,
                    )
                    .map_err(map_escrow_error)?;
                msg!("RecordAchievementProgress");
                sol_log_64(allocation_id, achievement_index as u64, completion_percentage as u64, 0, 0);
            }
            Instruction::FlagAnomalousAllocation { allocation_id, indicator } => {
                engine
                    .flag_anomalous_allocation(ledger, allocation_id, indicator)
                    .map_err(map_escrow_error)?;
                msg!("FlagAnomalousAllocation");
                sol_log_64(allocation_id, 0, 0, 0, 0);
            }
            Instruction::VelocityLimitedAllocation { beneficiary, quantity, achievements } => {
                let id = engine
                    .velocity_limited_allocation(ledger, beneficiary.to_bytes(), quantity, achievements.as_slice())
                    .map_err(map_escrow_error)?;
                msg!("VelocityLimitedAllocation");
                sol_log_64(id, quantity, achievements.as_slice().len() as u64, 0, 0);
            }
            Instruction::SetSystemOperationalState { paused } => {
                engine
                    .set_system_operational_state(ledger, paused)
                    .map_err(map_escrow_error)?;
                msg!(if paused { "SystemPaused" } else { "SystemResumed" });
            }
            Instruction::SecureAllocationInitiation { beneficiary, quantity, achievements } => {
                let id = engine
                    .secure_allocation_initiation(ledger, beneficiary.to_bytes(), quantity, achievements.as_slice())
                    .map_err(map_escrow_error)?;
                msg!("SecureAllocationInitiation");
                sol_log_64(id, quantity, achievements.as_slice().len() as u64, 0, 0);
            }
            Instruction::SubmitAllocationReview { allocation_id, rationale } => {
                engine
                    .submit_allocation_review(ledger, allocation_id, rationale)
                    .map_err(map_escrow_error)?;
                msg!("SubmitAllocationReview");
                sol_log_64(allocation_id, 0, 0, 0, 0);
            }
            Instruction::ResolveAllocationReview { allocation_id, is_valid } => {
                engine
                    .resolve_allocation_review(ledger, allocation_id, is_valid)
                    .map_err(map_escrow_error)?;
                msg!("ResolveAllocationReview");
                sol_log_64(allocation_id, is_valid as u64, 0, 0, 0);
            }
            Instruction::DelegateAllocationControl { allocation_id, proxy, grant, duration } => {
                let expiry = engine
                    .delegate_allocation_control(ledger, allocation_id, proxy.to_bytes(), grant, duration)
                    .map_err(map_escrow_error)?;
                msg!("DelegateAllocationControl");
                sol_log_64(allocation_id, expiry, 0, 0, 0);
            }
            Instruction::RequestAssetRecovery { allocation_id, justification } => {
                let outcome = engine
                    .request_asset_recovery(ledger, allocation_id, justification)
                    .map_err(map_escrow_error)?;
                match outcome {
                    RecoveryOutcome::Pending => msg!("RecoveryPending"),
                    RecoveryOutcome::Recovered { amount } => {
                        msg!("RecoveryExecuted");
                        sol_log_64(allocation_id, amount, 0, 0, 0);
                    }
                }
            }
            Instruction::BatchValidateAchievements { allocation_ids } => {
                engine
                    .batch_validate_achievements(ledger, allocation_ids.as_slice())
                    .map_err(map_escrow_error)?;
                msg!("BatchValidateAchievements");
                sol_log_64(allocation_ids.as_slice().len() as u64, 0, 0, 0, 0);
            }
            Instruction::SetBeneficiaryVerification { beneficiary, verified } => {
                engine
                    .set_beneficiary_verification(ledger, beneficiary.to_bytes(), verified)
                    .map_err(map_escrow_error)?;
                msg!(if verified { "BeneficiaryVerified" } else { "BeneficiaryUnverified" });
            }
            Instruction::AddressAnomalyFlag { allocation_id } => {
                engine
                    .address_anomaly_flag(ledger, allocation_id)
                    .map_err(map_escrow_error)?;
                msg!("AddressAnomalyFlag");
                sol_log_64(allocation_id, 0, 0, 0, 0);
            }
        }
        Ok(())
    }
}

// 9. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use crate::processor;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::{MAGIC, REGISTRY_LEN, VERSION},
        engine::{AllocationState, EscrowParams},
        error::EscrowProgramError,
        processor::process_instruction,
    };
    use solana_program::{
        account_info::AccountInfo, clock::Clock, program_error::ProgramError, program_pack::Pack,
        pubkey::Pubkey,
    };
    use spl_token::state::{Account as TokenAccount, AccountState};

    // --- Harness ---

    struct TestAccount {
        key: Pubkey,
        owner: Pubkey,
        lamports: u64,
        data: Vec<u8>,
        is_signer: bool,
        is_writable: bool,
    }

    impl TestAccount {
        fn new(key: Pubkey, owner: Pubkey, lamports: u64, data: Vec<u8>) -> Self {
            Self { key, owner, lamports, data, is_signer: false, is_writable: false }
        }
        fn signer(mut self) -> Self { self.is_signer = true; self }
        fn writable(mut self) -> Self { self.is_writable = true; self }

        fn to_info<'a>(&'a mut self) -> AccountInfo<'a> {
            AccountInfo::new(
                &self.key,
                self.is_signer,
                self.is_writable,
                &mut self.lamports,
                &mut self.data,
                &self.owner,
                false,
                0,
            )
        }
    }

    // --- Builders ---

    fn make_token_account(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
        let mut data = vec![0u8; TokenAccount::LEN];
        let mut account = TokenAccount::default();
        account.mint = mint;
        account.owner = owner;
        account.amount = amount;
        account.state = AccountState::Initialized;
        TokenAccount::pack(account, &mut data).unwrap();
        data
    }

    fn make_clock(slot: u64) -> Vec<u8> {
        let clock = Clock { slot, ..Clock::default() };
        bincode::serialize(&clock).unwrap()
    }

    fn token_balance(acc: &TestAccount) -> u64 {
        TokenAccount::unpack(&acc.data).unwrap().amount
    }

    fn user() -> TestAccount {
        TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), 0, vec![]).signer()
    }

    struct RegistryFixture {
        program_id: Pubkey,
        overseer: TestAccount,
        registry: TestAccount,
        mint: TestAccount,
        vault: TestAccount,
        vault_pda: TestAccount,
        token_prog: TestAccount,
        clock: TestAccount,
    }

    impl RegistryFixture {
        fn ata(&self, owner: &TestAccount, amount: u64) -> TestAccount {
            TestAccount::new(
                Pubkey::new_unique(),
                spl_token::ID,
                0,
                make_token_account(self.mint.key, owner.key, amount),
            )
            .writable()
        }

        fn set_slot(&mut self, slot: u64) {
            self.clock.data = make_clock(slot);
        }

        /// Run an instruction with the shared account layout.
        fn exec(
            &mut self,
            caller: &mut TestAccount,
            parties: &mut [&mut TestAccount],
            data: &[u8],
        ) -> Result<(), ProgramError> {
            let mut accs = vec![
                caller.to_info(),
                self.registry.to_info(),
                self.vault.to_info(),
                self.vault_pda.to_info(),
                self.token_prog.to_info(),
                self.clock.to_info(),
            ];
            for p in parties.iter_mut() {
                accs.push(p.to_info());
            }
            process_instruction(&self.program_id, &accs, data)
        }

        fn engine(&self) -> &engine::EscrowEngine {
            zc::engine_ref(&self.registry.data).unwrap()
        }
    }

    fn setup_registry() -> RegistryFixture {
        let program_id = Pubkey::new_unique();
        let registry_key = Pubkey::new_unique();
        let (vault_pda, _) = accounts::derive_vault_authority(&program_id, &registry_key);
        let mint_key = Pubkey::new_unique();

        RegistryFixture {
            program_id,
            overseer: user(),
            registry: TestAccount::new(registry_key, program_id, 0, vec![0u8; REGISTRY_LEN]).writable(),
            mint: TestAccount::new(mint_key, spl_token::ID, 0, vec![]),
            vault: TestAccount::new(Pubkey::new_unique(), spl_token::ID, 0, make_token_account(mint_key, vault_pda, 0)).writable(),
            vault_pda: TestAccount::new(vault_pda, solana_program::system_program::id(), 0, vec![]),
            token_prog: TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]),
            clock: TestAccount::new(solana_program::sysvar::clock::id(), solana_program::sysvar::id(), 0, make_clock(100)),
        }
    }

    // --- Encoders ---

    fn encode_u64(val: u64, buf: &mut Vec<u8>) { buf.extend_from_slice(&val.to_le_bytes()); }
    fn encode_pubkey(val: &Pubkey, buf: &mut Vec<u8>) { buf.extend_from_slice(val.as_ref()); }

    fn encode_init_registry(params: &EscrowParams) -> Vec<u8> {
        let mut data = vec![0u8];
        encode_u64(params.allocation_lifespan, &mut data);
        encode_u64(params.max_extension_time, &mut data);
        encode_u64(params.review_stake, &mut data);
        encode_u64(params.review_timeframe, &mut data);
        encode_u64(params.velocity_window, &mut data);
        encode_u64(params.max_allocations_per_window, &mut data);
        data
    }

    fn encode_initiate(beneficiary: &Pubkey, quantity: u64, achievements: &[u64]) -> Vec<u8> {
        let mut data = vec![1u8];
        encode_pubkey(beneficiary, &mut data);
        encode_u64(quantity, &mut data);
        data.push(achievements.len() as u8);
        for &a in achievements {
            encode_u64(a, &mut data);
        }
        data
    }

    fn encode_id(tag: u8, id: u64) -> Vec<u8> {
        let mut data = vec![tag];
        encode_u64(id, &mut data);
        data
    }

    fn encode_text(tag: u8, id: u64, text: &[u8]) -> Vec<u8> {
        let mut data = encode_id(tag, id);
        data.push(text.len() as u8);
        data.extend_from_slice(text);
        data
    }

    fn encode_proportional(recipients: &[(Pubkey, u8)], quantity: u64) -> Vec<u8> {
        let mut data = vec![7u8, recipients.len() as u8];
        for (beneficiary, pct) in recipients {
            encode_pubkey(beneficiary, &mut data);
            data.push(*pct);
        }
        encode_u64(quantity, &mut data);
        data
    }

    fn encode_progress(id: u64, index: u8, pct: u8, hash: [u8; 32], description: &[u8]) -> Vec<u8> {
        let mut data = encode_id(8, id);
        data.push(index);
        data.push(pct);
        data.extend_from_slice(&hash);
        data.push(description.len() as u8);
        data.extend_from_slice(description);
        data
    }

    fn encode_resolve(id: u64, is_valid: bool) -> Vec<u8> {
        let mut data = encode_id(14, id);
        data.push(is_valid as u8);
        data
    }

    fn encode_verification(beneficiary: &Pubkey, verified: bool) -> Vec<u8> {
        let mut data = vec![18u8];
        encode_pubkey(beneficiary, &mut data);
        data.push(verified as u8);
        data
    }

    fn overseer_signer(f: &RegistryFixture) -> TestAccount {
        TestAccount::new(f.overseer.key, f.overseer.owner, 0, vec![]).signer()
    }

    fn init(f: &mut RegistryFixture) -> Result<(), ProgramError> {
        let accs = vec![
            f.overseer.to_info(),
            f.registry.to_info(),
            f.vault.to_info(),
            f.mint.to_info(),
        ];
        process_instruction(&f.program_id, &accs, &encode_init_registry(&EscrowParams::DEFAULT))
    }

    fn custom(e: EscrowProgramError) -> ProgramError {
        ProgramError::Custom(e as u32)
    }

    // --- Tests ---

    #[test]
    fn test_init_registry() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let header = state::read_header(&f.registry.data);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.overseer, f.overseer.key.to_bytes());

        let config = state::read_config(&f.registry.data);
        assert_eq!(config.vault, f.vault.key.to_bytes());
        assert_eq!(config.mint, f.mint.key.to_bytes());

        let engine = f.engine();
        assert_eq!(engine.overseer, f.overseer.key.to_bytes());
        assert_eq!(engine.params, EscrowParams::DEFAULT);
        assert_eq!(engine.latest_allocation_id, 0);
    }

    #[test]
    fn test_init_registry_twice_rejected() {
        let mut f = setup_registry();
        init(&mut f).unwrap();
        assert_eq!(init(&mut f), Err(custom(EscrowProgramError::AlreadyInitialized)));
    }

    #[test]
    fn test_init_rejects_foreign_vault() {
        let mut f = setup_registry();
        f.vault.data = make_token_account(f.mint.key, Pubkey::new_unique(), 0);
        assert_eq!(init(&mut f), Err(custom(EscrowProgramError::InvalidVault)));
    }

    #[test]
    fn test_init_rejects_bad_params() {
        let mut f = setup_registry();
        let params = EscrowParams { allocation_lifespan: 0, ..EscrowParams::DEFAULT };
        let accs = vec![
            f.overseer.to_info(),
            f.registry.to_info(),
            f.vault.to_info(),
            f.mint.to_info(),
        ];
        let res = process_instruction(&f.program_id, &accs, &encode_init_registry(&params));
        assert_eq!(res, Err(custom(EscrowProgramError::InvalidConfigParam)));
    }

    #[test]
    fn test_uninitialized_registry_rejected() {
        let mut f = setup_registry();
        let mut provider = user();
        let beneficiary = Pubkey::new_unique();
        let res = f.exec(&mut provider, &mut [], &encode_initiate(&beneficiary, 10, &[1]));
        assert_eq!(res, Err(custom(EscrowProgramError::NotInitialized)));
    }

    #[test]
    fn test_initiate_and_validate_moves_tokens() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let beneficiary = user();
        let mut provider_ata = f.ata(&provider, 1_000);
        let mut beneficiary_ata = f.ata(&beneficiary, 0);

        let ix = encode_initiate(&beneficiary.key, 1_000, &[11, 22, 33, 44]);
        f.exec(&mut provider, &mut [&mut provider_ata], &ix).unwrap();
        assert_eq!(token_balance(&provider_ata), 0);
        assert_eq!(token_balance(&f.vault), 1_000);

        let a = f.engine().allocation(1).unwrap();
        assert_eq!(a.state(), Some(AllocationState::Active));
        assert_eq!(a.expires_at, 100 + 1008);

        let mut overseer = TestAccount::new(f.overseer.key, f.overseer.owner, 0, vec![]).signer();
        f.exec(&mut overseer, &mut [&mut beneficiary_ata], &encode_id(2, 1)).unwrap();
        assert_eq!(token_balance(&beneficiary_ata), 250);
        assert_eq!(token_balance(&f.vault), 750);
        assert_eq!(f.engine().allocation(1).unwrap().validated_achievements, 1);
    }

    #[test]
    fn test_terminate_returns_full_quantity() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let beneficiary = Pubkey::new_unique();
        let mut provider_ata = f.ata(&provider, 500);

        f.exec(&mut provider, &mut [&mut provider_ata], &encode_initiate(&beneficiary, 500, &[1, 2, 3])).unwrap();
        f.exec(&mut provider, &mut [&mut provider_ata], &encode_id(3, 1)).unwrap();

        assert_eq!(token_balance(&provider_ata), 500);
        assert_eq!(token_balance(&f.vault), 0);
        assert_eq!(
            f.engine().allocation(1).unwrap().state(),
            Some(AllocationState::Terminated)
        );
    }

    #[test]
    fn test_validate_requires_overseer() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let mut beneficiary = user();
        let mut provider_ata = f.ata(&provider, 100);
        let mut beneficiary_ata = f.ata(&beneficiary, 0);

        f.exec(&mut provider, &mut [&mut provider_ata], &encode_initiate(&beneficiary.key, 100, &[1])).unwrap();
        let res = f.exec(&mut beneficiary, &mut [&mut beneficiary_ata], &encode_id(2, 1));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAccessDenied)));
        assert_eq!(token_balance(&beneficiary_ata), 0);
    }

    #[test]
    fn test_return_assets_only_after_expiry() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let beneficiary = Pubkey::new_unique();
        let mut provider_ata = f.ata(&provider, 300);
        f.exec(&mut provider, &mut [&mut provider_ata], &encode_initiate(&beneficiary, 300, &[1, 2])).unwrap();

        let mut overseer = TestAccount::new(f.overseer.key, f.overseer.owner, 0, vec![]).signer();
        f.set_slot(100 + 1007);
        let res = f.exec(&mut overseer, &mut [&mut provider_ata], &encode_id(4, 1));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAllocationLapsed)));

        f.set_slot(100 + 1009);
        f.exec(&mut overseer, &mut [&mut provider_ata], &encode_id(4, 1)).unwrap();
        assert_eq!(token_balance(&provider_ata), 300);
        assert_eq!(
            f.engine().allocation(1).unwrap().state(),
            Some(AllocationState::Returned)
        );
    }

    #[test]
    fn test_proportional_allocation_takes_custody() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let mut provider_ata = f.ata(&provider, 900);
        let (a, b, c) = (Pubkey::new_unique(), Pubkey::new_unique(), Pubkey::new_unique());

        let res = f.exec(&mut provider, &mut [&mut provider_ata], &encode_proportional(&[(a, 50), (b, 40)], 900));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineInvalidAssetDistribution)));
        assert_eq!(token_balance(&provider_ata), 900);

        let ix = encode_proportional(&[(a, 50), (b, 30), (c, 20)], 900);
        f.exec(&mut provider, &mut [&mut provider_ata], &ix).unwrap();
        assert_eq!(token_balance(&provider_ata), 0);
        assert_eq!(token_balance(&f.vault), 900);

        let engine = f.engine();
        assert_eq!(engine.latest_multi_allocation_id, 1);
        assert_eq!(engine.latest_allocation_id, 0);
        let p = engine.proportional_allocation(1).unwrap();
        assert_eq!(p.provider, provider.key.to_bytes());
        assert_eq!(p.total_quantity, 900);
        assert_eq!(p.initialized_at, 100);
        let split: Vec<_> = p.recipients().iter().map(|r| (r.beneficiary, r.percentage)).collect();
        assert_eq!(split, vec![(a.to_bytes(), 50), (b.to_bytes(), 30), (c.to_bytes(), 20)]);
    }

    #[test]
    fn test_record_progress_by_beneficiary() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let mut beneficiary = user();
        let mut provider_ata = f.ata(&provider, 100);
        f.exec(&mut provider, &mut [&mut provider_ata], &encode_initiate(&beneficiary.key, 100, &[1, 2])).unwrap();

        let res = f.exec(&mut provider, &mut [], &encode_progress(1, 0, 40, [7; 32], b"draft"));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAccessDenied)));

        f.set_slot(150);
        f.exec(&mut beneficiary, &mut [], &encode_progress(1, 1, 40, [7; 32], b"draft")).unwrap();
        let engine = f.engine();
        let p = engine.achievement_progress(1, 1).unwrap().unwrap();
        assert_eq!(p.completion_percentage, 40);
        assert_eq!(p.description(), b"draft");
        assert_eq!(p.verification_hash, [7; 32]);
        assert_eq!(p.recorded_at, 150);
        assert!(engine.achievement_progress(1, 0).unwrap().is_none());
        assert_eq!(token_balance(&f.vault), 100);

        let res = f.exec(&mut beneficiary, &mut [], &encode_progress(1, 2, 40, [0; 32], b""));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineInvalidAchievement)));
    }

    #[test]
    fn test_invalid_review_forfeits_stake_to_overseer() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let mut reviewer = user();
        let beneficiary = Pubkey::new_unique();
        let mut provider_ata = f.ata(&provider, 400);
        let mut reviewer_ata = f.ata(&reviewer, 1_500_000);
        let mut overseer_ata = f.ata(&f.overseer, 0);
        f.exec(&mut provider, &mut [&mut provider_ata], &encode_initiate(&beneficiary, 400, &[1])).unwrap();

        f.exec(&mut reviewer, &mut [&mut reviewer_ata], &encode_text(13, 1, b"milestone never shipped")).unwrap();
        assert_eq!(token_balance(&reviewer_ata), 500_000);
        assert_eq!(token_balance(&f.vault), 400 + 1_000_000);

        let res = f.exec(&mut reviewer, &mut [&mut reviewer_ata], &encode_text(13, 1, b"again"));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineReviewExists)));

        let mut overseer = overseer_signer(&f);
        f.set_slot(100 + 143);
        f.exec(&mut overseer, &mut [&mut overseer_ata, &mut reviewer_ata], &encode_resolve(1, false)).unwrap();
        assert_eq!(token_balance(&overseer_ata), 1_000_000);
        assert_eq!(token_balance(&reviewer_ata), 500_000);
        assert_eq!(token_balance(&f.vault), 400);

        let review = *f.engine().review(1).unwrap().unwrap();
        assert_eq!(review.reviewer, reviewer.key.to_bytes());
        assert_eq!(review.rationale(), b"milestone never shipped");
        assert_eq!((review.concluded, review.review_validated), (1, 0));

        let res = f.exec(&mut overseer, &mut [&mut overseer_ata], &encode_resolve(1, true));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAssetsAlreadyDisbursed)));
    }

    #[test]
    fn test_flag_freezes_termination_until_recovered() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let mut beneficiary = user();
        let mut provider_ata = f.ata(&provider, 600);
        let mut beneficiary_ata = f.ata(&beneficiary, 0);
        f.exec(&mut provider, &mut [&mut provider_ata], &encode_initiate(&beneficiary.key, 600, &[1, 2, 3])).unwrap();

        let mut overseer = overseer_signer(&f);
        f.exec(&mut overseer, &mut [&mut beneficiary_ata], &encode_id(2, 1)).unwrap();
        assert_eq!(token_balance(&beneficiary_ata), 200);

        f.exec(&mut beneficiary, &mut [], &encode_text(9, 1, b"duplicate invoice")).unwrap();
        assert_eq!(f.engine().allocation(1).unwrap().state(), Some(AllocationState::Flagged));

        let res = f.exec(&mut provider, &mut [&mut provider_ata], &encode_id(3, 1));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAssetsAlreadyDisbursed)));

        f.exec(&mut overseer, &mut [], &encode_id(19, 1)).unwrap();
        let flag = *f.engine().anomaly_flag(1).unwrap().unwrap();
        assert_eq!(flag.detected_by, beneficiary.key.to_bytes());
        assert_eq!(flag.addressed, 1);
        assert_eq!(f.engine().allocation(1).unwrap().state(), Some(AllocationState::Flagged));

        f.exec(&mut provider, &mut [&mut provider_ata], &encode_text(16, 1, b"dispute")).unwrap();
        assert_eq!(token_balance(&provider_ata), 0);
        assert_eq!(token_balance(&f.vault), 400);

        f.exec(&mut overseer, &mut [&mut provider_ata], &encode_text(16, 1, b"agreed")).unwrap();
        assert_eq!(token_balance(&provider_ata), 400);
        assert_eq!(token_balance(&f.vault), 0);

        let engine = f.engine();
        assert_eq!(engine.allocation(1).unwrap().state(), Some(AllocationState::Recovered));
        let req = engine.recovery_request(1).unwrap().unwrap();
        assert_eq!((req.provider_approved, req.overseer_approved), (1, 1));
        assert_eq!(req.justification(), b"agreed");
    }

    #[test]
    fn test_secure_initiation_needs_verified_beneficiary() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let beneficiary = Pubkey::new_unique();
        let mut provider_ata = f.ata(&provider, 50);
        let mut secure = encode_initiate(&beneficiary, 50, &[1]);
        secure[0] = 12;

        let res = f.exec(&mut provider, &mut [&mut provider_ata], &secure);
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAccessDenied)));

        let res = f.exec(&mut provider, &mut [], &encode_verification(&beneficiary, true));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAccessDenied)));

        let mut overseer = overseer_signer(&f);
        f.exec(&mut overseer, &mut [], &encode_verification(&beneficiary, true)).unwrap();
        assert!(f.engine().is_verified(&beneficiary.to_bytes()));

        f.exec(&mut provider, &mut [&mut provider_ata], &secure).unwrap();
        assert_eq!(token_balance(&f.vault), 50);
        assert_eq!(f.engine().allocation(1).unwrap().beneficiary, beneficiary.to_bytes());

        f.exec(&mut overseer, &mut [], &encode_verification(&beneficiary, false)).unwrap();
        assert!(!f.engine().is_verified(&beneficiary.to_bytes()));
        assert_eq!(f.engine().verified_count, 1);
    }

    #[test]
    fn test_missing_party_account_leaves_state_untouched() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let beneficiary = Pubkey::new_unique();
        let res = f.exec(&mut provider, &mut [], &encode_initiate(&beneficiary, 10, &[1]));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAssetTransferFailed)));
        assert_eq!(f.engine().latest_allocation_id, 0);
    }

    #[test]
    fn test_party_account_with_wrong_mint_ignored() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        let beneficiary = Pubkey::new_unique();
        let mut foreign = TestAccount::new(
            Pubkey::new_unique(),
            spl_token::ID,
            0,
            make_token_account(Pubkey::new_unique(), provider.key, 1_000),
        )
        .writable();
        let res = f.exec(&mut provider, &mut [&mut foreign], &encode_initiate(&beneficiary, 10, &[1]));
        assert_eq!(res, Err(custom(EscrowProgramError::EngineAssetTransferFailed)));
        assert_eq!(token_balance(&foreign), 1_000);
    }

    #[test]
    fn test_missing_signer_rejected() {
        let mut f = setup_registry();
        init(&mut f).unwrap();

        let mut provider = user();
        provider.is_signer = false;
        let beneficiary = Pubkey::new_unique();
        let mut provider_ata = f.ata(&provider, 10);
        let res = f.exec(&mut provider, &mut [&mut provider_ata], &encode_initiate(&beneficiary, 10, &[1]));
        assert_eq!(res, Err(custom(EscrowProgramError::ExpectedSigner)));
    }

    #[test]
    fn test_wrong_vault_authority_rejected() {
        let mut f = setup_registry();
        init(&mut f).unwrap();
        f.vault_pda.key = Pubkey::new_unique();

        let mut provider = user();
        let beneficiary = Pubkey::new_unique();
        let mut provider_ata = f.ata(&provider, 10);
        let res = f.exec(&mut provider, &mut [&mut provider_ata], &encode_initiate(&beneficiary, 10, &[1]));
        assert_eq!(res, Err(ProgramError::InvalidArgument));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut f = setup_registry();
        init(&mut f).unwrap();
        let mut provider = user();
        let res = f.exec(&mut provider, &mut [], &[42u8]);
        assert_eq!(res, Err(ProgramError::InvalidInstructionData));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes_and_bad_bools() {
        let mut data = encode_id(2, 7);
        data.push(0);
        assert!(matches!(ix::Instruction::decode(&data), Err(ProgramError::InvalidInstructionData)));

        assert!(matches!(ix::Instruction::decode(&[11, 2]), Err(ProgramError::InvalidInstructionData)));
        assert!(matches!(
            ix::Instruction::decode(&[11, 1]),
            Ok(ix::Instruction::SetSystemOperationalState { paused: true })
        ));
    }

    #[test]
    fn test_decode_delegate_flags() {
        let proxy = Pubkey::new_unique();
        let mut data = vec![15u8];
        encode_u64(3, &mut data);
        encode_pubkey(&proxy, &mut data);
        data.push(ix::DELEGATE_TERMINATE | ix::DELEGATE_AUGMENT);
        encode_u64(50, &mut data);

        match ix::Instruction::decode(&data).unwrap() {
            ix::Instruction::DelegateAllocationControl { allocation_id, proxy: p, grant, duration } => {
                assert_eq!(allocation_id, 3);
                assert_eq!(p, proxy);
                assert!(grant.can_terminate && !grant.can_prolong && grant.can_augment);
                assert_eq!(duration, 50);
            }
            other => panic!("unexpected {:?}", other),
        }

        let last = data.len() - 9;
        data[last] = 0x08;
        assert!(ix::Instruction::decode(&data).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_batch() {
        let mut data = vec![17u8, 11];
        for i in 0..11 {
            encode_u64(i, &mut data);
        }
        assert!(matches!(ix::Instruction::decode(&data), Err(ProgramError::InvalidInstructionData)));
    }

    #[test]
    fn test_engine_errors_map_to_distinct_codes() {
        use crate::engine::EscrowError;
        use num_traits::FromPrimitive;

        let e = error::map_escrow_error(EscrowError::VelocityLimitExceeded);
        let ProgramError::Custom(code) = e else { panic!("expected custom error") };
        assert_eq!(
            EscrowProgramError::from_u32(code),
            Some(EscrowProgramError::EngineVelocityLimitExceeded)
        );
    }
}
