// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use cid::{Cid, Version};
use fil_actors_runtime::DealWeight;
use fil_actors_runtime::network::*;
use fil_actors_runtime::runtime::Policy;
use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::commcid::{FIL_COMMITMENT_SEALED, POSEIDON_BLS12_381_A1_FC1};
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{RegisteredSealProof, SectorQuality, SectorSize, StoragePower};
use lazy_static::lazy_static;

use super::types::SectorOnChainInfo;

/// Precision used for making QA power calculations
pub const SECTOR_QUALITY_PRECISION: i64 = 20;

lazy_static! {
    /// Quality multiplier for committed capacity (no deals) in a sector
    pub static ref QUALITY_BASE_MULTIPLIER: BigInt = BigInt::from(10);

    /// Quality multiplier for unverified deals in a sector
    pub static ref DEAL_WEIGHT_MULTIPLIER: BigInt = BigInt::from(10);

    /// Quality multiplier for verified deals in a sector
    pub static ref VERIFIED_DEAL_WEIGHT_MULTIPLIER: BigInt = BigInt::from(100);
}

/// The maximum number of partitions that may be required to be loaded in a single invocation,
/// when all the sector infos for the partitions will be loaded.
pub fn load_partitions_sectors_max(policy: &Policy, partition_sector_count: u64) -> u64 {
    cmp::min(policy.addressed_sectors_max / partition_sector_count, policy.addressed_partitions_max)
}

/// Prefix for sealed sector CIDs (CommR).
pub fn is_sealed_sector(c: &Cid) -> bool {
    c.version() == Version::V1
        && c.codec() == FIL_COMMITMENT_SEALED
        && c.hash().code() == POSEIDON_BLS12_381_A1_FC1
        && c.hash().size() == 32
}

/// Checks whether a seal proof type is supported for new miners and sectors.
pub fn can_pre_commit_seal_proof(policy: &Policy, proof: RegisteredSealProof) -> bool {
    policy.valid_pre_commit_proof_type.contains(&proof)
}

/// Maximum duration to allow for the sealing process for seal algorithms.
/// Dependent on algorithm and sector size
pub fn max_seal_duration(proof: RegisteredSealProof) -> Option<ChainEpoch> {
    use RegisteredSealProof::*;
    match proof {
        StackedDRG32GiBV1 | StackedDRG2KiBV1 | StackedDRG8MiBV1 | StackedDRG512MiBV1
        | StackedDRG64GiBV1 => Some(10000),
        _ => None,
    }
}

/// Maximum duration a sector sealed with this proof may be committed for.
pub fn seal_proof_sector_maximum_lifetime(proof: RegisteredSealProof) -> Option<ChainEpoch> {
    use RegisteredSealProof::*;
    match proof {
        StackedDRG32GiBV1 | StackedDRG2KiBV1 | StackedDRG8MiBV1 | StackedDRG512MiBV1
        | StackedDRG64GiBV1 => Some(EPOCHS_IN_YEAR * 5),
        _ => None,
    }
}

/// DealWeight and VerifiedDealWeight are spacetime occupied by regular deals and verified deals in a sector.
/// Sum of DealWeight and VerifiedDealWeight should be less than or equal to total SpaceTime of a sector.
/// Sectors full of VerifiedDeals will have a SectorQuality of VerifiedDealWeightMultiplier/QualityBaseMultiplier.
/// Sectors full of Deals will have a SectorQuality of DealWeightMultiplier/QualityBaseMultiplier.
/// Sectors with neither will have a SectorQuality of QualityBaseMultiplier/QualityBaseMultiplier.
/// SectorQuality of a sector is a weighted average of multipliers based on their proportions.
pub fn quality_for_weight(
    size: SectorSize,
    duration: ChainEpoch,
    deal_weight: &DealWeight,
    verified_weight: &DealWeight,
) -> SectorQuality {
    let sector_space_time = BigInt::from(size as u64) * BigInt::from(duration);
    let total_deal_space_time = deal_weight + verified_weight;

    let weighted_base_space_time =
        (&sector_space_time - total_deal_space_time) * &*QUALITY_BASE_MULTIPLIER;
    let weighted_deal_space_time = deal_weight * &*DEAL_WEIGHT_MULTIPLIER;
    let weighted_verified_space_time = verified_weight * &*VERIFIED_DEAL_WEIGHT_MULTIPLIER;
    let weighted_sum_space_time =
        weighted_base_space_time + weighted_deal_space_time + weighted_verified_space_time;
    let scaled_up_weighted_sum_space_time: SectorQuality =
        weighted_sum_space_time << SECTOR_QUALITY_PRECISION;

    scaled_up_weighted_sum_space_time
        .div_floor(&sector_space_time)
        .div_floor(&QUALITY_BASE_MULTIPLIER)
}

/// Returns the power for a sector size and weight.
pub fn qa_power_for_weight(
    size: SectorSize,
    duration: ChainEpoch,
    deal_weight: &DealWeight,
    verified_weight: &DealWeight,
) -> StoragePower {
    let quality = quality_for_weight(size, duration, deal_weight, verified_weight);
    (BigInt::from(size as u64) * quality) >> SECTOR_QUALITY_PRECISION
}

/// Returns the quality-adjusted power for a sector.
pub fn qa_power_for_sector(size: SectorSize, sector: &SectorOnChainInfo) -> StoragePower {
    let duration = sector.expiration - sector.activation;
    qa_power_for_weight(size, duration, &sector.deal_weight, &sector.verified_deal_weight)
}

/// Determine maximum number of deal miner's sector can hold
pub fn sector_deals_max(policy: &Policy, size: SectorSize) -> u64 {
    cmp::max(256, size as u64 / policy.deal_limit_denominator)
}

/// Specification for a linear vesting schedule.
pub struct VestSpec {
    /// Delay before any amount starts vesting.
    pub initial_delay: ChainEpoch,
    /// Period over which the total should vest, after the initial delay.
    pub vest_period: ChainEpoch,
    /// Duration between successive incremental vests (independent of vesting period).
    pub step_duration: ChainEpoch,
    /// Maximum precision of vesting table (limits cardinality of table).
    pub quantization: ChainEpoch,
}

/// Schedule on which pledge and locked rewards vest into the available balance.
/// Quantization is aligned between miners so all vested amounts mature synchronously.
pub const PLEDGE_VESTING_SPEC: VestSpec = VestSpec {
    initial_delay: 7 * EPOCHS_IN_DAY,
    vest_period: 7 * EPOCHS_IN_DAY,
    step_duration: EPOCHS_IN_DAY,
    quantization: 12 * EPOCHS_IN_HOUR,
};

lazy_static! {
    static ref CONSENSUS_FAULT_REPORTER_INITIAL_SHARE_NUM: BigInt = BigInt::from(1);
    static ref CONSENSUS_FAULT_REPORTER_INITIAL_SHARE_DENOM: BigInt = BigInt::from(1000);
    static ref CONSENSUS_FAULT_REPORTER_SHARE_GROWTH_RATE_NUM: BigInt = BigInt::from(101251);
    static ref CONSENSUS_FAULT_REPORTER_SHARE_GROWTH_RATE_DENOM: BigInt = BigInt::from(100000);
}

/// Specification for a linear reward to the reporter of a consensus fault.
/// The reporter's share of the miner's current balance grows with the age of the fault,
/// up to a fixed maximum share.
pub fn reward_for_consensus_slash_report(
    elapsed_epoch: ChainEpoch,
    collateral: &TokenAmount,
) -> TokenAmount {
    // High level description
    // var growth_rate = SLASHER_SHARE_GROWTH_RATE_NUM / SLASHER_SHARE_GROWTH_RATE_DENOM
    // var multiplier = growth_rate^elapsed_epoch
    // var slasher_proportion = min(INITIAL_SLASHER_SHARE * multiplier, 0.05)
    // return collateral * slasher_proportion
    let max_reporter_share_num = BigInt::from(1);
    let max_reporter_share_denom = BigInt::from(20);

    let elapsed = elapsed_epoch.max(0) as u32;
    let slasher_share_numerator = CONSENSUS_FAULT_REPORTER_SHARE_GROWTH_RATE_NUM.pow(elapsed);
    let slasher_share_denominator = CONSENSUS_FAULT_REPORTER_SHARE_GROWTH_RATE_DENOM.pow(elapsed);

    let num: BigInt = (slasher_share_numerator * &*CONSENSUS_FAULT_REPORTER_INITIAL_SHARE_NUM)
        * collateral.atto();
    let denom = slasher_share_denominator * &*CONSENSUS_FAULT_REPORTER_INITIAL_SHARE_DENOM;

    cmp::min(
        TokenAmount::from_atto(num.div_floor(&denom)),
        TokenAmount::from_atto(
            (collateral.atto() * max_reporter_share_num).div_floor(&max_reporter_share_denom),
        ),
    )
}
