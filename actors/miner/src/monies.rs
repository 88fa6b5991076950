// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;

use fil_actors_runtime::network::EPOCHS_IN_DAY;
use fil_actors_runtime::reward::math::PRECISION;
use fil_actors_runtime::reward::{FilterEstimate, smooth};
use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::StoragePower;
use lazy_static::lazy_static;
use num_traits::Zero;

/// Projection period of expected sector block reward for deposit required to pre-commit a sector.
/// This deposit is lost if the pre-commitment is not timely followed up by a commitment proof.
const PRE_COMMIT_DEPOSIT_FACTOR: u64 = 20;

/// Projection period of expected sector block rewards for storage pledge required to commit a sector.
/// This pledge is lost if a sector is terminated before its full committed lifetime.
pub const INITIAL_PLEDGE_FACTOR: u64 = 20;

pub const PRE_COMMIT_DEPOSIT_PROJECTION_PERIOD: i64 =
    (PRE_COMMIT_DEPOSIT_FACTOR as ChainEpoch) * EPOCHS_IN_DAY;
pub const INITIAL_PLEDGE_PROJECTION_PERIOD: i64 =
    (INITIAL_PLEDGE_FACTOR as ChainEpoch) * EPOCHS_IN_DAY;

/// Projection period of expected daily sector block reward penalised when a fault is declared
/// or detected and again for every proving period the fault persists.
/// This guarantees that a miner pays back at least the expected reward earned since the last
/// successful PoSt.
const DECLARED_FAULT_FACTOR_NUM: i64 = 214;
const DECLARED_FAULT_FACTOR_DENOM: i64 = 100;
pub const DECLARED_FAULT_PROJECTION_PERIOD: ChainEpoch =
    (EPOCHS_IN_DAY * DECLARED_FAULT_FACTOR_NUM) / DECLARED_FAULT_FACTOR_DENOM;

/// Projection period of expected daily sector block reward penalised for a fault that was not
/// declared in advance of the proof deadline. The penalty is bigger to incentivise declaration.
const UNDECLARED_FAULT_FACTOR_NUM: i64 = 50;
const UNDECLARED_FAULT_FACTOR_DENOM: i64 = 10;
pub const UNDECLARED_FAULT_PROJECTION_PERIOD: ChainEpoch =
    (EPOCHS_IN_DAY * UNDECLARED_FAULT_FACTOR_NUM) / UNDECLARED_FAULT_FACTOR_DENOM;

/// Maximum number of days of expected rewards penalized when a sector is terminated.
pub const TERMINATION_LIFETIME_CAP: ChainEpoch = 70;

pub const TERMINATION_REWARD_FACTOR_NUM: u32 = 1;
pub const TERMINATION_REWARD_FACTOR_DENOM: u32 = 2;

const LOCK_TARGET_FACTOR_NUM: u32 = 3;
const LOCK_TARGET_FACTOR_DENOM: u32 = 10;

lazy_static! {
    /// Cap on initial pledge requirement for sectors.
    /// The target is 1 FIL (10**18 attoFIL) per 32GiB.
    /// This does not divide evenly, so the result is fractionally smaller.
    static ref INITIAL_PLEDGE_MAX_PER_BYTE: TokenAmount =
        TokenAmount::from_whole(1).div_floor(32i64 << 30);
}

/// The projected block reward a sector would earn over some period.
/// Also known as "BR(t)".
/// BR(t) = ProjectedRewardFraction(t) * SectorQualityAdjustedPower
/// ProjectedRewardFraction(t) is the sum of estimated reward over estimated total power
/// over all epochs in the projection period [t t+projectionDuration]
pub fn expected_reward_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
    projection_duration: ChainEpoch,
) -> TokenAmount {
    let network_qa_power_smoothed = network_qa_power_estimate.estimate();

    if network_qa_power_smoothed.is_zero() {
        return TokenAmount::from_atto(reward_estimate.estimate());
    }

    let expected_reward_for_proving_period = smooth::extrapolated_cum_sum_of_ratio(
        projection_duration,
        0,
        reward_estimate,
        network_qa_power_estimate,
    );
    let br = qa_sector_power * expected_reward_for_proving_period; // Q.0 * Q.128 => Q.128
    TokenAmount::from_atto(br >> PRECISION)
}

/// The penalty for a sector fault declared before the fault's proof deadline, or
/// charged for an ongoing fault at each proof deadline it persists.
/// It is a projection of the expected reward earned by the sector.
/// Also known as "FF(t)"
pub fn pledge_penalty_for_declared_fault(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        DECLARED_FAULT_PROJECTION_PERIOD,
    )
}

/// The penalty for a newly faulty sector that has not been declared in advance.
/// SP(t) = UndeclaredFaultFactor * BR(t)
pub fn pledge_penalty_for_undeclared_fault(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        UNDECLARED_FAULT_PROJECTION_PERIOD,
    )
}

/// Penalty to locked pledge collateral for the termination of a sector before scheduled expiry.
/// SectorAge is the time between the sector's activation and termination.
#[allow(clippy::too_many_arguments)]
pub fn pledge_penalty_for_termination(
    day_reward_at_activation: &TokenAmount,
    twenty_day_reward_at_activation: &TokenAmount,
    sector_age: ChainEpoch,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    // max(SP(t), BR(StartEpoch, 20d) + BR(StartEpoch, 1d)*terminationRewardFactor*min(SectorAgeInDays, 70))
    let capped_sector_age =
        BigInt::from(cmp::min(sector_age, TERMINATION_LIFETIME_CAP * EPOCHS_IN_DAY));
    cmp::max(
        pledge_penalty_for_undeclared_fault(
            reward_estimate,
            network_qa_power_estimate,
            qa_sector_power,
        ),
        twenty_day_reward_at_activation
            + TokenAmount::from_atto(
                (day_reward_at_activation.atto()
                    * capped_sector_age
                    * TERMINATION_REWARD_FACTOR_NUM)
                    .div_floor(
                        &(BigInt::from(EPOCHS_IN_DAY) * TERMINATION_REWARD_FACTOR_DENOM),
                    ),
            ),
    )
}

/// Computes the PreCommit Deposit given sector qa weight and current network conditions.
/// PreCommit Deposit = 20 * BR(t)
pub fn pre_commit_deposit_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        PRE_COMMIT_DEPOSIT_PROJECTION_PERIOD,
    )
}

/// Computes the pledge requirement for committing new quality-adjusted power to the network, given
/// the current network total and baseline power, per-epoch reward, and circulating token supply.
/// The pledge comprises two parts:
/// - storage pledge, aka IP base: a multiple of the reward expected to be earned by newly-committed power
/// - consensus pledge, aka additional IP: a pro-rata fraction of the circulating money supply
///
/// IP = IPBase(t) + AdditionalIP(t)
/// IPBase(t) = BR(t, InitialPledgeProjectionPeriod)
/// AdditionalIP(t) = LockTarget(t)*PledgeShare(t)
/// LockTarget = (LockTargetFactorNum / LockTargetFactorDenom) * FILCirculatingSupply(t)
/// PledgeShare(t) = sectorQAPower / max(BaselinePower(t), NetworkQAPower(t))
pub fn initial_pledge_for_power(
    qa_power: &StoragePower,
    baseline_power: &StoragePower,
    _network_total_pledge: &TokenAmount,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    circulating_supply: &TokenAmount,
) -> TokenAmount {
    let ip_base = expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        INITIAL_PLEDGE_PROJECTION_PERIOD,
    );

    let lock_target_num = circulating_supply.atto() * LOCK_TARGET_FACTOR_NUM;
    let lock_target_denom = BigInt::from(LOCK_TARGET_FACTOR_DENOM);

    let network_qa_power = network_qa_power_estimate.estimate();
    let pledge_share_num = qa_power;
    let pledge_share_denom =
        cmp::max(cmp::max(&network_qa_power, baseline_power), qa_power).clone();

    let additional_ip_num = lock_target_num * pledge_share_num;
    let additional_ip_denom = pledge_share_denom * lock_target_denom;
    let additional_ip = additional_ip_num.div_floor(&additional_ip_denom);

    let nominal_pledge = ip_base + TokenAmount::from_atto(additional_ip);
    let pledge_cap = TokenAmount::from_atto(INITIAL_PLEDGE_MAX_PER_BYTE.atto() * qa_power);

    cmp::min(nominal_pledge, pledge_cap)
}
