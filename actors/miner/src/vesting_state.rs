// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::ops::AddAssign;

use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;

use super::{QuantSpec, VestSpec};

/// Represents miner funds that will vest at the given epoch.
#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct VestingFund {
    pub epoch: ChainEpoch,
    pub amount: TokenAmount,
}

/// Represents the vesting table state for the miner.
/// It is a list of (vesting epoch, vesting amount).
/// The fund amounts are positive and ordered by epoch, ascending.
#[derive(Debug, Serialize_tuple, Deserialize_tuple)]
pub struct VestingFunds {
    pub funds: Vec<VestingFund>,
}

impl VestingFunds {
    pub fn new() -> Self {
        Self { funds: Vec::new() }
    }

    pub fn unlock_vested_funds(&mut self, current_epoch: ChainEpoch) -> TokenAmount {
        // The funds are in order of epoch, so we can just look for the first fund that is
        // in the future.
        let i = self
            .funds
            .iter()
            .position(|fund| fund.epoch >= current_epoch)
            .unwrap_or(self.funds.len());

        self.funds.drain(..i).map(|f| f.amount).sum()
    }

    /// Adds locked funds, vesting over the given schedule.
    /// The vesting epochs are quantized so that all miners' vesting amounts mature
    /// at the same epochs, limiting the overall table cardinality.
    pub fn add_locked_funds(
        &mut self,
        current_epoch: ChainEpoch,
        vesting_sum: &TokenAmount,
        proving_period_start: ChainEpoch,
        spec: &VestSpec,
    ) {
        // Quantization is aligned with when regular cron will be invoked, in the last epoch of deadlines.
        let vest_begin = current_epoch + spec.initial_delay; // Nothing unlocks here, this is just the start of the clock.

        let mut vested_so_far = TokenAmount::zero();
        let mut epoch = vest_begin;

        // Maintain the invariant that the table is sorted by epoch, and has at most one entry
        // per epoch, by merging the new schedule into the existing entries.
        let mut entries: BTreeMap<ChainEpoch, TokenAmount> =
            self.funds.drain(..).map(|fund| (fund.epoch, fund.amount)).collect();

        while vested_so_far < *vesting_sum {
            epoch += spec.step_duration;

            let vest_epoch = QuantSpec { unit: spec.quantization, offset: proving_period_start }
                .quantize_up(epoch);

            let elapsed = vest_epoch - vest_begin;
            let target_vest = if elapsed < spec.vest_period {
                // Linear vesting
                (vesting_sum * elapsed).div_floor(spec.vest_period)
            } else {
                vesting_sum.clone()
            };

            let vest_this_time = &target_vest - &vested_so_far;
            vested_so_far = target_vest;

            entries.entry(vest_epoch).or_insert_with(TokenAmount::zero).add_assign(vest_this_time);
        }

        self.funds = entries
            .into_iter()
            .map(|(epoch, amount)| VestingFund { epoch, amount })
            .collect();
    }

    /// Unlocks amounts of the table that are not yet vested, up to the target.
    /// Unvested amounts are drawn from the latest vesting epochs first, so the
    /// near-term vesting schedule is disturbed as little as possible.
    /// Returns the amount actually unlocked, capped at the total unvested funds.
    pub fn unlock_unvested_funds(
        &mut self,
        current_epoch: ChainEpoch,
        target: &TokenAmount,
    ) -> TokenAmount {
        let mut amount_unlocked = TokenAmount::zero();

        for fund in self.funds.iter_mut().rev() {
            if amount_unlocked >= *target {
                break;
            }
            if fund.epoch < current_epoch {
                // Entries earlier than this have already matured; they are drawn by
                // unlock_vested_funds, not penalties.
                break;
            }

            let unlock_amount =
                std::cmp::min(fund.amount.clone(), target - &amount_unlocked);
            amount_unlocked += &unlock_amount;
            fund.amount -= &unlock_amount;
        }

        self.funds.retain(|fund| !fund.amount.is_zero());

        amount_unlocked
    }
}

impl Default for VestingFunds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use fil_actors_runtime::network::{EPOCHS_IN_DAY, EPOCHS_IN_HOUR};

    use super::*;
    use crate::PLEDGE_VESTING_SPEC;

    fn total(funds: &VestingFunds) -> TokenAmount {
        funds.funds.iter().map(|f| f.amount.clone()).sum()
    }

    #[test]
    fn locked_funds_vest_over_schedule() {
        let mut funds = VestingFunds::new();
        let amount = TokenAmount::from_atto(7 * EPOCHS_IN_DAY);
        funds.add_locked_funds(0, &amount, 0, &PLEDGE_VESTING_SPEC);

        assert_eq!(amount, total(&funds));
        // All epochs quantized to 12-hour boundaries.
        for fund in &funds.funds {
            assert_eq!(0, fund.epoch % (12 * EPOCHS_IN_HOUR));
        }

        // Nothing vests before the initial delay has passed.
        assert!(funds.unlock_vested_funds(PLEDGE_VESTING_SPEC.initial_delay).is_zero());

        // Everything has vested after delay + period (plus quantization slack).
        let vested = funds.unlock_vested_funds(
            PLEDGE_VESTING_SPEC.initial_delay
                + PLEDGE_VESTING_SPEC.vest_period
                + PLEDGE_VESTING_SPEC.quantization
                + PLEDGE_VESTING_SPEC.step_duration
                + 1,
        );
        assert_eq!(amount, vested);
        assert!(funds.funds.is_empty());
    }

    #[test]
    fn unvested_funds_unlock_latest_first() {
        let mut funds = VestingFunds::new();
        let amount = TokenAmount::from_atto(1_000_000);
        funds.add_locked_funds(0, &amount, 0, &PLEDGE_VESTING_SPEC);
        let schedule_before: Vec<ChainEpoch> = funds.funds.iter().map(|f| f.epoch).collect();

        let target = TokenAmount::from_atto(100);
        let unlocked = funds.unlock_unvested_funds(0, &target);
        assert_eq!(target, unlocked);

        // The earliest entries are untouched.
        assert_eq!(schedule_before[0], funds.funds[0].epoch);
        assert_eq!(amount - target, total(&funds));

        // Unlocking more than is locked caps at the total.
        let big_target = TokenAmount::from_atto(10_000_000);
        let unlocked = funds.unlock_unvested_funds(0, &big_target);
        assert!(funds.funds.is_empty());
        assert_eq!(TokenAmount::from_atto(999_900), unlocked);
    }
}
