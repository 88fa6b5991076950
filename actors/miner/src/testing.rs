// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use fil_actors_runtime::runtime::Policy;
use fil_actors_runtime::{MessageAccumulator, make_map_with_root_and_bitwidth};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{SectorNumber, SectorSize};
use num_traits::Zero;

use crate::{
    BitFieldQueue, ExpirationQueue, Partition, PowerPair, QuantSpec, SectorOnChainInfo,
    SectorPreCommitOnChainInfo, Sectors, State, power_for_sectors,
};

pub struct StateSummary {
    pub live_power: PowerPair,
    pub active_power: PowerPair,
    pub faulty_power: PowerPair,
    pub sector_count: u64,
}

/// Checks the miner state for inconsistencies, accumulating messages for any that are found.
/// Invariant violations here indicate a bug in the actor, not bad user input.
pub fn check_state_invariants<BS: Blockstore>(
    policy: &Policy,
    state: &State,
    store: &BS,
    balance: &TokenAmount,
) -> (StateSummary, MessageAccumulator) {
    let acc = MessageAccumulator::default();

    // Load sector infos for cross-referencing from partitions.
    let mut all_sectors = BTreeMap::<SectorNumber, SectorOnChainInfo>::new();
    let mut sector_size = SectorSize::_32GiB;
    match state.get_info(store) {
        Ok(info) => {
            sector_size = info.sector_size;
            acc.require(
                info.window_post_partition_sectors > 0,
                "miner partition sectors should be positive",
            );
        }
        Err(e) => acc.add(format!("error loading miner info: {e}")),
    }

    match Sectors::load(store, &state.sectors) {
        Ok(sectors) => {
            let ret = sectors.amt.for_each(|sector_number, sector| {
                acc.require(
                    sector.sector_number == sector_number,
                    format!("sector number {} mismatches key {sector_number}", sector.sector_number),
                );
                all_sectors.insert(sector_number, sector.clone());
                Ok(())
            });
            acc.require_no_error(ret, "error iterating sectors");
        }
        Err(e) => acc.add(format!("error loading sectors: {e}")),
    }

    // Check deadlines and partitions.
    let mut all_live_power = PowerPair::zero();
    let mut all_active_power = PowerPair::zero();
    let mut all_faulty_power = PowerPair::zero();
    let mut all_sector_count = 0u64;
    let mut total_live_pledge = TokenAmount::zero();

    acc.require(
        state.current_deadline < policy.wpost_period_deadlines,
        format!("current deadline index {} out of range", state.current_deadline),
    );

    match state.load_deadlines(store) {
        Ok(deadlines) => {
            let ret = deadlines.for_each(store, |deadline_idx, deadline| {
                let acc = acc.with_prefix(format!("deadline {deadline_idx}: "));
                let quant = state.quant_spec_for_deadline(policy, deadline_idx);

                let mut deadline_live_sectors = 0u64;
                let mut deadline_total_sectors = 0u64;
                let mut deadline_faulty_power = PowerPair::zero();
                let mut partition_count = 0u64;

                let partitions = deadline.partitions_amt(store)?;
                partitions.for_each(|partition_idx, partition| {
                    let acc = acc.with_prefix(format!("partition {partition_idx}: "));
                    partition_count += 1;

                    check_partition_invariants(
                        &acc,
                        store,
                        partition,
                        quant,
                        sector_size,
                        &all_sectors,
                    );

                    deadline_live_sectors += partition.live_sectors().len();
                    deadline_total_sectors += partition.sectors.len();
                    deadline_faulty_power += &partition.faulty_power;

                    all_live_power += &partition.live_power;
                    all_active_power += &partition.active_power();
                    all_faulty_power += &partition.faulty_power;
                    all_sector_count += partition.live_sectors().len();

                    for sector_number in partition.live_sectors().iter() {
                        if let Some(sector) = all_sectors.get(&sector_number) {
                            total_live_pledge += &sector.initial_pledge;
                        } else {
                            acc.add(format!("live sector {sector_number} has no sector info"));
                        }
                    }

                    Ok(())
                })?;

                acc.require(
                    deadline.live_sectors == deadline_live_sectors,
                    format!(
                        "deadline live sectors {} does not match partitions {}",
                        deadline.live_sectors, deadline_live_sectors
                    ),
                );
                acc.require(
                    deadline.total_sectors == deadline_total_sectors,
                    format!(
                        "deadline total sectors {} does not match partitions {}",
                        deadline.total_sectors, deadline_total_sectors
                    ),
                );
                acc.require(
                    deadline.faulty_power == deadline_faulty_power,
                    "deadline faulty power does not match partitions",
                );

                // PoSt submissions must be a subset of the partition numbers.
                for partition_idx in deadline.post_submissions.iter() {
                    acc.require(
                        partition_idx < partition_count,
                        format!("post submission for missing partition {partition_idx}"),
                    );
                }

                // Early terminations must reference existing partitions.
                for partition_idx in deadline.early_terminations.iter() {
                    acc.require(
                        partition_idx < partition_count,
                        format!("early termination for missing partition {partition_idx}"),
                    );
                }

                Ok(())
            });
            acc.require_no_error(ret, "error iterating deadlines");
        }
        Err(e) => acc.add(format!("error loading deadlines: {e}")),
    }

    // Pre-committed sectors.
    let mut precommit_total = TokenAmount::zero();
    match make_map_with_root_and_bitwidth::<_, SectorPreCommitOnChainInfo>(
        &state.pre_committed_sectors,
        store,
        fil_actors_runtime::HAMT_BIT_WIDTH,
    ) {
        Ok(precommitted) => {
            let ret = precommitted.for_each(|_, precommit| {
                acc.require(
                    !precommit.pre_commit_deposit.is_negative(),
                    "pre-commit deposit is negative",
                );
                precommit_total += &precommit.pre_commit_deposit;
                Ok(())
            });
            acc.require_no_error(ret, "error iterating pre-committed sectors");
        }
        Err(e) => acc.add(format!("error loading pre-committed sectors: {e}")),
    }
    acc.require(
        state.pre_commit_deposits == precommit_total,
        format!(
            "pre-commit deposits {} do not match sum of deposits {}",
            state.pre_commit_deposits, precommit_total
        ),
    );

    // Initial pledge requirement equals the sum over live sectors.
    acc.require(
        state.initial_pledge_requirement == total_live_pledge,
        format!(
            "initial pledge requirement {} does not match sum of live sector pledges {}",
            state.initial_pledge_requirement, total_live_pledge
        ),
    );

    // Vesting table total equals locked funds.
    match state.load_vesting_funds(store) {
        Ok(funds) => {
            let mut total_vesting = TokenAmount::zero();
            let mut prev_epoch: Option<ChainEpoch> = None;
            for fund in &funds.funds {
                acc.require(fund.amount.is_positive(), "vesting entry with non-positive amount");
                if let Some(prev) = prev_epoch {
                    acc.require(fund.epoch > prev, "vesting table not sorted by epoch");
                }
                prev_epoch = Some(fund.epoch);
                total_vesting += &fund.amount;
            }
            acc.require(
                state.locked_funds == total_vesting,
                format!(
                    "locked funds {} do not match sum of vesting table {}",
                    state.locked_funds, total_vesting
                ),
            );
        }
        Err(e) => acc.add(format!("error loading vesting funds: {e}")),
    }

    // Balance covers the commitments.
    acc.require(
        balance >= &(&state.pre_commit_deposits + &state.locked_funds),
        format!(
            "balance {} below locked commitments {}",
            balance,
            &state.pre_commit_deposits + &state.locked_funds
        ),
    );

    (
        StateSummary {
            live_power: all_live_power,
            active_power: all_active_power,
            faulty_power: all_faulty_power,
            sector_count: all_sector_count,
        },
        acc,
    )
}

fn check_partition_invariants<BS: Blockstore>(
    acc: &MessageAccumulator,
    store: &BS,
    partition: &Partition,
    quant: QuantSpec,
    sector_size: SectorSize,
    all_sectors: &BTreeMap<SectorNumber, SectorOnChainInfo>,
) {
    let live = partition.live_sectors();

    acc.require(
        partition.sectors.contains_all(&partition.terminated),
        "terminated sectors not contained in all sectors",
    );
    acc.require(
        live.contains_all(&partition.faults),
        "faulty sectors not contained in live sectors",
    );
    acc.require(
        partition.faults.contains_all(&partition.recoveries),
        "recovering sectors not contained in faulty sectors",
    );
    acc.require(
        (&partition.faults & &partition.terminated).is_empty(),
        "terminated sectors are faulty",
    );

    // Check power memos against sector infos.
    let lookup = |bf: &BitField| -> Option<Vec<SectorOnChainInfo>> {
        let mut sectors = Vec::new();
        for sector_number in bf.iter() {
            match all_sectors.get(&sector_number) {
                Some(sector) => sectors.push(sector.clone()),
                None => {
                    acc.add(format!("sector {sector_number} has no info"));
                    return None;
                }
            }
        }
        Some(sectors)
    };

    if let Some(live_sectors) = lookup(&live) {
        let live_power = power_for_sectors(sector_size, &live_sectors);
        acc.require(
            partition.live_power == live_power,
            format!(
                "live power {:?} does not match sectors {:?}",
                partition.live_power, live_power
            ),
        );
    }
    if let Some(faulty_sectors) = lookup(&partition.faults) {
        let faulty_power = power_for_sectors(sector_size, &faulty_sectors);
        acc.require(
            partition.faulty_power == faulty_power,
            format!(
                "faulty power {:?} does not match sectors {:?}",
                partition.faulty_power, faulty_power
            ),
        );
    }
    if let Some(recovering_sectors) = lookup(&partition.recoveries) {
        let recovering_power = power_for_sectors(sector_size, &recovering_sectors);
        acc.require(
            partition.recovering_power == recovering_power,
            format!(
                "recovering power {:?} does not match sectors {:?}",
                partition.recovering_power, recovering_power
            ),
        );
    }

    // Validate the expiration queue.
    match ExpirationQueue::new(store, &partition.expirations_epochs, quant) {
        Ok(queue) => {
            let mut seen = BitField::new();
            let ret = queue.amt.for_each(|epoch, expiration_set| {
                let all = &expiration_set.on_time_sectors | &expiration_set.early_sectors;
                acc.require(
                    live.contains_all(&all),
                    format!("expiration queue at {epoch} references non-live sectors"),
                );
                acc.require(
                    !seen.contains_any(&all),
                    format!("expiration queue at {epoch} repeats sectors"),
                );
                seen |= &all;
                acc.require(
                    quant.quantize_up(epoch as ChainEpoch) == epoch as ChainEpoch,
                    format!("expiration queue epoch {epoch} is not quantized"),
                );
                Ok(())
            });
            acc.require_no_error(ret, "error iterating expiration queue");
        }
        Err(e) => acc.add(format!("error loading expiration queue: {e}")),
    }

    // Validate the early termination queue.
    match BitFieldQueue::new(store, &partition.early_terminated, crate::NO_QUANTIZATION) {
        Ok(queue) => {
            let ret = queue.amt.for_each(|_, bf| {
                acc.require(
                    partition.terminated.contains_all(bf),
                    "early termination queue contains unterminated sectors",
                );
                Ok(())
            });
            acc.require_no_error(ret, "error iterating early termination queue");
        }
        Err(e) => acc.add(format!("error loading early termination queue: {e}")),
    }
}
