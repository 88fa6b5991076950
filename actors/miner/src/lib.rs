// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;
use std::collections::BTreeMap;
use std::iter;
use std::ops::Neg;

use anyhow::anyhow;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use cid::Cid;
use cid::multihash::Code::Blake2b256;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::CborStore;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::METHOD_CONSTRUCTOR;
use fvm_shared::METHOD_SEND;
use fvm_shared::address::{Address, Payload, Protocol};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    RegisteredSealProof, SealVerifyInfo, SectorID, SectorInfo, SectorNumber, SectorSize,
    WindowPoStVerifyInfo,
};
use log::{error, info, warn};
use num_derive::FromPrimitive;
use num_traits::Zero;

pub use bitfield_queue::*;
pub use deadline_info::*;
pub use deadline_state::*;
pub use deadlines::*;
pub use expiration_queue::*;
use fil_actors_runtime::cbor::{serialize, serialize_vec};
use fil_actors_runtime::reward::{FilterEstimate, ThisEpochRewardReturn};
use fil_actors_runtime::runtime::builtins::Type;
use fil_actors_runtime::runtime::policy_constants::MAX_SECTOR_NUMBER;
use fil_actors_runtime::runtime::{ActorCode, DomainSeparationTag, Policy, Runtime};
use fil_actors_runtime::{
    ActorDowncast, ActorError, BURNT_FUNDS_ACTOR_ADDR, CALLER_TYPES_SIGNABLE, INIT_ACTOR_ADDR,
    REWARD_ACTOR_ADDR, STORAGE_MARKET_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR, actor_dispatch,
    actor_error, deserialize_block, extract_send_result,
};
pub use monies::*;
pub use partition_state::*;
pub use policy::*;
pub use quantize::*;
pub use sector_map::*;
pub use sectors::*;
pub use state::*;
pub use termination::*;
pub use types::*;
pub use vesting_state::*;

mod bitfield_queue;
mod deadline_info;
mod deadline_state;
mod deadlines;
mod expiration_queue;
#[doc(hidden)]
pub mod ext;
mod monies;
mod partition_state;
mod policy;
mod quantize;
mod sector_map;
mod sectors;
mod state;
mod termination;
pub mod testing;
mod types;
mod vesting_state;

/// Distinguished exit code for broken balance invariants; a particular case of illegal state.
/// Not expected to ever happen, but a distinguished code helps diagnose the problem if it does.
pub const ERR_BALANCE_INVARIANTS_BROKEN: ExitCode = ExitCode::new(1000);

/// Limit on the number of deal ids in a single message to the market actor,
/// imposed by the CBOR array marshal limit.
const DEAL_TERMINATION_BATCH_SIZE: usize = 8192;

/// Storage Miner actor methods available
#[derive(FromPrimitive)]
#[repr(u64)]
pub enum Method {
    Constructor = METHOD_CONSTRUCTOR,
    ControlAddresses = 2,
    ChangeWorkerAddress = 3,
    ChangePeerID = 4,
    SubmitWindowedPoSt = 5,
    PreCommitSector = 6,
    ProveCommitSector = 7,
    ExtendSectorExpiration = 8,
    TerminateSectors = 9,
    DeclareFaults = 10,
    DeclareFaultsRecovered = 11,
    OnDeferredCronEvent = 12,
    CheckSectorProven = 13,
    AddLockedFund = 14,
    ReportConsensusFault = 15,
    WithdrawBalance = 16,
    ConfirmSectorProofsValid = 17,
    ChangeMultiaddrs = 18,
}

/// Miner Actor
pub struct Actor;

impl Actor {
    pub fn constructor(
        rt: &impl Runtime,
        params: MinerConstructorParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(iter::once(&INIT_ACTOR_ADDR))?;

        check_peer_info(rt.policy(), &params.peer_id, &params.multi_addresses)?;

        if !can_pre_commit_seal_proof(rt.policy(), params.seal_proof_type) {
            return Err(actor_error!(
                illegal_argument,
                "proof type {:?} not allowed for new miner actors",
                params.seal_proof_type
            ));
        }

        let owner = resolve_owner_address(rt, params.owner)?;
        let worker = resolve_worker_address(rt, params.worker)?;

        let policy = rt.policy();
        let current_epoch = rt.curr_epoch();
        let blake2b = |b: &[u8]| rt.hash_blake2b(b);
        let offset =
            assign_proving_period_offset(policy, rt.message().receiver(), current_epoch, blake2b)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_SERIALIZATION,
                        "failed to assign proving period offset",
                    )
                })?;

        let period_start = next_proving_period_start(policy, current_epoch, offset);
        if period_start <= current_epoch {
            return Err(actor_error!(
                illegal_state,
                "computed proving period start {} not after current epoch {}",
                period_start,
                current_epoch
            ));
        }

        let info = MinerInfo::new(
            owner,
            worker,
            params.peer_id,
            params.multi_addresses,
            params.seal_proof_type,
        )?;
        let info_cid = rt.store().put_cbor(&info, Blake2b256).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to construct miner info")
        })?;

        let st = State::new(rt.policy(), rt.store(), info_cid, period_start)?;
        rt.create(&st)?;

        // Register the first proving-deadline cron callback for the epoch before the period starts.
        enroll_cron_event(
            rt,
            period_start - 1,
            CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE, sectors: None },
        )?;

        Ok(())
    }

    /// Returns the "controlling" addresses: the owner and the worker.
    fn control_addresses(rt: &impl Runtime) -> Result<GetControlAddressesReturn, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let state: State = rt.state()?;
        let info = get_miner_info(rt.store(), &state)?;
        Ok(GetControlAddressesReturn { owner: info.owner, worker: info.worker })
    }

    /// Stages a worker-key change, to be committed by a deferred cron callback after the
    /// security delay has passed.
    fn change_worker_address(
        rt: &impl Runtime,
        params: ChangeWorkerAddressParams,
    ) -> Result<(), ActorError> {
        let new_worker = resolve_worker_address(rt, params.new_worker)?;

        let effective_epoch = rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            // Only the owner is allowed to change the worker address.
            rt.validate_immediate_caller_is(iter::once(&info.owner))?;

            let effective_epoch = rt.curr_epoch() + rt.policy().worker_key_change_delay;

            // This may replace another pending key change.
            info.pending_worker_key =
                Some(WorkerKeyChange { new_worker, effective_at: effective_epoch });

            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(effective_epoch)
        })?;

        enroll_cron_event(
            rt,
            effective_epoch,
            CronEventPayload { event_type: CRON_EVENT_WORKER_KEY_CHANGE, sectors: None },
        )?;

        Ok(())
    }

    fn change_peer_id(rt: &impl Runtime, params: ChangePeerIDParams) -> Result<(), ActorError> {
        check_peer_info(rt.policy(), &params.new_id, &[])?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(iter::once(&info.worker))?;

            info.peer_id = params.new_id;
            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(())
        })?;
        Ok(())
    }

    fn change_multiaddrs(
        rt: &impl Runtime,
        params: ChangeMultiaddrsParams,
    ) -> Result<(), ActorError> {
        check_peer_info(rt.policy(), &[], &params.new_multi_addrs)?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(iter::once(&info.worker))?;

            info.multi_address = params.new_multi_addrs;
            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(())
        })?;
        Ok(())
    }

    /// Invoked by miner's worker address to submit their fallback post.
    fn submit_windowed_post(
        rt: &impl Runtime,
        params: SubmitWindowedPoStParams,
    ) -> Result<(), ActorError> {
        let current_epoch = rt.curr_epoch();

        if params.proofs.len() != 1 {
            return Err(actor_error!(
                illegal_argument,
                "expected exactly one proof, got {}",
                params.proofs.len()
            ));
        }

        if params.deadline >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(
                illegal_argument,
                "invalid deadline {} of {}",
                params.deadline,
                rt.policy().wpost_period_deadlines
            ));
        }

        // Fetch the current reward and power before the state transaction; penalties for
        // skipped faults depend on them.
        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_stats = request_current_total_power(rt)?;

        let (post_result, penalty_from_vesting, penalty_from_balance) =
            rt.transaction(|state: &mut State, rt| {
                let info = get_miner_info(rt.store(), state)?;

                rt.validate_immediate_caller_is(iter::once(&info.worker))?;

                let window_post_proof_type =
                    info.seal_proof_type.registered_window_post_proof().map_err(|e| {
                        actor_error!(illegal_state, "failed to lookup window PoSt proof type: {}", e)
                    })?;
                if params.proofs[0].post_proof != window_post_proof_type {
                    return Err(actor_error!(
                        illegal_argument,
                        "expected proof of type {:?}, got {:?}",
                        window_post_proof_type,
                        params.proofs[0].post_proof
                    ));
                }

                // Validate that the miner didn't try to prove too many partitions at once.
                let submission_partition_limit =
                    load_partitions_sectors_max(rt.policy(), info.window_post_partition_sectors);
                if params.partitions.len() as u64 > submission_partition_limit {
                    return Err(actor_error!(
                        illegal_argument,
                        "too many partitions {}, limit {}",
                        params.partitions.len(),
                        submission_partition_limit
                    ));
                }

                let current_deadline = state.deadline_info(rt.policy(), current_epoch);

                // Check that the miner state indicates that the current proving deadline has started.
                // This should only fail if the cron actor wasn't invoked, and matters only in case that it hasn't been
                // invoked for a whole proving period, and hence the missed PoSt submissions from the prior occurrence
                // of this deadline haven't been processed yet.
                if !current_deadline.is_open() {
                    return Err(actor_error!(
                        illegal_state,
                        "proving period {} not yet open at {}",
                        current_deadline.period_start,
                        current_epoch
                    ));
                }

                // The miner may only submit a proof for the current deadline.
                if params.deadline != current_deadline.index {
                    return Err(actor_error!(
                        illegal_argument,
                        "invalid deadline {} at epoch {}, expected {}",
                        params.deadline,
                        current_epoch,
                        current_deadline.index
                    ));
                }

                // Verify that the PoSt was committed to the chain at most
                // WPoStChallengeLookback+WPoStChallengeWindow in the past.
                if params.chain_commit_epoch < current_deadline.challenge {
                    return Err(actor_error!(
                        illegal_argument,
                        "expected chain commit epoch {} to be after {}",
                        params.chain_commit_epoch,
                        current_deadline.challenge
                    ));
                }

                if params.chain_commit_epoch >= current_epoch {
                    return Err(actor_error!(
                        illegal_argument,
                        "chain commit epoch {} must be less than the current epoch {}",
                        params.chain_commit_epoch,
                        current_epoch
                    ));
                }

                // Verify the chain commit randomness.
                let comm_rand = rt.get_randomness_from_tickets(
                    DomainSeparationTag::PoStChainCommit,
                    params.chain_commit_epoch,
                    &[],
                )?;
                if Randomness(comm_rand.into()) != params.chain_commit_rand {
                    return Err(actor_error!(illegal_argument, "post commit randomness mismatched"));
                }

                let sectors = Sectors::load(rt.store(), &state.sectors).map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors")
                })?;

                let mut deadlines = state.load_deadlines(rt.store())?;

                let mut deadline = deadlines.load_deadline(rt.store(), params.deadline)?;

                // Record proven sectors/partitions, returning updates to power and the final set of sectors
                // proven/skipped.
                let fault_expiration = current_deadline.last() + rt.policy().fault_max_age;
                let mut post_partitions = params.partitions.clone();
                let post_result = deadline
                    .record_proven_sectors(
                        rt.store(),
                        &sectors,
                        info.sector_size,
                        current_deadline.quant_spec(),
                        fault_expiration,
                        &mut post_partitions,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!(
                                "failed to process post submission for deadline {}",
                                params.deadline
                            ),
                        )
                    })?;

                // All partitions may already have been proven; in that case the submission is a
                // no-op and nothing is recorded or penalized.
                if post_result.sectors.is_empty() {
                    return Ok((post_result, TokenAmount::zero(), TokenAmount::zero()));
                }

                // Load sector infos for proof, substituting a known-good sector for known-faulty sectors.
                let sector_infos = sectors
                    .load_for_proof(&post_result.sectors, &post_result.ignored_sectors)
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            "failed to load sectors for post verification",
                        )
                    })?;

                // A submission with no provable sectors (all faulty or skipped) skips verification.
                if !sector_infos.is_empty() {
                    verify_windowed_post(rt, current_deadline.challenge, &sector_infos, &params.proofs)
                        .map_err(|e| e.wrap("window post failed"))?;
                }

                // Penalize new skipped faults and retracted recoveries as undeclared faults.
                // These pay a higher fee than faults declared before the deadline challenge window opened.
                // The ongoing fault fee for the declared portion is deferred to the deadline cron.
                let penalty_target = &pledge_penalty_for_undeclared_fault(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_stats.quality_adj_power_smoothed,
                    &post_result.new_faulty_power.qa,
                ) + &pledge_penalty_for_undeclared_fault(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_stats.quality_adj_power_smoothed,
                    &post_result.retracted_recovery_power.qa,
                ) - &pledge_penalty_for_declared_fault(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_stats.quality_adj_power_smoothed,
                    &post_result.penalty_power().qa,
                );

                let (penalty_from_balance, penalty_from_vesting) = if penalty_target.is_positive() {
                    let unlocked_balance =
                        state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                            actor_error!(illegal_state, "failed to calculate unlocked balance: {}", e)
                        })?;
                    state
                        .penalize_funds_in_priority_order(
                            rt.store(),
                            current_epoch,
                            &penalty_target,
                            &unlocked_balance,
                        )
                        .map_err(|e| {
                            e.downcast_default(
                                ExitCode::USR_ILLEGAL_STATE,
                                "failed to unlock penalty",
                            )
                        })?
                } else {
                    (TokenAmount::zero(), TokenAmount::zero())
                };

                let deadline_idx = params.deadline;
                deadlines.update_deadline(rt.store(), params.deadline, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to update deadline {}", deadline_idx),
                    )
                })?;

                state.save_deadlines(rt.store(), deadlines).map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
                })?;

                Ok((post_result, penalty_from_vesting, penalty_from_balance))
            })?;

        // Restore power for recovered sectors. Remove power for new faults.
        request_update_power(rt, post_result.power_delta())?;

        // Burn penalties.
        burn_funds(rt, &penalty_from_vesting + &penalty_from_balance)?;
        notify_pledge_changed(rt, &penalty_from_vesting.neg())?;

        let state: State = rt.state()?;
        state
            .check_balance_invariants(&rt.current_balance())
            .map_err(err_balance_invariants_broken)?;

        Ok(())
    }

    /// Pledges to seal and commit a single sector.
    /// The sector must have an expiration on a proving-period boundary.
    /// A pre-commitment may be replacing a committed-capacity sector, in which case the
    /// deposit is floored at the replaced sector's pledge.
    fn pre_commit_sector(
        rt: &impl Runtime,
        params: SectorPreCommitInfo,
    ) -> Result<(), ActorError> {
        let current_epoch = rt.curr_epoch();

        if !is_sealed_sector(&params.sealed_cid) {
            return Err(actor_error!(illegal_argument, "sealed CID had wrong prefix"));
        }

        if params.seal_rand_epoch >= current_epoch {
            return Err(actor_error!(
                illegal_argument,
                "seal challenge epoch {} must be before now {}",
                params.seal_rand_epoch,
                current_epoch
            ));
        }

        let challenge_earliest = current_epoch - rt.policy().max_pre_commit_randomness_lookback;
        if params.seal_rand_epoch < challenge_earliest {
            // The subsequent commitment proof can't possibly be accepted because the seal challenge will be deemed
            // too old. Note that passing this check doesn't guarantee the proof will be soon enough, depending on
            // when it arrives.
            return Err(actor_error!(
                illegal_argument,
                "seal challenge epoch {} too old, must be after {}",
                params.seal_rand_epoch,
                challenge_earliest
            ));
        }

        if params.expiration <= current_epoch {
            return Err(actor_error!(
                illegal_argument,
                "sector expiration {} must be after now {}",
                params.expiration,
                current_epoch
            ));
        }

        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(
                illegal_argument,
                "sector number {} out of range 0..(2^63-1)",
                params.sector_number
            ));
        }

        if params.replace_capacity && params.deal_ids.is_empty() {
            return Err(actor_error!(
                illegal_argument,
                "cannot replace sector without committing deals"
            ));
        }
        if params.replace_sector_deadline >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(
                illegal_argument,
                "invalid deadline {}",
                params.replace_sector_deadline
            ));
        }
        if params.replace_sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(
                illegal_argument,
                "invalid sector number {}",
                params.replace_sector_number
            ));
        }

        let st: State = rt.state()?;
        let info = get_miner_info(rt.store(), &st)?;

        rt.validate_immediate_caller_is(iter::once(&info.worker))?;

        if params.seal_proof != info.seal_proof_type {
            return Err(actor_error!(
                illegal_argument,
                "sector seal proof {:?} must match miner seal proof type {:?}",
                params.seal_proof,
                info.seal_proof_type
            ));
        }

        if params.deal_ids.len() as u64 > sector_deals_max(rt.policy(), info.sector_size) {
            return Err(actor_error!(illegal_argument, "too many deals for sector"));
        }

        validate_expiration(
            rt.policy(),
            &st,
            current_epoch,
            current_epoch,
            params.expiration,
            params.seal_proof,
        )?;

        // Gather the network state required to price the deposit, and the deal weights
        // that determine the sector's quality.
        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_stats = request_current_total_power(rt)?;
        let deal_weights = request_deal_weights(rt, &params.deal_ids, current_epoch, params.expiration)?;

        let newly_vested = rt.transaction(|state: &mut State, rt| {
            let store = rt.store();

            if state.has_sector_number(store, params.sector_number).map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    format!("failed to check sector {}", params.sector_number),
                )
            })? {
                return Err(actor_error!(
                    illegal_argument,
                    "sector {} already committed",
                    params.sector_number
                ));
            }

            if state
                .get_precommitted_sector(store, params.sector_number)?
                .is_some()
            {
                return Err(actor_error!(
                    illegal_argument,
                    "sector {} already pre-committed",
                    params.sector_number
                ));
            }

            // The pre-commit deposit is never less than the pledge of a sector being replaced.
            let mut deposit_minimum = TokenAmount::zero();
            if params.replace_capacity {
                let replace_sector = validate_replace_sector(state, store, &params)?;
                deposit_minimum = replace_sector.initial_pledge;
            }

            let newly_vested = state.unlock_vested_funds(store, current_epoch).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest funds")
            })?;
            let available_balance =
                state.get_available_balance(&rt.current_balance()).map_err(|e| {
                    actor_error!(illegal_state, "failed to calculate available balance: {}", e)
                })?;

            let duration = params.expiration - current_epoch;
            let sector_weight = qa_power_for_weight(
                info.sector_size,
                duration,
                &deal_weights.deal_weight,
                &deal_weights.verified_deal_weight,
            );
            let deposit_req = cmp::max(
                initial_pledge_for_power(
                    &sector_weight,
                    &reward_stats.this_epoch_baseline_power,
                    &power_stats.pledge_collateral,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_stats.quality_adj_power_smoothed,
                    &rt.total_fil_circ_supply(),
                ),
                deposit_minimum,
            );

            if available_balance < deposit_req {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds for pre-commit deposit: {}",
                    deposit_req
                ));
            }

            state.add_pre_commit_deposit(&deposit_req).map_err(|e| {
                actor_error!(illegal_state, "failed to add pre-commit deposit {}: {}", deposit_req, e)
            })?;
            state.put_precommitted_sector(
                store,
                SectorPreCommitOnChainInfo {
                    info: params.clone(),
                    pre_commit_deposit: deposit_req,
                    pre_commit_epoch: current_epoch,
                    deal_weight: deal_weights.deal_weight.clone(),
                    verified_deal_weight: deal_weights.verified_deal_weight.clone(),
                },
            )?;

            Ok(newly_vested)
        })?;

        // Request deferred cron check for the pre-commit expiry.
        let msd = max_seal_duration(params.seal_proof).ok_or_else(|| {
            actor_error!(illegal_argument, "no max seal duration set for proof type: {:?}", params.seal_proof)
        })?;
        let expiry_bound = current_epoch + msd + 1;

        let mut sectors = BitField::new();
        sectors.set(params.sector_number);
        enroll_cron_event(
            rt,
            expiry_bound,
            CronEventPayload { event_type: CRON_EVENT_PRE_COMMIT_EXPIRY, sectors: Some(sectors) },
        )?;

        notify_pledge_changed(rt, &newly_vested.neg())?;

        let state: State = rt.state()?;
        state
            .check_balance_invariants(&rt.current_balance())
            .map_err(err_balance_invariants_broken)?;

        Ok(())
    }

    /// Checks state of the corresponding sector pre-commitment, then schedules the proof to be verified in bulk
    /// by the power actor.
    /// If valid, the power actor will call ConfirmSectorProofsValid at the end of the same epoch as this message.
    fn prove_commit_sector(
        rt: &impl Runtime,
        params: ProveCommitSectorParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;

        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument, "sector number greater than maximum"));
        }

        let sector_number = params.sector_number;

        let st: State = rt.state()?;
        let precommit = st
            .get_precommitted_sector(rt.store(), sector_number)?
            .ok_or_else(|| actor_error!(not_found, "no pre-committed sector {}", sector_number))?;

        let msd = max_seal_duration(precommit.info.seal_proof).ok_or_else(|| {
            actor_error!(
                illegal_state,
                "no max seal duration for proof type: {:?}",
                precommit.info.seal_proof
            )
        })?;
        let prove_commit_due = precommit.pre_commit_epoch + msd;
        if rt.curr_epoch() > prove_commit_due {
            return Err(actor_error!(
                illegal_argument,
                "commitment proof for {} too late at {}, due {}",
                sector_number,
                rt.curr_epoch(),
                prove_commit_due
            ));
        }

        let interactive_epoch =
            precommit.pre_commit_epoch + rt.policy().pre_commit_challenge_delay;
        if rt.curr_epoch() <= interactive_epoch {
            return Err(actor_error!(forbidden, "too early to prove sector {}", sector_number));
        }

        // Check (and activate) storage deals associated to sector. Abort if checks failed.
        let unsealed_cid =
            request_unsealed_sector_cid(rt, precommit.info.seal_proof, &precommit.info.deal_ids)?;

        let miner_actor_id = if let Payload::ID(i) = rt.message().receiver().payload() {
            *i
        } else {
            return Err(actor_error!(
                illegal_state,
                "runtime provided non-ID receiver address {}",
                rt.message().receiver()
            ));
        };

        let entropy = serialize_vec(&rt.message().receiver(), "address for seal challenge")?;
        let randomness = Randomness(
            rt.get_randomness_from_tickets(
                DomainSeparationTag::SealRandomness,
                precommit.info.seal_rand_epoch,
                &entropy,
            )?
            .into(),
        );
        let interactive_randomness = Randomness(
            rt.get_randomness_from_beacon(
                DomainSeparationTag::InteractiveSealChallengeSeed,
                interactive_epoch,
                &entropy,
            )?
            .into(),
        );

        let svi = SealVerifyInfo {
            registered_proof: precommit.info.seal_proof,
            sector_id: SectorID { miner: miner_actor_id, number: sector_number },
            deal_ids: precommit.info.deal_ids.clone(),
            randomness,
            interactive_randomness,
            proof: params.proof.into(),
            sealed_cid: precommit.info.sealed_cid,
            unsealed_cid,
        };

        extract_send_result(rt.send_simple(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            IpldBlock::serialize_cbor(&svi)?,
            TokenAmount::zero(),
        ))?;

        Ok(())
    }

    fn confirm_sector_proofs_valid(
        rt: &impl Runtime,
        params: ConfirmSectorProofsParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        // Fetch the current network state needed to price the sectors' pledge.
        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_stats = request_current_total_power(rt)?;
        let circulating_supply = rt.total_fil_circ_supply();

        let current_epoch = rt.curr_epoch();
        let st: State = rt.state()?;
        let store = rt.store();
        let info = get_miner_info(store, &st)?;

        // This skips missing pre-commits.
        let mut precommitted_sectors = Vec::new();
        for &sector_number in &params.sectors {
            match st.get_precommitted_sector(store, sector_number)? {
                Some(precommit) => precommitted_sectors.push(precommit),
                None => {
                    warn!("skipping confirmation of missing pre-commit {}", sector_number);
                }
            }
        }

        // Activate the deals for each valid pre-commitment, dropping any sector whose deals
        // can no longer be activated.
        let mut valid_precommits = Vec::new();
        for precommit in precommitted_sectors {
            let activation_res = extract_send_result(rt.send_simple(
                &STORAGE_MARKET_ACTOR_ADDR,
                ext::market::ACTIVATE_DEALS_METHOD,
                IpldBlock::serialize_cbor(&ext::market::ActivateDealsParams {
                    deal_ids: precommit.info.deal_ids.clone(),
                    sector_expiry: precommit.info.expiration,
                })?,
                TokenAmount::zero(),
            ));
            match activation_res {
                Ok(_) => valid_precommits.push(precommit),
                Err(e) => {
                    info!(
                        "failed to activate deals on sector {}, dropping from prove commit set: {}",
                        precommit.info.sector_number,
                        e.msg()
                    );
                }
            }
        }

        if valid_precommits.is_empty() {
            return Ok(());
        }

        let (total_pledge, newly_vested, new_power) = rt.transaction(|state: &mut State, rt| {
            let store = rt.store();
            let policy = rt.policy();

            let mut new_sector_numbers = Vec::<SectorNumber>::with_capacity(valid_precommits.len());
            let mut deposit_to_unlock = TokenAmount::zero();
            let mut activated = Vec::<(&SectorPreCommitOnChainInfo, SectorOnChainInfo)>::new();
            let mut total_pledge = TokenAmount::zero();

            for precommit in &valid_precommits {
                // Compute initial pledge at the activation epoch.
                let duration = precommit.info.expiration - current_epoch;
                if duration < policy.min_sector_expiration {
                    warn!(
                        "precommit {} has lifetime {} less than minimum. ignoring",
                        precommit.info.sector_number, duration,
                    );
                    continue;
                }

                let power = qa_power_for_weight(
                    info.sector_size,
                    duration,
                    &precommit.deal_weight,
                    &precommit.verified_deal_weight,
                );

                let day_reward = expected_reward_for_power(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_stats.quality_adj_power_smoothed,
                    &power,
                    fil_actors_runtime::network::EPOCHS_IN_DAY,
                );

                // The storage pledge is recorded for use in computing the penalty if this
                // sector is terminated before its declared expiration.
                let storage_pledge = expected_reward_for_power(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_stats.quality_adj_power_smoothed,
                    &power,
                    INITIAL_PLEDGE_PROJECTION_PERIOD,
                );

                let mut initial_pledge = initial_pledge_for_power(
                    &power,
                    &reward_stats.this_epoch_baseline_power,
                    &power_stats.pledge_collateral,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_stats.quality_adj_power_smoothed,
                    &circulating_supply,
                );

                // Lower-bound the pledge by that of the sector being replaced.
                if precommit.info.replace_capacity {
                    if let Some(replaced) = state
                        .get_sector(store, precommit.info.replace_sector_number)
                        .map_err(|e| {
                            e.downcast_default(
                                ExitCode::USR_ILLEGAL_STATE,
                                "failed to load replaced sector",
                            )
                        })?
                    {
                        initial_pledge = cmp::max(initial_pledge, replaced.initial_pledge);
                    }
                }

                deposit_to_unlock += &precommit.pre_commit_deposit;
                total_pledge += &initial_pledge;

                let new_sector_info = SectorOnChainInfo {
                    sector_number: precommit.info.sector_number,
                    seal_proof: precommit.info.seal_proof,
                    sealed_cid: precommit.info.sealed_cid,
                    deal_ids: precommit.info.deal_ids.clone(),
                    expiration: precommit.info.expiration,
                    activation: current_epoch,
                    deal_weight: precommit.deal_weight.clone(),
                    verified_deal_weight: precommit.verified_deal_weight.clone(),
                    initial_pledge,
                    expected_day_reward: day_reward,
                    expected_storage_pledge: storage_pledge,
                };

                new_sector_numbers.push(new_sector_info.sector_number);
                activated.push((precommit, new_sector_info));
            }

            let new_sectors: Vec<SectorOnChainInfo> =
                activated.iter().map(|(_, sector)| sector.clone()).collect();
            state.put_sectors(store, new_sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to put new sectors")
            })?;

            state.delete_precommitted_sectors(store, &new_sector_numbers).map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    "failed to delete precommited sectors",
                )
            })?;

            // Unlock deposit for successful proofs, make it available for lock-up as initial pledge.
            state
                .add_pre_commit_deposit(&(deposit_to_unlock.clone().neg()))
                .map_err(|e| actor_error!(illegal_state, "failed to unlock deposit: {}", e))?;

            // Lock up initial pledge for new sectors.
            let newly_vested =
                state.unlock_vested_funds(store, current_epoch).map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest new funds")
                })?;
            state
                .add_initial_pledge_requirement(&total_pledge)
                .map_err(|e| actor_error!(illegal_state, "failed to add pledge: {}", e))?;

            if !state.meets_initial_pledge_condition(&rt.current_balance()) {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds for aggregate initial pledge requirement {}",
                    total_pledge
                ));
            }

            // For a CC upgrade, the replaced sector is rescheduled to expire at the end of the
            // next not-elapsed instance of its deadline, ahead of the replacement's activation.
            for (precommit, _) in &activated {
                if !precommit.info.replace_capacity {
                    continue;
                }
                replace_sector_expiration(policy, state, store, &info, current_epoch, &precommit.info)
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!(
                                "failed to replace sector {} expiration",
                                precommit.info.replace_sector_number
                            ),
                        )
                    })?;
            }

            // Assign new sectors to deadlines.
            let mut sectors_by_deadline = BTreeMap::<u64, Vec<SectorOnChainInfo>>::new();
            for (precommit, sector_info) in &activated {
                let deadline_idx = if precommit.info.replace_capacity {
                    precommit.info.replace_sector_deadline
                } else {
                    state.first_assignable_deadline(policy, current_epoch).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            "failed to find assignable deadline",
                        )
                    })?
                };
                sectors_by_deadline.entry(deadline_idx).or_default().push(sector_info.clone());
            }

            let mut new_power = PowerPair::zero();
            for (deadline_idx, deadline_sectors) in sectors_by_deadline {
                new_power += &state
                    .assign_sectors_to_deadline(
                        policy,
                        store,
                        current_epoch,
                        deadline_idx,
                        deadline_sectors,
                        info.window_post_partition_sectors,
                        info.sector_size,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            "failed to assign new sectors to deadlines",
                        )
                    })?;
            }

            Ok((total_pledge, newly_vested, new_power))
        })?;

        // Request power for the activated sectors, and update the pledge total.
        request_update_power(rt, new_power)?;
        notify_pledge_changed(rt, &(total_pledge - newly_vested))?;

        let state: State = rt.state()?;
        state
            .check_balance_invariants(&rt.current_balance())
            .map_err(err_balance_invariants_broken)?;

        Ok(())
    }

    fn check_sector_proven(
        rt: &impl Runtime,
        params: CheckSectorProvenParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;

        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument, "sector number out of range"));
        }

        let st: State = rt.state()?;

        match st.get_sector(rt.store(), params.sector_number) {
            Err(e) => Err(actor_error!(
                illegal_state,
                "failed to load proven sector {}: {}",
                params.sector_number,
                e
            )),
            Ok(None) => {
                Err(actor_error!(not_found, "sector {} not proven", params.sector_number))
            }
            Ok(Some(_sector)) => Ok(()),
        }
    }

    /// Changes the expiration epoch for a set of sectors to a new, later one.
    /// The sectors must not be terminated or faulty.
    /// The sector's power is recomputed for the new expiration.
    fn extend_sector_expiration(
        rt: &impl Runtime,
        params: ExtendSectorExpirationParams,
    ) -> Result<(), ActorError> {
        {
            let policy = rt.policy();
            if params.extensions.len() as u64 > policy.addressed_partitions_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many declarations {}, max {}",
                    params.extensions.len(),
                    policy.addressed_partitions_max
                ));
            }
        }

        // Limit the number of sectors declared at once.
        let mut sector_count: u64 = 0;
        for decl in &params.extensions {
            let policy = rt.policy();
            if decl.deadline >= policy.wpost_period_deadlines {
                return Err(actor_error!(
                    illegal_argument,
                    "deadline {} not in range 0..{}",
                    decl.deadline,
                    policy.wpost_period_deadlines
                ));
            }

            match sector_count.checked_add(decl.sectors.len()) {
                Some(sum) => sector_count = sum,
                None => {
                    return Err(actor_error!(illegal_argument, "sector bitfield integer overflow"));
                }
            }
        }

        {
            let policy = rt.policy();
            if sector_count > policy.addressed_sectors_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many sectors for declaration {}, max {}",
                    sector_count,
                    policy.addressed_sectors_max
                ));
            }
        }

        let power_delta = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(iter::once(&info.worker))?;

            let store = rt.store();
            let curr_epoch = rt.curr_epoch();

            let mut deadlines = state.load_deadlines(store)?;

            // Group declarations by deadline, and remember iteration order.
            let mut decls_by_deadline = BTreeMap::<u64, Vec<&ExpirationExtension>>::new();
            for decl in &params.extensions {
                decls_by_deadline.entry(decl.deadline).or_default().push(decl);
            }

            let sectors_arr = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut power_delta = PowerPair::zero();
            let mut all_new_sectors = Vec::<SectorOnChainInfo>::new();

            for (&deadline_idx, decls) in &decls_by_deadline {
                let policy = rt.policy();
                let quant = state.quant_spec_for_deadline(policy, deadline_idx);

                let mut deadline = deadlines.load_deadline(store, deadline_idx)?;

                for decl in decls {
                    let old_sectors = sectors_arr
                        .load_sector(&decl.sectors)
                        .map_err(|e| e.wrap("failed to load sectors"))?;

                    let mut new_sectors = Vec::<SectorOnChainInfo>::with_capacity(old_sectors.len());
                    for sector in &old_sectors {
                        if decl.new_expiration < sector.expiration {
                            return Err(actor_error!(
                                illegal_argument,
                                "cannot reduce sector {} expiration to {} from {}",
                                sector.sector_number,
                                decl.new_expiration,
                                sector.expiration
                            ));
                        }

                        validate_expiration(
                            policy,
                            state,
                            curr_epoch,
                            sector.activation,
                            decl.new_expiration,
                            sector.seal_proof,
                        )?;

                        let mut sector = sector.clone();
                        sector.expiration = decl.new_expiration;
                        new_sectors.push(sector);
                    }

                    // Overwrite sector infos.
                    all_new_sectors.extend_from_slice(&new_sectors);

                    // Remove old sectors from the queue and assign to the new expiration.
                    // The old sector infos hold the scheduled expiration.
                    let mut partition_sectors = PartitionSectorMap::default();
                    partition_sectors.add(decl.partition, decl.sectors.clone()).map_err(|e| {
                        actor_error!(illegal_argument, "failed to group sectors: {}", e)
                    })?;
                    deadline
                        .reschedule_sector_expirations(
                            store,
                            &sectors_arr,
                            decl.new_expiration,
                            &mut partition_sectors,
                            info.sector_size,
                            quant,
                        )
                        .map_err(|e| {
                            e.downcast_default(
                                ExitCode::USR_ILLEGAL_STATE,
                                "failed to reschedule sector expirations",
                            )
                        })?;

                    // Extending the expiration of a sector increases its quality-adjusted
                    // power contribution.
                    for (old, new) in old_sectors.iter().zip(new_sectors.iter()) {
                        let old_qa = qa_power_for_sector(info.sector_size, old);
                        let new_qa = qa_power_for_sector(info.sector_size, new);
                        power_delta.qa += &(new_qa - old_qa);
                    }
                }

                deadlines.update_deadline(store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to save deadline {}", deadline_idx),
                    )
                })?;
            }

            let mut sectors_arr = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;
            sectors_arr.store(all_new_sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to update sectors")
            })?;
            state.sectors = sectors_arr.amt.flush().map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save sectors")
            })?;

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok(power_delta)
        })?;

        request_update_power(rt, power_delta)?;
        Ok(())
    }

    /// Marks some sectors as terminated at the present epoch, earlier than their
    /// scheduled termination, and adds these sectors to the early termination queue.
    /// This method then processes up to AddressedSectorsMax sectors and
    /// AddressedPartitionsMax partitions from the early termination queue,
    /// terminating deals, paying fines, and returning pledge collateral. While
    /// sectors remain in this queue:
    ///
    ///  1. The miner will be unable to withdraw funds.
    ///  2. The chain will process up to AddressedSectorsMax sectors and
    ///     AddressedPartitionsMax per epoch until the queue is empty.
    ///
    /// The sectors are immediately ignored for Window PoSt proofs, and should be
    /// masked in the same way as faulty sectors. A miner may terminate and then
    /// re-commit a sector with the same sector number, but different commD/commR values.
    ///
    /// This function may be invoked with no new sectors to explicitly process the
    /// next batch of sectors.
    fn terminate_sectors(
        rt: &impl Runtime,
        params: TerminateSectorsParams,
    ) -> Result<TerminateSectorsReturn, ActorError> {
        // Note: this cannot terminate pre-committed but un-proven sectors.
        // They must be allowed to expire (and deposit burnt).

        let mut to_process = DeadlineSectorMap::new();

        for term in params.terminations {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(rt.policy(), deadline, partition, term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        let power_delta = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(iter::once(&info.worker))?;

            let store = rt.store();
            let curr_epoch = rt.curr_epoch();
            let mut power_delta = PowerPair::zero();

            let mut deadlines = state.load_deadlines(store)?;

            // We're only reading the sectors, so there's no need to save this back.
            // However, we still want to avoid re-loading this array per-partition.
            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors")
            })?;

            for (deadline_idx, partition_sectors) in to_process.iter() {
                // If the deadline is the current or next deadline to prove, don't allow terminating sectors.
                // We assume that deadlines are immutable when being proven.
                if !deadline_is_mutable(
                    rt.policy(),
                    state.proving_period_start,
                    deadline_idx,
                    curr_epoch,
                ) {
                    return Err(actor_error!(
                        illegal_argument,
                        "cannot terminate sectors in immutable deadline {}",
                        deadline_idx
                    ));
                }

                let quant = state.quant_spec_for_deadline(rt.policy(), deadline_idx);
                let mut deadline = deadlines.load_deadline(store, deadline_idx)?;

                let removed_power = deadline
                    .terminate_sectors(
                        store,
                        &sectors,
                        curr_epoch,
                        partition_sectors,
                        info.sector_size,
                        quant,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to terminate sectors in deadline {}", deadline_idx),
                        )
                    })?;

                state.early_terminations.set(deadline_idx);
                power_delta -= &removed_power;

                deadlines.update_deadline(store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to update deadline {}", deadline_idx),
                    )
                })?;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok(power_delta)
        })?;

        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_stats = request_current_total_power(rt)?;

        // Now, try to process these sectors. Any that remain are drained by subsequent
        // deadline crons, or by re-invoking this method with no new sectors.
        let more = process_early_terminations(
            rt,
            &reward_stats.this_epoch_reward_smoothed,
            &power_stats.quality_adj_power_smoothed,
        )?;

        request_update_power(rt, power_delta)?;

        let state: State = rt.state()?;
        state
            .check_balance_invariants(&rt.current_balance())
            .map_err(err_balance_invariants_broken)?;

        Ok(TerminateSectorsReturn { done: !more })
    }

    fn declare_faults(rt: &impl Runtime, params: DeclareFaultsParams) -> Result<(), ActorError> {
        let mut to_process = DeadlineSectorMap::new();

        for term in params.faults {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(rt.policy(), deadline, partition, term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        let power_delta = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(iter::once(&info.worker))?;

            let store = rt.store();

            let mut deadlines = state.load_deadlines(store)?;

            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut new_fault_power_total = PowerPair::zero();
            let curr_epoch = rt.curr_epoch();
            for (deadline_idx, partition_map) in to_process.iter() {
                let policy = rt.policy();
                let target_deadline = declaration_deadline_info(
                    policy,
                    state.proving_period_start,
                    deadline_idx,
                    curr_epoch,
                )
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "invalid fault declaration deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                validate_fr_declaration_deadline(&target_deadline).map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "failed fault declaration at deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                let mut deadline = deadlines.load_deadline(store, deadline_idx)?;

                let fault_expiration_epoch = target_deadline.last() + policy.fault_max_age;

                let new_faulty_power = deadline
                    .declare_faults(
                        store,
                        &sectors,
                        info.sector_size,
                        target_deadline.quant_spec(),
                        fault_expiration_epoch,
                        partition_map,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to declare faults for deadline {}", deadline_idx),
                        )
                    })?;

                deadlines.update_deadline(store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to store deadline {} partitions", deadline_idx),
                    )
                })?;

                new_fault_power_total += &new_faulty_power;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok(new_fault_power_total.neg())
        })?;

        // Remove power for new faulty sectors.
        // Payment of the penalty for declared faults is deferred to the deadline cron.
        request_update_power(rt, power_delta)?;

        Ok(())
    }

    fn declare_faults_recovered(
        rt: &impl Runtime,
        params: DeclareFaultsRecoveredParams,
    ) -> Result<(), ActorError> {
        let mut to_process = DeadlineSectorMap::new();

        for term in params.recoveries {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(rt.policy(), deadline, partition, term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(iter::once(&info.worker))?;

            // A miner with an outstanding pledge shortfall may not declare recoveries.
            // The power for the recovered sectors would not be backed by collateral.
            if !state.meets_initial_pledge_condition(&rt.current_balance()) {
                return Err(actor_error!(
                    insufficient_funds,
                    "cannot declare recoveries while undercollateralized"
                ));
            }

            let store = rt.store();

            let mut deadlines = state.load_deadlines(store)?;

            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let curr_epoch = rt.curr_epoch();
            for (deadline_idx, partition_map) in to_process.iter() {
                let policy = rt.policy();
                let target_deadline = declaration_deadline_info(
                    policy,
                    state.proving_period_start,
                    deadline_idx,
                    curr_epoch,
                )
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "invalid recovery declaration deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                validate_fr_declaration_deadline(&target_deadline).map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "failed recovery declaration at deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                let mut deadline = deadlines.load_deadline(store, deadline_idx)?;

                deadline
                    .declare_faults_recovered(store, &sectors, info.sector_size, partition_map)
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to declare recoveries for deadline {}", deadline_idx),
                        )
                    })?;

                deadlines.update_deadline(store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to store deadline {}", deadline_idx),
                    )
                })?;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok(())
        })?;

        // Power is not restored yet, but when the recovered sectors are successfully PoSted.
        Ok(())
    }

    fn on_deferred_cron_event(
        rt: &impl Runtime,
        payload: CronEventPayload,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        match payload.event_type {
            CRON_EVENT_PROVING_DEADLINE => handle_proving_deadline(rt)?,
            CRON_EVENT_WORKER_KEY_CHANGE => commit_worker_key_change(rt)?,
            CRON_EVENT_PRE_COMMIT_EXPIRY => {
                check_precommit_expiry(rt, &payload.sectors.unwrap_or_default())?
            }
            _ => {
                error!(
                    "onDeferredCronEvent invalid event type: {}",
                    payload.event_type
                );
            }
        };

        Ok(())
    }

    /// Locks up some amount of the miner's unlocked balance (including funds received alongside the invoking message).
    fn add_locked_fund(rt: &impl Runtime, amount: TokenAmount) -> Result<(), ActorError> {
        if amount.is_negative() {
            return Err(actor_error!(illegal_argument, "cannot lock up a negative amount of funds"));
        }

        let newly_vested = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                [info.worker, info.owner, REWARD_ACTOR_ADDR].iter(),
            )?;

            let newly_vested =
                state.add_locked_funds(rt.store(), rt.curr_epoch(), &amount, &PLEDGE_VESTING_SPEC)
                    .map_err(|e| {
                        e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to lock pledge")
                    })?;

            // The locked amount must still leave the sector pledge requirements covered.
            let available = state.get_available_balance(&rt.current_balance()).map_err(|e| {
                actor_error!(illegal_state, "failed to calculate available balance: {}", e)
            })?;
            if available.is_negative() {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds to lock, available: {}, requested: {}",
                    &available + &amount,
                    amount
                ));
            }

            Ok(newly_vested)
        })?;

        notify_pledge_changed(rt, &(amount - newly_vested))?;
        Ok(())
    }

    fn report_consensus_fault(
        rt: &impl Runtime,
        params: ReportConsensusFaultParams,
    ) -> Result<(), ActorError> {
        // Note: only the first report of any fault is processed because it sets the
        // ConsensusFaultElapsed state variable to an epoch after the fault, and reports prior to
        // that epoch are no longer valid
        rt.validate_immediate_caller_type(CALLER_TYPES_SIGNABLE.iter())?;
        let reporter = rt.message().caller();

        let fault = rt
            .verify_consensus_fault(&params.header1, &params.header2, &params.header_extra)
            .map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_ARGUMENT, "fault not verified")
            })?
            .ok_or_else(|| actor_error!(illegal_argument, "No consensus fault found"))?;
        if fault.target != rt.message().receiver() {
            return Err(actor_error!(
                illegal_argument,
                "fault by {} reported to miner {}",
                fault.target,
                rt.message().receiver()
            ));
        }

        // Elapsed since the fault (i.e. since the higher of the two blocks)
        let current_epoch = rt.curr_epoch();
        let fault_age = current_epoch - fault.epoch;
        if fault_age <= 0 {
            return Err(actor_error!(
                illegal_argument,
                "invalid fault epoch {} ahead of current {}",
                fault.epoch,
                current_epoch
            ));
        }

        // Reward reporter with a share of the miner's current balance.
        let slasher_reward = reward_for_consensus_slash_report(fault_age, &rt.current_balance());
        extract_send_result(rt.send_simple(&reporter, METHOD_SEND, None, slasher_reward))?;

        let st: State = rt.state()?;

        // Notify the power actor of the miner's now-invalid claims.
        extract_send_result(rt.send_simple(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::ON_CONSENSUS_FAULT_METHOD,
            IpldBlock::serialize_cbor(&st.locked_funds)?,
            TokenAmount::zero(),
        ))?;

        // Terminate deals of all sectors, in bounded batches.
        let mut deal_ids = Vec::<DealID>::new();
        st.for_each_sector(rt.store(), |sector| {
            deal_ids.extend_from_slice(&sector.deal_ids);
            Ok(())
        })
        .map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors")
        })?;
        request_terminate_deals(rt, current_epoch, deal_ids)?;

        // Delete the actor and burn all remaining funds.
        rt.delete_actor(&BURNT_FUNDS_ACTOR_ADDR)?;

        Ok(())
    }

    fn withdraw_balance(
        rt: &impl Runtime,
        params: WithdrawBalanceParams,
    ) -> Result<(), ActorError> {
        if params.amount_requested.is_negative() {
            return Err(actor_error!(
                illegal_argument,
                "negative fund requested for withdrawal: {}",
                params.amount_requested
            ));
        }

        let (amount_withdrawn, newly_vested, owner) =
            rt.transaction(|state: &mut State, rt| {
                let info = get_miner_info(rt.store(), state)?;

                // Only the owner is allowed to withdraw the balance as it belongs to/is controlled by the owner
                // and not the worker.
                rt.validate_immediate_caller_is(iter::once(&info.owner))?;

                // Ensure we don't have any pending terminations.
                if !state.early_terminations.is_empty() {
                    return Err(actor_error!(
                        forbidden,
                        "cannot withdraw funds while {} deadlines have terminated sectors \
                        with outstanding fees",
                        state.early_terminations.len()
                    ));
                }

                // Unlock vested funds so we can spend them.
                let newly_vested =
                    state.unlock_vested_funds(rt.store(), rt.curr_epoch()).map_err(|e| {
                        e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest fund")
                    })?;

                // Verify the locked funds cover the initial pledge requirements.
                let available_balance =
                    state.get_available_balance(&rt.current_balance()).map_err(|e| {
                        actor_error!(illegal_state, "failed to calculate available balance: {}", e)
                    })?;
                if available_balance.is_negative() {
                    return Err(actor_error!(
                        insufficient_funds,
                        "does not meet initial pledge requirement, cannot withdraw"
                    ));
                }

                let amount_withdrawn =
                    cmp::min(&available_balance, &params.amount_requested).clone();

                Ok((amount_withdrawn, newly_vested, info.owner))
            })?;

        if amount_withdrawn.is_positive() {
            extract_send_result(rt.send_simple(&owner, METHOD_SEND, None, amount_withdrawn))?;
        }

        notify_pledge_changed(rt, &newly_vested.neg())?;

        let state: State = rt.state()?;
        state
            .check_balance_invariants(&rt.current_balance())
            .map_err(err_balance_invariants_broken)?;

        Ok(())
    }
}

///////////////////////
// Cron handling     //
///////////////////////

/// Invoked at the end of the last epoch for each proving deadline.
fn handle_proving_deadline(rt: &impl Runtime) -> Result<(), ActorError> {
    let curr_epoch = rt.curr_epoch();

    let reward_stats = request_current_epoch_block_reward(rt)?;
    let power_stats = request_current_total_power(rt)?;

    let mut power_delta_total = PowerPair::zero();
    let mut penalty_total = TokenAmount::zero();
    let mut pledge_delta_total = TokenAmount::zero();

    let state: State = rt.transaction(|state: &mut State, rt| {
        let policy = rt.policy();
        let store = rt.store();

        // Vest locked funds.
        // This happens first so that any subsequent penalties are taken
        // from locked vesting funds before funds free this epoch.
        let newly_vested = state.unlock_vested_funds(store, curr_epoch).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest funds")
        })?;
        pledge_delta_total -= &newly_vested;

        let dl_info = state.deadline_info(policy, curr_epoch);
        // Skip deadline processing on the incomplete first period after construction.
        if dl_info.period_started() {
            let quant = dl_info.quant_spec();
            let fault_expiration = dl_info.last() + policy.fault_max_age;

            let mut deadlines = state.load_deadlines(store)?;
            let mut deadline = deadlines.load_deadline(store, dl_info.index)?;

            // Mark partitions with missed PoSts as faulty, and clear failed recoveries.
            let (detected_faulty_power, failed_recovery_power) = deadline
                .process_deadline_end(store, quant, fault_expiration)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to process end of deadline {}", dl_info.index),
                    )
                })?;
            power_delta_total -= &detected_faulty_power;

            // Faults detected by this missed PoSt pay the undeclared fault fee; sectors that
            // were already faulty and remain so through this deadline pay the (smaller)
            // ongoing fee. The fee base is taken before expirations are popped: a fault that
            // expires at this deadline still pays for the window it just missed.
            let detected_power = &detected_faulty_power + &failed_recovery_power;
            let detected_penalty = &pledge_penalty_for_undeclared_fault(
                &reward_stats.this_epoch_reward_smoothed,
                &power_stats.quality_adj_power_smoothed,
                &detected_power.qa,
            ) - &pledge_penalty_for_declared_fault(
                &reward_stats.this_epoch_reward_smoothed,
                &power_stats.quality_adj_power_smoothed,
                &detected_power.qa,
            );
            let ongoing_penalty = pledge_penalty_for_declared_fault(
                &reward_stats.this_epoch_reward_smoothed,
                &power_stats.quality_adj_power_smoothed,
                &deadline.faulty_power.qa,
            );
            let penalty_target = detected_penalty + ongoing_penalty;

            // Pop sector expirations that land at (or before) the close of this deadline.
            let expired = deadline
                .pop_expired_sectors(store, dl_info.last(), quant)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to load expired sectors for deadline {}", dl_info.index),
                    )
                })?;

            // Release pledge for on-time expirations. Active power is removed here; the
            // faulty power of expiring sectors was already removed when the fault was
            // detected or declared.
            state
                .add_initial_pledge_requirement(&expired.on_time_pledge.clone().neg())
                .map_err(|e| {
                    actor_error!(illegal_state, "failed to reduce pledge requirement: {}", e)
                })?;
            pledge_delta_total -= &expired.on_time_pledge;
            power_delta_total -= &expired.active_power;

            if !expired.early_sectors.is_empty() {
                state.early_terminations.set(dl_info.index);
            }

            if penalty_target.is_positive() {
                let unlocked_balance =
                    state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                        actor_error!(illegal_state, "failed to calculate unlocked balance: {}", e)
                    })?;
                let (penalty_from_balance, penalty_from_vesting) = state
                    .penalize_funds_in_priority_order(
                        store,
                        curr_epoch,
                        &penalty_target,
                        &unlocked_balance,
                    )
                    .map_err(|e| {
                        e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to unlock penalty")
                    })?;
                penalty_total = &penalty_from_balance + &penalty_from_vesting;
                pledge_delta_total -= &penalty_from_vesting;
            }

            deadlines.update_deadline(store, dl_info.index, &deadline).map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    format!("failed to update deadline {}", dl_info.index),
                )
            })?;
            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            // Advance to the next deadline; increment the proving period on wrap-around.
            state.current_deadline = (state.current_deadline + 1) % policy.wpost_period_deadlines;
            if state.current_deadline == 0 {
                state.proving_period_start += policy.wpost_proving_period;
            }
        }

        Ok(state.clone())
    })?;

    // Remove power for new faults, and burn penalties.
    request_update_power(rt, power_delta_total)?;
    burn_funds(rt, penalty_total)?;
    notify_pledge_changed(rt, &pledge_delta_total)?;

    // Schedule cron callback for next deadline's last epoch.
    let new_deadline_info = state.deadline_info(rt.policy(), curr_epoch + 1);
    enroll_cron_event(
        rt,
        new_deadline_info.last(),
        CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE, sectors: None },
    )?;

    // Drain a batch of pending early terminations, if any. Anything left over is
    // picked up by subsequent deadline crons.
    if have_pending_early_terminations(&state) {
        process_early_terminations(
            rt,
            &reward_stats.this_epoch_reward_smoothed,
            &power_stats.quality_adj_power_smoothed,
        )?;
    }

    let state: State = rt.state()?;
    state
        .check_balance_invariants(&rt.current_balance())
        .map_err(err_balance_invariants_broken)?;

    Ok(())
}

fn process_early_terminations(
    rt: &impl Runtime,
    reward_smoothed: &FilterEstimate,
    quality_adj_power_smoothed: &FilterEstimate,
) -> Result</* more */ bool, ActorError> {
    let (result, more, deals_to_terminate, penalty, pledge_delta) =
        rt.transaction(|state: &mut State, rt| {
            let store = rt.store();
            let policy = rt.policy();
            let curr_epoch = rt.curr_epoch();

            let (result, more) = state
                .pop_early_terminations(
                    policy,
                    store,
                    policy.addressed_partitions_max,
                    policy.addressed_sectors_max,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to pop early terminations",
                    )
                })?;

            // Nothing to do, don't waste any time.
            // This can happen if we end up processing early terminations
            // before the cron callback fires.
            if result.is_empty() {
                info!("no early terminations (maybe cron callback hasn't happened yet?)");
                return Ok((
                    result,
                    more,
                    Vec::new(),
                    TokenAmount::zero(),
                    TokenAmount::zero(),
                ));
            }

            let info = get_miner_info(store, state)?;
            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut total_initial_pledge = TokenAmount::zero();
            let mut deals_to_terminate = Vec::<DealID>::new();
            let mut penalty_target = TokenAmount::zero();

            for (epoch, sector_numbers) in result.iter() {
                let sector_infos = sectors
                    .load_sector(sector_numbers)
                    .map_err(|e| e.wrap("failed to load sector infos"))?;

                for sector in &sector_infos {
                    total_initial_pledge += &sector.initial_pledge;
                    deals_to_terminate.extend_from_slice(&sector.deal_ids);
                    let sector_power = qa_power_for_sector(info.sector_size, sector);
                    penalty_target += pledge_penalty_for_termination(
                        &sector.expected_day_reward,
                        &sector.expected_storage_pledge,
                        epoch - sector.activation,
                        reward_smoothed,
                        quality_adj_power_smoothed,
                        &sector_power,
                    );
                }
            }

            // Pay the termination fee from the unlocked balance first, then from unvested funds;
            // the fee is thereby capped at the funds actually held.
            let unlocked_balance =
                state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                    actor_error!(illegal_state, "failed to calculate unlocked balance: {}", e)
                })?;
            let (penalty_from_balance, penalty_from_vesting) = state
                .penalize_funds_in_priority_order(
                    store,
                    curr_epoch,
                    &penalty_target,
                    &unlocked_balance,
                )
                .map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to unlock penalty")
                })?;
            let penalty = &penalty_from_balance + &penalty_from_vesting;

            // Release the pledge requirement for the terminated sectors.
            state
                .add_initial_pledge_requirement(&total_initial_pledge.clone().neg())
                .map_err(|e| {
                    actor_error!(illegal_state, "failed to reduce pledge requirement: {}", e)
                })?;

            let pledge_delta = (total_initial_pledge + penalty_from_vesting).neg();

            Ok((result, more, deals_to_terminate, penalty, pledge_delta))
        })?;

    // We didn't do anything, abort.
    if result.is_empty() {
        return Ok(more);
    }

    // Burn penalty.
    burn_funds(rt, penalty)?;

    // Return pledge.
    notify_pledge_changed(rt, &pledge_delta)?;

    // Terminate deals.
    request_terminate_deals(rt, rt.curr_epoch(), deals_to_terminate)?;

    // Reschedule cron worker, if necessary.
    Ok(more)
}

fn commit_worker_key_change(rt: &impl Runtime) -> Result<(), ActorError> {
    rt.transaction(|state: &mut State, rt| {
        let mut info = get_miner_info(rt.store(), state)?;

        let pending_worker_key = match &info.pending_worker_key {
            Some(key) => key,
            None => {
                warn!("no pending worker key change to commit");
                return Ok(());
            }
        };

        if rt.curr_epoch() < pending_worker_key.effective_at {
            warn!(
                "worker key change not yet effective: {} < {}",
                rt.curr_epoch(),
                pending_worker_key.effective_at
            );
            return Ok(());
        }

        info.worker = pending_worker_key.new_worker;
        info.pending_worker_key = None;

        state.save_info(rt.store(), &info).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save miner info")
        })
    })
}

fn check_precommit_expiry(rt: &impl Runtime, sectors: &BitField) -> Result<(), ActorError> {
    let deposit_to_burn = rt.transaction(|state: &mut State, rt| {
        let deposit_to_burn = state.expire_pre_commits(rt.store(), sectors).map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                "failed to expire pre-committed sectors",
            )
        })?;
        Ok(deposit_to_burn)
    })?;

    // This deposit was locked separately to pledge collateral so there's no pledge change here.
    burn_funds(rt, deposit_to_burn)?;

    let state: State = rt.state()?;
    state
        .check_balance_invariants(&rt.current_balance())
        .map_err(err_balance_invariants_broken)?;

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Utility functions & helpers
////////////////////////////////////////////////////////////////////////////////

fn validate_replace_sector<BS: Blockstore>(
    state: &State,
    store: &BS,
    params: &SectorPreCommitInfo,
) -> Result<SectorOnChainInfo, ActorError> {
    let replace_sector = state
        .get_sector(store, params.replace_sector_number)
        .map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                format!("failed to load sector {}", params.replace_sector_number),
            )
        })?
        .ok_or_else(|| {
            actor_error!(not_found, "no such sector {} to replace", params.replace_sector_number)
        })?;

    if !replace_sector.deal_ids.is_empty() {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} which has deals",
            params.replace_sector_number
        ));
    }
    if params.seal_proof != replace_sector.seal_proof {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} seal proof {:?} with seal proof {:?}",
            params.replace_sector_number,
            replace_sector.seal_proof,
            params.seal_proof
        ));
    }
    if params.expiration < replace_sector.expiration {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} expiration {} with sooner expiration {}",
            params.replace_sector_number,
            replace_sector.expiration,
            params.expiration
        ));
    }

    state
        .check_sector_health(
            store,
            params.replace_sector_deadline,
            params.replace_sector_partition,
            params.replace_sector_number,
        )
        .map_err(|e| {
            e.downcast_default(
                ExitCode::USR_FORBIDDEN,
                format!("failed to replace sector {}", params.replace_sector_number),
            )
        })?;

    Ok(replace_sector)
}

/// Reschedules a replaced CC sector to expire at the end of the next not-elapsed instance
/// of its deadline, ahead of its upgraded replacement.
fn replace_sector_expiration<BS: Blockstore>(
    policy: &Policy,
    state: &mut State,
    store: &BS,
    info: &MinerInfo,
    current_epoch: ChainEpoch,
    precommit: &SectorPreCommitInfo,
) -> anyhow::Result<()> {
    if state.get_sector(store, precommit.replace_sector_number)?.is_none() {
        // The sector was terminated (e.g. expired) since the pre-commitment; nothing to move.
        return Ok(());
    }

    let deadline_idx = precommit.replace_sector_deadline;
    let target_deadline =
        new_deadline_info(policy, state.proving_period_start, deadline_idx, current_epoch)
            .next_not_elapsed();
    let new_expiration = target_deadline.last();

    let mut deadlines = state.load_deadlines(store)?;
    let mut deadline = deadlines.load_deadline(store, deadline_idx)?;

    let sectors = Sectors::load(store, &state.sectors)?;
    let mut replace_sector_numbers = BitField::new();
    replace_sector_numbers.set(precommit.replace_sector_number);

    let mut partition_sectors = PartitionSectorMap::default();
    partition_sectors.add(precommit.replace_sector_partition, replace_sector_numbers)?;

    let quant = state.quant_spec_for_deadline(policy, deadline_idx);
    deadline.reschedule_sector_expirations(
        store,
        &sectors,
        new_expiration,
        &mut partition_sectors,
        info.sector_size,
        quant,
    )?;

    deadlines.update_deadline(store, deadline_idx, &deadline)?;
    state.save_deadlines(store, deadlines)?;

    Ok(())
}

fn validate_expiration(
    policy: &Policy,
    state: &State,
    curr_epoch: ChainEpoch,
    activation: ChainEpoch,
    expiration: ChainEpoch,
    seal_proof: RegisteredSealProof,
) -> Result<(), ActorError> {
    // expiration cannot be less than minimum after activation
    if expiration - activation < policy.min_sector_expiration {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, total sector lifetime ({}) must exceed {} after activation {}",
            expiration,
            expiration - activation,
            policy.min_sector_expiration,
            activation
        ));
    }

    // expiration cannot exceed MaxSectorExpirationExtension from now
    if expiration > curr_epoch + policy.max_sector_expiration_extension {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, cannot be more than {} past current epoch {}",
            expiration,
            policy.max_sector_expiration_extension,
            curr_epoch
        ));
    }

    // total sector lifetime cannot exceed SectorMaximumLifetime for the sector's seal proof
    let max_lifetime = seal_proof_sector_maximum_lifetime(seal_proof).ok_or_else(|| {
        actor_error!(illegal_argument, "unrecognized seal proof type {:?}", seal_proof)
    })?;
    if expiration - activation > max_lifetime {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, total sector lifetime ({}) cannot exceed {} after activation {}",
            expiration,
            expiration - activation,
            max_lifetime,
            activation
        ));
    }

    // ensure expiration is one epoch before a proving period boundary
    let period_offset = state.proving_period_start % policy.wpost_proving_period;
    let expiry_offset = (expiration + 1) % policy.wpost_proving_period;
    if expiry_offset != period_offset {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, must be immediately before proving period boundary {} mod {}",
            expiration,
            period_offset,
            policy.wpost_proving_period
        ));
    }

    Ok(())
}

fn enroll_cron_event(
    rt: &impl Runtime,
    event_epoch: ChainEpoch,
    cb: CronEventPayload,
) -> Result<(), ActorError> {
    let payload = serialize(&cb, "cron payload")?;
    let ser_params =
        IpldBlock::serialize_cbor(&ext::power::EnrollCronEventParams { event_epoch, payload })?;
    extract_send_result(rt.send_simple(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::ENROLL_CRON_EVENT_METHOD,
        ser_params,
        TokenAmount::zero(),
    ))?;

    Ok(())
}

fn request_update_power(rt: &impl Runtime, delta: PowerPair) -> Result<(), ActorError> {
    if delta.is_zero() {
        return Ok(());
    }

    let delta_clone = delta.clone();

    extract_send_result(rt.send_simple(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::UPDATE_CLAIMED_POWER_METHOD,
        IpldBlock::serialize_cbor(&ext::power::UpdateClaimedPowerParams {
            raw_byte_delta: delta.raw,
            quality_adjusted_delta: delta.qa,
        })?,
        TokenAmount::zero(),
    ))
    .map_err(|e| e.wrap(format!("failed to update power with {:?}", delta_clone)))?;

    Ok(())
}

fn request_terminate_deals(
    rt: &impl Runtime,
    epoch: ChainEpoch,
    deal_ids: Vec<DealID>,
) -> Result<(), ActorError> {
    for batch in deal_ids.chunks(DEAL_TERMINATION_BATCH_SIZE) {
        extract_send_result(rt.send_simple(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::ON_MINER_SECTORS_TERMINATE_METHOD,
            IpldBlock::serialize_cbor(&ext::market::OnMinerSectorsTerminateParams {
                epoch,
                deal_ids: batch.to_vec(),
            })?,
            TokenAmount::zero(),
        ))?;
    }
    Ok(())
}

fn have_pending_early_terminations(state: &State) -> bool {
    let no_early_terminations = state.early_terminations.is_empty();
    !no_early_terminations
}

fn verify_windowed_post(
    rt: &impl Runtime,
    challenge_epoch: ChainEpoch,
    sectors: &[SectorOnChainInfo],
    proofs: &[fvm_shared::sector::PoStProof],
) -> Result<(), ActorError> {
    let miner_actor_id: u64 = if let Payload::ID(i) = rt.message().receiver().payload() {
        *i
    } else {
        return Err(actor_error!(
            illegal_state,
            "runtime provided bad receiver address {}",
            rt.message().receiver()
        ));
    };

    // Regenerate challenge randomness, which must match that generated for the proof.
    let entropy = serialize_vec(&rt.message().receiver(), "address for window post challenge")?;
    let randomness = rt.get_randomness_from_beacon(
        DomainSeparationTag::WindowedPoStChallengeSeed,
        challenge_epoch,
        &entropy,
    )?;

    let challenged_sectors = sectors
        .iter()
        .map(|s| SectorInfo {
            proof: s.seal_proof,
            sector_number: s.sector_number,
            sealed_cid: s.sealed_cid,
        })
        .collect();

    // get public inputs
    let pv_info = WindowPoStVerifyInfo {
        randomness: Randomness(randomness.into()),
        proofs: proofs.to_vec(),
        challenged_sectors,
        prover: miner_actor_id,
    };

    // verify the post proof
    rt.verify_post(&pv_info)
        .map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_ARGUMENT, "invalid PoSt")
        })?;
    Ok(())
}

fn request_current_epoch_block_reward(
    rt: &impl Runtime,
) -> Result<ThisEpochRewardReturn, ActorError> {
    deserialize_block(
        extract_send_result(rt.send_simple(
            &REWARD_ACTOR_ADDR,
            ext::reward::THIS_EPOCH_REWARD_METHOD,
            Default::default(),
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to check epoch baseline power"))?,
    )
}

/// Requests the current network total power and pledge from the power actor.
fn request_current_total_power(
    rt: &impl Runtime,
) -> Result<ext::power::CurrentTotalPowerReturn, ActorError> {
    deserialize_block(
        extract_send_result(rt.send_simple(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::CURRENT_TOTAL_POWER_METHOD,
            Default::default(),
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to check current power"))?,
    )
}

/// Requests deal weights for a sector's deals from the market actor.
fn request_deal_weights(
    rt: &impl Runtime,
    deal_ids: &[DealID],
    sector_start: ChainEpoch,
    sector_expiry: ChainEpoch,
) -> Result<ext::market::VerifyDealsForActivationReturn, ActorError> {
    deserialize_block(
        extract_send_result(rt.send_simple(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
            IpldBlock::serialize_cbor(&ext::market::VerifyDealsForActivationParams {
                deal_ids: deal_ids.to_vec(),
                sector_start,
                sector_expiry,
            })?,
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to verify deals and get deal weight"))?,
    )
}

/// Requests the storage market actor compute the unsealed sector CID from a sector's deals.
fn request_unsealed_sector_cid(
    rt: &impl Runtime,
    sector_type: RegisteredSealProof,
    deal_ids: &[DealID],
) -> Result<Cid, ActorError> {
    deserialize_block(
        extract_send_result(rt.send_simple(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::COMPUTE_DATA_COMMITMENT_METHOD,
            IpldBlock::serialize_cbor(&ext::market::ComputeDataCommitmentParams {
                deal_ids: deal_ids.to_vec(),
                sector_type,
            })?,
            TokenAmount::zero(),
        ))
        .map_err(|e| e.wrap("failed to request unsealed sector CID"))?,
    )
}

/// Resolves an address to an ID address and verifies that it is address of an account or multisig actor.
fn resolve_owner_address(rt: &impl Runtime, raw: Address) -> Result<Address, ActorError> {
    let resolved = rt
        .resolve_address(&raw)
        .ok_or_else(|| actor_error!(illegal_argument, "unable to resolve address: {}", raw))?;

    let owner_code = rt
        .get_actor_code_cid(&resolved)
        .ok_or_else(|| actor_error!(illegal_argument, "no code for address: {}", resolved))?;

    let is_principal = rt
        .resolve_builtin_actor_type(&owner_code)
        .as_ref()
        .map(|t| CALLER_TYPES_SIGNABLE.contains(t))
        .unwrap_or(false);

    if !is_principal {
        return Err(actor_error!(
            illegal_argument,
            "owner actor type must be a principal, was {}",
            owner_code
        ));
    }

    Ok(Address::new_id(resolved))
}

/// Resolves an address to an ID address and verifies that it is address of an account actor with an associated BLS key.
/// The worker must be BLS since the worker key will be used alongside a BLS-VRF.
fn resolve_worker_address(rt: &impl Runtime, raw: Address) -> Result<Address, ActorError> {
    let resolved = rt
        .resolve_address(&raw)
        .ok_or_else(|| actor_error!(illegal_argument, "unable to resolve address: {}", raw))?;

    let worker_code = rt
        .get_actor_code_cid(&resolved)
        .ok_or_else(|| actor_error!(illegal_argument, "no code for address: {}", resolved))?;
    if rt.resolve_builtin_actor_type(&worker_code) != Some(Type::Account) {
        return Err(actor_error!(
            illegal_argument,
            "worker actor type must be an account, was {}",
            worker_code
        ));
    }

    if raw.protocol() != Protocol::BLS {
        let pub_key: Address = deserialize_block(extract_send_result(rt.send_simple(
            &Address::new_id(resolved),
            ext::account::PUBKEY_ADDRESS_METHOD,
            None,
            TokenAmount::zero(),
        ))?)?;
        if pub_key.protocol() != Protocol::BLS {
            return Err(actor_error!(
                illegal_argument,
                "worker account {} must have BLS pubkey, was {}",
                resolved,
                pub_key.protocol()
            ));
        }
    }
    Ok(Address::new_id(resolved))
}

fn burn_funds(rt: &impl Runtime, amount: TokenAmount) -> Result<(), ActorError> {
    log::debug!("storage provider {} burning {}", rt.message().receiver(), amount);
    if amount.is_positive() {
        extract_send_result(rt.send_simple(&BURNT_FUNDS_ACTOR_ADDR, METHOD_SEND, None, amount))?;
    }
    Ok(())
}

fn notify_pledge_changed(rt: &impl Runtime, pledge_delta: &TokenAmount) -> Result<(), ActorError> {
    if !pledge_delta.is_zero() {
        extract_send_result(rt.send_simple(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
            IpldBlock::serialize_cbor(pledge_delta)?,
            TokenAmount::zero(),
        ))?;
    }
    Ok(())
}

/// Assigns proving period offset randomly in the range [0, WPoStProvingPeriod) by hashing
/// the actor's address and current epoch.
fn assign_proving_period_offset(
    policy: &Policy,
    addr: Address,
    current_epoch: ChainEpoch,
    blake2b: impl FnOnce(&[u8]) -> [u8; 32],
) -> anyhow::Result<ChainEpoch> {
    let mut my_addr = serialize_vec(&addr, "address")?;
    my_addr.write_i64::<BigEndian>(current_epoch)?;

    let digest = blake2b(&my_addr);

    let mut offset: u64 = BigEndian::read_u64(&digest);
    offset %= policy.wpost_proving_period as u64;

    // Conversion from i64 to u64 is safe because it's % WPOST_PROVING_PERIOD which is i64
    Ok(offset as ChainEpoch)
}

/// Computes the epoch at which a proving period should start such that it is greater than the
/// current epoch, and has a defined offset from being an exact multiple of WPoStProvingPeriod.
/// A miner is exempt from Window PoSt until the first full proving period starts.
fn next_proving_period_start(
    policy: &Policy,
    current_epoch: ChainEpoch,
    offset: ChainEpoch,
) -> ChainEpoch {
    let curr_modulus = current_epoch % policy.wpost_proving_period;

    let period_progress = if curr_modulus >= offset {
        curr_modulus - offset
    } else {
        policy.wpost_proving_period - (offset - curr_modulus)
    };

    current_epoch + policy.wpost_proving_period - period_progress
}

/// Computes deadline information for a fault or recovery declaration.
/// If the deadline has not yet elapsed, the declaration is taken as being for the current proving period.
/// If the deadline has elapsed, it's instead taken as being for the next proving period after the current epoch.
fn declaration_deadline_info(
    policy: &Policy,
    period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> anyhow::Result<DeadlineInfo> {
    if deadline_idx >= policy.wpost_period_deadlines {
        return Err(anyhow!(
            "invalid deadline {}, must be < {}",
            deadline_idx,
            policy.wpost_period_deadlines
        ));
    }

    let deadline =
        new_deadline_info(policy, period_start, deadline_idx, current_epoch).next_not_elapsed();
    Ok(deadline)
}

/// Checks that a fault or recovery declaration at a specific deadline is outside the exclusion window for the deadline.
fn validate_fr_declaration_deadline(deadline: &DeadlineInfo) -> anyhow::Result<()> {
    if deadline.fault_cutoff_passed() {
        Err(anyhow!("late fault or recovery declaration"))
    } else {
        Ok(())
    }
}

pub fn power_for_sector(sector_size: SectorSize, sector: &SectorOnChainInfo) -> PowerPair {
    PowerPair {
        raw: fvm_shared::bigint::BigInt::from(sector_size as u64),
        qa: qa_power_for_sector(sector_size, sector),
    }
}

/// Returns the sum of the raw byte and quality-adjusted power for sectors.
pub fn power_for_sectors(sector_size: SectorSize, sectors: &[SectorOnChainInfo]) -> PowerPair {
    let qa = sectors.iter().map(|s| qa_power_for_sector(sector_size, s)).sum();

    PowerPair {
        raw: fvm_shared::bigint::BigInt::from(sector_size as u64)
            * fvm_shared::bigint::BigInt::from(sectors.len()),
        qa,
    }
}

fn get_miner_info<BS>(store: &BS, state: &State) -> Result<MinerInfo, ActorError>
where
    BS: Blockstore,
{
    state
        .get_info(store)
        .map_err(|e| e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not read miner info"))
}

fn check_peer_info(
    policy: &Policy,
    peer_id: &[u8],
    multiaddrs: &[fvm_ipld_encoding::BytesDe],
) -> Result<(), ActorError> {
    if peer_id.len() > policy.max_peer_id_length {
        return Err(actor_error!(
            illegal_argument,
            "peer ID size of {} exceeds maximum size of {}",
            peer_id.len(),
            policy.max_peer_id_length
        ));
    }

    let mut total_size = 0;
    for ma in multiaddrs {
        if ma.0.is_empty() {
            return Err(actor_error!(illegal_argument, "invalid empty multiaddr"));
        }
        total_size += ma.0.len();
    }

    if total_size > policy.max_multiaddr_data {
        return Err(actor_error!(
            illegal_argument,
            "multiaddr size of {} exceeds maximum of {}",
            total_size,
            policy.max_multiaddr_data
        ));
    }

    Ok(())
}

impl ActorCode for Actor {
    type Methods = Method;

    fn name() -> &'static str {
        "StorageMiner"
    }

    actor_dispatch! {
        Constructor => constructor,
        ControlAddresses => control_addresses,
        ChangeWorkerAddress => change_worker_address,
        ChangePeerID => change_peer_id,
        SubmitWindowedPoSt => submit_windowed_post,
        PreCommitSector => pre_commit_sector,
        ProveCommitSector => prove_commit_sector,
        ExtendSectorExpiration => extend_sector_expiration,
        TerminateSectors => terminate_sectors,
        DeclareFaults => declare_faults,
        DeclareFaultsRecovered => declare_faults_recovered,
        OnDeferredCronEvent => on_deferred_cron_event,
        CheckSectorProven => check_sector_proven,
        AddLockedFund => add_locked_fund,
        ReportConsensusFault => report_consensus_fault,
        WithdrawBalance => withdraw_balance,
        ConfirmSectorProofsValid => confirm_sector_proofs_valid,
        ChangeMultiaddrs => change_multiaddrs,
    }
}
