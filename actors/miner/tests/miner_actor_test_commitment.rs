use fil_actor_miner::{
    Actor, Method, initial_pledge_for_power, max_seal_duration, power_for_sector,
    qa_power_for_weight,
};
use fil_actors_runtime::runtime::Runtime;
use fil_actors_runtime::runtime::policy_constants::{
    MAX_SECTOR_NUMBER, PRE_COMMIT_CHALLENGE_DELAY, WPOST_PROVING_PERIOD,
};
use fil_actors_runtime::test_utils::*;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::SectorNumber;
use num_traits::Zero;

mod util;
use util::*;

#[test]
fn valid_precommit_then_provecommit() {
    let period_offset = 100;
    let mut h = ActorHarness::new(period_offset);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    let precommit_epoch = period_offset + 1;
    rt.set_epoch(precommit_epoch);

    h.construct_and_verify(&rt);
    let dl_info = h.deadline(&rt);

    // Make a good commitment for the proof to target.
    // Use the max sector number to make sure everything works.
    let sector_no: SectorNumber = MAX_SECTOR_NUMBER;
    // something on deadline boundary but > 180 days
    let expiration =
        dl_info.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * WPOST_PROVING_PERIOD;

    let precommit_params =
        h.make_pre_commit(sector_no, precommit_epoch - 1, expiration, vec![]);
    let precommit = h.pre_commit_sector(&rt, precommit_params.clone());

    // Check precommit expectations.
    assert_eq!(precommit_epoch, precommit.pre_commit_epoch);
    assert_eq!(precommit_params, precommit.info);

    // Deal weights are recorded on chain from the market actor's response.
    assert_eq!(h.mock_deal_weights().deal_weight, precommit.deal_weight);
    assert_eq!(h.mock_deal_weights().verified_deal_weight, precommit.verified_deal_weight);

    // Expect the pre-commit deposit to be the initial pledge calculated at pre-commit time.
    let qa_power = qa_power_for_weight(
        h.sector_size,
        precommit.info.expiration - precommit_epoch,
        &precommit.deal_weight,
        &precommit.verified_deal_weight,
    );
    let expected_deposit = initial_pledge_for_power(
        &qa_power,
        &h.baseline_power,
        &h.network_pledge,
        &h.epoch_reward_smooth,
        &h.epoch_qa_power_smooth,
        &rt.circulating_supply.borrow(),
    );
    assert_eq!(expected_deposit, precommit.pre_commit_deposit);

    let state = h.get_state(&rt);
    assert_eq!(expected_deposit, state.pre_commit_deposits);
    assert!(expected_deposit.is_positive());

    // Run prove commit logic.
    rt.set_epoch(precommit_epoch + PRE_COMMIT_CHALLENGE_DELAY + 1);
    let sector = h.prove_commit_sector_and_confirm(
        &rt,
        &precommit,
        h.make_prove_commit_params(sector_no),
        ProveCommitConfig::empty(),
    );

    // Expect precommit to have been removed.
    let state = h.get_state(&rt);
    assert!(state.get_precommitted_sector(rt.store(), sector_no).unwrap().is_none());

    // Expect deposit to have been transferred to initial pledge.
    assert_eq!(TokenAmount::zero(), state.pre_commit_deposits);

    let qa_power = qa_power_for_weight(
        h.sector_size,
        precommit.info.expiration - *rt.epoch.borrow(),
        &precommit.deal_weight,
        &precommit.verified_deal_weight,
    );
    let expected_initial_pledge = initial_pledge_for_power(
        &qa_power,
        &h.baseline_power,
        &h.network_pledge,
        &h.epoch_reward_smooth,
        &h.epoch_qa_power_smooth,
        &rt.circulating_supply.borrow(),
    );
    assert_eq!(expected_initial_pledge, state.initial_pledge_requirement);
    assert_eq!(expected_initial_pledge, sector.initial_pledge);

    // Expect new sector on chain.
    assert_eq!(precommit.deal_weight, sector.deal_weight);
    assert_eq!(precommit.verified_deal_weight, sector.verified_deal_weight);
    assert_eq!(*rt.epoch.borrow(), sector.activation);
    assert_eq!(expiration, sector.expiration);

    // Expect the sector to be assigned to deadline 0, partition 0 (first mutable deadline).
    let (dl_idx, p_idx) = h.find_sector(&rt, sector_no);
    assert_eq!(0, dl_idx);
    assert_eq!(0, p_idx);

    let (deadline, partition) = h.get_deadline_and_partition(&rt, dl_idx, p_idx);
    assert_eq!(1, deadline.live_sectors);
    assert!(deadline.post_submissions.is_empty());
    assert!(deadline.early_terminations.is_empty());

    let quant = state.quant_spec_for_deadline(&rt.policy, dl_idx);
    let quantized_expiration = quant.quantize_up(precommit.info.expiration);

    assert_bitfield_equals(&partition.sectors, &[sector_no]);
    assert_empty_bitfield(&partition.faults);
    assert_empty_bitfield(&partition.recoveries);
    assert_empty_bitfield(&partition.terminated);

    let sector_power = power_for_sector(h.sector_size, &sector);
    assert_eq!(sector_power, partition.live_power);

    // The expiration queue holds the sector at its quantized expiration.
    let queue = fil_actor_miner::ExpirationQueue::new(
        rt.store(),
        &partition.expirations_epochs,
        quant,
    )
    .unwrap();
    let entry = queue.amt.get(quantized_expiration as u64).unwrap().unwrap();
    assert_bitfield_equals(&entry.on_time_sectors, &[sector_no]);
    assert_empty_bitfield(&entry.early_sectors);
    assert_eq!(expected_initial_pledge, entry.on_time_pledge);
    assert_eq!(sector_power, entry.active_power);

    h.check_state(&rt);
}

#[test]
fn invalid_pre_commit_rejected() {
    let period_offset = 100;
    let mut h = ActorHarness::new(period_offset);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    let precommit_epoch = period_offset + 1;
    rt.set_epoch(precommit_epoch);

    h.construct_and_verify(&rt);
    let deadline = h.deadline(&rt);
    let challenge_epoch = precommit_epoch - 1;

    let old_sector = h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![])[0].clone();

    let expiration =
        deadline.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * WPOST_PROVING_PERIOD;

    // Good commitment.
    h.pre_commit_sector(&rt, h.make_pre_commit(101, challenge_epoch, expiration, vec![]));

    // Duplicate pre-commit sector ID.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    h.expect_query_network_info(&rt);
    let vd_params = fil_actor_miner::ext::market::VerifyDealsForActivationParams {
        deal_ids: vec![],
        sector_start: *rt.epoch.borrow(),
        sector_expiry: expiration,
    };
    rt.expect_send_simple(
        fil_actors_runtime::STORAGE_MARKET_ACTOR_ADDR,
        fil_actor_miner::ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
        IpldBlock::serialize_cbor(&vd_params).unwrap(),
        TokenAmount::zero(),
        IpldBlock::serialize_cbor(&h.mock_deal_weights()).unwrap(),
        ExitCode::OK,
    );
    let dup = h.make_pre_commit(101, challenge_epoch, expiration, vec![]);
    let result = rt.call::<Actor>(
        Method::PreCommitSector as u64,
        IpldBlock::serialize_cbor(&dup).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "already pre-committed", result);
    rt.reset();

    // Sector ID already committed.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    h.expect_query_network_info(&rt);
    rt.expect_send_simple(
        fil_actors_runtime::STORAGE_MARKET_ACTOR_ADDR,
        fil_actor_miner::ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
        IpldBlock::serialize_cbor(&vd_params).unwrap(),
        TokenAmount::zero(),
        IpldBlock::serialize_cbor(&h.mock_deal_weights()).unwrap(),
        ExitCode::OK,
    );
    let committed =
        h.make_pre_commit(old_sector.sector_number, challenge_epoch, expiration, vec![]);
    let result = rt.call::<Actor>(
        Method::PreCommitSector as u64,
        IpldBlock::serialize_cbor(&committed).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "already committed", result);
    rt.reset();

    // Bad sealed CID.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    let mut bad_cid = h.make_pre_commit(102, challenge_epoch, expiration, vec![]);
    bad_cid.sealed_cid = make_cid_sha(b"random data", 0x55);
    let result = rt.call::<Actor>(
        Method::PreCommitSector as u64,
        IpldBlock::serialize_cbor(&bad_cid).unwrap(),
    );
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "sealed CID had wrong prefix",
        result,
    );
    rt.reset();

    // Sector number out of range.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    let out_of_range =
        h.make_pre_commit(MAX_SECTOR_NUMBER + 1, challenge_epoch, expiration, vec![]);
    let result = rt.call::<Actor>(
        Method::PreCommitSector as u64,
        IpldBlock::serialize_cbor(&out_of_range).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "out of range", result);
    rt.reset();

    // Expires at current epoch.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    let expires_now = h.make_pre_commit(102, challenge_epoch, *rt.epoch.borrow(), vec![]);
    let result = rt.call::<Actor>(
        Method::PreCommitSector as u64,
        IpldBlock::serialize_cbor(&expires_now).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "must be after now", result);
    rt.reset();

    // Expires not on period end.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    let not_aligned = h.make_pre_commit(102, challenge_epoch, expiration - 1, vec![]);
    let result = rt.call::<Actor>(
        Method::PreCommitSector as u64,
        IpldBlock::serialize_cbor(&not_aligned).unwrap(),
    );
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "proving period boundary",
        result,
    );
    rt.reset();

    // Expires too early.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    let too_early =
        h.make_pre_commit(102, challenge_epoch, deadline.period_end(), vec![]);
    let result = rt.call::<Actor>(
        Method::PreCommitSector as u64,
        IpldBlock::serialize_cbor(&too_early).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "must exceed", result);
    rt.reset();

    h.check_state(&rt);
}

#[test]
fn prove_commit_failures() {
    let period_offset = 100;
    let mut h = ActorHarness::new(period_offset);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    let precommit_epoch = period_offset + 1;
    rt.set_epoch(precommit_epoch);

    h.construct_and_verify(&rt);
    let deadline = h.deadline(&rt);

    let sector_no = 100;
    let expiration =
        deadline.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * WPOST_PROVING_PERIOD;
    let precommit = h.pre_commit_sector(
        &rt,
        h.make_pre_commit(sector_no, precommit_epoch - 1, expiration, vec![]),
    );

    // Sector pre-commitment missing.
    rt.set_epoch(precommit_epoch + PRE_COMMIT_CHALLENGE_DELAY + 1);
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_any();
    let result = rt.call::<Actor>(
        Method::ProveCommitSector as u64,
        IpldBlock::serialize_cbor(&h.make_prove_commit_params(sector_no + 1)).unwrap(),
    );
    expect_abort(ExitCode::USR_NOT_FOUND, result);
    rt.reset();

    // Too early.
    rt.set_epoch(precommit_epoch + PRE_COMMIT_CHALLENGE_DELAY - 1);
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_any();
    let result = rt.call::<Actor>(
        Method::ProveCommitSector as u64,
        IpldBlock::serialize_cbor(&h.make_prove_commit_params(sector_no)).unwrap(),
    );
    expect_abort(ExitCode::USR_FORBIDDEN, result);
    rt.reset();

    // Too late.
    rt.set_epoch(
        precommit_epoch + max_seal_duration(precommit.info.seal_proof).unwrap() + 1,
    );
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_any();
    let result = rt.call::<Actor>(
        Method::ProveCommitSector as u64,
        IpldBlock::serialize_cbor(&h.make_prove_commit_params(sector_no)).unwrap(),
    );
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "too late", result);
    rt.reset();

    // Good proof.
    rt.set_epoch(precommit_epoch + PRE_COMMIT_CHALLENGE_DELAY + 1);
    h.prove_commit_sector_and_confirm(
        &rt,
        &precommit,
        h.make_prove_commit_params(sector_no),
        ProveCommitConfig::empty(),
    );
    let state = h.get_state(&rt);
    assert!(state.initial_pledge_requirement.is_positive());

    // Duplicate proof (sector no longer pre-committed).
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_any();
    let result = rt.call::<Actor>(
        Method::ProveCommitSector as u64,
        IpldBlock::serialize_cbor(&h.make_prove_commit_params(sector_no)).unwrap(),
    );
    expect_abort(ExitCode::USR_NOT_FOUND, result);
    rt.reset();

    h.check_state(&rt);
}

#[test]
fn invalid_deal_activation_drops_sector() {
    let period_offset = 100;
    let mut h = ActorHarness::new(period_offset);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    let precommit_epoch = period_offset + 1;
    rt.set_epoch(precommit_epoch);

    h.construct_and_verify(&rt);
    let deadline = h.deadline(&rt);

    let sector_no = 100;
    let expiration =
        deadline.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * WPOST_PROVING_PERIOD;
    let precommit = h.pre_commit_sector(
        &rt,
        h.make_pre_commit(sector_no, precommit_epoch - 1, expiration, vec![1]),
    );

    rt.set_epoch(precommit_epoch + PRE_COMMIT_CHALLENGE_DELAY + 1);
    h.prove_commit_sector(&rt, &precommit, h.make_prove_commit_params(sector_no));

    // Market actor aborts deal activation; the sector is dropped without failing the call.
    let mut conf = ProveCommitConfig::empty();
    conf.verify_deals_exit.insert(sector_no, ExitCode::USR_ILLEGAL_ARGUMENT);
    h.confirm_sector_proofs_valid(&rt, conf, vec![precommit]);

    let state = h.get_state(&rt);
    assert!(state.get_sector(rt.store(), sector_no).unwrap().is_none());
    // The pre-commitment (and its deposit) remain until the expiry cron cleans them up.
    assert!(state.get_precommitted_sector(rt.store(), sector_no).unwrap().is_some());
    assert!(state.pre_commit_deposits.is_positive());

    h.check_state(&rt);
}

#[test]
fn valid_committed_capacity_upgrade() {
    let period_offset = 100;
    let mut h = ActorHarness::new(period_offset);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    h.construct_and_verify(&rt);

    // Move the current epoch forward so that the first deadline is a stable candidate for
    // both sectors.
    rt.set_epoch(period_offset + fil_actors_runtime::runtime::policy_constants::WPOST_CHALLENGE_WINDOW);

    // Commit a sector to upgrade.
    let old_sector = h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![])[0].clone();
    let (dl_idx, p_idx) = h.find_sector(&rt, old_sector.sector_number);

    let challenge_epoch = *rt.epoch.borrow() - 1;
    let mut upgrade_params =
        h.make_pre_commit(200, challenge_epoch, old_sector.expiration, vec![1]);
    upgrade_params.replace_capacity = true;
    upgrade_params.replace_sector_deadline = dl_idx;
    upgrade_params.replace_sector_partition = p_idx;
    upgrade_params.replace_sector_number = old_sector.sector_number;
    let upgrade = h.pre_commit_sector(&rt, upgrade_params.clone());

    // Check new pre-commit in state.
    assert!(upgrade.info.replace_capacity);
    assert_eq!(upgrade_params.replace_sector_number, upgrade.info.replace_sector_number);
    // Require new sector's pledge to be at least that of the old sector.
    assert!(upgrade.pre_commit_deposit >= old_sector.initial_pledge);

    // Old sector is unchanged.
    let old_sector_again = h.get_sector(&rt, old_sector.sector_number);
    assert_eq!(old_sector, old_sector_again);

    // Deposit and pledge as expected.
    let state = h.get_state(&rt);
    assert_eq!(state.pre_commit_deposits, upgrade.pre_commit_deposit);
    assert_eq!(state.initial_pledge_requirement, old_sector.initial_pledge);

    // Prove new sector.
    rt.set_epoch(upgrade.pre_commit_epoch + PRE_COMMIT_CHALLENGE_DELAY + 1);
    let new_sector = h.prove_commit_sector_and_confirm(
        &rt,
        &upgrade,
        h.make_prove_commit_params(upgrade.info.sector_number),
        ProveCommitConfig::empty(),
    );

    // Both sectors have pledge.
    let state = h.get_state(&rt);
    assert_eq!(TokenAmount::zero(), state.pre_commit_deposits);
    assert_eq!(
        state.initial_pledge_requirement,
        &old_sector.initial_pledge + &new_sector.initial_pledge
    );
    // The upgraded sector's pledge is floored at the replaced sector's.
    assert!(new_sector.initial_pledge >= old_sector.initial_pledge);

    // Both sectors are present (in the same deadline/partition).
    let (deadline, partition) = h.get_deadline_and_partition(&rt, dl_idx, p_idx);
    assert_eq!(2, deadline.total_sectors);
    assert_eq!(2, deadline.live_sectors);
    assert_empty_bitfield(&deadline.early_terminations);

    assert_bitfield_equals(
        &partition.sectors,
        &[old_sector.sector_number, new_sector.sector_number],
    );
    assert_empty_bitfield(&partition.faults);
    assert_empty_bitfield(&partition.terminated);

    // The old sector's expiration has changed to the end of this proving deadline.
    // The new one expires when the old one used to.
    let quant = state.quant_spec_for_deadline(&rt.policy, dl_idx);
    let dl_info = fil_actor_miner::new_deadline_info(
        &rt.policy,
        state.proving_period_start,
        dl_idx,
        *rt.epoch.borrow(),
    )
    .next_not_elapsed();
    let quantized_expiration = quant.quantize_up(old_sector.expiration);

    let queue = fil_actor_miner::ExpirationQueue::new(
        rt.store(),
        &partition.expirations_epochs,
        quant,
    )
    .unwrap();
    let early_entry = queue.amt.get(dl_info.last() as u64).unwrap().unwrap();
    assert_bitfield_equals(&early_entry.on_time_sectors, &[old_sector.sector_number]);
    let late_entry = queue.amt.get(quantized_expiration as u64).unwrap().unwrap();
    assert_bitfield_equals(&late_entry.on_time_sectors, &[new_sector.sector_number]);

    h.check_state(&rt);

    // Roll forward to the beginning of the next iteration of this deadline.
    h.advance_to_epoch_with_cron(&rt, dl_info.open);

    // Fail to submit PoSt. This means that both sectors will be detected faulty.
    // Expect the old sector to be marked as terminated.
    let both_sectors = vec![old_sector.clone(), new_sector.clone()];
    let lost_power = h.power_pair_for_sectors(&both_sectors);
    let fault_penalty = h.undeclared_fault_penalty(&both_sectors);

    let mut cfg = CronConfig::empty();
    cfg.detected_faults_power_delta = Some(-&lost_power);
    cfg.detected_faults_penalty = fault_penalty;
    cfg.expired_sectors_pledge_delta = -old_sector.initial_pledge.clone();
    h.advance_deadline(&rt, cfg);

    let (deadline, partition) = h.get_deadline_and_partition(&rt, dl_idx, p_idx);
    assert_eq!(2, deadline.total_sectors);
    assert_eq!(1, deadline.live_sectors);
    assert_bitfield_equals(
        &partition.sectors,
        &[old_sector.sector_number, new_sector.sector_number],
    );
    assert_bitfield_equals(&partition.terminated, &[old_sector.sector_number]);
    assert_bitfield_equals(&partition.faults, &[new_sector.sector_number]);

    let new_power = power_for_sector(h.sector_size, &new_sector);
    assert_eq!(new_power, partition.live_power);
    assert_eq!(new_power, partition.faulty_power);

    // Old sector is gone from the pledge requirement.
    let state = h.get_state(&rt);
    assert_eq!(state.initial_pledge_requirement, new_sector.initial_pledge);

    h.check_state(&rt);
}

#[test]
fn invalid_committed_capacity_upgrade_rejected() {
    let period_offset = 100;
    let mut h = ActorHarness::new(period_offset);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    rt.set_epoch(period_offset + 1);
    h.construct_and_verify(&rt);

    // Commit sectors to target upgrade. The first has no deals, the second has a deal.
    let old_sectors =
        h.commit_and_prove_sectors(&rt, 2, DEFAULT_SECTOR_EXPIRATION, vec![vec![], vec![10]]);
    let (dl_idx, p_idx) = h.find_sector(&rt, old_sectors[0].sector_number);

    let challenge_epoch = *rt.epoch.borrow() - 1;
    let mut upgrade_params =
        h.make_pre_commit(200, challenge_epoch, old_sectors[0].expiration, vec![20]);
    upgrade_params.replace_capacity = true;
    upgrade_params.replace_sector_deadline = dl_idx;
    upgrade_params.replace_sector_partition = p_idx;
    upgrade_params.replace_sector_number = old_sectors[0].sector_number;

    // Must have deals.
    {
        let mut params = upgrade_params.clone();
        params.deal_ids = vec![];
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
        let result = rt.call::<Actor>(
            Method::PreCommitSector as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        expect_abort_contains_message(
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "cannot replace sector without committing deals",
            result,
        );
        rt.reset();
    }

    // Old sector cannot have deals.
    {
        let mut params = upgrade_params.clone();
        params.replace_sector_number = old_sectors[1].sector_number;
        expect_precommit_abort(
            &h,
            &rt,
            params,
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "cannot replace sector which has deals",
        );
    }

    // Target sector must exist.
    {
        let mut params = upgrade_params.clone();
        params.replace_sector_number = 999;
        expect_precommit_abort(&h, &rt, params, ExitCode::USR_NOT_FOUND, "no such sector");
    }

    // Expiration must not be sooner than target.
    {
        let mut params = upgrade_params.clone();
        params.expiration -= WPOST_PROVING_PERIOD;
        expect_precommit_abort(
            &h,
            &rt,
            params,
            ExitCode::USR_ILLEGAL_ARGUMENT,
            "sooner expiration",
        );
    }

    // Demonstrate that the params are otherwise OK.
    h.pre_commit_sector(&rt, upgrade_params);
    h.check_state(&rt);
}

fn expect_precommit_abort(
    h: &ActorHarness,
    rt: &MockRuntime,
    params: fil_actor_miner::SectorPreCommitInfo,
    code: ExitCode,
    message: &str,
) {
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    h.expect_query_network_info(rt);
    let vd_params = fil_actor_miner::ext::market::VerifyDealsForActivationParams {
        deal_ids: params.deal_ids.clone(),
        sector_start: *rt.epoch.borrow(),
        sector_expiry: params.expiration,
    };
    rt.expect_send_simple(
        fil_actors_runtime::STORAGE_MARKET_ACTOR_ADDR,
        fil_actor_miner::ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
        IpldBlock::serialize_cbor(&vd_params).unwrap(),
        TokenAmount::zero(),
        IpldBlock::serialize_cbor(&h.mock_deal_weights()).unwrap(),
        ExitCode::OK,
    );
    let result = rt.call::<Actor>(
        Method::PreCommitSector as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    );
    expect_abort_contains_message(code, message, result);
    rt.reset();
}
