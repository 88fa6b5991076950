use fil_actor_miner::{
    Actor, ExpirationExtension, ExtendSectorExpirationParams, Method, qa_power_for_sector,
};
use fil_actors_runtime::runtime::Runtime;
use fil_actors_runtime::runtime::policy_constants::{
    MAX_SECTOR_EXPIRATION_EXTENSION, WPOST_PROVING_PERIOD,
};
use fil_actors_runtime::test_utils::*;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::sector::RegisteredSealProof;
use num_traits::Zero;

mod util;
use util::*;

const PERIOD_OFFSET: i64 = 100;

fn setup() -> (ActorHarness, MockRuntime) {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    h.set_proof_type(RegisteredSealProof::StackedDRG2KiBV1);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    h.construct_and_verify(&rt);
    rt.set_epoch(PERIOD_OFFSET + 1);
    (h, rt)
}

#[test]
fn rejects_negative_extension() {
    let (mut h, rt) = setup();
    let sector = h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![])[0].clone();
    let (deadline_idx, partition_idx) = h.find_sector(&rt, sector.sector_number);

    // Attempt to shorten the expiration.
    let new_expiration = sector.expiration - WPOST_PROVING_PERIOD;
    let mut sectors = BitField::new();
    sectors.set(sector.sector_number);
    let params = ExtendSectorExpirationParams {
        extensions: vec![ExpirationExtension {
            deadline: deadline_idx,
            partition: partition_idx,
            sectors,
            new_expiration,
        }],
    };

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    let result = rt.call::<Actor>(
        Method::ExtendSectorExpiration as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    );
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "cannot reduce sector",
        result,
    );
    rt.reset();
    h.check_state(&rt);
}

#[test]
fn rejects_extension_too_far_in_future() {
    let (mut h, rt) = setup();
    let sector = h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![])[0].clone();
    let (deadline_idx, partition_idx) = h.find_sector(&rt, sector.sector_number);

    // Extend the expiration well past the maximum.
    let new_expiration =
        *rt.epoch.borrow() + MAX_SECTOR_EXPIRATION_EXTENSION + WPOST_PROVING_PERIOD;
    let mut sectors = BitField::new();
    sectors.set(sector.sector_number);
    let params = ExtendSectorExpirationParams {
        extensions: vec![ExpirationExtension {
            deadline: deadline_idx,
            partition: partition_idx,
            sectors,
            new_expiration,
        }],
    };

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    let result = rt.call::<Actor>(
        Method::ExtendSectorExpiration as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    );
    expect_abort_contains_message(
        ExitCode::USR_ILLEGAL_ARGUMENT,
        "cannot be more than",
        result,
    );
    rt.reset();
    h.check_state(&rt);
}

#[test]
fn updates_expiration_with_valid_params() {
    let (mut h, rt) = setup();
    let old_sector =
        h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![])[0].clone();
    h.advance_and_submit_posts(&rt, &[old_sector.clone()]);

    let state = h.get_state(&rt);
    let (deadline_idx, partition_idx) = h.find_sector(&rt, old_sector.sector_number);

    let extension = 42 * WPOST_PROVING_PERIOD;
    let new_expiration = old_sector.expiration + extension;

    let mut sectors = BitField::new();
    sectors.set(old_sector.sector_number);
    let params = ExtendSectorExpirationParams {
        extensions: vec![ExpirationExtension {
            deadline: deadline_idx,
            partition: partition_idx,
            sectors,
            new_expiration,
        }],
    };

    // Extending the sector changes its quality-adjusted power contribution: the fixed deal
    // weight is diluted over the longer lifetime.
    let mut new_sector = old_sector.clone();
    new_sector.expiration = new_expiration;
    let qa_delta = qa_power_for_sector(h.sector_size, &new_sector)
        - qa_power_for_sector(h.sector_size, &old_sector);
    assert!(qa_delta != BigInt::zero());

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    let claim = fil_actor_miner::ext::power::UpdateClaimedPowerParams {
        raw_byte_delta: BigInt::zero(),
        quality_adjusted_delta: qa_delta,
    };
    rt.expect_send_simple(
        fil_actors_runtime::STORAGE_POWER_ACTOR_ADDR,
        fil_actor_miner::ext::power::UPDATE_CLAIMED_POWER_METHOD,
        IpldBlock::serialize_cbor(&claim).unwrap(),
        TokenAmount::zero(),
        None,
        ExitCode::OK,
    );
    rt.call::<Actor>(
        Method::ExtendSectorExpiration as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    )
    .unwrap();
    rt.verify();

    // The sector info records the new expiration.
    let new_sector = h.get_sector(&rt, old_sector.sector_number);
    assert_eq!(new_expiration, new_sector.expiration);

    // The sector is rescheduled in the partition queue at the quantized new expiration.
    let quant = state.quant_spec_for_deadline(&rt.policy, deadline_idx);
    let (_, partition) = h.get_deadline_and_partition(&rt, deadline_idx, partition_idx);
    let queue = fil_actor_miner::ExpirationQueue::new(
        rt.store(),
        &partition.expirations_epochs,
        quant,
    )
    .unwrap();
    let quantized = quant.quantize_up(new_expiration);
    let entry = queue.amt.get(quantized as u64).unwrap().unwrap();
    assert_bitfield_equals(&entry.on_time_sectors, &[old_sector.sector_number]);
    // The old expiration entry is gone.
    assert!(queue.amt.get(quant.quantize_up(old_sector.expiration) as u64).unwrap().is_none());

    h.check_state(&rt);
}
