use fil_actor_miner::{
    Actor, CRON_EVENT_WORKER_KEY_CHANGE, ChangeMultiaddrsParams, ChangePeerIDParams,
    ChangeWorkerAddressParams, CronEventPayload, Method, ext,
};
use fil_actors_runtime::runtime::policy_constants::WORKER_KEY_CHANGE_DELAY;
use fil_actors_runtime::test_utils::*;
use fil_actors_runtime::STORAGE_POWER_ACTOR_ADDR;
use fvm_ipld_encoding::{BytesDe, ipld_block::IpldBlock};
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;

use num_traits::Zero;

mod util;
use util::*;

const PERIOD_OFFSET: i64 = 100;

#[test]
fn change_worker_address_stages_and_commits_change() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    let new_worker = Address::new_id(999);
    let new_worker_key = new_bls_addr(7);
    rt.set_address_actor_type(new_worker, *ACCOUNT_ACTOR_CODE_ID);

    let effective_epoch = *rt.epoch.borrow() + WORKER_KEY_CHANGE_DELAY;

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.owner);
    rt.expect_validate_caller_addr(vec![h.owner]);
    // Resolve the new worker's BLS key.
    rt.expect_send_simple(
        new_worker,
        ext::account::PUBKEY_ADDRESS_METHOD,
        None,
        TokenAmount::zero(),
        IpldBlock::serialize_cbor(&new_worker_key).unwrap(),
        ExitCode::OK,
    );
    // Enroll the key-change cron.
    rt.expect_send_simple(
        STORAGE_POWER_ACTOR_ADDR,
        ext::power::ENROLL_CRON_EVENT_METHOD,
        make_cron_event_params(
            effective_epoch,
            CronEventPayload { event_type: CRON_EVENT_WORKER_KEY_CHANGE, sectors: None },
        ),
        TokenAmount::zero(),
        None,
        ExitCode::OK,
    );

    let params = ChangeWorkerAddressParams { new_worker };
    rt.call::<Actor>(
        Method::ChangeWorkerAddress as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    )
    .unwrap();
    rt.verify();

    let info = h.get_info(&rt);
    assert_eq!(h.worker, info.worker);
    let pending = info.pending_worker_key.unwrap();
    assert_eq!(new_worker, pending.new_worker);
    assert_eq!(effective_epoch, pending.effective_at);

    // The cron callback at the effective epoch promotes the key.
    rt.set_epoch(effective_epoch);
    rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
    let payload = CronEventPayload { event_type: CRON_EVENT_WORKER_KEY_CHANGE, sectors: None };
    rt.call::<Actor>(
        Method::OnDeferredCronEvent as u64,
        IpldBlock::serialize_cbor(&payload).unwrap(),
    )
    .unwrap();
    rt.verify();

    let info = h.get_info(&rt);
    assert_eq!(new_worker, info.worker);
    assert!(info.pending_worker_key.is_none());
    h.check_state(&rt);
}

#[test]
fn change_worker_address_restricted_to_owner() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    let new_worker = Address::new_id(999);
    rt.set_address_actor_type(new_worker, *ACCOUNT_ACTOR_CODE_ID);
    let new_worker_key = new_bls_addr(7);

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.owner]);
    rt.expect_send_simple(
        new_worker,
        ext::account::PUBKEY_ADDRESS_METHOD,
        None,
        TokenAmount::zero(),
        IpldBlock::serialize_cbor(&new_worker_key).unwrap(),
        ExitCode::OK,
    );
    let params = ChangeWorkerAddressParams { new_worker };
    let result = rt.call::<Actor>(
        Method::ChangeWorkerAddress as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    );
    expect_abort(ExitCode::USR_FORBIDDEN, result);
    rt.reset();
}

#[test]
fn change_peer_id_and_multiaddrs() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    h.construct_and_verify(&rt);

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    let params = ChangePeerIDParams { new_id: b"peer-1".to_vec() };
    rt.call::<Actor>(
        Method::ChangePeerID as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    )
    .unwrap();
    rt.verify();
    assert_eq!(b"peer-1".to_vec(), h.get_info(&rt).peer_id);

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(vec![h.worker]);
    let params =
        ChangeMultiaddrsParams { new_multi_addrs: vec![BytesDe(vec![1, 2, 3])] };
    rt.call::<Actor>(
        Method::ChangeMultiaddrs as u64,
        IpldBlock::serialize_cbor(&params).unwrap(),
    )
    .unwrap();
    rt.verify();
    assert_eq!(vec![BytesDe(vec![1, 2, 3])], h.get_info(&rt).multi_address);

    h.check_state(&rt);
}
