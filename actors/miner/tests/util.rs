#![allow(dead_code)]

use fil_actor_miner::{
    Actor, CRON_EVENT_PRE_COMMIT_EXPIRY, CRON_EVENT_PROVING_DEADLINE, ConfirmSectorProofsParams,
    CronEventPayload, Deadline, DeadlineInfo, DeclareFaultsParams, DeclareFaultsRecoveredParams,
    FaultDeclaration, Method, MinerConstructorParams as ConstructorParams, Partition,
    PoStPartition, PowerPair, RecoveryDeclaration, SectorOnChainInfo, SectorPreCommitInfo,
    SectorPreCommitOnChainInfo, State, SubmitWindowedPoStParams, TerminateSectorsParams,
    TerminationDeclaration, WithdrawBalanceParams, ext, initial_pledge_for_power,
    max_seal_duration, power_for_sectors, qa_power_for_weight, testing::check_state_invariants,
};
use fil_actors_runtime::reward::{FilterEstimate, ThisEpochRewardReturn};
use fil_actors_runtime::runtime::policy_constants::{
    PRE_COMMIT_CHALLENGE_DELAY, WPOST_CHALLENGE_WINDOW, WPOST_PROVING_PERIOD,
};
use fil_actors_runtime::runtime::{DomainSeparationTag, Runtime};
use fil_actors_runtime::test_utils::*;
use fil_actors_runtime::{
    BURNT_FUNDS_ACTOR_ADDR, INIT_ACTOR_ADDR, REWARD_ACTOR_ADDR, STORAGE_MARKET_ACTOR_ADDR,
    STORAGE_POWER_ACTOR_ADDR,
};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::to_vec;
use fvm_shared::METHOD_SEND;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    PoStProof, RegisteredPoStProof, RegisteredSealProof, SectorInfo, SectorNumber, SectorSize,
    StoragePower, WindowPoStVerifyInfo,
};
use num_traits::Zero;
use rand::prelude::*;

const RECEIVER_ID: u64 = 1000;
pub const DEFAULT_SECTOR_EXPIRATION: u64 = 190;

pub fn new_bls_addr(s: u8) -> Address {
    let seed = [s; 32];
    let mut rng: StdRng = SeedableRng::from_seed(seed);
    let mut key = [0u8; 48];
    rng.fill_bytes(&mut key);
    Address::new_bls(&key).unwrap()
}

pub fn big_balance() -> TokenAmount {
    TokenAmount::from_whole(1_000_000)
}

pub struct ActorHarness {
    pub receiver: Address,
    pub owner: Address,
    pub worker: Address,
    pub worker_key: Address,

    pub seal_proof_type: RegisteredSealProof,
    pub window_post_proof_type: RegisteredPoStProof,
    pub sector_size: SectorSize,
    pub partition_size: u64,
    pub period_offset: ChainEpoch,
    pub next_sector_no: SectorNumber,

    pub network_pledge: TokenAmount,
    pub network_raw_power: StoragePower,
    pub network_qa_power: StoragePower,
    pub baseline_power: StoragePower,

    pub epoch_reward: TokenAmount,
    pub epoch_reward_smooth: FilterEstimate,
    pub epoch_qa_power_smooth: FilterEstimate,
}

impl ActorHarness {
    pub fn new(proving_period_offset: ChainEpoch) -> ActorHarness {
        let owner = Address::new_id(100);
        let worker = Address::new_id(101);
        let worker_key = new_bls_addr(0);
        let receiver = Address::new_id(RECEIVER_ID);
        let rwd = TokenAmount::from_whole(10);
        let pwr = StoragePower::from(1i128 << 50);
        let proof_type = RegisteredSealProof::StackedDRG32GiBV1;

        ActorHarness {
            receiver,
            owner,
            worker,
            worker_key,

            seal_proof_type: proof_type,
            window_post_proof_type: proof_type.registered_window_post_proof().unwrap(),
            sector_size: proof_type.sector_size().unwrap(),
            partition_size: proof_type.window_post_partitions_sector().unwrap(),

            period_offset: proving_period_offset,
            next_sector_no: 100,

            network_pledge: rwd.clone() * BigInt::from(1000),
            network_raw_power: pwr.clone(),
            network_qa_power: pwr.clone(),
            baseline_power: pwr.clone(),

            epoch_reward: rwd.clone(),
            epoch_reward_smooth: FilterEstimate::new(rwd.atto().clone(), Zero::zero()),
            epoch_qa_power_smooth: FilterEstimate::new(pwr, Zero::zero()),
        }
    }

    pub fn set_proof_type(&mut self, proof_type: RegisteredSealProof) {
        self.seal_proof_type = proof_type;
        self.window_post_proof_type = proof_type.registered_window_post_proof().unwrap();
        self.sector_size = proof_type.sector_size().unwrap();
        self.partition_size = proof_type.window_post_partitions_sector().unwrap();
    }

    pub fn new_runtime(&self) -> MockRuntime {
        let mut rt = MockRuntime { receiver: self.receiver, ..Default::default() };

        // A fixed hash digest makes the proving period offset predictable.
        rt.hash_func = fixed_hasher(self.period_offset);

        rt.actor_code_cids.borrow_mut().insert(self.owner, *ACCOUNT_ACTOR_CODE_ID);
        rt.actor_code_cids.borrow_mut().insert(self.worker, *ACCOUNT_ACTOR_CODE_ID);

        rt
    }

    pub fn get_state(&self, rt: &MockRuntime) -> State {
        rt.get_state::<State>()
    }

    pub fn get_info(&self, rt: &MockRuntime) -> fil_actor_miner::MinerInfo {
        self.get_state(rt).get_info(rt.store()).unwrap()
    }

    pub fn construct_and_verify(&self, rt: &MockRuntime) {
        let params = ConstructorParams {
            owner: self.owner,
            worker: self.worker,
            seal_proof_type: self.seal_proof_type,
            peer_id: vec![0],
            multi_addresses: vec![],
        };

        rt.set_caller(*INIT_ACTOR_CODE_ID, INIT_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![INIT_ACTOR_ADDR]);
        // Fetch worker pubkey.
        rt.expect_send_simple(
            self.worker,
            ext::account::PUBKEY_ADDRESS_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&self.worker_key).unwrap(),
            ExitCode::OK,
        );
        // Register proving period cron.
        let mut next_proving_period_end = self.period_offset - 1;
        let current_epoch = *rt.epoch.borrow();
        while next_proving_period_end < current_epoch {
            next_proving_period_end += WPOST_PROVING_PERIOD;
        }
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ext::power::ENROLL_CRON_EVENT_METHOD,
            make_deadline_cron_event_params(next_proving_period_end),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        let result = rt
            .call::<Actor>(
                Method::Constructor as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    //
    // State access helpers
    //

    pub fn deadline(&self, rt: &MockRuntime) -> DeadlineInfo {
        let state = self.get_state(rt);
        state.deadline_info(&rt.policy, *rt.epoch.borrow())
    }

    pub fn get_precommit(
        &self,
        rt: &MockRuntime,
        sector_number: SectorNumber,
    ) -> SectorPreCommitOnChainInfo {
        let state = self.get_state(rt);
        state.get_precommitted_sector(rt.store(), sector_number).unwrap().unwrap()
    }

    pub fn get_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> SectorOnChainInfo {
        let state = self.get_state(rt);
        state.get_sector(rt.store(), sector_number).unwrap().unwrap()
    }

    pub fn get_deadline(&self, rt: &MockRuntime, deadline_idx: u64) -> Deadline {
        let state = self.get_state(rt);
        let deadlines = state.load_deadlines(rt.store()).unwrap();
        deadlines.load_deadline(rt.store(), deadline_idx).unwrap()
    }

    pub fn get_partition(&self, rt: &MockRuntime, deadline: &Deadline, idx: u64) -> Partition {
        deadline.load_partition(rt.store(), idx).unwrap()
    }

    pub fn get_deadline_and_partition(
        &self,
        rt: &MockRuntime,
        deadline_idx: u64,
        partition_idx: u64,
    ) -> (Deadline, Partition) {
        let deadline = self.get_deadline(rt, deadline_idx);
        let partition = self.get_partition(rt, &deadline, partition_idx);
        (deadline, partition)
    }

    pub fn find_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> (u64, u64) {
        let state = self.get_state(rt);
        state.find_sector(rt.store(), sector_number).unwrap()
    }

    pub fn get_locked_funds(&self, rt: &MockRuntime) -> TokenAmount {
        self.get_state(rt).locked_funds
    }

    pub fn check_state(&self, rt: &MockRuntime) {
        let state = self.get_state(rt);
        let (_, acc) = check_state_invariants(&rt.policy, &state, rt.store(), &rt.get_balance());
        acc.assert_empty();
    }

    //
    // Commitment helpers
    //

    pub fn make_pre_commit(
        &self,
        sector_number: SectorNumber,
        challenge: ChainEpoch,
        expiration: ChainEpoch,
        deal_ids: Vec<DealID>,
    ) -> SectorPreCommitInfo {
        SectorPreCommitInfo {
            seal_proof: self.seal_proof_type,
            sector_number,
            sealed_cid: make_sealed_cid(b"commr"),
            seal_rand_epoch: challenge,
            deal_ids,
            expiration,
            ..Default::default()
        }
    }

    pub fn expect_query_network_info(&self, rt: &MockRuntime) {
        let current_power = ext::power::CurrentTotalPowerReturn {
            raw_byte_power: self.network_raw_power.clone(),
            quality_adj_power: self.network_qa_power.clone(),
            pledge_collateral: self.network_pledge.clone(),
            quality_adj_power_smoothed: self.epoch_qa_power_smooth.clone(),
        };
        let current_reward = ThisEpochRewardReturn {
            this_epoch_reward: self.epoch_reward.clone(),
            this_epoch_reward_smoothed: self.epoch_reward_smooth.clone(),
            this_epoch_baseline_power: self.baseline_power.clone(),
        };
        rt.expect_send_simple(
            REWARD_ACTOR_ADDR,
            ext::reward::THIS_EPOCH_REWARD_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&current_reward).unwrap(),
            ExitCode::OK,
        );
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ext::power::CURRENT_TOTAL_POWER_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&current_power).unwrap(),
            ExitCode::OK,
        );
    }

    /// Deal weights returned by the mocked market actor for any pre-commitment.
    pub fn mock_deal_weights(&self) -> ext::market::VerifyDealsForActivationReturn {
        ext::market::VerifyDealsForActivationReturn {
            deal_weight: StoragePower::from(self.sector_size as u64 / 2),
            verified_deal_weight: StoragePower::from(self.sector_size as u64 / 2),
        }
    }

    pub fn pre_commit_sector(
        &self,
        rt: &MockRuntime,
        params: SectorPreCommitInfo,
    ) -> SectorPreCommitOnChainInfo {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(vec![self.worker]);

        self.expect_query_network_info(rt);

        let vd_params = ext::market::VerifyDealsForActivationParams {
            deal_ids: params.deal_ids.clone(),
            sector_start: *rt.epoch.borrow(),
            sector_expiry: params.expiration,
        };
        rt.expect_send_simple(
            STORAGE_MARKET_ACTOR_ADDR,
            ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
            IpldBlock::serialize_cbor(&vd_params).unwrap(),
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&self.mock_deal_weights()).unwrap(),
            ExitCode::OK,
        );

        // Pre-commit expiry cron enrollment.
        let msd = max_seal_duration(params.seal_proof).unwrap();
        let mut sectors = BitField::new();
        sectors.set(params.sector_number);
        let cron_params = make_cron_event_params(
            *rt.epoch.borrow() + msd + 1,
            CronEventPayload {
                event_type: CRON_EVENT_PRE_COMMIT_EXPIRY,
                sectors: Some(sectors),
            },
        );
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ext::power::ENROLL_CRON_EVENT_METHOD,
            cron_params,
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        let result = rt
            .call::<Actor>(
                Method::PreCommitSector as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();

        self.get_precommit(rt, params.sector_number)
    }

    pub fn make_prove_commit_params(
        &self,
        sector_number: SectorNumber,
    ) -> fil_actor_miner::ProveCommitSectorParams {
        fil_actor_miner::ProveCommitSectorParams {
            sector_number,
            proof: vec![0u8; 192].into(),
        }
    }

    pub fn prove_commit_sector(
        &self,
        rt: &MockRuntime,
        precommit: &SectorPreCommitOnChainInfo,
        params: fil_actor_miner::ProveCommitSectorParams,
    ) {
        let commd = make_piece_cid(b"commd");
        let seal_rand = [1u8; 32];
        let seal_int_rand = [2u8; 32];
        let interactive_epoch = precommit.pre_commit_epoch + PRE_COMMIT_CHALLENGE_DELAY;

        // Prepare for and receive call to ProveCommitSector
        let cdc_params = ext::market::ComputeDataCommitmentParams {
            deal_ids: precommit.info.deal_ids.clone(),
            sector_type: precommit.info.seal_proof,
        };
        rt.expect_send_simple(
            STORAGE_MARKET_ACTOR_ADDR,
            ext::market::COMPUTE_DATA_COMMITMENT_METHOD,
            IpldBlock::serialize_cbor(&cdc_params).unwrap(),
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&commd).unwrap(),
            ExitCode::OK,
        );

        let entropy = to_vec(&self.receiver).unwrap();
        rt.expect_get_randomness_from_tickets(
            DomainSeparationTag::SealRandomness,
            precommit.info.seal_rand_epoch,
            entropy.clone(),
            seal_rand,
        );
        rt.expect_get_randomness_from_beacon(
            DomainSeparationTag::InteractiveSealChallengeSeed,
            interactive_epoch,
            entropy,
            seal_int_rand,
        );

        let actor_id = RECEIVER_ID;
        let seal = fvm_shared::sector::SealVerifyInfo {
            registered_proof: precommit.info.seal_proof,
            sector_id: fvm_shared::sector::SectorID {
                miner: actor_id,
                number: precommit.info.sector_number,
            },
            deal_ids: precommit.info.deal_ids.clone(),
            randomness: Randomness(seal_rand.to_vec()),
            interactive_randomness: Randomness(seal_int_rand.to_vec()),
            proof: params.proof.clone().into(),
            sealed_cid: precommit.info.sealed_cid,
            unsealed_cid: commd,
        };
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ext::power::SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            IpldBlock::serialize_cbor(&seal).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_any();
        let result = rt
            .call::<Actor>(
                Method::ProveCommitSector as u64,
                IpldBlock::serialize_cbor(&params).unwrap(),
            )
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    /// Options for proveCommitConf behaviour.
    /// Default zero values should let everything be ok.
    pub fn confirm_sector_proofs_valid(
        &self,
        rt: &MockRuntime,
        conf: ProveCommitConfig,
        precommits: Vec<SectorPreCommitOnChainInfo>,
    ) {
        self.expect_query_network_info(rt);

        let mut valid_precommits = Vec::new();
        let mut all_sector_numbers = Vec::new();
        for precommit in &precommits {
            all_sector_numbers.push(precommit.info.sector_number);

            let vd_params = ext::market::ActivateDealsParams {
                deal_ids: precommit.info.deal_ids.clone(),
                sector_expiry: precommit.info.expiration,
            };
            let exit = conf
                .verify_deals_exit
                .get(&precommit.info.sector_number)
                .copied()
                .unwrap_or(ExitCode::OK);
            if exit == ExitCode::OK {
                valid_precommits.push(precommit.clone());
            }
            rt.expect_send_simple(
                STORAGE_MARKET_ACTOR_ADDR,
                ext::market::ACTIVATE_DEALS_METHOD,
                IpldBlock::serialize_cbor(&vd_params).unwrap(),
                TokenAmount::zero(),
                None,
                exit,
            );
        }

        // Expected pledge is the sum of initial pledges.
        if !valid_precommits.is_empty() {
            let mut expect_pledge = TokenAmount::zero();
            let mut expect_qa_power = StoragePower::zero();
            let mut expect_raw_power = StoragePower::zero();

            for precommit in &valid_precommits {
                let epoch = *rt.epoch.borrow();
                let duration = precommit.info.expiration - epoch;
                let qa_power_delta = qa_power_for_weight(
                    self.sector_size,
                    duration,
                    &precommit.deal_weight,
                    &precommit.verified_deal_weight,
                );
                expect_qa_power += &qa_power_delta;
                expect_raw_power += StoragePower::from(self.sector_size as u64);
                let mut pledge = initial_pledge_for_power(
                    &qa_power_delta,
                    &self.baseline_power,
                    &self.network_pledge,
                    &self.epoch_reward_smooth,
                    &self.epoch_qa_power_smooth,
                    &rt.circulating_supply.borrow(),
                );

                // The pledge of a replacement sector is floored at the replaced sector's.
                if precommit.info.replace_capacity {
                    let replaced = self.get_sector(rt, precommit.info.replace_sector_number);
                    pledge = std::cmp::max(pledge, replaced.initial_pledge);
                }

                expect_pledge += pledge;
            }

            let pc_params = ext::power::UpdateClaimedPowerParams {
                raw_byte_delta: expect_raw_power,
                quality_adjusted_delta: expect_qa_power,
            };
            rt.expect_send_simple(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_CLAIMED_POWER_METHOD,
                IpldBlock::serialize_cbor(&pc_params).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
            rt.expect_send_simple(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
                IpldBlock::serialize_cbor(&expect_pledge).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }

        rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
        let params = ConfirmSectorProofsParams { sectors: all_sector_numbers };
        rt.call::<Actor>(
            Method::ConfirmSectorProofsValid as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
        .unwrap();
        rt.verify();
    }

    pub fn prove_commit_sector_and_confirm(
        &self,
        rt: &MockRuntime,
        precommit: &SectorPreCommitOnChainInfo,
        params: fil_actor_miner::ProveCommitSectorParams,
        conf: ProveCommitConfig,
    ) -> SectorOnChainInfo {
        let sector_number = params.sector_number;
        self.prove_commit_sector(rt, precommit, params);
        self.confirm_sector_proofs_valid(rt, conf, vec![precommit.clone()]);

        self.get_sector(rt, sector_number)
    }

    /// Pre-commits and then proves a number of sectors.
    /// The sectors will expire at the end of lifetime_periods proving periods after now.
    /// The runtime epoch will be moved forward to the epoch of commitment proofs.
    pub fn commit_and_prove_sectors(
        &mut self,
        rt: &MockRuntime,
        n: usize,
        lifetime_periods: u64,
        deal_ids: Vec<Vec<DealID>>,
    ) -> Vec<SectorOnChainInfo> {
        let precommit_epoch = *rt.epoch.borrow();
        let deadline = self.deadline(rt);
        let expiration =
            deadline.period_end() + (lifetime_periods as i64) * WPOST_PROVING_PERIOD;

        // Precommit
        let mut precommits = Vec::with_capacity(n);
        for i in 0..n {
            let sector_no = self.next_sector_no;
            let sector_deal_ids = deal_ids.get(i).cloned().unwrap_or_default();
            let params =
                self.make_pre_commit(sector_no, precommit_epoch - 1, expiration, sector_deal_ids);
            let precommit = self.pre_commit_sector(rt, params);
            precommits.push(precommit);
            self.next_sector_no += 1;
        }

        self.advance_to_epoch_with_cron(rt, precommit_epoch + PRE_COMMIT_CHALLENGE_DELAY + 1);

        let mut info = Vec::with_capacity(n);
        for pc in precommits {
            let sector = self.prove_commit_sector_and_confirm(
                rt,
                &pc,
                self.make_prove_commit_params(pc.info.sector_number),
                ProveCommitConfig::empty(),
            );
            info.push(sector);
        }
        rt.reset();
        info
    }

    //
    // Deadline progression
    //

    pub fn advance_to_epoch_with_cron(&self, rt: &MockRuntime, epoch: ChainEpoch) {
        let mut deadline = self.deadline(rt);
        while epoch > deadline.last() {
            self.advance_deadline(rt, CronConfig::empty());
            deadline = self.deadline(rt);
        }
        rt.set_epoch(epoch);
    }

    /// Completes a deadline by moving the epoch forward to the penultimate one, calling the
    /// deadline cron handler, and then advancing to the first epoch in the new deadline.
    pub fn advance_deadline(&self, rt: &MockRuntime, mut cfg: CronConfig) -> DeadlineInfo {
        let deadline = self.deadline(rt);
        rt.set_epoch(deadline.last());
        cfg.expected_enrollment = deadline.last() + WPOST_CHALLENGE_WINDOW;
        self.on_deadline_cron(rt, cfg);
        rt.set_epoch(deadline.next_open());
        self.deadline(rt)
    }

    pub fn on_deadline_cron(&self, rt: &MockRuntime, cfg: CronConfig) {
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);

        // Preamble.
        self.expect_query_network_info(rt);

        let mut power_delta = PowerPair::zero();
        if let Some(detected) = &cfg.detected_faults_power_delta {
            power_delta += detected;
        }
        if let Some(expired) = &cfg.expired_sectors_power_delta {
            power_delta += expired;
        }

        if !power_delta.is_zero() {
            let params = ext::power::UpdateClaimedPowerParams {
                raw_byte_delta: power_delta.raw,
                quality_adjusted_delta: power_delta.qa,
            };
            rt.expect_send_simple(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_CLAIMED_POWER_METHOD,
                IpldBlock::serialize_cbor(&params).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }

        let penalty_total = &cfg.detected_faults_penalty + &cfg.continued_faults_penalty;
        if penalty_total.is_positive() {
            rt.expect_send_simple(
                BURNT_FUNDS_ACTOR_ADDR,
                METHOD_SEND,
                None,
                penalty_total,
                None,
                ExitCode::OK,
            );
        }

        // With a well-funded balance, penalties are drawn from unlocked funds and so make no
        // pledge change; only vested funds and released pledge appear here.
        let pledge_delta = &cfg.expired_sectors_pledge_delta + &cfg.vesting_pledge_delta;
        if !pledge_delta.is_zero() {
            rt.expect_send_simple(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
                IpldBlock::serialize_cbor(&pledge_delta).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }

        // Re-enrollment for next deadline.
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ext::power::ENROLL_CRON_EVENT_METHOD,
            make_deadline_cron_event_params(cfg.expected_enrollment),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
        let payload =
            CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE, sectors: None };
        rt.call::<Actor>(
            Method::OnDeferredCronEvent as u64,
            IpldBlock::serialize_cbor(&payload).unwrap(),
        )
        .unwrap();
        rt.verify();
    }

    //
    // Window PoSt
    //

    pub fn submit_window_post(
        &self,
        rt: &MockRuntime,
        deadline: &DeadlineInfo,
        partitions: Vec<PoStPartition>,
        infos: Vec<SectorOnChainInfo>,
        cfg: PoStConfig,
    ) {
        let current_epoch = *rt.epoch.borrow();
        let chain_commit_epoch = current_epoch - 1;
        let commit_rand = [4u8; 32];

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(vec![self.worker]);

        self.expect_query_network_info(rt);

        rt.expect_get_randomness_from_tickets(
            DomainSeparationTag::PoStChainCommit,
            chain_commit_epoch,
            vec![],
            commit_rand,
        );

        // Only sectors that are not skipped and not existing non-recovered faults will be verified.
        // A submission addressing only already-proven partitions is ignored without verification.
        let mut all_ignored = BitField::new();
        let mut any_new_partition = false;
        let dln = self.get_deadline(rt, deadline.index);
        for p in &partitions {
            if !dln.post_submissions.get(p.index) {
                any_new_partition = true;
                let partition = self.get_partition(rt, &dln, p.index);
                let expected_faults = &partition.faults - &partition.recoveries;
                all_ignored |= &expected_faults;
                all_ignored |= &p.skipped;
            }
        }

        // Find the first non-faulty, non-skipped sector in the PoSt to replace all faulty sectors.
        let mut maybe_good_info = None;
        for ci in &infos {
            if !all_ignored.get(ci.sector_number) {
                maybe_good_info = Some(ci.clone());
                break;
            }
        }
        if !any_new_partition {
            maybe_good_info = None;
        }

        let proofs = make_post_proofs(self.window_post_proof_type);

        // good_info is None indicates all the sectors have been skipped and PoSt verification
        // should not occur.
        if let Some(good_info) = maybe_good_info {
            let entropy = to_vec(&self.receiver).unwrap();
            let challenge_rand = [10u8; 32];
            rt.expect_get_randomness_from_beacon(
                DomainSeparationTag::WindowedPoStChallengeSeed,
                deadline.challenge,
                entropy,
                challenge_rand,
            );

            let proof_infos: Vec<SectorInfo> = infos
                .iter()
                .map(|ci| {
                    let si = if all_ignored.get(ci.sector_number) { &good_info } else { ci };
                    SectorInfo {
                        proof: si.seal_proof,
                        sector_number: si.sector_number,
                        sealed_cid: si.sealed_cid,
                    }
                })
                .collect();

            let vi = WindowPoStVerifyInfo {
                randomness: Randomness(challenge_rand.to_vec()),
                proofs: proofs.clone(),
                challenged_sectors: proof_infos,
                prover: RECEIVER_ID,
            };
            rt.expect_verify_post(vi, cfg.verification_exit);
        }

        if cfg.verification_exit == ExitCode::OK {
            if let Some(power_delta) = &cfg.expected_power_delta {
                if !power_delta.is_zero() {
                    let claim = ext::power::UpdateClaimedPowerParams {
                        raw_byte_delta: power_delta.raw.clone(),
                        quality_adjusted_delta: power_delta.qa.clone(),
                    };
                    rt.expect_send_simple(
                        STORAGE_POWER_ACTOR_ADDR,
                        ext::power::UPDATE_CLAIMED_POWER_METHOD,
                        IpldBlock::serialize_cbor(&claim).unwrap(),
                        TokenAmount::zero(),
                        None,
                        ExitCode::OK,
                    );
                }
            }
            if cfg.expected_penalty.is_positive() {
                rt.expect_send_simple(
                    BURNT_FUNDS_ACTOR_ADDR,
                    METHOD_SEND,
                    None,
                    cfg.expected_penalty.clone(),
                    None,
                    ExitCode::OK,
                );
            }
        }

        let params = SubmitWindowedPoStParams {
            deadline: deadline.index,
            partitions,
            proofs,
            chain_commit_epoch,
            chain_commit_rand: Randomness(commit_rand.to_vec()),
        };

        let result = rt.call::<Actor>(
            Method::SubmitWindowedPoSt as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        );
        if cfg.verification_exit == ExitCode::OK {
            expect_empty(result.unwrap());
        } else {
            expect_abort(ExitCode::USR_ILLEGAL_ARGUMENT, result);
        }
        rt.verify();
    }

    /// Advances the chain, submitting PoSts for the given sectors as their deadlines arrive,
    /// until all have been proven.
    pub fn advance_and_submit_posts(&self, rt: &MockRuntime, sectors: &[SectorOnChainInfo]) {
        let state = self.get_state(rt);

        let mut deadlines: std::collections::BTreeMap<u64, Vec<SectorOnChainInfo>> =
            std::collections::BTreeMap::new();
        for sector in sectors {
            let (dl_idx, _) = state.find_sector(rt.store(), sector.sector_number).unwrap();
            deadlines.entry(dl_idx).or_default().push(sector.clone());
        }

        let mut dl_info = self.deadline(rt);
        while !deadlines.is_empty() {
            if let Some(dl_sectors) = deadlines.remove(&dl_info.index) {
                let mut partitions = Vec::new();
                let mut powers = PowerPair::zero();
                let mut seen = std::collections::BTreeSet::new();
                for sector in &dl_sectors {
                    let (_, p_idx) = state.find_sector(rt.store(), sector.sector_number).unwrap();
                    if seen.insert(p_idx) {
                        partitions
                            .push(PoStPartition { index: p_idx, skipped: BitField::new() });
                        let partition =
                            self.get_partition(rt, &self.get_deadline(rt, dl_info.index), p_idx);
                        powers += &partition.recovering_power;
                    }
                }

                // All sectors in the partitions must be addressed by the proof.
                let mut all_infos = Vec::new();
                for p in &partitions {
                    let partition =
                        self.get_partition(rt, &self.get_deadline(rt, dl_info.index), p.index);
                    let partition_sectors =
                        state.load_sector_infos(rt.store(), &partition.sectors).unwrap();
                    all_infos.extend(partition_sectors);
                }

                self.submit_window_post(
                    rt,
                    &dl_info,
                    partitions,
                    all_infos,
                    PoStConfig::with_expected_power_delta(&powers),
                );
            }

            self.advance_deadline(rt, CronConfig::empty());
            dl_info = self.deadline(rt);
        }
    }

    //
    // Faults, recoveries, terminations
    //

    pub fn declare_faults(
        &self,
        rt: &MockRuntime,
        fault_sector_infos: &[SectorOnChainInfo],
    ) -> PowerPair {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(vec![self.worker]);

        let fault_power = power_for_sectors(self.sector_size, fault_sector_infos);
        let claim = ext::power::UpdateClaimedPowerParams {
            raw_byte_delta: -fault_power.raw.clone(),
            quality_adjusted_delta: -fault_power.qa.clone(),
        };
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ext::power::UPDATE_CLAIMED_POWER_METHOD,
            IpldBlock::serialize_cbor(&claim).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        // Calculate params from faulted sector infos.
        let state = self.get_state(rt);
        let params = make_fault_params_from_faulting_sectors(rt, &state, fault_sector_infos);
        rt.call::<Actor>(
            Method::DeclareFaults as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
        .unwrap();
        rt.verify();

        fault_power
    }

    pub fn declare_recoveries(
        &self,
        rt: &MockRuntime,
        deadline_idx: u64,
        partition_idx: u64,
        recovery_sectors: BitField,
    ) {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(vec![self.worker]);

        let params = DeclareFaultsRecoveredParams {
            recoveries: vec![RecoveryDeclaration {
                deadline: deadline_idx,
                partition: partition_idx,
                sectors: recovery_sectors,
            }],
        };

        rt.call::<Actor>(
            Method::DeclareFaultsRecovered as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
        .unwrap();
        rt.verify();
    }

    pub fn terminate_sectors(
        &self,
        rt: &MockRuntime,
        sectors: &BitField,
        expected_fee: TokenAmount,
    ) {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(vec![self.worker]);

        let mut deal_ids = Vec::<DealID>::new();
        let mut sector_infos = Vec::new();
        for sector in sectors.iter() {
            let sector = self.get_sector(rt, sector);
            deal_ids.extend_from_slice(&sector.deal_ids);
            sector_infos.push(sector);
        }

        self.expect_query_network_info(rt);

        let mut pledge_delta = TokenAmount::zero();
        if expected_fee.is_positive() {
            rt.expect_send_simple(
                BURNT_FUNDS_ACTOR_ADDR,
                METHOD_SEND,
                None,
                expected_fee.clone(),
                None,
                ExitCode::OK,
            );
        }
        for sector in &sector_infos {
            pledge_delta -= &sector.initial_pledge;
        }
        if !pledge_delta.is_zero() {
            rt.expect_send_simple(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
                IpldBlock::serialize_cbor(&pledge_delta).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }
        if !deal_ids.is_empty() {
            let params = ext::market::OnMinerSectorsTerminateParams {
                epoch: *rt.epoch.borrow(),
                deal_ids,
            };
            rt.expect_send_simple(
                STORAGE_MARKET_ACTOR_ADDR,
                ext::market::ON_MINER_SECTORS_TERMINATE_METHOD,
                IpldBlock::serialize_cbor(&params).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }
        {
            let sector_power = power_for_sectors(self.sector_size, &sector_infos);
            let claim = ext::power::UpdateClaimedPowerParams {
                raw_byte_delta: -sector_power.raw,
                quality_adjusted_delta: -sector_power.qa,
            };
            rt.expect_send_simple(
                STORAGE_POWER_ACTOR_ADDR,
                ext::power::UPDATE_CLAIMED_POWER_METHOD,
                IpldBlock::serialize_cbor(&claim).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }

        // Create declarations.
        let state: State = self.get_state(rt);
        let mut declarations = Vec::new();
        for id in sectors.iter() {
            let (deadline, partition) = state.find_sector(rt.store(), id).unwrap();
            let mut sectors = BitField::new();
            sectors.set(id);
            declarations.push(TerminationDeclaration { deadline, partition, sectors });
        }

        let params = TerminateSectorsParams { terminations: declarations };
        rt.call::<Actor>(
            Method::TerminateSectors as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
        .unwrap();
        rt.verify();
    }

    //
    // Funds
    //

    pub fn add_locked_fund(&self, rt: &MockRuntime, amount: &TokenAmount) {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(vec![self.worker, self.owner, REWARD_ACTOR_ADDR]);
        // Expect pledge update.
        rt.expect_send_simple(
            STORAGE_POWER_ACTOR_ADDR,
            ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
            IpldBlock::serialize_cbor(amount).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        rt.call::<Actor>(
            Method::AddLockedFund as u64,
            IpldBlock::serialize_cbor(amount).unwrap(),
        )
        .unwrap();
        rt.verify();
    }

    pub fn withdraw_funds(&self, rt: &MockRuntime, amount: &TokenAmount) {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.owner);
        rt.expect_validate_caller_addr(vec![self.owner]);

        rt.expect_send_simple(
            self.owner,
            METHOD_SEND,
            None,
            amount.clone(),
            None,
            ExitCode::OK,
        );

        let params = WithdrawBalanceParams { amount_requested: amount.clone() };
        rt.call::<Actor>(
            Method::WithdrawBalance as u64,
            IpldBlock::serialize_cbor(&params).unwrap(),
        )
        .unwrap();
        rt.verify();
    }

    //
    // Fee calculation shortcuts
    //

    pub fn declared_fault_penalty(&self, sectors: &[SectorOnChainInfo]) -> TokenAmount {
        let power = power_for_sectors(self.sector_size, sectors);
        fil_actor_miner::pledge_penalty_for_declared_fault(
            &self.epoch_reward_smooth,
            &self.epoch_qa_power_smooth,
            &power.qa,
        )
    }

    pub fn undeclared_fault_penalty(&self, sectors: &[SectorOnChainInfo]) -> TokenAmount {
        let power = power_for_sectors(self.sector_size, sectors);
        fil_actor_miner::pledge_penalty_for_undeclared_fault(
            &self.epoch_reward_smooth,
            &self.epoch_qa_power_smooth,
            &power.qa,
        )
    }

    pub fn termination_penalty(
        &self,
        termination_epoch: ChainEpoch,
        sectors: &[SectorOnChainInfo],
    ) -> TokenAmount {
        sectors.iter().fold(TokenAmount::zero(), |acc, sector| {
            let sector_power = fil_actor_miner::qa_power_for_sector(self.sector_size, sector);
            acc + fil_actor_miner::pledge_penalty_for_termination(
                &sector.expected_day_reward,
                &sector.expected_storage_pledge,
                termination_epoch - sector.activation,
                &self.epoch_reward_smooth,
                &self.epoch_qa_power_smooth,
                &sector_power,
            )
        })
    }

    pub fn power_pair_for_sectors(&self, sectors: &[SectorOnChainInfo]) -> PowerPair {
        power_for_sectors(self.sector_size, sectors)
    }
}

#[derive(Default)]
pub struct ProveCommitConfig {
    pub verify_deals_exit: std::collections::HashMap<SectorNumber, ExitCode>,
}

impl ProveCommitConfig {
    pub fn empty() -> ProveCommitConfig {
        Default::default()
    }
}

pub struct PoStConfig {
    pub expected_power_delta: Option<PowerPair>,
    pub expected_penalty: TokenAmount,
    pub verification_exit: ExitCode,
}

impl PoStConfig {
    pub fn with_expected_power_delta(power: &PowerPair) -> PoStConfig {
        PoStConfig {
            expected_power_delta: Some(power.clone()),
            expected_penalty: TokenAmount::zero(),
            verification_exit: ExitCode::OK,
        }
    }

    pub fn empty() -> PoStConfig {
        PoStConfig {
            expected_power_delta: None,
            expected_penalty: TokenAmount::zero(),
            verification_exit: ExitCode::OK,
        }
    }
}

#[derive(Default)]
pub struct CronConfig {
    pub expected_enrollment: ChainEpoch,
    pub detected_faults_power_delta: Option<PowerPair>,
    pub expired_sectors_power_delta: Option<PowerPair>,
    pub expired_sectors_pledge_delta: TokenAmount,
    pub continued_faults_penalty: TokenAmount,
    pub detected_faults_penalty: TokenAmount,
    pub vesting_pledge_delta: TokenAmount,
}

impl CronConfig {
    pub fn empty() -> CronConfig {
        Default::default()
    }
}

pub fn make_deadline_cron_event_params(epoch: ChainEpoch) -> Option<IpldBlock> {
    make_cron_event_params(
        epoch,
        CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE, sectors: None },
    )
}

pub fn make_cron_event_params(
    epoch: ChainEpoch,
    payload: CronEventPayload,
) -> Option<IpldBlock> {
    let payload = fvm_ipld_encoding::RawBytes::serialize(payload).unwrap();
    IpldBlock::serialize_cbor(&ext::power::EnrollCronEventParams {
        event_epoch: epoch,
        payload,
    })
    .unwrap()
}

pub fn make_post_proofs(proof_type: RegisteredPoStProof) -> Vec<PoStProof> {
    vec![PoStProof { post_proof: proof_type, proof_bytes: b"proof0".to_vec() }]
}

pub fn make_fault_params_from_faulting_sectors(
    rt: &MockRuntime,
    state: &State,
    fault_sector_infos: &[SectorOnChainInfo],
) -> DeclareFaultsParams {
    let mut declaration_map: std::collections::BTreeMap<(u64, u64), FaultDeclaration> =
        std::collections::BTreeMap::new();
    for sector in fault_sector_infos {
        let (dl_idx, p_idx) = state.find_sector(rt.store(), sector.sector_number).unwrap();
        let declaration = declaration_map.entry((dl_idx, p_idx)).or_insert_with(|| {
            FaultDeclaration {
                deadline: dl_idx,
                partition: p_idx,
                sectors: BitField::new(),
            }
        });
        declaration.sectors.set(sector.sector_number);
    }

    let declarations = declaration_map.into_values().collect();
    DeclareFaultsParams { faults: declarations }
}

pub fn sector_info_as_bitfield(sectors: &[SectorOnChainInfo]) -> BitField {
    let mut bf = BitField::new();
    for sector in sectors {
        bf.set(sector.sector_number);
    }
    bf
}

pub fn assert_bitfield_equals(bf: &BitField, bits: &[u64]) {
    let mut rbf = BitField::new();
    for bit in bits {
        rbf.set(*bit);
    }
    assert_eq!(bf, &rbf);
}

pub fn assert_empty_bitfield(b: &BitField) {
    assert!(b.is_empty());
}

/// Returns a fake hashing function that always arranges the first 8 bytes of the digest to be
/// the big-endian encoding of a target value.
pub fn fixed_hasher(target: ChainEpoch) -> Box<dyn Fn(&[u8]) -> [u8; 32]> {
    let hash = move |_: &[u8]| {
        let mut digest = [0u8; 32];
        digest[..8].copy_from_slice(&target.to_be_bytes());
        digest
    };
    Box::new(hash)
}
