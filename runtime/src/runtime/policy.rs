// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::{RegisteredPoStProof, RegisteredSealProof};
use serde::{Deserialize, Serialize};

/// A set of supported proof types.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProofSet<P: PartialEq>(Vec<P>);

impl<P: PartialEq> ProofSet<P> {
    pub fn contains(&self, proof: &P) -> bool {
        self.0.contains(proof)
    }

    pub fn insert(&mut self, proof: P) {
        if !self.0.contains(&proof) {
            self.0.push(proof);
        }
    }
}

impl<P: PartialEq> From<Vec<P>> for ProofSet<P> {
    fn from(proofs: Vec<P>) -> Self {
        ProofSet(proofs)
    }
}

/// Config trait which handles different network configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Epochs after which chain state is final with overwhelming probability
    /// (hence the fork tolerance of state machines relying on it).
    pub chain_finality: ChainEpoch,

    /// The period over which all a miner's active sectors will be challenged.
    pub wpost_proving_period: ChainEpoch,
    /// The duration of a deadline's challenge window, the period before a deadline when the
    /// challenge is available.
    pub wpost_challenge_window: ChainEpoch,
    /// The number of non-overlapping PoSt deadlines in each proving period.
    pub wpost_period_deadlines: u64,
    /// Lookback from the deadline's challenge window opening from which to sample chain randomness
    /// for the Window PoSt challenge seed.
    pub wpost_challenge_lookback: ChainEpoch,
    /// Maximum age of a Window PoSt chain commitment epoch.
    pub wpost_max_chain_commit_age: ChainEpoch,
    /// Minimum period before a deadline's challenge window opens that a fault must be declared
    /// for that deadline.
    pub fault_declaration_cutoff: ChainEpoch,
    /// The maximum age of a fault before the faulty sector is terminated.
    pub fault_max_age: ChainEpoch,
    /// Staging period for a miner worker key change.
    pub worker_key_change_delay: ChainEpoch,
    /// Minimum number of epochs past the current epoch a sector may be set to expire.
    pub min_sector_expiration: ChainEpoch,
    /// Maximum number of epochs past the current epoch a sector may be set to expire.
    pub max_sector_expiration_extension: ChainEpoch,
    /// Number of epochs between publishing the precommit and when the challenge for interactive
    /// PoRep is drawn.
    pub pre_commit_challenge_delay: ChainEpoch,
    /// Maximum delay between challenge and pre-commitment.
    pub max_pre_commit_randomness_lookback: ChainEpoch,

    /// The maximum number of sector infos that may be required to be loaded in a single invocation.
    pub addressed_sectors_max: u64,
    /// The maximum number of partitions that may be required to be loaded in a single invocation.
    pub addressed_partitions_max: u64,
    /// The maximum number of sector numbers addressable in a single invocation
    /// (which implies also the max infos that may be loaded at once).
    pub sectors_max: usize,

    /// Maximum size of a single peer ID (in bytes).
    pub max_peer_id_length: usize,
    /// Maximum size of aggregate multiaddrs (in bytes).
    pub max_multiaddr_data: usize,

    /// Ratio of sector size to maximum number of deals per sector.
    /// The maximum number of deals is the sector size divided by this number
    /// or 256, whichever is larger.
    pub deal_limit_denominator: u64,

    /// Allowed pre-commit proof types for new miners.
    pub valid_pre_commit_proof_type: ProofSet<RegisteredSealProof>,
    /// Allowed Window PoSt proof types for new miners.
    pub valid_post_proof_type: ProofSet<RegisteredPoStProof>,
}

impl Default for Policy {
    fn default() -> Policy {
        use policy_constants::*;
        Policy {
            chain_finality: CHAIN_FINALITY,
            wpost_proving_period: WPOST_PROVING_PERIOD,
            wpost_challenge_window: WPOST_CHALLENGE_WINDOW,
            wpost_period_deadlines: WPOST_PERIOD_DEADLINES,
            wpost_challenge_lookback: WPOST_CHALLENGE_LOOKBACK,
            wpost_max_chain_commit_age: WPOST_CHALLENGE_WINDOW,
            fault_declaration_cutoff: FAULT_DECLARATION_CUTOFF,
            fault_max_age: FAULT_MAX_AGE,
            worker_key_change_delay: WORKER_KEY_CHANGE_DELAY,
            min_sector_expiration: MIN_SECTOR_EXPIRATION,
            max_sector_expiration_extension: MAX_SECTOR_EXPIRATION_EXTENSION,
            pre_commit_challenge_delay: PRE_COMMIT_CHALLENGE_DELAY,
            max_pre_commit_randomness_lookback: MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK,
            addressed_sectors_max: ADDRESSED_SECTORS_MAX,
            addressed_partitions_max: ADDRESSED_PARTITIONS_MAX,
            sectors_max: SECTORS_MAX,
            max_peer_id_length: MAX_PEER_ID_LENGTH,
            max_multiaddr_data: MAX_MULTIADDR_DATA,
            deal_limit_denominator: DEAL_LIMIT_DENOMINATOR,
            valid_pre_commit_proof_type: ProofSet::from(vec![
                RegisteredSealProof::StackedDRG2KiBV1,
                RegisteredSealProof::StackedDRG8MiBV1,
                RegisteredSealProof::StackedDRG512MiBV1,
                RegisteredSealProof::StackedDRG32GiBV1,
                RegisteredSealProof::StackedDRG64GiBV1,
            ]),
            valid_post_proof_type: ProofSet::from(vec![
                RegisteredPoStProof::StackedDRGWindow2KiBV1,
                RegisteredPoStProof::StackedDRGWindow8MiBV1,
                RegisteredPoStProof::StackedDRGWindow512MiBV1,
                RegisteredPoStProof::StackedDRGWindow32GiBV1,
                RegisteredPoStProof::StackedDRGWindow64GiBV1,
            ]),
        }
    }
}

pub mod policy_constants {
    use fvm_shared::clock::ChainEpoch;

    use crate::builtin::*;

    pub const CHAIN_FINALITY: ChainEpoch = 900;

    pub const WPOST_PROVING_PERIOD: ChainEpoch = EPOCHS_IN_DAY;
    pub const WPOST_CHALLENGE_WINDOW: ChainEpoch = 30 * 60 / EPOCH_DURATION_SECONDS;
    pub const WPOST_PERIOD_DEADLINES: u64 = 48;
    pub const WPOST_CHALLENGE_LOOKBACK: ChainEpoch = 20;

    pub const FAULT_DECLARATION_CUTOFF: ChainEpoch = WPOST_CHALLENGE_LOOKBACK + 50;
    pub const FAULT_MAX_AGE: ChainEpoch = WPOST_PROVING_PERIOD * 14;

    pub const WORKER_KEY_CHANGE_DELAY: ChainEpoch = CHAIN_FINALITY;

    pub const MIN_SECTOR_EXPIRATION: ChainEpoch = 180 * EPOCHS_IN_DAY;
    pub const MAX_SECTOR_EXPIRATION_EXTENSION: ChainEpoch = 540 * EPOCHS_IN_DAY;

    pub const PRE_COMMIT_CHALLENGE_DELAY: ChainEpoch = 150;
    pub const MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK: ChainEpoch = EPOCHS_IN_DAY + CHAIN_FINALITY;

    pub const ADDRESSED_SECTORS_MAX: u64 = 10_000;
    pub const ADDRESSED_PARTITIONS_MAX: u64 = 200;
    pub const SECTORS_MAX: usize = 32 << 20;

    pub const MAX_PEER_ID_LENGTH: usize = 128;
    pub const MAX_MULTIADDR_DATA: usize = 1024;

    pub const DEAL_LIMIT_DENOMINATOR: u64 = 134217728;

    /// The maximum assignable sector number.
    /// Raising this would require modifying our AMT implementation.
    pub const MAX_SECTOR_NUMBER: u64 = i64::MAX as u64;
}

/// Accessor for the policy in effect for the current invocation.
pub trait RuntimePolicy {
    fn policy(&self) -> &Policy;
}
