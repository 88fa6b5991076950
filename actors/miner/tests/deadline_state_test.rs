use fil_actor_miner::{
    Deadline, PoStPartition, QuantSpec, SectorOnChainInfo, Sectors, power_for_sectors,
};
use fil_actors_runtime::Array;
use fil_actors_runtime::test_utils::make_sealed_cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::MemoryBlockstore;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber, SectorSize};
use num_traits::Zero;

const SECTOR_SIZE: SectorSize = SectorSize::_32GiB;
const QUANT: QuantSpec = QuantSpec { unit: 4, offset: 1 };
const PARTITION_SIZE: u64 = 4;

fn test_sector(expiration: ChainEpoch, sector_number: SectorNumber) -> SectorOnChainInfo {
    SectorOnChainInfo {
        expiration,
        sector_number,
        seal_proof: RegisteredSealProof::StackedDRG32GiBV1,
        sealed_cid: make_sealed_cid(format!("commr-{}", sector_number).as_bytes()),
        deal_weight: BigInt::zero(),
        verified_deal_weight: BigInt::zero(),
        initial_pledge: TokenAmount::from_atto(1000 + sector_number),
        ..Default::default()
    }
}

// Nine sectors fill two whole partitions (size 4) and part of a third.
fn all_sectors() -> Vec<SectorOnChainInfo> {
    vec![
        test_sector(2, 1),
        test_sector(3, 2),
        test_sector(7, 3),
        test_sector(8, 4),
        test_sector(8, 5),
        test_sector(11, 6),
        test_sector(13, 7),
        test_sector(8, 8),
        test_sector(8, 9),
    ]
}

fn bf(bits: &[u64]) -> BitField {
    let mut bf = BitField::new();
    for bit in bits {
        bf.set(*bit);
    }
    bf
}

struct Harness {
    store: MemoryBlockstore,
    sectors_root: cid::Cid,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryBlockstore::new();
        let sectors_root = {
            let mut amt = Array::<SectorOnChainInfo, _>::new(&store);
            for sector in all_sectors() {
                amt.set(sector.sector_number, sector).unwrap();
            }
            amt.flush().unwrap()
        };
        Self { store, sectors_root }
    }

    fn sectors(&self) -> Sectors<'_, MemoryBlockstore> {
        Sectors::load(&self.store, &self.sectors_root).unwrap()
    }

    fn deadline_with_all_sectors(&self) -> Deadline {
        let mut deadline = Deadline::new(&self.store).unwrap();
        let power = deadline
            .add_sectors(&self.store, PARTITION_SIZE, &all_sectors(), SECTOR_SIZE, QUANT)
            .unwrap();
        assert_eq!(power, power_for_sectors(SECTOR_SIZE, &all_sectors()));
        deadline
    }
}

#[test]
fn adds_sectors_filling_partitions_in_order() {
    let h = Harness::new();
    let deadline = h.deadline_with_all_sectors();

    assert_eq!(9, deadline.live_sectors);
    assert_eq!(9, deadline.total_sectors);

    let partitions = deadline.partitions_amt(&h.store).unwrap();
    assert_eq!(3, partitions.count());

    let p0 = deadline.load_partition(&h.store, 0).unwrap();
    let p1 = deadline.load_partition(&h.store, 1).unwrap();
    let p2 = deadline.load_partition(&h.store, 2).unwrap();
    assert_eq!(p0.sectors, bf(&[1, 2, 3, 4]));
    assert_eq!(p1.sectors, bf(&[5, 6, 7, 8]));
    assert_eq!(p2.sectors, bf(&[9]));
}

#[test]
fn incremental_adds_fill_the_last_partition_first() {
    let h = Harness::new();
    let mut deadline = Deadline::new(&h.store).unwrap();

    deadline
        .add_sectors(&h.store, PARTITION_SIZE, &all_sectors()[..2], SECTOR_SIZE, QUANT)
        .unwrap();
    deadline
        .add_sectors(&h.store, PARTITION_SIZE, &all_sectors()[2..5], SECTOR_SIZE, QUANT)
        .unwrap();

    let partitions = deadline.partitions_amt(&h.store).unwrap();
    assert_eq!(2, partitions.count());
    let p0 = deadline.load_partition(&h.store, 0).unwrap();
    let p1 = deadline.load_partition(&h.store, 1).unwrap();
    assert_eq!(p0.sectors, bf(&[1, 2, 3, 4]));
    assert_eq!(p1.sectors, bf(&[5]));
}

#[test]
fn records_proven_partitions_and_skips_duplicates() {
    let h = Harness::new();
    let mut deadline = h.deadline_with_all_sectors();
    let sectors = h.sectors();

    let mut posts =
        vec![PoStPartition { index: 0, skipped: BitField::new() }];
    let result = deadline
        .record_proven_sectors(&h.store, &sectors, SECTOR_SIZE, QUANT, 100, &mut posts)
        .unwrap();
    assert_eq!(result.sectors, bf(&[1, 2, 3, 4]));
    assert!(result.ignored_sectors.is_empty());
    assert_eq!(deadline.post_submissions, bf(&[0]));

    // A repeated submission for partition 0 is skipped; partition 1 is still processed.
    let mut posts = vec![
        PoStPartition { index: 0, skipped: BitField::new() },
        PoStPartition { index: 1, skipped: BitField::new() },
    ];
    let result = deadline
        .record_proven_sectors(&h.store, &sectors, SECTOR_SIZE, QUANT, 100, &mut posts)
        .unwrap();
    assert_eq!(result.sectors, bf(&[5, 6, 7, 8]));
    assert_eq!(deadline.post_submissions, bf(&[0, 1]));
}

#[test]
fn process_deadline_end_faults_unproven_partitions() {
    let h = Harness::new();
    let mut deadline = h.deadline_with_all_sectors();
    let sectors = h.sectors();

    // Prove partition 0 only.
    let mut posts = vec![PoStPartition { index: 0, skipped: BitField::new() }];
    deadline
        .record_proven_sectors(&h.store, &sectors, SECTOR_SIZE, QUANT, 100, &mut posts)
        .unwrap();

    let fault_expiration = 100;
    let (new_faulty_power, failed_recovery_power) = deadline
        .process_deadline_end(&h.store, QUANT, fault_expiration)
        .unwrap();

    let unproven: Vec<SectorOnChainInfo> = all_sectors()[4..].to_vec();
    assert_eq!(new_faulty_power, power_for_sectors(SECTOR_SIZE, &unproven));
    assert!(failed_recovery_power.is_zero());

    // The faulty power is memoized and the PoSt submissions are reset.
    assert_eq!(deadline.faulty_power, new_faulty_power);
    assert!(deadline.post_submissions.is_empty());

    let p1 = deadline.load_partition(&h.store, 1).unwrap();
    assert_eq!(p1.faults, bf(&[5, 6, 7, 8]));
}

#[test]
fn terminate_and_pop_early_terminations() {
    let h = Harness::new();
    let mut deadline = h.deadline_with_all_sectors();
    let sectors = h.sectors();

    let mut partition_sectors = fil_actor_miner::PartitionSectorMap::default();
    partition_sectors.add(0, bf(&[1, 3])).unwrap();
    partition_sectors.add(1, bf(&[6])).unwrap();

    let power_lost = deadline
        .terminate_sectors(&h.store, &sectors, 15, &mut partition_sectors, SECTOR_SIZE, QUANT)
        .unwrap();

    let terminated: Vec<SectorOnChainInfo> =
        vec![all_sectors()[0].clone(), all_sectors()[2].clone(), all_sectors()[5].clone()];
    assert_eq!(power_lost, power_for_sectors(SECTOR_SIZE, &terminated));
    assert_eq!(6, deadline.live_sectors);
    assert_eq!(deadline.early_terminations, bf(&[0, 1]));

    let (result, has_more) = deadline.pop_early_terminations(&h.store, 10, 10).unwrap();
    assert!(!has_more);
    assert_eq!(3, result.sectors_processed);
    assert_eq!(2, result.partitions_processed);
    assert_eq!(result.sectors.get(&15).unwrap(), &bf(&[1, 3, 6]));
    assert!(deadline.early_terminations.is_empty());
}

#[test]
fn remove_partitions_rejects_faulty_partitions() {
    let h = Harness::new();
    let mut deadline = h.deadline_with_all_sectors();
    let sectors = h.sectors();

    // Fault a sector in partition 1.
    let mut partition_sectors = fil_actor_miner::PartitionSectorMap::default();
    partition_sectors.add(1, bf(&[6])).unwrap();
    deadline
        .declare_faults(&h.store, &sectors, SECTOR_SIZE, QUANT, 100, &mut partition_sectors)
        .unwrap();

    let result = deadline.remove_partitions(&h.store, &bf(&[1]), QUANT);
    assert!(result.is_err());
}
