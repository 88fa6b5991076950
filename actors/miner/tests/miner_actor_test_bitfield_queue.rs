use fil_actor_miner::{BitFieldQueue, NO_QUANTIZATION, QuantSpec};
use fil_actors_runtime::Array;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::MemoryBlockstore;

fn empty_queue(store: &MemoryBlockstore, quant: QuantSpec) -> BitFieldQueue<'_, MemoryBlockstore> {
    let root = Array::<BitField, _>::new(store).flush().unwrap();
    BitFieldQueue::new(store, &root, quant).unwrap()
}

fn bf(bits: &[u64]) -> BitField {
    let mut bf = BitField::new();
    for bit in bits {
        bf.set(*bit);
    }
    bf
}

fn queue_as_map(queue: &BitFieldQueue<'_, MemoryBlockstore>) -> Vec<(u64, Vec<u64>)> {
    let mut entries = Vec::new();
    queue
        .amt
        .for_each(|epoch, bitfield| {
            entries.push((epoch, bitfield.iter().collect()));
            Ok(())
        })
        .unwrap();
    entries
}

#[test]
fn adds_values_to_empty_queue() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);

    queue.add_to_queue_values(42, [1, 2, 3, 4]).unwrap();

    assert_eq!(queue_as_map(&queue), vec![(42, vec![1, 2, 3, 4])]);
}

#[test]
fn quantizes_added_epochs() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_queue(&store, QuantSpec { unit: 5, offset: 3 });

    for epoch in [0, 2, 3, 4, 7, 8, 9] {
        queue.add_to_queue_values(epoch, [epoch as u64]).unwrap();
    }

    // While we're at it, verify that we can put queues back and load them.
    let root = queue.amt.flush().unwrap();
    let queue = BitFieldQueue::new(&store, &root, QuantSpec { unit: 5, offset: 3 }).unwrap();

    assert_eq!(
        queue_as_map(&queue),
        vec![(3, vec![0, 2, 3]), (8, vec![4, 7, 8]), (13, vec![9])]
    );
}

#[test]
fn merges_values_within_same_epoch() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);

    queue.add_to_queue_values(42, [1, 3]).unwrap();
    queue.add_to_queue_values(42, [2, 4]).unwrap();

    assert_eq!(queue_as_map(&queue), vec![(42, vec![1, 2, 3, 4])]);
}

#[test]
fn adds_many_values_grouped_by_epoch() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);

    queue
        .add_many_to_queue_values([(13, 10), (42, 1), (42, 2), (13, 11), (40, 1)])
        .unwrap();

    assert_eq!(
        queue_as_map(&queue),
        vec![(13, vec![10, 11]), (40, vec![1]), (42, vec![1, 2])]
    );
}

#[test]
fn pop_until_pops_all_up_to_and_including() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);

    queue.add_to_queue_values(10, [1, 2]).unwrap();
    queue.add_to_queue_values(20, [3]).unwrap();
    queue.add_to_queue_values(30, [4]).unwrap();

    let (popped, modified) = queue.pop_until(5).unwrap();
    assert!(!modified);
    assert!(popped.is_empty());

    let (popped, modified) = queue.pop_until(20).unwrap();
    assert!(modified);
    assert_eq!(popped, bf(&[1, 2, 3]));

    assert_eq!(queue_as_map(&queue), vec![(30, vec![4])]);
}

#[test]
fn cut_removes_values_and_empty_entries() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_queue(&store, NO_QUANTIZATION);

    queue.add_to_queue_values(10, [1, 2]).unwrap();
    queue.add_to_queue_values(20, [3]).unwrap();

    queue.cut(&bf(&[2, 3])).unwrap();

    // Cutting shifts higher bits down; value 1 remains at its epoch and the now-empty
    // entry at 20 is dropped.
    assert_eq!(queue_as_map(&queue), vec![(10, vec![1])]);
}
