//! End-to-end behaviors of the block state engine: pool exhaustion episodes,
//! transmission-cycle resets, NACK synthesis and ingestion, and buffer
//! window maintenance.

use norm_block::{Block, BlockBuffer, BlockPool, SegmentPool};
use norm_core::{BlockId, ObjectId};
use norm_wire::{NackMsg, RepairAdvMsg, RepairFlags, RepairForm, RepairRequest};

#[test]
fn pool_exhaustion_episodes() {
    let mut pool = SegmentPool::new(2, 64).unwrap();

    // First two gets succeed with distinct buffers.
    let mut a = pool.get().expect("first segment");
    let b = pool.get().expect("second segment");
    a.as_bytes_mut()[0] = 1;
    assert_eq!(b.as_bytes()[0], 0);

    // Third fails and opens episode one.
    assert!(pool.get().is_none());
    assert_eq!(pool.overruns(), 1);

    // Fourth fails silently inside the same episode.
    assert!(pool.get().is_none());
    assert_eq!(pool.overruns(), 1);

    // A put then get closes the episode.
    pool.put(a);
    let c = pool.get().expect("pool has a free segment again");

    // The next failure is a new episode.
    assert!(pool.get().is_none());
    assert_eq!(pool.overruns(), 2);

    pool.put(b);
    pool.put(c);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.peak_usage(), 2);
}

#[test]
fn tx_reset_idempotence() {
    let mut block = Block::new(14);
    let seg = 1024;

    assert!(block.tx_reset(10, 4, 2, seg));
    let pending: Vec<u16> = (0..14).filter(|&i| block.is_pending(i)).collect();
    assert_eq!(pending, (0..12).collect::<Vec<u16>>());

    // Identical call: nothing changes, no repair-timer reschedule.
    assert!(!block.tx_reset(10, 4, 2, seg));
    let unchanged: Vec<u16> = (0..14).filter(|&i| block.is_pending(i)).collect();
    assert_eq!(unchanged, pending);
    assert!(!block.has_repairs());
}

#[test]
fn nack_form_selection() {
    // Receiver block, size 20, num_data 16, pending {3, 7, 8, 9, 10, 15}.
    let mut block = Block::new(20);
    for id in [3u16, 7, 8, 9, 10, 15] {
        block.set_pending(id);
    }
    block.set_erasure_count(6);

    let mut nack = NackMsg::new();
    block
        .append_repair_request(&mut nack, 16, 0, ObjectId::new(1), false, 1024)
        .unwrap();

    let requests = nack.repair_requests().unwrap();
    assert_eq!(requests.len(), 3);

    assert_eq!(requests[0].form(), RepairForm::Items);
    assert_eq!(requests[0].symbol_ids(), vec![3]);

    assert_eq!(requests[1].form(), RepairForm::Ranges);
    assert_eq!(requests[1].symbol_ids(), vec![7, 8, 9, 10]);

    assert_eq!(requests[2].form(), RepairForm::Items);
    assert_eq!(requests[2].symbol_ids(), vec![15]);

    for request in &requests {
        assert!(request.flags().contains(RepairFlags::SEGMENT));
        assert!(!request.flags().contains(RepairFlags::INFO));
    }
}

#[test]
fn repair_adv_mirrors_distilled_repair_state() {
    // Same pending pattern as nack_form_selection. After is_repair_pending
    // leaves the repair mask holding the uncovered bits, the advertisement
    // compresses them with the same run rules over the whole block.
    let mut block = Block::new(20);
    for id in [3u16, 7, 8, 9, 10, 15] {
        block.set_pending(id);
    }
    block.set_erasure_count(6);
    assert!(block.is_repair_pending(16, 0));

    let mut adv = RepairAdvMsg::new();
    block
        .append_repair_adv(&mut adv, ObjectId::new(1), true, 16, 1024)
        .unwrap();

    let requests = adv.repair_requests().unwrap();
    assert_eq!(requests.len(), 3);

    assert_eq!(requests[0].form(), RepairForm::Items);
    assert_eq!(requests[0].symbol_ids(), vec![3]);

    assert_eq!(requests[1].form(), RepairForm::Ranges);
    assert_eq!(requests[1].symbol_ids(), vec![7, 8, 9, 10]);

    assert_eq!(requests[2].form(), RepairForm::Items);
    assert_eq!(requests[2].symbol_ids(), vec![15]);

    for request in &requests {
        assert!(request.flags().contains(RepairFlags::SEGMENT));
        assert!(request.flags().contains(RepairFlags::INFO));
    }
}

#[test]
fn repair_adv_is_silent_without_repair_state() {
    let block = Block::new(20);
    let mut adv = RepairAdvMsg::new();
    block
        .append_repair_adv(&mut adv, ObjectId::new(1), false, 16, 1024)
        .unwrap();
    assert_eq!(adv.request_count(), 0);
    assert!(adv.payload().is_empty());
}

#[test]
fn nack_requests_parity_when_erasures_fit() {
    // Two erasures, four parity: the NACK asks for two pending parity
    // symbols, not the missing data.
    let mut block = Block::new(20);
    block.set_pending(2);
    block.set_pending(9);
    block.set_pending(16);
    block.set_pending(17);
    block.set_pending(18);
    block.set_pending(19);
    block.set_erasure_count(2);

    let mut nack = NackMsg::new();
    block
        .append_repair_request(&mut nack, 16, 4, ObjectId::new(1), true, 1024)
        .unwrap();

    let requests = nack.repair_requests().unwrap();
    let requested: Vec<u16> = requests.iter().flat_map(RepairRequest::symbol_ids).collect();
    // Window is [num_data, num_data + erasure_count) = [16, 18).
    assert_eq!(requested, vec![16, 17]);
    assert!(requests[0].flags().contains(RepairFlags::INFO));
}

#[test]
fn block_buffer_range_maintenance() {
    let mut buffer = BlockBuffer::new(8, 8).unwrap();
    let mut pool = BlockPool::new(8, 8).unwrap();

    for id in [5u32, 7, 10, 12] {
        let mut block = pool.get().unwrap();
        block.init(BlockId::new(id), 8);
        buffer.insert(block).unwrap();
    }
    assert_eq!(buffer.range_lo(), Some(BlockId::new(5)));
    assert_eq!(buffer.range_hi(), Some(BlockId::new(12)));
    assert_eq!(buffer.range(), 8);

    // Span would become 9: rejected, block handed back.
    let mut rejected = pool.get().unwrap();
    rejected.init(BlockId::new(13), 8);
    assert!(!buffer.can_insert(BlockId::new(13)));
    let err = buffer.insert(rejected).unwrap_err();
    pool.put(err.into_block());

    pool.put(buffer.remove(BlockId::new(5)).unwrap());
    assert_eq!(buffer.range_lo(), Some(BlockId::new(7)));
    assert_eq!(buffer.range(), 6);

    pool.put(buffer.remove(BlockId::new(12)).unwrap());
    assert_eq!(buffer.range_hi(), Some(BlockId::new(10)));
    assert_eq!(buffer.range(), 4);

    let mut accepted = pool.get().unwrap();
    accepted.init(BlockId::new(13), 8);
    assert!(buffer.can_insert(BlockId::new(13)));
    buffer.insert(accepted).unwrap();
    assert_eq!(buffer.range_hi(), Some(BlockId::new(13)));
    assert_eq!(buffer.range(), 7);

    for block in buffer.drain() {
        pool.put(block);
    }
}

#[test]
fn parity_policy_spends_fresh_parity_first() {
    // Fresh sender block: parity_offset = parity_count = 0.
    let mut block = Block::new(16);
    let (num_data, num_parity) = (10, 4);

    // NACK asks for [num_data, num_data + 5] with 6 erasures; only 4 fresh
    // parity symbols exist.
    assert!(block.handle_segment_request(num_data, num_data + 5, num_data, num_parity, 6));

    let staged: Vec<u16> = (0..16).filter(|&i| block.is_repair(i)).collect();
    // Parity 10..13 plus the explicit residual 14..15.
    assert_eq!(staged, vec![10, 11, 12, 13, 14, 15]);
    assert_eq!(block.parity_count(), 4);
    assert_eq!(block.parity_offset(), 0);
}

#[test]
fn iterator_walks_gapped_window() {
    let mut buffer = BlockBuffer::new(28, 16).unwrap();
    for id in [3u32, 9, 17, 30] {
        let mut block = Block::new(8);
        block.init(BlockId::new(id), 8);
        buffer.insert(block).unwrap();
    }
    let ids: Vec<u32> = buffer.iter().map(|block| block.id().raw()).collect();
    assert_eq!(ids, vec![3, 9, 17, 30]);
    buffer.drain();
}

#[test]
fn activate_repairs_is_a_union() {
    let mut block = Block::new(14);
    block.set_pending(0);
    block.set_pending(5);
    assert!(block.handle_segment_request(5, 8, 10, 4, 0));

    let pending_before: Vec<u16> = (0..14).filter(|&i| block.is_pending(i)).collect();
    let staged: Vec<u16> = (0..14).filter(|&i| block.is_repair(i)).collect();

    assert!(block.activate_repairs());
    assert!(!block.has_repairs());

    let pending_after: Vec<u16> = (0..14).filter(|&i| block.is_pending(i)).collect();
    let mut expected: Vec<u16> = pending_before.into_iter().chain(staged).collect();
    expected.sort_unstable();
    expected.dedup();
    assert_eq!(pending_after, expected);
}

#[test]
fn nack_round_trip_recovers_pending_set() {
    // Explicit-repair case: more erasures than parity, no parity configured,
    // so the NACK lists exactly the pending data set.
    let pending = [0u16, 1, 2, 5, 6, 7, 8, 11, 13, 14, 15];
    let mut block = Block::new(16);
    for &id in &pending {
        block.set_pending(id);
    }
    block.set_erasure_count(pending.len() as u16);

    let mut nack = NackMsg::new();
    block
        .append_repair_request(&mut nack, 16, 0, ObjectId::new(3), false, 1024)
        .unwrap();

    let decoded: Vec<u16> = nack
        .repair_requests()
        .unwrap()
        .iter()
        .flat_map(RepairRequest::symbol_ids)
        .collect();
    assert_eq!(decoded, pending);
}

#[test]
fn sender_repair_cycle_from_received_nack() {
    // A sender block mid-transfer: a received NACK is staged, then
    // committed, and the re-advertised repair state matches.
    let (num_data, num_parity) = (10u16, 4u16);
    let mut segments = SegmentPool::new(16, 128).unwrap();
    let mut blocks = BlockPool::new(4, 14).unwrap();
    let mut buffer = BlockBuffer::new(8, 8).unwrap();

    let mut block = blocks.get().unwrap();
    block.init(BlockId::new(42), num_data + num_parity);
    for i in 0..num_data {
        let segment = segments.get().unwrap();
        block.set_segment(i, segment);
    }
    assert!(block.tx_reset(num_data, num_parity, 0, 64));
    // Transmission drains the pending set.
    while let Some(next) = block.first_pending() {
        block.unset_pending(next);
    }
    buffer.insert(block).unwrap();

    // Receiver NACK: data symbols 2..4 missing.
    let receiver_nack_first = 2u16;
    let receiver_nack_last = 4u16;

    let block = buffer.find_mut(BlockId::new(42)).unwrap();
    assert!(block.handle_segment_request(
        receiver_nack_first,
        receiver_nack_last,
        num_data,
        num_parity,
        0,
    ));
    assert!(block.activate_repairs());

    let pending: Vec<u16> = (0..14).filter(|&i| block.is_pending(i)).collect();
    assert_eq!(pending, vec![2, 3, 4]);

    // Teardown: segments home, block home.
    let mut block = buffer.remove(BlockId::new(42)).unwrap();
    block.empty_to_pool(&mut segments);
    blocks.put(block);
    assert_eq!(segments.in_use(), 0);
}

#[test]
fn holdoff_nack_lands_directly_in_pending() {
    let mut block = Block::new(14);
    // During holdoff there is no staging step.
    assert!(block.tx_update(3, 4, 10, 4, 0));
    assert!(block.is_pending(3));
    assert!(block.is_pending(4));
    assert!(!block.has_repairs());
    // Worst-case parity was committed for this cycle.
    assert_eq!(block.parity_count(), 4);
    assert_eq!(block.parity_offset(), 4);
}
