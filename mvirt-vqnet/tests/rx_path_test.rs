//! Receive path tests: guest-posted chains through the dispatcher

mod harness;

use harness::{QUEUE_SIZE, TestRig, config};
use mvirt_vqnet::BridgeError;

#[test]
fn test_posted_64_byte_segment_delivered_once() {
    let mut rig = TestRig::new(&config(8));
    let frame: Vec<u8> = (0..64u8).collect();

    // The guest carves the segment from a 1500-byte buffer and posts it with
    // the frame's length; the delivered size comes from the descriptor

    let head = rig.guest.post_rx(&[&frame]);
    let used_before = rig.guest.rx_used_idx();

    let summary = rig.device.dispatch().expect("dispatch");
    assert_eq!(summary.rx_chains, 1);

    assert_eq!(rig.delivered().len(), 1);
    assert_eq!(rig.delivered()[0].len(), 64);
    assert_eq!(rig.delivered()[0], frame);

    assert_eq!(rig.guest.rx_used_idx(), used_before.wrapping_add(1));
    assert_eq!(rig.guest.rx_doorbells(), 1);
    assert_eq!(rig.guest.take_rx_used(), vec![(head, 0)]);
}

#[test]
fn test_three_segment_chain_gathered_in_order() {
    let mut rig = TestRig::new(&config(8));

    rig.guest.post_rx(&[&[1; 10], &[2; 20], &[3; 30]]);
    rig.device.dispatch().expect("dispatch");

    assert_eq!(
        rig.delivered(),
        &[vec![1u8; 10], vec![2u8; 20], vec![3u8; 30]][..]
    );
    // One chain, one used entry
    assert_eq!(rig.guest.rx_used_idx(), 1);
    assert_eq!(rig.guest.take_rx_used().len(), 1);
    assert_eq!(rig.guest.pool.available(), harness::GUEST_CHUNKS as usize);
}

#[test]
fn test_stale_wake_is_noop() {
    let mut rig = TestRig::new(&config(8));
    let stats = rig.device.transmit().pool_stats().expect("stats");

    for _ in 0..3 {
        let summary = rig.device.dispatch().expect("dispatch");
        assert!(summary.is_idle());
    }

    assert!(rig.delivered().is_empty());
    assert_eq!(rig.guest.rx_used_idx(), 0);
    assert_eq!(rig.guest.rx_doorbells(), 0);
    assert_eq!(rig.device.transmit().pool_stats().expect("stats"), stats);
    assert!(!rig.device.is_halted());
}

#[test]
fn test_rejected_frame_still_returned() {
    let mut rig = TestRig::new(&config(8));
    rig.device.facade_mut().reject_next = 1;

    let first = rig.guest.post_rx(&[b"dropped"]);
    let second = rig.guest.post_rx(&[b"kept"]);
    let summary = rig.device.dispatch().expect("dispatch");

    assert_eq!(summary.rx_chains, 2);
    assert_eq!(rig.delivered(), &[b"kept".to_vec()][..]);
    assert_eq!(rig.guest.take_rx_used(), vec![(first, 0), (second, 0)]);
    assert!(!rig.device.is_halted());
}

#[test]
fn test_ring_wraps_over_many_rounds() {
    let mut rig = TestRig::new(&config(8));
    let rounds = 3;

    for round in 0..rounds {
        for i in 0..QUEUE_SIZE {
            let frame = [(round * 100 + i as usize) as u8; 60];
            rig.guest.post_rx(&[&frame]);
        }
        let summary = rig.device.dispatch().expect("dispatch");
        assert_eq!(summary.rx_chains, QUEUE_SIZE as usize);
        assert_eq!(rig.guest.take_rx_used().len(), QUEUE_SIZE as usize);
    }

    assert_eq!(rig.delivered().len(), rounds * QUEUE_SIZE as usize);
    assert_eq!(rig.guest.rx_used_idx(), (rounds * QUEUE_SIZE as usize) as u16);
    assert_eq!(rig.guest.pool.available(), harness::GUEST_CHUNKS as usize);
}

#[test]
fn test_corrupt_chain_halts_device() {
    use vm_memory::{Bytes, GuestAddress};

    let mut rig = TestRig::new(&config(8));
    rig.guest.post_rx(&[b"a", b"b"]);

    // Make the chain point back at its own head
    let next = GuestAddress(harness::config(8).rx_layout().desc_table.0 + 14);
    rig.guest
        .memory()
        .write_obj(0u16.to_le(), next)
        .expect("corrupt");

    let err = rig.device.dispatch().expect_err("loop detected");
    assert!(err.is_fatal());
    assert!(rig.device.is_halted());
    // The chain was still handed back before halting
    assert_eq!(rig.guest.rx_used_idx(), 1);

    rig.guest.post_rx(&[b"late"]);
    assert!(matches!(rig.device.dispatch(), Err(BridgeError::Halted)));

    // The device model cannot publish on the transmit ring either
    let tx = rig.device.transmit().clone();
    assert!(matches!(tx.send(&[7; 100]), Err(BridgeError::Halted)));
    assert_eq!(rig.guest.tx_doorbells(), 0);
    assert!(rig.guest.consume_tx().is_empty());
}
