//! End-to-end loopback tests: sender and receiver joined by in-memory
//! datagram channels, with loss, duplication, and reordering injected at the
//! packet level.

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::transport::{DatagramSink, DatagramSource, LossyChannel, MemoryChannel};
use crate::{DiodeConfig, DiodeReceiver, DiodeSender, ReceiveOutcome};

fn test_config(chunk_bytes: usize, k: usize, r: usize) -> DiodeConfig {
    DiodeConfig {
        chunk_bytes,
        k,
        r,
        rate: 0,
        idle_timeout: Duration::from_millis(100),
        ..DiodeConfig::default()
    }
}

/// Pump `input` through a lossless in-process loopback.
async fn transfer(config: DiodeConfig, input: &[u8]) -> (Vec<u8>, ReceiveOutcome) {
    let (tx, rx) = MemoryChannel::pair();

    let mut sender = DiodeSender::new(config.clone(), tx).unwrap();
    sender.push(input).await.unwrap();
    sender.finish().await.unwrap();

    let mut receiver = DiodeReceiver::new(config, rx).unwrap();
    let mut out = Vec::new();
    let outcome = receiver.run(&mut out).await.unwrap();
    drop(sender);
    (out, outcome)
}

/// Run a sender and capture its raw datagrams.
async fn capture_packets(config: DiodeConfig, input: &[u8]) -> Vec<Vec<u8>> {
    let (tx, mut rx) = MemoryChannel::pair();

    let mut sender = DiodeSender::new(config, tx).unwrap();
    sender.push(input).await.unwrap();
    sender.finish().await.unwrap();

    let mut packets = Vec::new();
    let mut buf = vec![0u8; 65536];
    while let Ok(Ok(n)) =
        tokio::time::timeout(Duration::from_millis(20), rx.recv_datagram(&mut buf)).await
    {
        packets.push(buf[..n].to_vec());
    }
    packets
}

/// Feed a prepared packet trace to a fresh receiver.
async fn deliver(config: DiodeConfig, packets: &[Vec<u8>]) -> (Vec<u8>, ReceiveOutcome) {
    let (mut tx, rx) = MemoryChannel::pair();
    for packet in packets {
        tx.send_datagram(packet).await.unwrap();
    }

    let mut receiver = DiodeReceiver::new(config, rx).unwrap();
    let mut out = Vec::new();
    let outcome = receiver.run(&mut out).await.unwrap();
    drop(tx);
    (out, outcome)
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[tokio::test]
async fn empty_stream() {
    let (out, outcome) = transfer(test_config(1024, 4, 2), &[]).await;
    assert!(out.is_empty());
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn empty_stream_wire_is_payload_free_markers() {
    let packets = capture_packets(test_config(1024, 4, 2), &[]).await;
    assert_eq!(packets.len(), 3);
    for packet in &packets {
        assert_eq!(
            packet.len(),
            crate::protocol::HEADER_BYTES + crate::protocol::LENGTH_TRAILER_BYTES
        );
        let header = crate::protocol::PacketHeader::from_bytes(packet).unwrap();
        assert!(header.is_last_block());
        assert!(!header.is_parity());
        assert_eq!(header.payload_len, 0);
        assert_eq!(crate::protocol::read_length_trailer(packet), Some(0));
    }
}

#[tokio::test]
async fn single_short_chunk() {
    let (out, outcome) = transfer(test_config(1024, 4, 2), b"hello").await;
    assert_eq!(out, b"hello");
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn one_full_block() {
    let input = pattern_bytes(4096);
    let (out, outcome) = transfer(test_config(1024, 4, 2), &input).await;
    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn multi_block_stream_with_remainder() {
    let input = pattern_bytes(3 * 4096 + 777);
    let (out, outcome) = transfer(test_config(1024, 4, 2), &input).await;
    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn default_parameters_roundtrip() {
    // Sixteen-odd blocks at the default K=64/R=32 geometry.
    let input = pattern_bytes(1024 * 1024 + 13);
    let (out, outcome) = transfer(test_config(1024, 64, 32), &input).await;
    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn any_two_losses_per_block_are_recovered() {
    let config = test_config(1024, 4, 2);
    let input = pattern_bytes(4096);
    let packets = capture_packets(config.clone(), &input).await;

    // Packets 0..6 belong to block 0 (4 data + 2 parity); the rest are the
    // terminal marker family.
    assert_eq!(packets.len(), 6 + 3);

    for a in 0..6 {
        for b in (a + 1)..6 {
            let trace: Vec<Vec<u8>> = packets
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != a && i != b)
                .map(|(_, p)| p.clone())
                .collect();
            let (out, outcome) = deliver(config.clone(), &trace).await;
            assert_eq!(out, input, "dropping packets {a} and {b}");
            assert_eq!(outcome, ReceiveOutcome::Complete);
        }
    }
}

#[tokio::test]
async fn three_losses_per_block_are_fatal() {
    let config = test_config(1024, 4, 2);
    let input = pattern_bytes(4096);
    let packets = capture_packets(config.clone(), &input).await;

    // Drop 3 of block 0's 6 packets: below k, unrecoverable.
    let trace: Vec<Vec<u8>> = packets
        .iter()
        .enumerate()
        .filter(|&(i, _)| i >= 3)
        .map(|(_, p)| p.clone())
        .collect();
    let (out, outcome) = deliver(config, &trace).await;
    assert!(out.is_empty(), "no chunks of the damaged block may leak");
    assert_eq!(outcome, ReceiveOutcome::Incomplete);
}

#[tokio::test]
async fn duplicated_trace_is_idempotent() {
    let config = test_config(1024, 4, 2);
    let input = pattern_bytes(2 * 4096 + 100);
    let packets = capture_packets(config.clone(), &input).await;

    let mut tripled = Vec::new();
    for packet in &packets {
        for _ in 0..3 {
            tripled.push(packet.clone());
        }
    }
    let (out, outcome) = deliver(config, &tripled).await;
    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn shuffled_and_duplicated_trace_reassembles() {
    let config = test_config(256, 4, 2);
    let input = pattern_bytes(3 * 4 * 256); // three full blocks
    let packets = capture_packets(config.clone(), &input).await;

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x0D10_DE);
    for seed_round in 0..4 {
        let mut trace = Vec::new();
        for packet in &packets {
            for _ in 0..3 {
                trace.push(packet.clone());
            }
        }
        trace.shuffle(&mut rng);

        let (out, outcome) = deliver(config.clone(), &trace).await;
        assert_eq!(out, input, "round {seed_round}");
        assert_eq!(outcome, ReceiveOutcome::Complete);
    }
}

#[tokio::test]
async fn periodic_loss_within_budget_is_transparent() {
    // Dropping every 7th packet loses at most one chunk per 6-packet block
    // family, well inside r = 2.
    let config = test_config(512, 4, 2);
    let input = pattern_bytes(20 * 4 * 512 + 321);

    let (tx, rx) = MemoryChannel::pair();
    let mut sender = DiodeSender::new(config.clone(), LossyChannel::with_pattern(tx, 7)).unwrap();
    sender.push(&input).await.unwrap();
    sender.finish().await.unwrap();

    let mut receiver = DiodeReceiver::new(config, rx).unwrap();
    let mut out = Vec::new();
    let outcome = receiver.run(&mut out).await.unwrap();
    drop(sender);

    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn repeat_rounds_survive_heavy_random_loss() {
    // 30% random loss against r/n = 1/3 plus a second full round of every
    // block: each 12-packet family must keep at least 4 of its 6 distinct
    // chunks, which the fixed hash pattern satisfies.
    let mut config = test_config(512, 4, 2);
    config.repeat = 2;
    let input = pattern_bytes(10 * 4 * 512);

    let (tx, rx) = MemoryChannel::pair();
    let mut sender =
        DiodeSender::new(config.clone(), LossyChannel::with_random_loss(tx, 30)).unwrap();
    sender.push(&input).await.unwrap();
    sender.finish().await.unwrap();

    let mut receiver = DiodeReceiver::new(config, rx).unwrap();
    let mut out = Vec::new();
    let outcome = receiver.run(&mut out).await.unwrap();
    drop(sender);

    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn terminal_length_survives_short_chunk_loss() {
    let config = test_config(1024, 4, 2);
    let packets = capture_packets(config.clone(), b"hello").await;
    // One terminal family per round: 4 data (1 short + 3 pads) + 2 parity.
    assert_eq!(packets.len(), 18);

    // Drop every copy of the short data chunk. The block still reaches k
    // chunks, parity rebuilds the chunk's bytes, and the length trailer on
    // the surviving packets pins the remainder.
    let trace: Vec<Vec<u8>> = packets
        .iter()
        .enumerate()
        .filter(|&(i, _)| i % 6 != 0)
        .map(|(_, p)| p.clone())
        .collect();
    let (out, outcome) = deliver(config, &trace).await;
    assert_eq!(out, b"hello");
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn losing_every_terminal_marker_times_out_incomplete() {
    let config = test_config(1024, 4, 2);
    let input = pattern_bytes(4096);
    let packets = capture_packets(config.clone(), &input).await;

    // Keep only block 0; all terminal marker copies vanish.
    let trace: Vec<Vec<u8>> = packets.into_iter().take(6).collect();
    let (out, outcome) = deliver(config, &trace).await;

    // Block 0 still drains, but the stream end was never observed.
    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Incomplete);
}

#[tokio::test]
async fn zero_parity_lossless_roundtrip() {
    let input = pattern_bytes(6 * 1024 + 5);
    let (out, outcome) = transfer(test_config(1024, 4, 0), &input).await;
    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Complete);
}

#[tokio::test]
async fn single_chunk_blocks_roundtrip() {
    let input = pattern_bytes(2500);
    let (out, outcome) = transfer(test_config(1024, 1, 1), &input).await;
    assert_eq!(out, input);
    assert_eq!(outcome, ReceiveOutcome::Complete);
}
