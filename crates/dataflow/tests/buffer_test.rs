use dataflow::{
    AttachPolicy, Buffer, NodeConfig, NodeState, PoseParams, SharedPose, Sink, Source,
};
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

const PARAMS: PoseParams = PoseParams {
    sample_period_sec: 0.001,
};

/// Scenario S4: a burst of 100 samples against a 64-slot ring and a slow
/// downstream consumer. Accounting is exact: produced equals consumed
/// plus dropped, survivors arrive in emission order, and the overrun
/// count is reported.
#[test]
fn test_buffer_absorbs_burst() {
    let dir = tempdir().unwrap();
    let cfg = NodeConfig::with_root(dir.path());

    const SAMPLES: u64 = 100;
    const CAPACITY: usize = 64;

    // Upstream sink first, so the buffer's source connects immediately.
    let mut upstream =
        Sink::<SharedPose>::bind_with(&cfg, "burst_in", PARAMS, AttachPolicy::Dynamic).unwrap();

    // Downstream consumer reserves its slot before the relay starts
    // publishing, then consumes at 1 ms per sample after a late start.
    let mut tail = Source::<SharedPose>::touch_with(&cfg, "burst_out").unwrap();
    let consumer = thread::spawn(move || {
        assert_eq!(tail.connect().unwrap(), NodeState::Live);
        thread::sleep(Duration::from_millis(200));

        let mut seen = Vec::new();
        while tail.wait().unwrap() == NodeState::Live {
            thread::sleep(Duration::from_millis(1));
            seen.push(tail.to_owned().unwrap().sample_count);
            tail.post().unwrap();
        }
        seen
    });

    let buffer = Buffer::<SharedPose>::connect_with(&cfg, "burst_in", "burst_out", CAPACITY)
        .unwrap();

    // Emit the burst as fast as the relay can take it.
    let producer = thread::spawn(move || {
        for _ in 0..SAMPLES {
            upstream.wait().unwrap();
            upstream.post().unwrap();
        }
    });

    let stats = buffer.run(&AtomicBool::new(false)).unwrap();
    producer.join().expect("producer panicked");
    let seen = consumer.join().expect("consumer panicked");

    assert_eq!(stats.pushed, SAMPLES);
    assert_eq!(
        stats.pushed,
        stats.popped + stats.dropped,
        "produced = consumed + dropped"
    );
    assert!(
        stats.dropped >= SAMPLES - CAPACITY as u64 - 2,
        "a burst over a {CAPACITY}-slot ring must overrun, got {} drops",
        stats.dropped
    );
    assert_eq!(seen.len() as u64, stats.popped);

    // Survivors keep emission order and the upstream stamp, and the tail
    // of the stream is intact.
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "order not preserved");
    assert_eq!(*seen.last().unwrap(), SAMPLES);
    let tail_len = CAPACITY.min(seen.len());
    let expected_tail: Vec<u64> = (SAMPLES - tail_len as u64 + 1..=SAMPLES).collect();
    assert_eq!(
        &seen[seen.len() - tail_len..],
        &expected_tail[..],
        "the newest {tail_len} samples survive contiguously"
    );
}

/// With headroom in the ring nothing is dropped: strict FIFO end to end,
/// and upstream END drains the ring before propagating downstream.
#[test]
fn test_buffer_fifo_and_end_propagation() {
    let dir = tempdir().unwrap();
    let cfg = NodeConfig::with_root(dir.path());

    const SAMPLES: u64 = 10;

    let mut upstream =
        Sink::<SharedPose>::bind_with(&cfg, "relay_in", PARAMS, AttachPolicy::Dynamic).unwrap();

    let mut tail = Source::<SharedPose>::touch_with(&cfg, "relay_out").unwrap();
    let consumer = thread::spawn(move || {
        assert_eq!(tail.connect().unwrap(), NodeState::Live);
        let mut seen = Vec::new();
        while tail.wait().unwrap() == NodeState::Live {
            seen.push(tail.to_owned().unwrap().sample_count);
            tail.post().unwrap();
        }
        seen
    });

    let buffer =
        Buffer::<SharedPose>::connect_with(&cfg, "relay_in", "relay_out", 32).unwrap();

    let producer = thread::spawn(move || {
        for _ in 0..SAMPLES {
            upstream.wait().unwrap();
            upstream.post().unwrap();
        }
    });

    let stats = buffer.run(&AtomicBool::new(false)).unwrap();
    producer.join().expect("producer panicked");
    let seen = consumer.join().expect("consumer panicked");

    assert_eq!(stats.pushed, SAMPLES);
    assert_eq!(stats.popped, SAMPLES);
    assert_eq!(stats.dropped, 0);
    assert_eq!(seen, (1..=SAMPLES).collect::<Vec<u64>>());
}

/// The relay preserves upstream stamps: downstream consumers read the
/// producer's sample count, not the relay node's.
#[test]
fn test_buffer_preserves_upstream_stamp() {
    let dir = tempdir().unwrap();
    let cfg = NodeConfig::with_root(dir.path());

    let mut upstream =
        Sink::<SharedPose>::bind_with(&cfg, "stamp_in", PARAMS, AttachPolicy::Dynamic).unwrap();

    let mut tail = Source::<SharedPose>::touch_with(&cfg, "stamp_out").unwrap();
    let consumer = thread::spawn(move || {
        assert_eq!(tail.connect().unwrap(), NodeState::Live);
        let mut stamps = Vec::new();
        while tail.wait().unwrap() == NodeState::Live {
            let pose = tail.to_owned().unwrap();
            stamps.push((pose.sample_count, pose.timestamp_ns));
            tail.post().unwrap();
        }
        stamps
    });

    let buffer =
        Buffer::<SharedPose>::connect_with(&cfg, "stamp_in", "stamp_out", 8).unwrap();

    let producer = thread::spawn(move || {
        for _ in 0..5u64 {
            upstream.wait().unwrap();
            upstream.post().unwrap();
            thread::sleep(Duration::from_millis(2));
        }
    });

    let stats = buffer.run(&AtomicBool::new(false)).unwrap();
    producer.join().expect("producer panicked");
    let stamps = consumer.join().expect("consumer panicked");

    assert_eq!(stats.dropped, 0);
    let counts: Vec<u64> = stamps.iter().map(|(count, _)| *count).collect();
    assert_eq!(counts, (1..=5).collect::<Vec<u64>>());
    assert!(
        stamps.iter().all(|&(_, ts)| ts > 0),
        "wall-clock stamps must survive the relay"
    );
}
