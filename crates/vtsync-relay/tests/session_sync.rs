//! End-to-end tests for the buffer manager: PTY output in, debounced
//! snapshots out.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use vtsync_core::{wire, ChangeFlags, Snapshot};
use vtsync_relay::{
    BufferConfig, BufferManager, DirectOutputHub, InjectorConfig, OutputSource, RelayError,
    StreamInjector,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(config: BufferConfig) -> (Arc<DirectOutputHub>, BufferManager) {
    init_logging();
    let hub = Arc::new(DirectOutputHub::new());
    let manager = BufferManager::new(Arc::clone(&hub) as Arc<dyn OutputSource>, config).unwrap();
    (hub, manager)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_debounced_into_one_notification() {
    let (hub, manager) = setup(BufferConfig::default());
    hub.add_session("s1", 80, 24);
    let mut sub = manager.subscribe("s1").unwrap();

    for chunk in [&b"Hello"[..], b"\r\n", b"\x1b[1mWorld", b"\x1b[0m"] {
        hub.notify_output("s1", chunk);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(sub.try_recv().is_none());

    settle().await;
    let snap = sub.try_recv().expect("one debounced snapshot");
    assert!(sub.try_recv().is_none());

    assert_eq!(snap.row_text(0).as_deref(), Some("Hello"));
    assert_eq!(snap.row_text(1).as_deref(), Some("World"));
    assert_eq!((snap.cursor_x, snap.cursor_y), (5, 1));
    assert_eq!(snap.dirty_rows, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_identical_output_is_suppressed() {
    let (hub, manager) = setup(BufferConfig::default());
    hub.add_session("s1", 20, 4);
    let mut sub = manager.subscribe("s1").unwrap();

    hub.notify_output("s1", b"abc");
    settle().await;
    let first = sub.try_recv().unwrap();

    // Cursor is already at row 1, column 4
    hub.notify_output("s1", b"\x1b[1;4H");
    settle().await;
    assert!(sub.try_recv().is_none());

    hub.notify_output("s1", b"d");
    settle().await;
    let second = sub.try_recv().unwrap();
    assert!(second.sequence_id > first.sequence_id);
    assert!(second.incremental);
    assert_eq!(second.row_text(0).as_deref(), Some("abcd"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_subscriber_does_not_stall_others() {
    let config = BufferConfig {
        subscriber_capacity: 2,
        ..BufferConfig::default()
    };
    let (hub, manager) = setup(config);
    hub.add_session("s1", 20, 8);

    let mut slow = manager.subscribe("s1").unwrap();
    let mut fast = manager.subscribe("s1").unwrap();

    let mut fast_seen = Vec::new();
    for i in 0..4 {
        hub.notify_output("s1", format!("line{}\r\n", i).as_bytes());
        settle().await;
        fast_seen.push(fast.try_recv().expect("fast subscriber keeps up").sequence_id);
    }
    assert!(fast_seen.windows(2).all(|w| w[0] < w[1]));

    let a = slow.try_recv().unwrap();
    let b = slow.try_recv().unwrap();
    assert!(slow.try_recv().is_none());
    assert_eq!(vec![a.sequence_id, b.sequence_id], fast_seen[..2].to_vec());

    // Resync after the gap
    let full = manager.get_full_snapshot("s1").unwrap();
    assert!(full.is_full());
    assert_eq!(full.row_text(3).as_deref(), Some("line3"));
}

#[tokio::test(start_paused = true)]
async fn test_callback_subscription() {
    let (hub, manager) = setup(BufferConfig::default());
    hub.add_session("s1", 20, 4);

    let seen: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = manager
        .subscribe_with_callback("s1", move |id, snap: Arc<Snapshot>| {
            sink.lock().push((id.to_string(), snap.sequence_id));
        })
        .unwrap();

    hub.notify_output("s1", b"one");
    settle().await;
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].0, "s1");

    handle.unsubscribe();
    handle.unsubscribe();
    assert_eq!(manager.subscriber_count("s1"), 0);

    hub.notify_output("s1", b"two");
    settle().await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resize_notifies() {
    let (hub, manager) = setup(BufferConfig::default());
    hub.add_session("s1", 10, 3);
    let mut sub = manager.subscribe("s1").unwrap();

    hub.notify_output("s1", b"abcdefghij");
    settle().await;
    sub.try_recv().unwrap();

    manager.resize("s1", 4, 5).unwrap();
    settle().await;
    let snap = sub.try_recv().unwrap();
    assert!(snap.change_flags.contains(ChangeFlags::SIZE));
    assert_eq!((snap.cols, snap.rows), (4, 5));
    assert_eq!(snap.row_text(0).as_deref(), Some("abcd"));
}

#[tokio::test(start_paused = true)]
async fn test_exited_session_is_torn_down() {
    let config = BufferConfig {
        liveness_interval_ms: 1000,
        ..BufferConfig::default()
    };
    let (hub, manager) = setup(config);
    let session = hub.add_session("s1", 20, 4);
    let mut sub = manager.subscribe("s1").unwrap();
    assert_eq!(hub.callback_count("s1"), 1);

    session.exit();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(sub.recv().await.is_none());
    assert_eq!(hub.callback_count("s1"), 0);
    assert!(manager.session_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_everything() {
    let (hub, manager) = setup(BufferConfig::default());
    hub.add_session("a", 20, 4);
    hub.add_session("b", 20, 4);
    let mut sub_a = manager.subscribe("a").unwrap();
    let mut sub_b = manager.subscribe("b").unwrap();

    hub.notify_output("a", b"pending");
    manager.shutdown().await;

    assert!(sub_a.recv().await.is_none());
    assert!(sub_b.recv().await.is_none());
    assert!(manager.is_shut_down());
    assert_eq!(hub.callback_count("a") + hub.callback_count("b"), 0);
    assert!(matches!(
        manager.subscribe("a"),
        Err(RelayError::ShutDown)
    ));

    // Output after shutdown goes nowhere
    hub.notify_output("a", b"late");
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_delivered_snapshot_survives_the_wire() {
    let (hub, manager) = setup(BufferConfig::default());
    hub.add_session("s1", 30, 4);
    let mut sub = manager.subscribe("s1").unwrap();

    hub.notify_output("s1", "\x1b[31mred\x1b[0m plain é\r\n\x1b[44mblue".as_bytes());
    settle().await;
    let snap = sub.try_recv().unwrap();

    let decoded = wire::decode(&wire::encode(&snap)).unwrap();
    assert_eq!((decoded.cols, decoded.rows), (30, 4));
    assert_eq!((decoded.cursor_x, decoded.cursor_y), (snap.cursor_x, snap.cursor_y));
    for (i, row) in snap.included_rows() {
        assert_eq!(decoded.row(i), Some(row));
    }
}

#[tokio::test(start_paused = true)]
async fn test_injected_titles_reach_the_buffer() {
    let (hub, manager) = setup(BufferConfig::default());
    hub.add_session("s1", 20, 4);
    manager.get_or_create_buffer("s1").unwrap();
    let injector = StreamInjector::new(hub.sink("s1"), &InjectorConfig::default());

    // Spliced in after the carriage return
    injector.queue_title("first");
    let out = injector.process_output(b"ls\r\n");
    hub.notify_output("s1", &out);
    assert_eq!(manager.get_buffer_snapshot("s1").unwrap().title, "first");

    // No safe point: written once the stream goes idle
    injector.queue_title("second");
    let out = injector.process_output(b"partial");
    assert_eq!(out, b"partial".to_vec());
    hub.notify_output("s1", &out);
    settle().await;

    let snap = manager.get_buffer_snapshot("s1").unwrap();
    assert_eq!(snap.title, "second");
    assert_eq!(snap.row_text(1).as_deref(), Some("partial"));
}
