//! Sessions without direct output callbacks are followed through their
//! stream log.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use vtsync_relay::{BufferConfig, BufferManager, DirectOutputHub, OutputSource};

#[tokio::test]
async fn test_manager_tails_stream_log() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut log = tempfile::NamedTempFile::new().unwrap();
    writeln!(log, r#"{{"version": 2, "width": 20, "height": 4}}"#).unwrap();
    writeln!(log, r#"[0.1, "o", "hello\r\n"]"#).unwrap();
    log.flush().unwrap();

    let hub = Arc::new(DirectOutputHub::new());
    hub.add_logged_session("s1", 20, 4, log.path().to_path_buf());
    let manager =
        BufferManager::new(Arc::clone(&hub) as Arc<dyn OutputSource>, BufferConfig::default()).unwrap();

    let mut sub = manager.subscribe("s1").unwrap();
    assert_eq!(hub.callback_count("s1"), 0);

    let first = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.row_text(0).as_deref(), Some("hello"));

    writeln!(log, r#"[0.2, "r", "10x3"]"#).unwrap();
    write!(log, r#"[0.3, "o", "world"]"#).unwrap();
    log.flush().unwrap();
    // The last record has no newline yet, so only the resize is applied
    let resized = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((resized.cols, resized.rows), (10, 3));

    writeln!(log).unwrap();
    log.flush().unwrap();
    let last = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.row_text(1).as_deref(), Some("world"));

    manager.shutdown().await;
}
