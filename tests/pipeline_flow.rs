//! End-to-end flow against mock HTTP: feed posts in, one paced reply out.

use mockito::{Matcher, Server};
use replybot::config::{Config, FeedConfig, FolderSourceConfig, SenderConfig, StorageConfig};
use replybot::pipeline::Pipeline;
use replybot::storage::{SqliteStorage, Storage};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn wait_matched(mock: &mockito::Mock) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !mock.matched_async().await {
        assert!(Instant::now() < deadline, "mock was never matched");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn test_config(server: &Server, folder_root: &str) -> Config {
    Config {
        feed: FeedConfig {
            url: format!("{}/feed", server.url()),
            poll_interval_s: 1,
            answered_window_hours: 24,
            request_timeout_ms: 5000,
        },
        sender: SenderConfig {
            base_url: format!("{}/chat", server.url()),
            post_url: format!("{}/chat/post", server.url()),
            display_name: "bot".to_string(),
            min_send_interval_ms: 100,
            queue_size: 16,
            request_timeout_ms: 5000,
        },
        storage: StorageConfig {
            path: ":memory:".to_string(),
        },
        folder_source: Some(FolderSourceConfig {
            command: ".random".to_string(),
            root: folder_root.to_string(),
        }),
        gallery_source: None,
    }
}

#[tokio::test]
async fn test_command_post_gets_exactly_one_reply() {
    let mut server = Server::new_async().await;
    // Post 6 carries an unregistered command and must be dropped silently
    let feed_body = r#"[
        {"count": "6", "body": ".foo bar", "date": "2024-03-10T12:00:06Z"},
        {"count": "5", "body": ".random", "date": "2024-03-10T12:00:05Z"}
    ]"#;
    let _feed = server
        .mock("GET", "/feed")
        .with_body(feed_body)
        .expect_at_least(1)
        .create_async()
        .await;
    let _boot = server
        .mock("GET", "/chat")
        .with_status(200)
        .with_header("set-cookie", "sid=abc; Path=/")
        .create_async()
        .await;
    let delivery = server
        .mock("POST", "/chat/post")
        .match_body(Matcher::Regex(">>5".to_string()))
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;

    let pool = tempfile::tempdir().unwrap();
    std::fs::write(pool.path().join("a.jpg"), b"jpegdata").unwrap();

    let config = test_config(&server, &pool.path().to_string_lossy());
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let pipeline = Pipeline::start(&config, storage.clone()).await.unwrap();

    // Wait for post 5 to be recorded answered
    let deadline = Instant::now() + Duration::from_secs(8);
    loop {
        let recent = storage
            .recent_answered_ids(Duration::from_secs(3600))
            .await
            .unwrap();
        if recent.contains("5") {
            break;
        }
        assert!(Instant::now() < deadline, "post 5 was never answered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let recent = storage
        .recent_answered_ids(Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(recent.contains("5"));
    assert!(
        !recent.contains("6"),
        "post with an unregistered command must never be answered"
    );

    // The worker's POST trails the answered flag by a moment
    wait_matched(&delivery).await;
    delivery.assert_async().await;
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_answered_posts_not_replied_again_across_polls() {
    let mut server = Server::new_async().await;
    let feed_body = r#"[
        {"count": 5, "body": ".random", "date": "2024-03-10T12:00:05Z"}
    ]"#;
    let feed = server
        .mock("GET", "/feed")
        .with_body(feed_body)
        .expect_at_least(2)
        .create_async()
        .await;
    let _boot = server
        .mock("GET", "/chat")
        .with_status(200)
        .with_header("set-cookie", "sid=abc; Path=/")
        .create_async()
        .await;
    let delivery = server
        .mock("POST", "/chat/post")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let pool = tempfile::tempdir().unwrap();
    std::fs::write(pool.path().join("a.jpg"), b"jpegdata").unwrap();

    let config = test_config(&server, &pool.path().to_string_lossy());
    // Post 5 was answered on a previous run
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.record_answered("5").await.unwrap();

    let pipeline = Pipeline::start(&config, storage.clone()).await.unwrap();

    // Let a few poll passes go by
    tokio::time::sleep(Duration::from_millis(2500)).await;
    pipeline.shutdown().await;

    feed.assert_async().await;
    delivery.assert_async().await;
}

#[tokio::test]
async fn test_pipeline_survives_feed_outage() {
    let mut server = Server::new_async().await;
    let feed = server
        .mock("GET", "/feed")
        .with_status(500)
        .expect_at_least(2)
        .create_async()
        .await;
    let _boot = server
        .mock("GET", "/chat")
        .with_status(200)
        .with_header("set-cookie", "sid=abc; Path=/")
        .create_async()
        .await;

    let pool = tempfile::tempdir().unwrap();
    std::fs::write(pool.path().join("a.jpg"), b"jpegdata").unwrap();

    let config = test_config(&server, &pool.path().to_string_lossy());
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let pipeline = Pipeline::start(&config, storage.clone()).await.unwrap();

    // Poll loop keeps running through the failures
    tokio::time::sleep(Duration::from_millis(2500)).await;
    pipeline.shutdown().await;

    feed.assert_async().await;
}
