//! Broadcaster Integration Tests
//!
//! Fan-out under concurrent publishers and subscriber churn.

use std::sync::Arc;

use mlpipe::core::{Broadcaster, ChannelSubscriber, Subscriber, CLAIMS_STREAM};
use mlpipe::domain::{LogLevel, Message};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_keep_per_channel_order() {
    let broadcaster = Arc::new(Broadcaster::new());
    let mut receivers = Vec::new();
    for channel in ["run_a", "run_b", "run_c"] {
        let (subscriber, rx) = ChannelSubscriber::new();
        broadcaster.subscribe(channel, Arc::new(subscriber) as Arc<dyn Subscriber>);
        receivers.push(rx);
    }

    let mut tasks = Vec::new();
    for channel in ["run_a", "run_b", "run_c"] {
        let broadcaster = broadcaster.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..100 {
                broadcaster
                    .send_log(channel, LogLevel::Info, format!("{channel}-{i}"))
                    .await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for (rx, channel) in receivers.iter_mut().zip(["run_a", "run_b", "run_c"]) {
        let mut lines = Vec::new();
        while let Ok(Message::Log { message, .. }) = rx.try_recv() {
            lines.push(message);
        }
        let expected: Vec<String> = (0..100).map(|i| format!("{channel}-{i}")).collect();
        assert_eq!(lines, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscriber_churn_during_publish() {
    let broadcaster = Arc::new(Broadcaster::new());
    let (steady, mut steady_rx) = ChannelSubscriber::new();
    broadcaster.subscribe("run_a", Arc::new(steady) as Arc<dyn Subscriber>);

    let churn = {
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let (subscriber, _rx) = ChannelSubscriber::new();
                let id = subscriber.id();
                broadcaster.subscribe("run_a", Arc::new(subscriber) as Arc<dyn Subscriber>);
                tokio::task::yield_now().await;
                broadcaster.unsubscribe("run_a", id);
            }
        })
    };

    for i in 0..200 {
        broadcaster
            .send_log("run_a", LogLevel::Info, i.to_string())
            .await;
    }
    churn.await.unwrap();

    let mut received = 0;
    while steady_rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 200);
    assert_eq!(broadcaster.subscriber_count("run_a"), 1);
}

#[tokio::test]
async fn test_one_subscriber_on_run_and_stream() {
    let broadcaster = Broadcaster::new();
    let (subscriber, mut rx) = ChannelSubscriber::new();
    let subscriber: Arc<dyn Subscriber> = Arc::new(subscriber);
    broadcaster.subscribe("run_a", subscriber.clone());
    broadcaster.subscribe(CLAIMS_STREAM, subscriber.clone());

    broadcaster
        .send_log("run_a", LogLevel::Warning, "slow batch")
        .await;
    broadcaster.send_claim(json!({"claim_id": "C-1"})).await;
    broadcaster.send_log("run_b", LogLevel::Info, "elsewhere").await;

    let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|m| m.kind())
        .collect();
    assert_eq!(kinds, vec!["log", "claim"]);

    broadcaster.unsubscribe("run_a", subscriber.id());
    assert_eq!(broadcaster.subscriber_count("run_a"), 0);
    assert_eq!(broadcaster.subscriber_count(CLAIMS_STREAM), 1);
}
