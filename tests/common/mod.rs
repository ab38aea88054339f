//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use mlpipe::adapters::InMemoryTracker;
use mlpipe::core::{
    Broadcaster, ChannelSubscriber, ExecutorSettings, FailureModes, Orchestrator, PipelineStore,
    SqliteStore, StepExecutor, StepRegistry, Subscriber,
};
use mlpipe::domain::{Message, StepRecord};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<SqliteStore>,
    pub tracker: Arc<InMemoryTracker>,
    _dir: TempDir,
}

/// Orchestrator over a file-backed store, instant latency, in-memory tracker
pub fn harness() -> Harness {
    harness_with(ExecutorSettings::instant())
}

/// Same as [`harness`] with custom executor settings
pub fn harness_with(settings: ExecutorSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("pipeline.db")).unwrap());
    let tracker = Arc::new(InMemoryTracker::new());

    let executor = StepExecutor::new(
        Arc::new(StepRegistry::builtin()),
        Arc::new(Broadcaster::new()),
        tracker.clone(),
        FailureModes::default(),
        settings,
    );
    let orchestrator =
        Orchestrator::new(store.clone() as Arc<dyn PipelineStore>, Arc::new(executor)).unwrap();

    Harness {
        orchestrator,
        store,
        tracker,
        _dir: dir,
    }
}

/// Attach a channel subscriber to a channel
pub fn subscribe(orchestrator: &Orchestrator, channel: &str) -> UnboundedReceiver<Message> {
    let (subscriber, rx) = ChannelSubscriber::new();
    orchestrator
        .broadcaster()
        .subscribe(channel, Arc::new(subscriber) as Arc<dyn Subscriber>);
    rx
}

/// Everything received so far
pub fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

pub fn find_step<'a>(steps: &'a [StepRecord], name: &str) -> &'a StepRecord {
    steps
        .iter()
        .find(|s| s.step_name == name)
        .unwrap_or_else(|| panic!("no step {name}"))
}
