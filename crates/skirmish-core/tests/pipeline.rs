//! End-to-end tests driving the full topology through its channels.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use skirmish_core::config::SkirmishConfig;
use skirmish_core::feed::{InboundRecord, OutboundRecord, ROUNDS_TOPIC};
use skirmish_core::processor::{ProcessContext, ProcessError, Processor, Record};
use skirmish_core::runner::{FeedHandles, Pipeline, PipelineFeeds, PipelineReport, RunningPipeline};
use skirmish_core::stores::ArenaReader;
use skirmish_core::topology::TopologyBuilder;
use skirmish_store::StoreError;
use skirmish_types::{ArenaId, DecisionKey, VictoryRecord};

const T: i64 = 1_700_000_000_000;

fn config(state_dir: Option<&std::path::Path>) -> SkirmishConfig {
    let mut config = SkirmishConfig::default();
    config.stores.state_dir = state_dir.map(std::path::Path::to_path_buf);
    config.pipeline.partitions = 2;
    config.pipeline.channel_capacity = 64;
    config.pipeline.batch_size = 4;
    config
}

fn round(round_id: &str, event_time: i64, players: &[(&str, i64)]) -> InboundRecord {
    let players: Vec<serde_json::Value> = players
        .iter()
        .map(|(id, metric)| serde_json::json!({"player_id": id, "metric": metric}))
        .collect();
    let payload = serde_json::json!({
        "round_id": round_id,
        "arena_id": "arena-1",
        "event_time": event_time,
        "players": players,
    });
    InboundRecord::keyed(round_id, serde_json::to_vec(&payload).unwrap())
}

async fn register_arena(reader: &ArenaReader, handles: &FeedHandles, name: &str) {
    let payload = serde_json::json!({"arena_id": "arena-1", "name": name});
    handles
        .arenas
        .send(InboundRecord::keyed("arena-1", serde_json::to_vec(&payload).unwrap()))
        .await
        .unwrap();
    let id = ArenaId::from("arena-1");
    for _ in 0..200 {
        if reader.get(&id).is_some_and(|a| a.name == name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reader.get(&id).is_some(), "arena never registered");
}

/// Close the inputs, wait for the pipeline, and collect every output.
async fn finish(
    running: RunningPipeline,
    handles: FeedHandles,
) -> (PipelineReport, Vec<OutboundRecord>) {
    let FeedHandles {
        arenas,
        rounds,
        mut results,
    } = handles;
    drop(arenas);
    drop(rounds);
    let report = running.wait().await.unwrap();
    let mut out = Vec::new();
    while let Some(record) = results.recv().await {
        out.push(record);
    }
    (report, out)
}

fn victories(out: &[OutboundRecord]) -> Vec<VictoryRecord> {
    out.iter()
        .map(|o| serde_json::from_slice(&o.payload).unwrap())
        .collect()
}

#[tokio::test]
async fn round_is_decided_and_enriched() {
    let pipeline = Pipeline::open(config(None)).unwrap();
    let query = pipeline.query_service();
    let arenas = pipeline.arena_reader();
    let (handles, feeds) = PipelineFeeds::channels(64);
    let running = pipeline.start(feeds);

    register_arena(&arenas, &handles, "Colosseum").await;
    handles
        .rounds
        .send(round("r-1", T, &[("A", 5), ("B", 3), ("C", 9), ("D", 9)]))
        .await
        .unwrap();

    let (report, out) = finish(running, handles).await;
    assert_eq!(out.len(), 1);
    let output = out.first().unwrap();
    assert_eq!(output.key.as_deref(), Some("arena-1/r-1"));
    assert_eq!(output.topic, "results");

    let victory = victories(&out).pop().unwrap();
    assert_eq!(victory.winner_id.as_str(), "C");
    assert_eq!(victory.winning_metric, 9);
    assert_eq!(victory.arena_name.as_deref(), Some("Colosseum"));
    assert_eq!(report.totals().emitted, 1);
    assert_eq!(
        query.query_latest_victory(&DecisionKey::new("arena-1", "r-1")),
        Some(victory)
    );
}

#[tokio::test]
async fn identical_replay_emits_once() {
    let pipeline = Pipeline::open(config(None)).unwrap();
    let (handles, feeds) = PipelineFeeds::channels(64);
    let running = pipeline.start(feeds);

    for _ in 0..2 {
        handles.rounds.send(round("r-1", T, &[("A", 1), ("B", 2)])).await.unwrap();
    }

    let (report, out) = finish(running, handles).await;
    assert_eq!(out.len(), 1);
    assert_eq!(report.totals().suppressed, 1);
}

#[tokio::test]
async fn poison_round_does_not_halt_partition() {
    let pipeline = Pipeline::open(config(None)).unwrap();
    let (handles, feeds) = PipelineFeeds::channels(64);
    let running = pipeline.start(feeds);

    let missing_id = serde_json::json!({
        "arena_id": "arena-1",
        "event_time": T,
        "players": [{"player_id": "A", "metric": 1}],
    });
    handles
        .rounds
        .send(InboundRecord::keyed("r-1", serde_json::to_vec(&missing_id).unwrap()))
        .await
        .unwrap();
    handles
        .rounds
        .send(InboundRecord::keyed("r-1", b"not json".to_vec()))
        .await
        .unwrap();
    handles.rounds.send(round("r-1", T, &[("A", 1)])).await.unwrap();

    let (report, out) = finish(running, handles).await;
    assert_eq!(report.totals().poison, 2);
    assert_eq!(victories(&out).len(), 1);
}

#[tokio::test]
async fn unknown_arena_is_forwarded_flagged() {
    let pipeline = Pipeline::open(config(None)).unwrap();
    let (handles, feeds) = PipelineFeeds::channels(64);
    let running = pipeline.start(feeds);

    handles.rounds.send(round("r-1", T, &[("A", 1)])).await.unwrap();

    let (report, out) = finish(running, handles).await;
    let victory = victories(&out).pop().unwrap();
    assert!(victory.arena_name.is_none());
    assert_eq!(report.totals().unresolved, 0);
}

#[tokio::test]
async fn state_survives_restart_and_cleanup_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");

    {
        let pipeline = Pipeline::open(config(Some(&state))).unwrap();
        let arenas = pipeline.arena_reader();
        let (handles, feeds) = PipelineFeeds::channels(64);
        let running = pipeline.start(feeds);
        register_arena(&arenas, &handles, "Forum").await;
        handles.rounds.send(round("r-1", T, &[("A", 4), ("B", 2)])).await.unwrap();
        let (_, out) = finish(running, handles).await;
        assert_eq!(out.len(), 1);
    }

    let mut second = config(Some(&state));
    second.stores.cleanup_on_shutdown = true;
    let pipeline = Pipeline::open(second).unwrap();
    assert_eq!(
        pipeline.arena_reader().get(&ArenaId::from("arena-1")).map(|a| a.name),
        Some("Forum".to_owned())
    );

    let query = pipeline.query_service();
    let (handles, feeds) = PipelineFeeds::channels(64);
    let running = pipeline.start(feeds);
    // Restored windows are published as soon as each partition task starts.
    let key = DecisionKey::new("arena-1", "r-1");
    for _ in 0..200 {
        if query.query_latest_victory(&key).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        query.query_latest_victory(&key).map(|v| v.winner_id.into_inner()),
        Some("A".to_owned())
    );

    // The replay is still inside the restored window.
    handles.rounds.send(round("r-1", T, &[("A", 4), ("B", 2)])).await.unwrap();
    let (report, out) = finish(running, handles).await;
    assert!(out.is_empty());
    assert_eq!(report.totals().suppressed, 1);
    assert!(!state.exists());
}

#[tokio::test]
async fn shutdown_stops_routers_and_signals() {
    let pipeline = Pipeline::open(config(None)).unwrap();
    let (handles, feeds) = PipelineFeeds::channels(64);
    let running = pipeline.start(feeds);
    let mut signal = running.shutdown_signal();

    let report = running.shutdown().await.unwrap();
    assert!(signal.wait_for(|stopping| *stopping).await.is_ok());
    // One arena task plus one task per round partition.
    assert_eq!(report.tasks.len(), 3);
    drop(handles);
}

#[tokio::test]
async fn shutdown_routes_everything_already_accepted() {
    let pipeline = Pipeline::open(config(None)).unwrap();
    let (handles, feeds) = PipelineFeeds::channels(256);
    let running = pipeline.start(feeds);

    for i in 0..200 {
        let round_id = format!("r-{i}");
        handles.rounds.send(round(&round_id, T, &[("A", 2), ("B", 1)])).await.unwrap();
    }
    let report = running.shutdown().await.unwrap();

    let FeedHandles {
        rounds, mut results, ..
    } = handles;
    assert!(rounds.is_closed());
    let mut out = Vec::new();
    while let Some(record) = results.recv().await {
        out.push(record);
    }
    assert_eq!(out.len(), 200);
    assert_eq!(report.totals().emitted, 200);
}

/// Passes records through; the third call ever made fails its store.
struct FlakyStore {
    calls: Arc<AtomicUsize>,
}

impl Processor for FlakyStore {
    fn process(&mut self, record: Record, context: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 2 {
            return Err(StoreError::Poisoned("disk went away".to_owned()).into());
        }
        context.forward(record);
        Ok(())
    }
}

#[tokio::test]
async fn storage_fault_replays_the_batch_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let factory_calls = Arc::clone(&calls);
    let topology = TopologyBuilder::new()
        .add_source("src", ROUNDS_TOPIC)
        .unwrap()
        .add_processor(
            "flaky",
            move || {
                Box::new(FlakyStore {
                    calls: Arc::clone(&factory_calls),
                })
            },
            &["src"],
        )
        .unwrap()
        .add_sink("out", "results", &["flaky"])
        .unwrap()
        .build()
        .unwrap();
    let mut config = config(None);
    config.pipeline.partitions = 1;
    let pipeline = Pipeline::with_topology(config, topology).unwrap();
    let (handles, feeds) = PipelineFeeds::channels(64);
    let running = pipeline.start(feeds);

    for i in 0..8 {
        handles
            .rounds
            .send(InboundRecord::keyed("k", format!("rec-{i}").into_bytes()))
            .await
            .unwrap();
    }

    let (report, out) = finish(running, handles).await;
    let mut payloads: Vec<String> = out
        .into_iter()
        .map(|o| String::from_utf8(o.payload).unwrap())
        .collect();
    payloads.sort();
    let expected: Vec<String> = (0..8).map(|i| format!("rec-{i}")).collect();
    assert_eq!(payloads, expected);
    assert_eq!(report.totals().restarts, 1);
    assert_eq!(report.totals().processed, 8);
    assert!(calls.load(Ordering::SeqCst) > 8);
}
