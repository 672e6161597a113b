//! Ingestion pump and hub behavior against scripted upstream streams.

use nodewatch_core::{FilterSpec, LogLevel, SubscribeError};
use nodewatch_logs::{
    BackoffConfig, FanoutConfig, FanoutEngine, IngestionPump, JsonLineDecoder, LogConfig,
    LogEvent, LogHub, PumpState, RecordDecoder, RingBuffer, RosoutDecoder, Subscription,
};
use nodewatch_test_utils::fixtures::{json_lines, record, rosout_block, rosout_lines};
use nodewatch_test_utils::{ScriptedConnection, ScriptedLineSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(60);

async fn next_event(sub: &mut Subscription) -> LogEvent {
    tokio::time::timeout(WAIT, sub.next())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
}

fn message(event: &LogEvent) -> &str {
    match event {
        LogEvent::Record(entry) => &entry.record.message,
        LogEvent::Gap(_) => "<gap>",
    }
}

struct Harness {
    fanout: Arc<FanoutEngine>,
    source: Arc<ScriptedLineSource>,
    shutdown_tx: watch::Sender<bool>,
    pump: nodewatch_logs::PumpHandle,
    task: tokio::task::JoinHandle<()>,
}

fn start_pump(connections: Vec<ScriptedConnection>) -> Harness {
    let fanout = FanoutEngine::new(Arc::new(RingBuffer::new(100)), FanoutConfig::default());
    let source = Arc::new(ScriptedLineSource::new(connections));
    let pump = IngestionPump::new(
        "/rosout",
        source.clone(),
        Box::new(RosoutDecoder::new()),
        Arc::clone(&fanout),
        BackoffConfig::default()
            .with_initial(Duration::from_millis(100))
            .with_max(Duration::from_millis(400))
            .with_jitter(Duration::ZERO),
    );
    let handle = pump.handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(pump.run(shutdown_rx));
    Harness {
        fanout,
        source,
        shutdown_tx,
        pump: handle,
        task,
    }
}

#[tokio::test(start_paused = true)]
async fn pump_decodes_and_publishes_in_order() {
    let (live, feed) = ScriptedConnection::live();
    let harness = start_pump(vec![live]);
    let mut sub = harness.fanout.subscribe(&FilterSpec::match_all()).unwrap();

    feed.send_all(rosout_lines(&[("sensing.lidar", "one"), ("planning", "two")]));
    feed.send_all(rosout_block(1_714_564_900, 40, "control", "three"));

    let first = next_event(&mut sub).await;
    let second = next_event(&mut sub).await;
    let third = next_event(&mut sub).await;
    assert_eq!(
        [message(&first), message(&second), message(&third)],
        ["one", "two", "three"]
    );

    let entry = third.as_record().unwrap();
    assert_eq!(entry.seq, 3);
    assert_eq!(entry.record.level, LogLevel::Error);
    assert_eq!(entry.record.source, "/control");
    assert_eq!(first.as_record().unwrap().record.source, "/sensing/lidar");

    assert_eq!(harness.fanout.ring().len(), 3);
    assert_eq!(harness.pump.state(), PumpState::Streaming);
    assert_eq!(harness.pump.stats().records, 3);
}

#[tokio::test(start_paused = true)]
async fn reconnect_emits_one_gap_per_episode() {
    let (live, feed) = ScriptedConnection::live();
    let harness = start_pump(vec![
        ScriptedConnection::LinesThenError(
            rosout_lines(&[("n", "A"), ("n", "B")]),
            "broken pipe".to_string(),
        ),
        ScriptedConnection::Refused("container restarting".to_string()),
        ScriptedConnection::Refused("container restarting".to_string()),
        live,
    ]);
    let mut sub = harness.fanout.subscribe(&FilterSpec::match_all()).unwrap();
    feed.send_all(rosout_lines(&[("n", "C")]));

    let mut observed = Vec::new();
    for _ in 0..4 {
        observed.push(next_event(&mut sub).await);
    }
    let messages: Vec<_> = observed.iter().map(message).collect();
    assert_eq!(messages, vec!["A", "B", "<gap>", "C"]);

    match &observed[2] {
        LogEvent::Gap(notice) => {
            assert_eq!(notice.source_id, "/rosout");
            assert_eq!(notice.last_seq, 2);
            assert!(notice.reason.contains("broken pipe"));
        }
        other => panic!("expected gap, got {:?}", other),
    }

    let stats = harness.pump.stats();
    assert_eq!(stats.gaps, 1);
    assert_eq!(stats.connect_attempts, 4);
    assert_eq!(stats.state, PumpState::Streaming);
    assert_eq!(harness.source.opens(), 4);

    // Records from before the disconnect are not replayed.
    let seqs: Vec<_> = harness
        .fanout
        .ring()
        .snapshot(10)
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(sub.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn initial_connect_failures_emit_no_gap() {
    let (live, feed) = ScriptedConnection::live();
    let harness = start_pump(vec![
        ScriptedConnection::Refused("no such container".to_string()),
        live,
    ]);
    let mut sub = harness.fanout.subscribe(&FilterSpec::match_all()).unwrap();
    feed.send_all(rosout_lines(&[("n", "first")]));

    let event = next_event(&mut sub).await;
    assert_eq!(message(&event), "first");
    assert_eq!(harness.pump.stats().gaps, 0);
}

#[tokio::test(start_paused = true)]
async fn silent_reconnects_stay_in_one_episode() {
    let (live, feed) = ScriptedConnection::live();
    let harness = start_pump(vec![
        ScriptedConnection::LinesThenError(rosout_lines(&[("n", "A")]), "exit 1".to_string()),
        ScriptedConnection::lines(Vec::<String>::new()),
        ScriptedConnection::lines(Vec::<String>::new()),
        ScriptedConnection::lines(Vec::<String>::new()),
        live,
    ]);
    let mut sub = harness.fanout.subscribe(&FilterSpec::match_all()).unwrap();

    assert_eq!(message(&next_event(&mut sub).await), "A");
    assert!(next_event(&mut sub).await.is_gap());

    let started = tokio::time::Instant::now();
    tokio::time::timeout(WAIT, async {
        while harness.source.opens() < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    // 100ms after the lost stream, then 200, 400 and 400 after the silent ones.
    assert!(started.elapsed() >= Duration::from_millis(1100));
    assert_eq!(harness.pump.state(), PumpState::Connecting);

    feed.send_all(rosout_lines(&[("n", "C")]));
    assert_eq!(message(&next_event(&mut sub).await), "C");
    assert!(sub.try_next().is_none());

    let stats = harness.pump.stats();
    assert_eq!(stats.gaps, 1);
    assert_eq!(stats.connect_attempts, 5);
    assert_eq!(stats.state, PumpState::Streaming);
}

#[tokio::test(start_paused = true)]
async fn partial_block_is_discarded_on_reconnect() {
    let mut cut_off = rosout_block(1_000, 40, "n", "lost");
    cut_off.truncate(3);
    let mut first = rosout_lines(&[("n", "A")]);
    first.extend(cut_off);

    let (live, feed) = ScriptedConnection::live();
    let harness = start_pump(vec![
        ScriptedConnection::LinesThenError(first, "eof".to_string()),
        live,
    ]);
    let mut sub = harness.fanout.subscribe(&FilterSpec::match_all()).unwrap();
    feed.send_all(rosout_block(2_000, 20, "n", "B"));

    assert_eq!(message(&next_event(&mut sub).await), "A");
    assert!(next_event(&mut sub).await.is_gap());
    let event = next_event(&mut sub).await;
    let entry = event.as_record().unwrap();
    assert_eq!(entry.record.message, "B");
    assert_eq!(entry.record.timestamp.timestamp(), 2_000);
    assert_eq!(entry.record.level, LogLevel::Info);
}

#[tokio::test(start_paused = true)]
async fn undecodable_blocks_are_counted_and_skipped() {
    let (live, feed) = ScriptedConnection::live();
    let harness = start_pump(vec![live]);
    let mut sub = harness.fanout.subscribe(&FilterSpec::match_all()).unwrap();

    feed.send_all(["level: 20", "msg: nameless", "---"]);
    feed.send_all(rosout_lines(&[("n", "ok")]));

    assert_eq!(message(&next_event(&mut sub).await), "ok");
    let stats = harness.pump.stats();
    assert_eq!(stats.undecodable, 1);
    assert_eq!(stats.records, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_pump() {
    let (live, feed) = ScriptedConnection::live();
    let harness = start_pump(vec![live]);
    feed.send_all(rosout_lines(&[("n", "hello")]));

    let mut state = harness.pump.watch_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == PumpState::Streaming))
        .await
        .unwrap()
        .unwrap();

    harness.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(WAIT, harness.task).await.unwrap().unwrap();
    assert_eq!(harness.pump.state(), PumpState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn slow_subscriber_does_not_stall_others() {
    let (live, feed) = ScriptedConnection::live();
    let source = Arc::new(ScriptedLineSource::new([live]));
    let hub = LogHub::with_decoder(
        LogConfig::default().with_subscriber_queue(2),
        source,
        Arc::new(|| Box::new(JsonLineDecoder) as Box<dyn RecordDecoder>),
    );

    let slow = hub.subscribe("/rosout", &FilterSpec::match_all()).unwrap();
    let mut fast = hub.subscribe("/rosout", &FilterSpec::match_all()).unwrap();

    let records: Vec<_> = (0..10)
        .map(|i| record("/n", LogLevel::Info, &i.to_string()))
        .collect();
    let lines = json_lines(&records);
    for line in lines {
        feed.send(line);
        // Give the pump a chance to publish before the next line.
        tokio::task::yield_now().await;
        let event = next_event(&mut fast).await;
        assert!(event.as_record().is_some());
    }

    assert_eq!(fast.dropped(), 0);
    assert_eq!(slow.dropped(), 8);
    let channel = hub.get("/rosout").unwrap();
    assert_eq!(channel.pump().stats().records, 10);
}

#[tokio::test(start_paused = true)]
async fn hub_opens_one_upstream_per_source() {
    let (live, feed) = ScriptedConnection::live();
    let source = Arc::new(ScriptedLineSource::new([live]));
    let hub = LogHub::new(LogConfig::default(), source.clone());

    let first = hub.channel("/rosout").unwrap();
    let second = hub.channel("/rosout").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let mut a = hub.subscribe("/rosout", &FilterSpec::match_all()).unwrap();
    let mut b = hub
        .subscribe("/rosout", &FilterSpec::new(["/sensing"], None))
        .unwrap();

    feed.send_all(rosout_lines(&[("sensing.lidar", "scan"), ("planning", "plan")]));

    assert_eq!(message(&next_event(&mut a).await), "scan");
    assert_eq!(message(&next_event(&mut a).await), "plan");
    assert_eq!(message(&next_event(&mut b).await), "scan");
    assert_eq!(source.opens(), 1);
    assert_eq!(hub.statuses().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_subscriber_gets_backlog_without_duplicates() {
    let (live, feed) = ScriptedConnection::live();
    let source = Arc::new(ScriptedLineSource::new([live]));
    let hub = LogHub::new(LogConfig::default().with_replay_size(2), source);

    let mut early = hub.subscribe("/rosout", &FilterSpec::match_all()).unwrap();
    feed.send_all(rosout_lines(&[("n", "1"), ("n", "2"), ("n", "3")]));
    for _ in 0..3 {
        next_event(&mut early).await;
    }

    let mut late = hub.subscribe("/rosout", &FilterSpec::match_all()).unwrap();
    let backlog: Vec<_> = late
        .backlog()
        .iter()
        .map(|e| e.record.message.clone())
        .collect();
    assert_eq!(backlog, vec!["2", "3"]);

    feed.send_all(rosout_block(1_714_565_000, 20, "n", "4"));
    assert_eq!(message(&next_event(&mut late).await), "4");
    assert!(late.try_next().is_none());
}

#[tokio::test(start_paused = true)]
async fn hub_only_opens_configured_sources() {
    let source = Arc::new(ScriptedLineSource::default());
    let hub = LogHub::new(
        LogConfig::default().with_sources(["/rosout", "/diagnostics_log"]),
        source.clone(),
    );

    for i in 0..50 {
        let err = hub
            .subscribe(&format!("/topic_{}", i), &FilterSpec::match_all())
            .unwrap_err();
        assert!(matches!(err, SubscribeError::UnknownSource { .. }));
    }
    tokio::task::yield_now().await;
    assert!(hub.statuses().is_empty());
    assert_eq!(source.opens(), 0);

    let bad_filter = FilterSpec {
        patterns: vec![],
        min_level: Some("LOUD".to_string()),
    };
    let err = hub.subscribe("/rosout", &bad_filter).unwrap_err();
    assert!(matches!(err, SubscribeError::Filter(_)));
    assert!(hub.get("/rosout").is_none());

    let sub = hub.subscribe("/diagnostics_log", &FilterSpec::match_all()).unwrap();
    drop(sub);
    let again = hub.subscribe("/diagnostics_log", &FilterSpec::match_all()).unwrap();
    drop(again);
    tokio::task::yield_now().await;
    assert_eq!(hub.statuses().len(), 1);
    assert_eq!(source.opens(), 1);
}
