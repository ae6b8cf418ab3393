//! End-to-end pipeline tests: submit → workers → poller → playback

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    FakeSynthesizer, RecordingSink, fast_worker_settings, file_count, memory_broker,
    sqlite_broker, wait_until,
};
use readout_gateway::broker::{ResultStore, TaskQueue};
use readout_gateway::destinations::DestinationManager;
use readout_gateway::pipeline::{
    Destination, Disposition, JobOutcome, PollerSettings, ResultPoller, ResultStatus, Sweeper,
    SynthesisResult, TaskSubmitter, Worker, WorkerPool,
};
use readout_gateway::voice::{PlaybackState, Synthesizer, spawn_playback};
use tokio::sync::mpsc;

const DEST: Destination = Destination::new(100, 200);
const RESULT_TTL: Duration = Duration::from_secs(300);

fn poller_settings() -> PollerSettings {
    PollerSettings {
        max_artifact_bytes: 1024,
        wait_timeout: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_single_item_goes_idle_playing_idle() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let synth: Arc<dyn Synthesizer> = Arc::new(
        FakeSynthesizer::new(dir.path()).with_delay("hello", Duration::from_millis(200)),
    );
    let sink = Arc::new(RecordingSink::new(Duration::from_millis(100)));

    let destinations =
        DestinationManager::new(broker.store.clone(), sink.clone(), poller_settings());
    let playback = destinations.activate(DEST).await;
    assert_eq!(playback.status().state, PlaybackState::Idle);

    let pool = WorkerPool::spawn(1, &broker, &synth, &fast_worker_settings(RESULT_TTL));
    let submitter = TaskSubmitter::new(broker.queue.clone(), 150);
    let task_id = submitter.submit("hello", DEST).await.unwrap();

    let mut status = playback.subscribe();
    let playing = tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == PlaybackState::Playing),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(playing.now_playing, Some(task_id));
    assert_eq!(playing.queued, 0);

    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == PlaybackState::Idle && s.played == 1),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(sink.played(), vec!["hello"]);
    assert_eq!(file_count(dir.path()), 0);

    pool.shutdown(Duration::from_secs(1)).await;
    destinations.shutdown().await;
}

#[tokio::test]
async fn test_playback_follows_completion_order() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let synth: Arc<dyn Synthesizer> = Arc::new(
        FakeSynthesizer::new(dir.path())
            .with_delay("A", Duration::from_millis(800))
            .with_delay("B", Duration::from_millis(80)),
    );
    let sink = Arc::new(RecordingSink::new(Duration::from_millis(20)));

    let destinations =
        DestinationManager::new(broker.store.clone(), sink.clone(), poller_settings());
    destinations.activate(DEST).await;
    let pool = WorkerPool::spawn(2, &broker, &synth, &fast_worker_settings(RESULT_TTL));

    let submitter = TaskSubmitter::new(broker.queue.clone(), 150);
    submitter.submit("A", DEST).await.unwrap();
    submitter.submit("B", DEST).await.unwrap();

    wait_until(Duration::from_secs(3), || sink.played().len() == 2).await;
    assert_eq!(sink.played(), vec!["B", "A"]);

    pool.shutdown(Duration::from_secs(1)).await;
    destinations.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_never_reach_playback() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let fake = Arc::new(FakeSynthesizer::new(dir.path()).failing("broken", usize::MAX));
    let synth: Arc<dyn Synthesizer> = fake.clone();
    let sink = Arc::new(RecordingSink::new(Duration::from_millis(10)));

    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let destinations =
        DestinationManager::new(broker.store.clone(), sink.clone(), poller_settings())
            .with_notices(notice_tx);
    let playback = destinations.activate(DEST).await;
    let pool = WorkerPool::spawn(1, &broker, &synth, &fast_worker_settings(RESULT_TTL));

    let submitter = TaskSubmitter::new(broker.queue.clone(), 150);
    let task_id = submitter.submit("broken", DEST).await.unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(3), notice_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.request_id, task_id);
    assert_eq!(notice.status, ResultStatus::Failed);
    assert!(notice.reason.contains("engine crashed"), "{}", notice.reason);

    assert_eq!(fake.calls("broken"), 3);
    assert!(sink.played().is_empty());
    assert_eq!(playback.status().played, 0);
    assert_eq!(broker.queue.pending().await.unwrap(), 0);

    pool.shutdown(Duration::from_secs(1)).await;
    destinations.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_and_plays() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let fake = Arc::new(FakeSynthesizer::new(dir.path()).failing("flaky", 2));
    let synth: Arc<dyn Synthesizer> = fake.clone();
    let sink = Arc::new(RecordingSink::new(Duration::from_millis(10)));

    let destinations =
        DestinationManager::new(broker.store.clone(), sink.clone(), poller_settings());
    destinations.activate(DEST).await;
    let pool = WorkerPool::spawn(1, &broker, &synth, &fast_worker_settings(RESULT_TTL));

    TaskSubmitter::new(broker.queue.clone(), 150)
        .submit("flaky", DEST)
        .await
        .unwrap();

    wait_until(Duration::from_secs(3), || sink.played().len() == 1).await;
    assert_eq!(fake.calls("flaky"), 3);
    assert_eq!(fake.created(), 1);

    pool.shutdown(Duration::from_secs(1)).await;
    destinations.shutdown().await;
}

#[tokio::test]
async fn test_late_consumption_is_expired() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let synth: Arc<dyn Synthesizer> = Arc::new(FakeSynthesizer::new(dir.path()));
    let worker = Worker::new(
        0,
        broker.clone(),
        synth,
        fast_worker_settings(Duration::from_millis(50)),
    );

    TaskSubmitter::new(broker.queue.clone(), 150)
        .submit("too late", DEST)
        .await
        .unwrap();
    assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Ready));
    assert_eq!(file_count(dir.path()), 1);

    // Nobody polls the destination until the TTL has passed
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sink = Arc::new(RecordingSink::new(Duration::from_millis(10)));
    let (playback, _task) = spawn_playback(DEST, sink.clone());
    let poller = ResultPoller::new(broker.store.clone(), playback.clone(), poller_settings());

    let disposition = poller.poll_once().await.unwrap().unwrap();
    let Disposition::Dropped(notice) = disposition else {
        panic!("expected expired result to be dropped, got {disposition:?}");
    };
    assert_eq!(notice.status, ResultStatus::Expired);
    assert_eq!(file_count(dir.path()), 0);
    assert!(sink.played().is_empty());
    assert_eq!(playback.status().state, PlaybackState::Idle);
}

#[tokio::test]
async fn test_sweeper_cleans_up_unconsumed_results() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let synth: Arc<dyn Synthesizer> = Arc::new(FakeSynthesizer::new(dir.path()));
    let worker = Worker::new(
        0,
        broker.clone(),
        synth,
        fast_worker_settings(Duration::from_millis(50)),
    );

    let task_id = TaskSubmitter::new(broker.queue.clone(), 150)
        .submit("orphan", DEST)
        .await
        .unwrap();
    worker.run_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sweeper = Sweeper::new(
        broker.store.clone(),
        dir.path().to_path_buf(),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    );
    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(report.expired_results, 1);
    assert_eq!(report.artifacts_removed, 1);
    assert_eq!(report.ready_entries_removed, 1);
    assert_eq!(file_count(dir.path()), 0);
    assert!(broker.store.get(&task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_redelivery_after_crash_yields_one_result() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, broker) = sqlite_broker(Duration::from_millis(100));
    let fake = Arc::new(FakeSynthesizer::new(dir.path()));
    let synth: Arc<dyn Synthesizer> = fake.clone();

    let task_id = TaskSubmitter::new(broker.queue.clone(), 150)
        .submit("hello", DEST)
        .await
        .unwrap();

    // First worker stores its result, then dies before notifying or acking
    let delivery = backend.consume(Duration::ZERO).await.unwrap().unwrap();
    let path = fake.synthesize("hello").await.unwrap();
    backend
        .put(&SynthesisResult::ready(
            &delivery.request,
            path,
            Duration::from_secs(300),
        ))
        .await
        .unwrap();
    drop(delivery);

    // Lease lapses and a second worker picks the task up
    let worker = Worker::new(1, broker.clone(), synth, fast_worker_settings(RESULT_TTL));
    let mut outcome = None;
    for _ in 0..50 {
        outcome = worker.run_once().await.unwrap();
        if outcome.is_some() {
            break;
        }
    }
    assert_eq!(outcome, Some(JobOutcome::AlreadyDone));

    assert_eq!(fake.created(), 1);
    assert_eq!(file_count(dir.path()), 1);
    assert_eq!(backend.pending().await.unwrap(), 0);
    assert_eq!(
        backend.wait_ready(DEST, Duration::ZERO).await.unwrap(),
        Some(task_id.clone())
    );
    assert_eq!(backend.wait_ready(DEST, Duration::ZERO).await.unwrap(), None);
    assert_eq!(
        backend.take(&task_id).await.unwrap().map(|r| r.status),
        Some(ResultStatus::Ready)
    );
}

#[tokio::test]
async fn test_at_most_one_clip_plays_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let synth: Arc<dyn Synthesizer> = Arc::new(FakeSynthesizer::new(dir.path()));
    let sink = Arc::new(RecordingSink::new(Duration::from_millis(30)));

    let destinations =
        DestinationManager::new(broker.store.clone(), sink.clone(), poller_settings());
    destinations.activate(DEST).await;
    let pool = WorkerPool::spawn(4, &broker, &synth, &fast_worker_settings(RESULT_TTL));

    let submitter = TaskSubmitter::new(broker.queue.clone(), 150);
    let texts: Vec<String> = (0..8).map(|i| format!("clip {i}")).collect();
    for text in &texts {
        submitter.submit(text, DEST).await.unwrap();
    }

    wait_until(Duration::from_secs(5), || sink.played().len() == texts.len()).await;

    let mut played = sink.played();
    played.sort();
    assert_eq!(played, texts);
    assert_eq!(sink.max_active(), 1);

    wait_until(Duration::from_secs(1), || file_count(dir.path()) == 0).await;

    pool.shutdown(Duration::from_secs(1)).await;
    destinations.shutdown().await;
}

#[tokio::test]
async fn test_destinations_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let synth: Arc<dyn Synthesizer> = Arc::new(FakeSynthesizer::new(dir.path()));
    let sink = Arc::new(RecordingSink::new(Duration::from_millis(100)));

    let other = Destination::new(100, 201);
    let destinations =
        DestinationManager::new(broker.store.clone(), sink.clone(), poller_settings());
    destinations.activate(DEST).await;
    destinations.activate(other).await;
    let pool = WorkerPool::spawn(2, &broker, &synth, &fast_worker_settings(RESULT_TTL));

    let submitter = TaskSubmitter::new(broker.queue.clone(), 150);
    submitter.submit("left", DEST).await.unwrap();
    submitter.submit("right", other).await.unwrap();

    wait_until(Duration::from_secs(3), || sink.played().len() == 2).await;
    assert_eq!(sink.max_active(), 2);

    pool.shutdown(Duration::from_secs(1)).await;
    destinations.shutdown().await;
}

#[tokio::test]
async fn test_reactivated_destination_skips_earlier_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, broker) = memory_broker();
    let synth: Arc<dyn Synthesizer> = Arc::new(FakeSynthesizer::new(dir.path()));
    let sink = Arc::new(RecordingSink::new(Duration::from_millis(10)));
    let worker = Worker::new(0, broker.clone(), synth, fast_worker_settings(RESULT_TTL));

    let destinations =
        DestinationManager::new(broker.store.clone(), sink.clone(), poller_settings());
    destinations.activate(DEST).await;
    let task_id = TaskSubmitter::new(broker.queue.clone(), 150)
        .submit("orphan", DEST)
        .await
        .unwrap();
    destinations.deactivate(DEST).await.unwrap();

    assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Ready));

    let playback = destinations.activate(DEST).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(sink.played().is_empty());
    assert_eq!(playback.status().played, 0);
    assert!(broker.store.get(&task_id).await.unwrap().is_some());
    assert_eq!(file_count(dir.path()), 1);

    destinations.shutdown().await;
}

#[tokio::test]
async fn test_redelivery_after_playback_is_not_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, broker) = memory_broker();
    let fake = Arc::new(FakeSynthesizer::new(dir.path()));
    let synth: Arc<dyn Synthesizer> = fake.clone();
    let sink = Arc::new(RecordingSink::new(Duration::from_millis(10)));

    let destinations =
        DestinationManager::new(broker.store.clone(), sink.clone(), poller_settings());
    destinations.activate(DEST).await;
    TaskSubmitter::new(broker.queue.clone(), 150)
        .submit("hello", DEST)
        .await
        .unwrap();

    // First worker finishes everything but the ack
    let delivery = backend.consume(Duration::ZERO).await.unwrap().unwrap();
    let path = fake.synthesize("hello").await.unwrap();
    let result = SynthesisResult::ready(&delivery.request, path, RESULT_TTL);
    backend.put(&result).await.unwrap();
    backend.notify_ready(DEST, &delivery.request.id).await.unwrap();
    wait_until(Duration::from_secs(2), || sink.played().len() == 1).await;

    // Its lease lapses and a second worker receives the task again
    backend.nack(&delivery, Duration::ZERO).await.unwrap();
    let worker = Worker::new(1, broker.clone(), synth, fast_worker_settings(RESULT_TTL));
    assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::AlreadyDone));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.played(), vec!["hello"]);
    assert_eq!(fake.created(), 1);
    assert_eq!(backend.pending().await.unwrap(), 0);

    destinations.shutdown().await;
}
