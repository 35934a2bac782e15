mod common;

use common::{MockSource, fast_retry, payload};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use vmxport::config::TransferConfig;
use vmxport::core::checkpoint::file_checksum;
use vmxport::core::{
    Checkpoint, CheckpointStore, ExportSession, ExportSubject, FileStatus, TransferTask,
};

const SIZE: usize = 50_000;

fn subject(dir: &Path) -> ExportSubject {
    ExportSubject {
        name: "web-01".to_string(),
        provider: "mock".to_string(),
        format: "ova".to_string(),
        output_dir: dir.to_path_buf(),
    }
}

fn config(resume: bool) -> TransferConfig {
    TransferConfig {
        parallelism: 2,
        resume_from_checkpoint: resume,
        retry: fast_retry(3),
        ..TransferConfig::default()
    }
}

fn tasks(dir: &Path) -> Vec<TransferTask> {
    (0..2)
        .map(|i| {
            TransferTask::new(
                format!("mem://disk-{i}"),
                dir.join(format!("disk-{i}.vmdk")),
                SIZE as u64,
                format!("disk-{i}.vmdk"),
            )
        })
        .collect()
}

fn healthy_source() -> MockSource {
    MockSource::new()
        .with_file("mem://disk-0", payload(0, SIZE))
        .with_file("mem://disk-1", payload(1, SIZE))
}

#[tokio::test]
async fn test_successful_export_removes_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let subject = subject(dir.path());
    let session = ExportSession::new(config(false), Arc::new(healthy_source()));

    let report = session
        .run(&subject, tasks(dir.path()), &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.bytes_written(), 2 * SIZE as u64);
    assert!(report.checkpoint_path.is_none());
    assert!(!session.checkpoint_path(&subject).exists());
}

#[tokio::test]
async fn test_completed_files_are_skipped_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let subject = subject(dir.path());

    let mut checkpoint = Checkpoint::new("web-01", "mock", "ova", dir.path());
    for i in 0..2u8 {
        let name = format!("disk-{i}.vmdk");
        let path = dir.path().join(&name);
        std::fs::write(&path, payload(i, SIZE)).unwrap();
        checkpoint.add_file(name.clone(), format!("mem://disk-{i}"), SIZE as u64);
        checkpoint.mark_status(&name, FileStatus::Completed);
        checkpoint.set_checksum(&name, file_checksum(&path).unwrap());
    }
    let path = CheckpointStore::default_path(dir.path(), "web-01");
    CheckpointStore::save(&checkpoint, &path).unwrap();

    let source = Arc::new(healthy_source());
    let session = ExportSession::new(config(true), source.clone());
    let report = session
        .run(&subject, tasks(dir.path()), &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(source.requests(), 0);
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.progress.downloaded, report.progress.total);
    assert_eq!(report.progress.total, 2 * SIZE as u64);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_failed_export_keeps_checkpoint_and_rerun_fetches_only_failures() {
    let dir = tempfile::tempdir().unwrap();
    let subject = subject(dir.path());

    let broken = MockSource::new()
        .with_file("mem://disk-0", payload(0, SIZE))
        .with_status("mem://disk-1", 404);
    let session = ExportSession::new(config(false), Arc::new(broken));
    let report = session
        .run(&subject, tasks(dir.path()), &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.failed().count(), 1);
    let kept = report.checkpoint_path.clone().expect("checkpoint should be kept");
    let saved = CheckpointStore::load(&kept).unwrap();
    assert_eq!(saved.file("disk-0.vmdk").unwrap().status, FileStatus::Completed);
    assert_eq!(saved.file("disk-1.vmdk").unwrap().status, FileStatus::Failed);

    let source = Arc::new(healthy_source());
    let session = ExportSession::new(config(true), source.clone());
    let report = session
        .run(&subject, tasks(dir.path()), &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(source.opens(), vec![("mem://disk-1".to_string(), 0)]);
    assert_eq!(std::fs::read(dir.path().join("disk-1.vmdk")).unwrap(), payload(1, SIZE));
    assert!(!kept.exists());
}

#[tokio::test]
async fn test_cancelled_export_resumes_from_partial_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let subject = subject(dir.path());
    let big = 512 * 1024;
    let task = TransferTask::new("mem://big", dir.path().join("big.vmdk"), big as u64, "big.vmdk");

    let slow = MockSource::new()
        .with_file("mem://big", payload(7, big))
        .slow(8 * 1024, Duration::from_millis(20));
    let session = ExportSession::new(config(false), Arc::new(slow));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let report = timeout(
        Duration::from_secs(5),
        session.run(&subject, vec![task.clone()], &cancel, |_| {}),
    )
    .await
    .expect("cancellation was not honoured")
    .unwrap();

    assert_eq!(report.cancelled(), 1);
    let kept = report.checkpoint_path.clone().expect("checkpoint should be kept");
    let saved = CheckpointStore::load(&kept).unwrap();
    let entry = saved.file("big.vmdk").unwrap();
    assert_eq!(entry.status, FileStatus::Downloading);
    let partial = std::fs::metadata(dir.path().join("big.vmdk")).unwrap().len();
    assert!(entry.downloaded_size > 0);
    assert_eq!(entry.downloaded_size, partial);

    let source = Arc::new(MockSource::new().with_file("mem://big", payload(7, big)));
    let session = ExportSession::new(config(true), source.clone());
    let report = session
        .run(&subject, vec![task], &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(source.opens(), vec![("mem://big".to_string(), partial)]);
    assert_eq!(std::fs::read(dir.path().join("big.vmdk")).unwrap(), payload(7, big));
    assert_eq!(report.progress.downloaded, big as u64);
    assert!(!kept.exists());
}

async fn cancel_after(
    session: &ExportSession,
    subject: &ExportSubject,
    task: TransferTask,
    delay: Duration,
) -> vmxport::core::ExportReport {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    timeout(Duration::from_secs(5), session.run(subject, vec![task], &cancel, |_| {}))
        .await
        .expect("cancellation was not honoured")
        .unwrap()
}

#[tokio::test]
async fn test_unknown_size_export_resumes_with_reported_size() {
    let dir = tempfile::tempdir().unwrap();
    let subject = subject(dir.path());
    let big = 512 * 1024;
    let task = TransferTask::new("mem://stream", dir.path().join("stream.vmdk"), 0, "stream.vmdk");

    let slow = MockSource::new()
        .with_file("mem://stream", payload(5, big))
        .slow(8 * 1024, Duration::from_millis(20));
    let session = ExportSession::new(config(false), Arc::new(slow));
    let report = cancel_after(&session, &subject, task.clone(), Duration::from_millis(150)).await;

    assert_eq!(report.cancelled(), 1);
    let kept = report.checkpoint_path.clone().expect("checkpoint should be kept");
    let saved = CheckpointStore::load(&kept).unwrap();
    let entry = saved.file("stream.vmdk").unwrap();
    assert_eq!(entry.total_size, big as u64);
    let partial = std::fs::metadata(dir.path().join("stream.vmdk")).unwrap().len();
    assert!(entry.downloaded_size > 0);
    assert_eq!(entry.downloaded_size, partial);

    let source = Arc::new(MockSource::new().with_file("mem://stream", payload(5, big)));
    let session = ExportSession::new(config(true), source.clone());
    let report = session
        .run(&subject, vec![task], &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(source.opens(), vec![("mem://stream".to_string(), partial)]);
    assert_eq!(std::fs::read(dir.path().join("stream.vmdk")).unwrap(), payload(5, big));
    assert!(!kept.exists());
}

#[tokio::test]
async fn test_unsized_source_checkpoint_stays_loadable() {
    let dir = tempfile::tempdir().unwrap();
    let subject = subject(dir.path());
    let big = 512 * 1024;
    let task = TransferTask::new("mem://stream", dir.path().join("stream.vmdk"), 0, "stream.vmdk");

    let slow = MockSource::new()
        .with_file("mem://stream", payload(5, big))
        .without_size()
        .slow(8 * 1024, Duration::from_millis(20));
    let session = ExportSession::new(config(false), Arc::new(slow));
    let report = cancel_after(&session, &subject, task.clone(), Duration::from_millis(150)).await;

    let kept = report.checkpoint_path.clone().expect("checkpoint should be kept");
    let saved = CheckpointStore::load(&kept).unwrap();
    let entry = saved.file("stream.vmdk").unwrap();
    assert_eq!(entry.status, FileStatus::Downloading);
    assert_eq!(entry.total_size, 0);
    assert_eq!(entry.downloaded_size, 0);

    let source = Arc::new(
        MockSource::new()
            .with_file("mem://stream", payload(5, big))
            .without_size(),
    );
    let session = ExportSession::new(config(true), source.clone());
    let report = session
        .run(&subject, vec![task], &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(source.opens(), vec![("mem://stream".to_string(), 0)]);
    assert_eq!(std::fs::read(dir.path().join("stream.vmdk")).unwrap(), payload(5, big));
}

#[tokio::test]
async fn test_completed_unknown_size_file_is_not_fetched_again() {
    let dir = tempfile::tempdir().unwrap();
    let subject = subject(dir.path());
    let tasks = || {
        vec![
            TransferTask::new("mem://a", dir.path().join("a.ovf"), 0, "a.ovf"),
            TransferTask::new("mem://b", dir.path().join("b.vmdk"), SIZE as u64, "b.vmdk"),
        ]
    };

    let broken = MockSource::new()
        .with_file("mem://a", payload(3, 1_234))
        .with_status("mem://b", 404);
    let session = ExportSession::new(config(false), Arc::new(broken));
    let report = session
        .run(&subject, tasks(), &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    let kept = report.checkpoint_path.clone().expect("checkpoint should be kept");
    let saved = CheckpointStore::load(&kept).unwrap();
    let entry = saved.file("a.ovf").unwrap();
    assert_eq!(entry.status, FileStatus::Completed);
    assert_eq!(entry.total_size, 1_234);

    let source = Arc::new(
        MockSource::new()
            .with_file("mem://a", payload(3, 1_234))
            .with_file("mem://b", payload(1, SIZE)),
    );
    let session = ExportSession::new(config(true), source.clone());
    let report = session
        .run(&subject, tasks(), &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(source.opens(), vec![("mem://b".to_string(), 0)]);
}
