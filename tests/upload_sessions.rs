mod support;

use std::time::Duration;

use assert_matches::assert_matches;
use bulk_ingest::{IngestConfig, IngestError, Phase, Progress, UploadRequest};
use bytes::Bytes;
use support::{ingestor, ingestor_with, test_config, MemoryStore};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

fn vendors_csv(names: &[&str]) -> Bytes {
    let mut csv = String::from("Vendor,Amount,Due,Status\n");
    for (i, name) in names.iter().enumerate() {
        csv.push_str(&format!("{name},{i}.25,2025-03-0{},open\n", i % 9 + 1));
    }
    Bytes::from(csv)
}

async fn wait_for_rows(rx: &mut mpsc::Receiver<Progress>, rows: u64) -> Progress {
    loop {
        let p = rx.recv().await.expect("progress closed early");
        if p.rows_read >= rows {
            return p;
        }
    }
}

async fn feed(writer: &mut DuplexStream, text: &str) {
    writer.write_all(text.as_bytes()).await.unwrap();
    writer.flush().await.unwrap();
}

#[tokio::test]
async fn duplicate_row_is_skipped_without_losing_the_batch() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let engine = ingestor(store.clone());

    // line 7 repeats the vendor on line 3
    let names = ["V0", "V1", "V2", "V3", "V4", "V1", "V6", "V7", "V8", "V9"];
    let id = engine
        .start_upload(UploadRequest::new("vendors", "dupes.csv"), vendors_csv(&names))
        .await?;
    let result = engine.upload_result(id).await?;

    assert_eq!(result.phase, Phase::Complete);
    assert_eq!(result.total_rows, 10);
    assert_eq!(result.inserted, 9);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.failed_rows[0].line, 7);
    let reason = &result.failed_rows[0].reason;
    assert!(reason.starts_with("line 7: "), "{reason}");
    assert!(reason.contains("duplicate key"), "{reason}");
    assert_eq!(store.row_count("vendors"), 9);

    let mut csv = Vec::new();
    let exported = engine.export_failed_rows(id, &mut csv).await?;
    assert_eq!(exported, 1);
    let text = String::from_utf8(csv)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "line,reason,Vendor,Amount,Due,Status");
    assert!(lines[1].starts_with("7,"));
    assert!(lines[1].ends_with(",V1,5.25,2025-03-06,open"));
    Ok(())
}

#[tokio::test]
async fn uploads_beyond_the_limit_are_rejected() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let engine = ingestor(store.clone());
    let mut writers = Vec::new();

    for i in 0..2 {
        let (mut writer, reader) = tokio::io::duplex(1024);
        feed(&mut writer, "Vendor,Amount\n").await;
        writers.push(writer);
        engine
            .start_upload_streaming(UploadRequest::new("vendors", format!("slow-{i}.csv")), reader, None)
            .await?;
    }
    assert_eq!(engine.limiter_status().active, 2);

    let err = engine
        .start_upload(UploadRequest::new("vendors", "extra.csv"), vendors_csv(&["X"]))
        .await
        .unwrap_err();
    assert_matches!(err, IngestError::TooManyUploads);
    assert!(err.is_retryable());

    for (i, mut writer) in writers.into_iter().enumerate() {
        feed(&mut writer, &format!("slow{i},1\n")).await;
    }
    engine.wait_for_uploads(&CancellationToken::new()).await?;
    assert_eq!(engine.limiter_status().active, 0);
    assert_eq!(store.row_count("vendors"), 2);

    let id = engine
        .start_upload(UploadRequest::new("vendors", "extra.csv"), vendors_csv(&["X"]))
        .await?;
    assert!(engine.upload_result(id).await?.is_success());
    Ok(())
}

#[tokio::test]
async fn caller_cancellation_skips_admission() {
    let engine = ingestor(MemoryStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let req = UploadRequest::new("vendors", "late.csv").with_cancel(cancel);
    assert_matches!(
        engine.start_upload(req, vendors_csv(&["A"])).await,
        Err(IngestError::Cancelled)
    );
    assert_eq!(engine.session_count(), 0);
}

#[tokio::test]
async fn progress_stream_ends_with_terminal_snapshot() -> anyhow::Result<()> {
    let engine = ingestor_with(
        IngestConfig {
            subscriber_buffer: 64,
            ..test_config()
        },
        MemoryStore::new(),
    );
    let (mut writer, reader) = tokio::io::duplex(1024);
    let id = engine
        .start_upload_streaming(UploadRequest::new("vendors", "live.csv"), reader, None)
        .await?;

    let mut rx = engine.subscribe_progress(id)?;
    let first = rx.recv().await.unwrap();
    assert!(!first.phase.is_terminal());

    feed(&mut writer, "Vendor,Amount\na,1\nb,2\nc,3\n").await;
    drop(writer);

    let mut last = first;
    while let Some(p) = rx.recv().await {
        last = p;
    }
    assert_eq!(last.phase, Phase::Complete);
    assert_eq!(last.rows_read, 3);
    assert_eq!(last.inserted, 3);
    assert_eq!(last.percent(), Some(100.0));

    let result = engine.upload_result(id).await?;
    assert_eq!(result.inserted, 3);
    assert_eq!(engine.progress(id)?.phase, Phase::Complete);

    // late subscribers see the final snapshot and a closed channel
    let mut late = engine.subscribe_progress(id)?;
    assert_eq!(late.recv().await.unwrap().phase, Phase::Complete);
    assert!(late.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn cancelled_upload_writes_nothing() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let engine = ingestor(store.clone());
    let (mut writer, reader) = tokio::io::duplex(1024);
    let id = engine
        .start_upload_streaming(UploadRequest::new("vendors", "big.csv"), reader, None)
        .await?;
    let mut rx = engine.subscribe_progress(id)?;

    feed(&mut writer, "Vendor,Amount\na,1\nb,2\n").await;
    wait_for_rows(&mut rx, 2).await;
    engine.cancel_upload(id)?;
    feed(&mut writer, "c,3\n").await;

    let result = engine.upload_result(id).await?;
    assert_eq!(result.phase, Phase::Cancelled);
    assert_eq!(result.inserted, 0);
    assert_eq!(result.error.as_deref(), Some("cancelled"));
    assert_eq!(store.row_count("vendors"), 0);
    assert_eq!(store.upload_count(), 0);
    assert!(store.audit_entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelling_the_caller_token_cancels_the_upload() -> anyhow::Result<()> {
    let engine = ingestor(MemoryStore::new());
    let caller = CancellationToken::new();
    let (mut writer, reader) = tokio::io::duplex(1024);
    let req = UploadRequest::new("vendors", "req.csv").with_cancel(caller.clone());
    let id = engine.start_upload_streaming(req, reader, None).await?;
    let mut rx = engine.subscribe_progress(id)?;

    feed(&mut writer, "Vendor,Amount\na,1\n").await;
    wait_for_rows(&mut rx, 1).await;
    caller.cancel();
    drop(writer);

    assert_eq!(engine.upload_result(id).await?.phase, Phase::Cancelled);
    Ok(())
}

#[tokio::test]
async fn phase_returns_to_validating_after_each_batch() -> anyhow::Result<()> {
    let engine = ingestor(MemoryStore::new());
    let (mut writer, reader) = tokio::io::duplex(1024);
    let id = engine
        .start_upload_streaming(UploadRequest::new("vendors", "phases.csv"), reader, None)
        .await?;

    feed(&mut writer, "Vendor,Amount\na,1\nb,2\nc,3\nd,4\n").await;
    let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let p = engine.progress(id).unwrap();
            if p.inserted == 4 && p.phase == Phase::Validating {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await?;
    assert_eq!(snapshot.rows_read, 4);

    drop(writer);
    let result = engine.upload_result(id).await?;
    assert_eq!(result.phase, Phase::Complete);
    assert_eq!(result.inserted, 4);
    Ok(())
}

#[tokio::test]
async fn read_error_after_cancel_ends_cancelled() -> anyhow::Result<()> {
    let engine = ingestor(MemoryStore::new());
    let caller = CancellationToken::new();
    let (body, chunks) = futures::channel::mpsc::unbounded::<std::io::Result<Bytes>>();
    let req = UploadRequest::new("vendors", "closed-tab.csv").with_cancel(caller.clone());
    let id = engine
        .start_upload_streaming(req, StreamReader::new(chunks), None)
        .await?;
    let mut rx = engine.subscribe_progress(id)?;

    body.unbounded_send(Ok(Bytes::from_static(b"Vendor,Amount\na,1\n")))?;
    wait_for_rows(&mut rx, 1).await;
    caller.cancel();
    body.unbounded_send(Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "client disconnected",
    )))?;

    let result = engine.upload_result(id).await?;
    assert_eq!(result.phase, Phase::Cancelled);
    assert_eq!(result.error, Some(IngestError::Cancelled.to_string()));
    assert_eq!(result.inserted, 0);
    Ok(())
}

#[tokio::test]
async fn panicking_upload_fails_and_frees_its_slot() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let engine = ingestor(store.clone());
    let id = engine
        .start_upload(
            UploadRequest::new("notes", "notes.csv"),
            Bytes::from_static(b"Note\nhello\nPANIC\n"),
        )
        .await?;

    let result = engine.upload_result(id).await?;
    assert_eq!(result.phase, Phase::Failed);
    assert_eq!(result.inserted, 0);
    let error = result.error.as_deref().unwrap();
    assert!(error.contains("panicked"), "{error}");
    assert!(error.contains("normalizer exploded"), "{error}");

    engine.wait_for_uploads(&CancellationToken::new()).await?;
    assert_eq!(engine.limiter_status().available, 2);
    assert_eq!(store.row_count("notes"), 0);
    Ok(())
}

#[tokio::test]
async fn drain_wait_gives_up_on_cancel() -> anyhow::Result<()> {
    let engine = ingestor(MemoryStore::new());
    let (writer, reader) = tokio::io::duplex(1024);
    engine
        .start_upload_streaming(UploadRequest::new("vendors", "stuck.csv"), reader, None)
        .await?;

    let shutdown = CancellationToken::new();
    let waiter = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.wait_for_uploads(&shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    shutdown.cancel();
    assert_matches!(waiter.await?, Err(IngestError::Cancelled));

    drop(writer);
    engine.wait_for_uploads(&CancellationToken::new()).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_table_is_rejected_before_admission() {
    let engine = ingestor(MemoryStore::new());
    let err = engine
        .start_upload(UploadRequest::new("payroll", "p.csv"), vendors_csv(&["A"]))
        .await
        .unwrap_err();
    assert_matches!(err, IngestError::UnknownTable(t) if t == "payroll");
    assert_eq!(engine.limiter_status().active, 0);
    assert_eq!(engine.session_count(), 0);
}

#[tokio::test]
async fn missing_header_fails_the_upload() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let engine = ingestor(store.clone());
    let id = engine
        .start_upload(UploadRequest::new("vendors", "wrong.csv"), Bytes::from_static(b"a,b\n1,2\n"))
        .await?;
    let result = engine.upload_result(id).await?;
    assert_eq!(result.phase, Phase::Failed);
    assert!(result.error.as_deref().unwrap().contains("could not find a header row"));
    assert_eq!(store.upload_count(), 0);
    Ok(())
}

#[tokio::test]
async fn commit_failure_fails_the_upload() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.fail_commit.store(true, std::sync::atomic::Ordering::SeqCst);
    let engine = ingestor(store.clone());
    let id = engine
        .start_upload(UploadRequest::new("vendors", "v.csv"), vendors_csv(&["A", "B"]))
        .await?;
    let result = engine.upload_result(id).await?;
    assert_eq!(result.phase, Phase::Failed);
    assert_eq!(result.inserted, 0);
    assert!(result.error.as_deref().unwrap().contains("commit"));
    assert_eq!(store.row_count("vendors"), 0);
    Ok(())
}

#[tokio::test]
async fn finished_sessions_expire() -> anyhow::Result<()> {
    let engine = ingestor_with(
        IngestConfig {
            session_ttl: Duration::from_millis(30),
            ..test_config()
        },
        MemoryStore::new(),
    );
    let id = engine
        .start_upload(UploadRequest::new("vendors", "v.csv"), vendors_csv(&["A"]))
        .await?;
    engine.upload_result(id).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(engine.session_count(), 0);
    assert_matches!(engine.upload_result(id).await, Err(IngestError::UploadNotFound(_)));
    assert_matches!(engine.cancel_upload(id), Err(IngestError::UploadNotFound(_)));
    // the committed record outlives the session
    assert_eq!(engine.upload(id).await?.rows_inserted, 1);
    Ok(())
}
