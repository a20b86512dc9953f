//! Task engine tests against a scripted renderer.
//!
//! No poppler binary is needed: every test plugs a `ScriptedBackend` into
//! the `*_with_backend` entry points.

mod common;

use common::{init_tracing, ScriptedBackend};
use futures::StreamExt;
use pdf2img::provider::{from_channel, from_slice};
use pdf2img::{
    convert_files_with_backend, convert_with_backend, CancellationToken, ConversionConfig,
    FailureKind, Observable, PageRange, Pdf2ImgError, ProcessExit, TaskKind, WorkerState,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DOC: &str = "/docs/book.pdf";

fn ranges(backend: &ScriptedBackend) -> Vec<(u32, u32)> {
    let mut r: Vec<_> = backend
        .spawned()
        .iter()
        .map(|job| (job.range.first, job.range.last))
        .collect();
    r.sort();
    r
}

// ── Single document ──────────────────────────────────────────────────────────

#[tokio::test]
async fn converts_241_pages_with_three_workers_in_strict_mode() {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::with_pages(241));
    let config = ConversionConfig::builder()
        .job(3)
        .strict(true)
        .build()
        .unwrap();

    let mut task = convert_with_backend(DOC, &config, backend.clone())
        .await
        .unwrap();
    assert_eq!(task.kind(), TaskKind::Single);
    assert_eq!(task.unit(), "pages");
    assert_eq!(task.workers().len(), 3);

    let entries = task.wait_and_collect().await;
    assert_eq!(entries.len(), 241);
    assert!(task.errors().await.is_empty());

    assert_eq!(ranges(&backend), vec![(1, 81), (82, 161), (162, 241)]);
    let spans: u32 = backend.spawned().iter().map(|j| j.range.len()).sum();
    assert_eq!(spans, 241);

    let pages: HashSet<u32> = entries.iter().map(|e| e.page).collect();
    assert_eq!(pages.len(), 241);

    // per worker, pages arrive in strictly increasing order
    let mut last_seen: HashMap<usize, u32> = HashMap::new();
    for e in &entries {
        if let Some(prev) = last_seen.insert(e.worker, e.page) {
            assert!(e.page > prev, "worker {} went from {} to {}", e.worker, prev, e.page);
        }
    }

    assert!(task.completed());
    assert!(!task.aborted());
    assert_eq!(task.total(), 241);
    assert_eq!(task.finished(), 241);
}

#[tokio::test]
async fn entry_carries_job_total_and_output() {
    let backend = Arc::new(ScriptedBackend::with_pages(4));
    let config = ConversionConfig::builder()
        .output_folder("/out")
        .build()
        .unwrap();
    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;

    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].page, 1);
    assert_eq!(entries[0].total, 4);
    assert_eq!(entries[0].worker, 0);
    assert_eq!(entries[0].output, PathBuf::from("/out/book-001.ppm"));
}

#[tokio::test]
async fn job_is_inferred_from_page_count() {
    for (pages, workers) in [(10, 1), (30, 2), (60, 3)] {
        let backend = Arc::new(ScriptedBackend::with_pages(pages));
        let mut task = convert_with_backend(DOC, &ConversionConfig::default(), backend)
            .await
            .unwrap();
        assert_eq!(task.workers().len(), workers, "{pages} pages");
        task.wait().await;
    }
}

#[tokio::test]
async fn job_is_clamped_to_page_count() {
    let backend = Arc::new(ScriptedBackend::with_pages(5));
    let config = ConversionConfig::builder().job(16).build().unwrap();
    let mut task = convert_with_backend(DOC, &config, backend.clone())
        .await
        .unwrap();
    assert_eq!(task.workers().len(), 5);
    assert_eq!(task.wait_and_collect().await.len(), 5);
    assert!(backend.spawned().iter().all(|j| j.range.len() == 1));
}

#[tokio::test]
async fn page_range_is_partitioned_across_workers() {
    let backend = Arc::new(ScriptedBackend::with_pages(100));
    let config = ConversionConfig::builder()
        .page_range(22, 42)
        .job(4)
        .build()
        .unwrap();
    let mut task = convert_with_backend(DOC, &config, backend.clone())
        .await
        .unwrap();
    let entries = task.wait_and_collect().await;

    assert_eq!(entries.len(), 21);
    assert_eq!(ranges(&backend), vec![(22, 27), (28, 32), (33, 37), (38, 42)]);
    assert!(entries.iter().all(|e| PageRange::new(22, 42).unwrap().contains(e.page)));
}

#[tokio::test]
async fn last_page_past_the_end_is_clipped() {
    let backend = Arc::new(ScriptedBackend::with_pages(14));
    let config = ConversionConfig::builder()
        .page_range(3, 100)
        .build()
        .unwrap();
    let mut task = convert_with_backend(DOC, &config, backend.clone())
        .await
        .unwrap();
    assert_eq!(task.wait_and_collect().await.len(), 12);
    assert_eq!(ranges(&backend), vec![(3, 14)]);
}

#[tokio::test]
async fn first_page_past_the_end_fails_before_any_spawn() {
    let backend = Arc::new(ScriptedBackend::with_pages(24));
    let config = ConversionConfig::builder().first_page(42).build().unwrap();

    let err = convert_with_backend(DOC, &config, backend.clone())
        .await
        .unwrap_err();
    assert!(
        matches!(err, Pdf2ImgError::InvalidPageRange { first: 42, last: 24 }),
        "got: {err}"
    );
    assert!(backend.spawned().is_empty());
}

#[tokio::test]
async fn page_count_failure_fails_construction() {
    let backend = Arc::new(ScriptedBackend::with_pages(10).unreadable(DOC));
    let err = convert_with_backend(DOC, &ConversionConfig::default(), backend.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Pdf2ImgError::PageCountFailed { .. }), "got: {err}");
    assert!(backend.spawned().is_empty());
}

// ── Stream faults ────────────────────────────────────────────────────────────

#[tokio::test]
async fn strict_syntax_error_stops_the_job() {
    let backend = Arc::new(
        ScriptedBackend::with_pages(10).inject(5, "Syntax Error (2031): Illegal character ')'"),
    );
    let config = ConversionConfig::builder().job(1).strict(true).build().unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.iter().map(|e| e.page).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].page, Some(5));
    assert!(matches!(errors[0].kind, FailureKind::Syntax { .. }));
    assert!(task.aborted());
    assert_eq!(
        task.workers()[0].state(),
        WorkerState::Terminal { aborted: true }
    );
}

#[tokio::test]
async fn lenient_syntax_error_is_recorded_and_conversion_continues() {
    let backend = Arc::new(
        ScriptedBackend::with_pages(10).inject(5, "Syntax Error (2031): Illegal character ')'"),
    );
    let config = ConversionConfig::builder().job(1).build().unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.len(), 10);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].kind, FailureKind::Syntax { .. }));
}

#[tokio::test]
async fn invalid_utf8_noise_between_pages_is_ignored() {
    let backend = Arc::new(
        ScriptedBackend::with_pages(3)
            .inject_bytes(2, &b"Internal Error: no font 'Caf\xe9t\xe9'"[..]),
    );
    let config = ConversionConfig::builder().job(1).build().unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.iter().map(|e| e.page).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(errors.is_empty(), "errors: {errors:?}");
}

#[tokio::test]
async fn invalid_utf8_syntax_error_is_recorded_when_lenient() {
    let backend = Arc::new(
        ScriptedBackend::with_pages(3)
            .inject_bytes(2, &b"Syntax Error (88): Unknown font '\xff\xfe'"[..]),
    );
    let config = ConversionConfig::builder().job(1).build().unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.len(), 3);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].page, Some(2));
    match &errors[0].kind {
        FailureKind::Syntax { line } => assert!(line.contains('\u{FFFD}'), "got: {line}"),
        other => panic!("expected a syntax error, got {other:?}"),
    }
}

#[tokio::test]
async fn exiting_line_is_fatal_even_when_lenient() {
    let backend = Arc::new(
        ScriptedBackend::with_pages(10)
            .inject(3, "Command Line Error: Couldn't open file '/docs/book.pdf', exiting"),
    );
    let config = ConversionConfig::builder().job(1).build().unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.len(), 2);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0].kind, FailureKind::Exiting { .. }));
}

#[tokio::test]
async fn sibling_workers_keep_going_after_a_failure() {
    // page 5 belongs to worker 0 only
    let backend = Arc::new(
        ScriptedBackend::with_pages(30).inject(5, "Syntax Error: Invalid XRef entry"),
    );
    let config = ConversionConfig::builder().job(2).strict(true).build().unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].worker, 0);
    assert_eq!(entries.iter().filter(|e| e.worker == 1).count(), 15);
    assert_eq!(entries.iter().filter(|e| e.worker == 0).count(), 4);
}

#[tokio::test]
async fn nonzero_exit_without_message_is_recorded() {
    let backend = Arc::new(ScriptedBackend::with_pages(3).exit(ProcessExit::failure(99)));
    let mut task = convert_with_backend(DOC, &ConversionConfig::default(), backend)
        .await
        .unwrap();
    let errors = task.errors().await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, FailureKind::ExitStatus { code: Some(99) });
    assert_eq!(errors[0].page, None);
}

#[tokio::test]
async fn spawn_failure_is_recorded_per_worker_without_page() {
    let backend = Arc::new(ScriptedBackend::with_pages(30).fail_spawn());
    let config = ConversionConfig::builder().job(2).build().unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    assert!(task.wait_and_collect().await.is_empty());
    let errors = task.errors().await;

    assert_eq!(errors.len(), 2);
    assert_eq!(errors.iter().map(|e| e.worker).collect::<Vec<_>>(), vec![0, 1]);
    assert!(errors.iter().all(|e| e.page.is_none()));
    assert!(errors
        .iter()
        .all(|e| matches!(e.kind, FailureKind::Spawn { .. })));
}

// ── Timeouts and cancellation ────────────────────────────────────────────────

#[tokio::test]
async fn per_page_timeout_fails_a_stalled_worker() {
    let backend = Arc::new(ScriptedBackend::with_pages(10).stall_after(2));
    let config = ConversionConfig::builder()
        .job(1)
        .per_page_timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.len(), 2);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].kind,
        FailureKind::PageTimeout {
            page: 3,
            after_ms: 50
        }
    );
}

#[tokio::test]
async fn per_page_timeout_restarts_on_every_page() {
    // 7 lines at 40ms each: far longer than the timeout in total,
    // never longer than it between two pages
    let backend = Arc::new(ScriptedBackend::with_pages(6).delay(Duration::from_millis(40)));
    let config = ConversionConfig::builder()
        .job(1)
        .per_page_timeout(Duration::from_millis(150))
        .build()
        .unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.len(), 6);
    assert!(errors.is_empty(), "errors: {errors:?}");
    assert_eq!(task.finished(), 6);
}

#[tokio::test]
async fn noise_lines_do_not_restart_the_page_timer() {
    let mut backend = ScriptedBackend::with_pages(4).delay(Duration::from_millis(40));
    for _ in 0..6 {
        backend = backend.inject(2, "pdftoppm: still rendering");
    }
    let config = ConversionConfig::builder()
        .job(1)
        .per_page_timeout(Duration::from_millis(150))
        .build()
        .unwrap();

    let mut task = convert_with_backend(DOC, &config, Arc::new(backend))
        .await
        .unwrap();
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.iter().map(|e| e.page).collect::<Vec<_>>(), vec![1]);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].kind,
        FailureKind::PageTimeout {
            page: 2,
            after_ms: 150
        }
    );
}

#[tokio::test]
async fn cancellation_stops_every_active_worker() {
    let backend = Arc::new(ScriptedBackend::with_pages(60).delay(Duration::from_millis(20)));
    let token = CancellationToken::new();
    let config = ConversionConfig::builder()
        .job(3)
        .cancellation(token.clone())
        .build()
        .unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert!(entries.len() < 60, "got {} entries", entries.len());
    assert_eq!(errors.len(), 3);
    assert_eq!(errors.iter().map(|e| e.worker).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(errors.iter().all(|e| e.kind == FailureKind::Cancelled));
    for worker in task.workers() {
        assert_eq!(worker.state(), WorkerState::Terminal { aborted: true });
        assert!(worker.completed() && worker.aborted());
    }
}

#[tokio::test]
async fn deadline_is_reported_as_deadline_exceeded() {
    let backend = Arc::new(ScriptedBackend::with_pages(30).delay(Duration::from_millis(20)));
    let config = ConversionConfig::builder()
        .job(1)
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    let errors = task.errors().await;

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, FailureKind::DeadlineExceeded);
    assert!(!config.cancellation.is_cancelled());
}

#[tokio::test]
async fn completion_never_cancels_the_callers_token() {
    let backend = Arc::new(ScriptedBackend::with_pages(3));
    let token = CancellationToken::new();
    let config = ConversionConfig::builder()
        .cancellation(token.clone())
        .build()
        .unwrap();

    let mut task = convert_with_backend(DOC, &config, backend).await.unwrap();
    task.wait().await;
    assert!(task.error().await.is_none());
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn entries_can_be_taken_as_a_stream() {
    let backend = Arc::new(ScriptedBackend::with_pages(25));
    let mut task = convert_with_backend(DOC, &ConversionConfig::default(), backend)
        .await
        .unwrap();

    let stream = task.entries().expect("entries not taken yet");
    assert!(task.entries().is_none());
    let entries: Vec<_> = stream.collect().await;
    assert_eq!(entries.len(), 25);

    task.wait().await;
    assert!(task.completed());
    assert!(task.workers().iter().all(|w| w.completed()));
}

// ── Batch ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_converts_every_document_exactly_once() {
    let docs: Vec<PathBuf> = (0..7).map(|i| PathBuf::from(format!("/docs/{i}.pdf"))).collect();
    let mut backend = ScriptedBackend::with_pages(2);
    for (i, doc) in docs.iter().enumerate() {
        backend = backend.document(doc, i as u32 + 1);
    }
    let backend = Arc::new(backend);
    let config = ConversionConfig::builder().job(3).build().unwrap();
    let provider = from_slice(docs.clone());

    let mut task = convert_files_with_backend(&provider, &config, backend.clone()).await;
    assert_eq!(task.kind(), TaskKind::Batch);
    assert_eq!(task.expected_documents(), Some(7));
    assert_eq!(task.workers().len(), 3);

    let entries = task.wait_and_collect().await;
    assert!(task.errors().await.is_empty());

    assert_eq!(entries.len(), (1..=7).sum::<usize>());
    let spawned: Vec<PathBuf> = backend.spawned().into_iter().map(|j| j.pdf).collect();
    assert_eq!(spawned.len(), 7);
    assert_eq!(spawned.iter().collect::<HashSet<_>>().len(), 7);

    assert_eq!(task.total(), 7);
    assert_eq!(task.finished(), 7);
}

#[tokio::test]
async fn batch_defaults_to_four_workers() {
    let backend = Arc::new(ScriptedBackend::with_pages(1));
    let provider = from_slice(["/docs/a.pdf"]);
    let mut task =
        convert_files_with_backend(&provider, &ConversionConfig::default(), backend).await;
    assert_eq!(task.workers().len(), 4);
    task.wait().await;
}

#[tokio::test]
async fn batch_total_grows_with_discovered_documents() {
    let backend = Arc::new(ScriptedBackend::with_pages(2));
    let (tx, rx) = mpsc::channel(1);
    let provider = from_channel(rx);
    let config = ConversionConfig::builder().job(2).build().unwrap();

    let mut task = convert_files_with_backend(&provider, &config, backend).await;
    assert_eq!(task.expected_documents(), None);

    let mut previous = 0;
    for sent in 1..=5u32 {
        tx.send(PathBuf::from(format!("/docs/{sent}.pdf"))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while task.total() < sent {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("document never picked up");

        let total = task.total();
        assert!(total >= previous, "total went back from {previous} to {total}");
        assert!(total <= sent, "total {total} exceeds {sent} documents sent");
        previous = total;
    }
    drop(tx);

    let entries = task.wait_and_collect().await;
    assert_eq!(entries.len(), 10);
    assert!(task.errors().await.is_empty());
    assert_eq!(task.total(), 5);
    assert_eq!(task.finished(), 5);
    assert_eq!(task.unit(), "documents");
    // every worker's last report is the final page of its last document
    assert_eq!(task.current(), 2);
}

#[tokio::test]
async fn batch_worker_moves_on_after_a_bad_document() {
    let backend = Arc::new(ScriptedBackend::with_pages(3).unreadable("/docs/broken.pdf"));
    let provider = from_slice(["/docs/a.pdf", "/docs/broken.pdf", "/docs/c.pdf"]);
    let config = ConversionConfig::builder().job(1).build().unwrap();

    let mut task = convert_files_with_backend(&provider, &config, backend).await;
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.len(), 6);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].pdf, PathBuf::from("/docs/broken.pdf"));
    assert!(matches!(errors[0].kind, FailureKind::PageCount { .. }));
    assert_eq!(task.finished(), 3);
}

#[tokio::test]
async fn batch_range_past_a_short_document_is_recorded() {
    let backend = Arc::new(
        ScriptedBackend::with_pages(10).document("/docs/short.pdf", 2),
    );
    let provider = from_slice(["/docs/long.pdf", "/docs/short.pdf"]);
    let config = ConversionConfig::builder()
        .first_page(5)
        .job(1)
        .build()
        .unwrap();

    let mut task = convert_files_with_backend(&provider, &config, backend).await;
    let entries = task.wait_and_collect().await;
    let errors = task.errors().await;

    assert_eq!(entries.len(), 6);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].kind,
        FailureKind::InvalidRange { first: 5, last: 2 }
    );
}

#[tokio::test]
async fn batch_cancellation_stops_idle_and_active_workers() {
    let backend = Arc::new(ScriptedBackend::with_pages(50).delay(Duration::from_millis(10)));
    let (tx, rx) = mpsc::channel(4);
    let provider = from_channel(rx);
    let token = CancellationToken::new();
    let config = ConversionConfig::builder()
        .job(2)
        .cancellation(token.clone())
        .build()
        .unwrap();

    let mut task = convert_files_with_backend(&provider, &config, backend).await;
    // one busy worker, one idle worker waiting on the provider
    tx.send(PathBuf::from("/docs/one.pdf")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    token.cancel();

    let errors = task.errors().await;
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.kind == FailureKind::Cancelled));
    assert!(task.completed() && task.aborted());
    drop(tx);
}
