mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};

use common::{definition, FakeTransport, Route};
use futures::future::join_all;
use multidesk::{DeskConfig, DeskError, ModelAcquisitionManager, ModelStatus};
use tokio::sync::Notify;

const URL: &str = "https://models.test/tars.gguf";

fn manager(dir: &Path, transport: &Arc<FakeTransport>) -> Arc<ModelAcquisitionManager> {
    let cfg = DeskConfig::with_models_dir(dir);
    Arc::new(ModelAcquisitionManager::new(
        &cfg,
        vec![definition("tars", URL, true)],
        transport.clone(),
    ))
}

fn files_in(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect()
}

fn redirect_chain(transport: &FakeTransport, hops: usize) {
    let mut from = URL.to_string();
    for hop in 1..=hops {
        let to = format!("https://cdn{}.models.test/tars.gguf", hop);
        transport.route(&from, Route::redirect(&to));
        from = to;
    }
    transport.route(&from, Route::ok(vec![b"GGUF".to_vec()], Some(4)));
}

#[tokio::test]
async fn concurrent_requests_share_one_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(URL, Route::ok(vec![b"GG".to_vec(), b"UF".to_vec()], Some(4)));
    let models = manager(dir.path(), &transport);

    let calls = (0..5).map(|_| models.ensure_available("tars", |_| {}));
    let results = join_all(calls).await;

    assert_eq!(transport.requests_for(URL), 1);
    let first = results[0].clone().unwrap();
    assert_eq!(first.status, ModelStatus::Ready);
    assert_eq!(first.local_path.as_deref(), Some(dir.path().join("tars.gguf").as_path()));
    for result in results {
        assert_eq!(result.unwrap(), first);
    }
    assert_eq!(std::fs::read(dir.path().join("tars.gguf")).unwrap(), b"GGUF");
}

#[tokio::test]
async fn ready_model_is_not_fetched_again() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("tars.gguf"), b"cached").unwrap();
    let transport = FakeTransport::new();
    let models = manager(dir.path(), &transport);

    let record = models.ensure_available("tars", |_| {}).await.unwrap();
    assert!(record.is_ready());
    assert_eq!(transport.total_requests(), 0);
}

#[tokio::test]
async fn progress_is_reported_in_increasing_percent() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(
        URL,
        Route::ok(vec![vec![0u8; 250], vec![0u8; 250], vec![0u8; 500]], Some(1000)),
    );
    let models = manager(dir.path(), &transport);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    models
        .download("tars", move |p| sink.lock().unwrap().push((p.model_id, p.percent)))
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![("tars".to_string(), 25), ("tars".to_string(), 50), ("tars".to_string(), 100)]
    );
}

#[tokio::test]
async fn unknown_length_reports_only_completion() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(URL, Route::ok(vec![vec![1u8; 64], vec![2u8; 64]], None));
    let models = manager(dir.path(), &transport);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    models
        .download("tars", move |p| sink.lock().unwrap().push(p.percent))
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![100]);
}

#[tokio::test]
async fn five_redirects_are_followed() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    redirect_chain(&transport, 5);
    let models = manager(dir.path(), &transport);

    let record = models.ensure_available("tars", |_| {}).await.unwrap();
    assert!(record.is_ready());
    assert_eq!(transport.total_requests(), 6);
}

#[tokio::test]
async fn sixth_redirect_fails_and_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    redirect_chain(&transport, 6);
    let models = manager(dir.path(), &transport);

    let err = models.ensure_available("tars", |_| {}).await.unwrap_err();
    assert_eq!(err, DeskError::TooManyRedirects(5));
    assert!(files_in(dir.path()).is_empty());
    assert_eq!(models.catalog().get("tars").await.unwrap().status, ModelStatus::NotDownloaded);
}

#[tokio::test]
async fn error_status_fails_download() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(URL, Route::status(404));
    let models = manager(dir.path(), &transport);

    let err = models.ensure_available("tars", |_| {}).await.unwrap_err();
    assert_eq!(err, DeskError::DownloadFailed(404));
    assert!(files_in(dir.path()).is_empty());
    assert!(!models.is_downloading("tars").await);
}

#[tokio::test]
async fn broken_stream_removes_partial_file_and_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(
        URL,
        Route {
            fail_with: Some(DeskError::Io("connection reset".into())),
            ..Route::ok(vec![vec![0u8; 100]], Some(1000))
        },
    );
    let models = manager(dir.path(), &transport);

    let err = models.ensure_available("tars", |_| {}).await.unwrap_err();
    assert_eq!(err, DeskError::Io("connection reset".into()));
    assert!(files_in(dir.path()).is_empty());

    transport.route(URL, Route::ok(vec![b"GGUF".to_vec()], Some(4)));
    let record = models.ensure_available("tars", |_| {}).await.unwrap();
    assert!(record.is_ready());
    assert_eq!(transport.requests_for(URL), 2);
}

#[tokio::test]
async fn delete_is_refused_while_downloading() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let gate = Arc::new(Notify::new());
    transport.route(
        URL,
        Route {
            gate: Some(gate.clone()),
            ..Route::ok(vec![b"GG".to_vec(), b"UF".to_vec()], Some(4))
        },
    );
    let models = manager(dir.path(), &transport);

    let running = {
        let models = models.clone();
        tokio::spawn(async move { models.download("tars", |_| {}).await })
    };
    while !models.is_downloading("tars").await {
        tokio::task::yield_now().await;
    }

    assert_eq!(models.delete("tars").await.unwrap_err(), DeskError::ModelBusy("tars".into()));
    assert_eq!(models.catalog().list().await[0].status, ModelStatus::Downloading);

    gate.notify_one();
    let record = running.await.unwrap().unwrap();
    assert!(record.is_ready());
    assert_eq!(std::fs::read(dir.path().join("tars.gguf")).unwrap(), b"GGUF");
}

#[tokio::test]
async fn delete_removes_artifact_and_tolerates_absence() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(URL, Route::ok(vec![b"GGUF".to_vec()], Some(4)));
    let models = manager(dir.path(), &transport);

    models.ensure_available("tars", |_| {}).await.unwrap();
    assert_eq!(models.catalog().list().await[0].status, ModelStatus::Ready);

    let record = models.delete("tars").await.unwrap();
    assert_eq!(record.status, ModelStatus::NotDownloaded);
    assert_eq!(record.local_path, None);
    assert!(!dir.path().join("tars.gguf").exists());
    assert_eq!(models.catalog().list().await[0].status, ModelStatus::NotDownloaded);

    assert!(models.delete("tars").await.is_ok());
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let models = manager(dir.path(), &transport);

    assert_eq!(
        models.ensure_available("nope", |_| {}).await.unwrap_err(),
        DeskError::UnknownModel("nope".into())
    );
    assert_eq!(models.delete("nope").await.unwrap_err(), DeskError::UnknownModel("nope".into()));
    assert_eq!(transport.total_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn parallel_callers_never_start_a_second_transfer() {
    for round in 0..200 {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new();
        transport.route(URL, Route::ok(vec![b"GG".to_vec(), b"UF".to_vec()], Some(4)));
        let models = manager(dir.path(), &transport);

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let models = models.clone();
                tokio::spawn(async move { models.ensure_available("tars", |_| {}).await })
            })
            .collect();
        for caller in join_all(callers).await {
            assert!(caller.unwrap().unwrap().is_ready());
        }

        assert_eq!(transport.requests_for(URL), 1, "round {round} fetched more than once");
    }
}

#[tokio::test]
async fn download_of_artifact_on_disk_does_not_refetch() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("tars.gguf"), b"cached").unwrap();
    let transport = FakeTransport::new();
    transport.route(URL, Route::ok(vec![b"GGUF".to_vec()], Some(4)));
    let models = manager(dir.path(), &transport);

    let record = models.download("tars", |_| {}).await.unwrap();
    assert!(record.is_ready());
    assert_eq!(transport.total_requests(), 0);
    assert_eq!(std::fs::read(dir.path().join("tars.gguf")).unwrap(), b"cached");
}

#[tokio::test]
async fn sub_percent_first_chunk_reports_no_zero() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(
        URL,
        Route::ok(vec![vec![0u8; 5], vec![0u8; 495], vec![0u8; 500]], Some(1000)),
    );
    let models = manager(dir.path(), &transport);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    models
        .download("tars", move |p| sink.lock().unwrap().push(p.percent))
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
}

#[tokio::test]
async fn crashed_transfer_does_not_leave_model_busy() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(URL, Route { panics: true, ..Route::ok(Vec::new(), None) });
    let models = manager(dir.path(), &transport);

    let err = models.ensure_available("tars", |_| {}).await.unwrap_err();
    assert!(matches!(err, DeskError::Io(_)), "unexpected error: {err:?}");
    assert!(!models.is_downloading("tars").await);
    assert_eq!(models.catalog().get("tars").await.unwrap().status, ModelStatus::NotDownloaded);
    assert!(models.delete("tars").await.is_ok());

    transport.route(URL, Route::ok(vec![b"GGUF".to_vec()], Some(4)));
    assert!(models.ensure_available("tars", |_| {}).await.unwrap().is_ready());
}
