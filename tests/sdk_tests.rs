//! SDK round trips against a loopback server: upload through the orchestrator,
//! fetch back through the proxy URL, then through the file cache.

mod common;

use common::TestServer;
use std::{path::PathBuf, sync::Arc};
use tenant_storage::{
    audit::AuditStore,
    models::UploadStatus,
    sdk::{
        Downloader, FileCache, GatewayClient, HttpDownloader, InProcessApi, StorageApi, Uploader,
        uploader::sha256_file,
    },
    services::storage_service::RequestOrigin,
};

fn in_process(server: &TestServer) -> Arc<dyn StorageApi> {
    let origin = RequestOrigin::new("http", server.addr.to_string());
    Arc::new(InProcessApi::new(server.service.clone(), origin, "worker"))
}

fn gateway(server: &TestServer) -> Arc<dyn StorageApi> {
    Arc::new(
        GatewayClient::new(&server.base_url(), Some("token".into()))
            .unwrap()
            .with_username("worker"),
    )
}

async fn write_file(dir: &std::path::Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, bytes).await.unwrap();
    path
}

#[tokio::test]
async fn single_upload_round_trips_through_the_proxy() {
    let server = TestServer::new().await;
    let work = tempfile::tempdir().unwrap();
    let payload = b"id,name\n1,ada\n2,grace\n".repeat(1000);
    let path = write_file(work.path(), "people.csv", &payload).await;

    let uploader = Uploader::new(in_process(&server)).unwrap();
    let file = uploader.upload_file(&path, "t1/etl").await.unwrap();

    assert!(file.name.starts_with("t1/etl/"));
    assert!(file.name.ends_with(".csv"));
    assert_eq!(file.source_name, "people.csv");
    assert_eq!(file.size, payload.len() as u64);
    assert_eq!(file.hash, sha256_file(&path).await.unwrap().0);
    assert!(file.is_uploaded);

    let row = server.audit.get_upload(&file.name).await.unwrap().unwrap();
    assert_eq!(row.status, UploadStatus::Completed);
    assert_eq!(row.username, "worker");
    assert_eq!(row.hash, file.hash);

    let fetched = reqwest::get(&file.url).await.unwrap();
    assert!(fetched.status().is_success());
    assert_eq!(&fetched.bytes().await.unwrap()[..], &payload[..]);
}

#[tokio::test]
async fn batch_upload_over_the_gateway_skips_unreadable_files() {
    let server = TestServer::new().await;
    let work = tempfile::tempdir().unwrap();
    let a = write_file(work.path(), "a.txt", b"first").await;
    let missing = work.path().join("missing.txt");
    let c = write_file(work.path(), "c.json", b"{\"third\":true}").await;

    let uploader = Uploader::new(gateway(&server))
        .unwrap()
        .with_concurrency(2, 2);
    let outcome = uploader
        .upload_files(&[a, missing, c], "t2/batch")
        .await
        .unwrap();

    assert_eq!(outcome.files.len(), 2);
    assert_eq!(outcome.failed, 1);
    assert!(outcome.remark.contains("missing.txt"));
    assert_eq!(outcome.files[0].source_name, "a.txt");
    assert_eq!(outcome.files[1].source_name, "c.json");

    for (file, expected) in outcome.files.iter().zip([&b"first"[..], &b"{\"third\":true}"[..]]) {
        let row = server.audit.get_upload(&file.name).await.unwrap().unwrap();
        assert_eq!(row.status, UploadStatus::Completed);
        assert_eq!(row.tenant, "t2");
        let body = reqwest::get(&file.url).await.unwrap().bytes().await.unwrap();
        assert_eq!(&body[..], expected);
    }
}

#[tokio::test]
async fn gateway_errors_surface_the_envelope_code() {
    let server = TestServer::with_max_file_size_mb(1).await;
    let work = tempfile::tempdir().unwrap();
    let path = write_file(work.path(), "big.bin", &vec![0u8; 1024 * 1024 + 1]).await;

    let uploader = Uploader::new(gateway(&server)).unwrap();
    let err = uploader.upload_file(&path, "t1/etl").await.unwrap_err();
    match err {
        tenant_storage::sdk::SdkError::Gateway { code, msg } => {
            assert_eq!(code, -413);
            assert!(msg.contains("MB"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn cache_serves_the_second_materialization_locally() {
    let server = TestServer::new().await;
    let work = tempfile::tempdir().unwrap();
    let path = write_file(work.path(), "model.bin", b"weights and biases").await;

    let uploader = Uploader::new(in_process(&server)).unwrap();
    let file = uploader.upload_file(&path, "t1/models").await.unwrap();

    let downloader: Arc<dyn Downloader> = Arc::new(HttpDownloader::new().unwrap());
    let cache = FileCache::new(downloader);
    let first = work.path().join("cache/one/model.bin");
    let second = work.path().join("cache/two/model.bin");

    let entry = cache
        .get_or_download(&file.hash, &file.url, &first)
        .await
        .unwrap();
    assert!(!entry.from_cache);

    // Removing the object proves the second call never touches the network.
    server.service.delete_by_key(&file.name).await.unwrap();
    let entry = cache
        .get_or_download(&file.hash, &file.url, &second)
        .await
        .unwrap();
    assert!(entry.from_cache);
    assert_eq!(tokio::fs::read(&second).await.unwrap(), b"weights and biases");
    assert_eq!(cache.ref_count(&first).await, 2);

    cache.release(&second).await;
    cache.release(&first).await;
    cache.shutdown().await;
    assert!(!first.exists());
    assert!(!second.exists());
}
