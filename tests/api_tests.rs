//! Integration tests for the storage HTTP API.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{TEST_BUCKET, TestServer};
use serde_json::json;
use std::time::Duration;
use tenant_storage::{audit::AuditStore, keys::escape_key, models::UploadStatus};
use tower::ServiceExt;

/// `{router}/yyyy/mm/dd/{uuid}.{ext}`
fn assert_key_layout(key: &str, router: &str, ext: &str) {
    let rest = key
        .strip_prefix(&format!("{router}/"))
        .unwrap_or_else(|| panic!("{key} is not under {router}/"));
    let parts: Vec<&str> = rest.split('/').collect();
    assert_eq!(parts.len(), 4, "unexpected layout: {key}");
    assert_eq!(parts[0].len(), 4);
    assert_eq!(parts[1].len(), 2);
    assert_eq!(parts[2].len(), 2);
    assert!(parts[..3].iter().all(|p| p.chars().all(|c| c.is_ascii_digit())));

    let name = parts[3]
        .strip_suffix(&format!(".{ext}"))
        .unwrap_or_else(|| panic!("{key} does not end with .{ext}"));
    assert_eq!(name.len(), 36);
    assert!(name.chars().all(|c| c == '-' || c.is_ascii_digit() || ('a'..='f').contains(&c)));
}

#[tokio::test]
async fn browser_upload_moves_ledger_row_to_completed() {
    let server = TestServer::new().await;

    let (status, body) = server
        .post(
            "/api/v1/storage/upload_token",
            json!({
                "file_name": "a.csv",
                "content_type": "text/csv",
                "file_size": 1024,
                "router": "t1/app/crm",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    let data = &body["data"];
    assert_eq!(data["method"], "presigned_url");
    assert_eq!(data["bucket"], TEST_BUCKET);
    assert_eq!(data["headers"]["Content-Type"], "text/csv");
    let key = data["key"].as_str().unwrap().to_string();
    assert_key_layout(&key, "t1/app/crm", "csv");

    let row = server.audit.get_upload(&key).await.unwrap().unwrap();
    assert_eq!(row.tenant, "t1");
    assert_eq!(row.router, "t1/app/crm");
    assert_eq!(row.username, "alice");
    assert_eq!(row.status, UploadStatus::Pending);

    let payload = vec![b'x'; 1024];
    let response = reqwest::Client::new()
        .put(data["url"].as_str().unwrap())
        .header("content-type", "text/csv")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let (_, body) = server
        .post(
            "/api/v1/storage/upload_complete",
            json!({ "key": key, "success": true }),
        )
        .await;
    assert_eq!(body["code"], 0);
    let download_url = body["data"]["download_url"].as_str().unwrap();
    assert!(download_url.starts_with("http://files.example.com/"));
    assert!(download_url.ends_with(&format!("/api/v1/storage/download/{}", escape_key(&key))));
    assert!(!body["data"]["expire"].as_str().unwrap().is_empty());

    let row = server.audit.get_upload(&key).await.unwrap().unwrap();
    assert_eq!(row.status, UploadStatus::Completed);
}

#[tokio::test]
async fn oversize_upload_is_rejected_before_any_backend_call() {
    let server = TestServer::with_max_file_size_mb(1).await;

    let (status, body) = server
        .post(
            "/api/v1/storage/upload_token",
            json!({
                "file_name": "big.bin",
                "file_size": 1024 * 1024 + 1,
                "router": "t1/app/crm",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], -413);
    assert!(body["msg"].as_str().unwrap().contains("1 MB"));
    assert_eq!(server.upload_row_count().await, 0);
    assert_eq!(server.backend.calls(), 0);
}

#[tokio::test]
async fn missing_router_and_malformed_json_are_bad_requests() {
    let server = TestServer::new().await;

    let (_, body) = server
        .post(
            "/api/v1/storage/upload_token",
            json!({ "file_name": "a.csv", "file_size": 1, "router": "" }),
        )
        .await;
    assert_eq!(body["code"], -400);

    let request = Request::post("/api/v1/storage/upload_token")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = server.json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], -400);
    assert_eq!(server.upload_row_count().await, 0);
}

#[tokio::test]
async fn stats_and_listing_cover_everything_under_the_router() {
    let server = TestServer::new().await;
    for (name, size) in [("a.txt", 100), ("b.txt", 200), ("c.txt", 300)] {
        server
            .upload_bytes("t1/app/crm", name, &vec![b'z'; size])
            .await;
    }
    server.upload_bytes("t1/app/other", "d.txt", b"elsewhere").await;

    let (_, body) = server.get("/api/v1/storage/stats?router=t1/app/crm").await;
    assert_eq!(body["code"], 0);
    assert_eq!(
        body["data"],
        json!({ "file_count": 3, "total_size": 600, "size_human": "600 B" })
    );

    let (_, body) = server.get("/api/v1/storage/files?router=t1/app/crm").await;
    assert_eq!(body["data"]["count"], 3);
    let files = body["data"]["files"].as_array().unwrap();
    assert_eq!(files.len(), 3);
    assert!(files
        .iter()
        .all(|f| f.as_str().unwrap().starts_with("t1/app/crm/")));

    let (_, body) = server.get("/api/v1/storage/files").await;
    assert_eq!(body["code"], -400);
}

#[tokio::test]
async fn batch_delete_tolerates_objects_already_gone() {
    let server = TestServer::new().await;
    let first = server.upload_bytes("t1/app/crm", "a.txt", b"one").await;
    server.upload_bytes("t1/app/crm", "b.txt", b"two").await;

    let (_, body) = server
        .delete(&format!("/api/v1/storage/files/{}", escape_key(&first)))
        .await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["key"], first.as_str());

    let (_, body) = server
        .post("/api/v1/storage/batch_delete", json!({ "router": "t1/app/crm" }))
        .await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["deleted_count"], 1);
    assert_eq!(body["data"]["failed_keys"], json!([]));

    let (_, body) = server.get("/api/v1/storage/stats?router=t1/app/crm").await;
    assert_eq!(body["data"]["file_count"], 0);
}

#[tokio::test]
async fn batch_delete_reports_keys_it_could_not_remove() {
    let server = TestServer::new().await;
    let stuck = server.upload_bytes("t1/app/crm", "a.txt", b"one").await;
    server.upload_bytes("t1/app/crm", "b.txt", b"two").await;
    server.backend.fail_delete(&stuck);

    let (_, body) = server
        .post("/api/v1/storage/batch_delete", json!({ "router": "t1/app/crm" }))
        .await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["deleted_count"], 1);
    assert_eq!(body["data"]["failed_keys"], json!([stuck]));
}

#[tokio::test]
async fn deleting_twice_succeeds_both_times() {
    let server = TestServer::new().await;
    let key = server.upload_bytes("t1/app", "a.txt", b"bye").await;
    let uri = format!("/api/v1/storage/files/{}", escape_key(&key));

    let (_, first) = server.delete(&uri).await;
    let (_, second) = server.delete(&uri).await;
    assert_eq!(first["code"], 0);
    assert_eq!(second["code"], 0);

    let (_, info) = server
        .get(&format!("/api/v1/storage/info/{}", escape_key(&key)))
        .await;
    assert_eq!(info["code"], -404);
}

#[tokio::test]
async fn batch_tokens_keep_input_order() {
    let server = TestServer::new().await;
    let (_, body) = server
        .post(
            "/api/v1/storage/batch_upload_token",
            json!({
                "files": [
                    { "file_name": "a.csv", "file_size": 1, "router": "t1/x" },
                    { "file_name": "b.json", "file_size": 2, "router": "t2/y" },
                    { "file_name": "c.png", "file_size": 3, "router": "t1/z" },
                ]
            }),
        )
        .await;
    assert_eq!(body["code"], 0);
    let creds = body["data"].as_array().unwrap();
    assert_eq!(creds.len(), 3);
    assert_key_layout(creds[0]["key"].as_str().unwrap(), "t1/x", "csv");
    assert_key_layout(creds[1]["key"].as_str().unwrap(), "t2/y", "json");
    assert_key_layout(creds[2]["key"].as_str().unwrap(), "t1/z", "png");
    assert_eq!(server.upload_row_count().await, 3);
}

#[tokio::test]
async fn one_invalid_file_rejects_the_whole_batch() {
    let server = TestServer::with_max_file_size_mb(1).await;
    let (_, body) = server
        .post(
            "/api/v1/storage/batch_upload_token",
            json!({
                "files": [
                    { "file_name": "a.csv", "file_size": 1, "router": "t1/x" },
                    { "file_name": "b.bin", "file_size": 10 * 1024 * 1024, "router": "t1/x" },
                ]
            }),
        )
        .await;
    assert_eq!(body["code"], -413);
    assert_eq!(server.upload_row_count().await, 0);
    assert_eq!(server.backend.calls(), 0);

    let (_, body) = server
        .post("/api/v1/storage/batch_upload_token", json!({ "files": [] }))
        .await;
    assert_eq!(body["code"], -400);
}

#[tokio::test]
async fn batch_completion_reports_each_item() {
    let server = TestServer::new().await;
    let (_, body) = server
        .post(
            "/api/v1/storage/batch_upload_token",
            json!({
                "files": [
                    { "file_name": "a.txt", "file_size": 1, "router": "t1/x" },
                    { "file_name": "b.txt", "file_size": 1, "router": "t1/x" },
                ]
            }),
        )
        .await;
    let creds = body["data"].as_array().unwrap();
    let ok_key = creds[0]["key"].as_str().unwrap().to_string();
    let bad_key = creds[1]["key"].as_str().unwrap().to_string();

    let (_, body) = server
        .post(
            "/api/v1/storage/batch_upload_complete",
            json!({
                "items": [
                    { "key": ok_key, "success": true },
                    { "key": bad_key, "success": false, "error": "network reset" },
                    { "key": "", "success": true },
                ]
            }),
        )
        .await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["success_count"], 1);
    assert_eq!(body["data"]["failed_count"], 2);
    let results = body["data"]["results"].as_array().unwrap();
    assert!(results[0]["download_url"]
        .as_str()
        .unwrap()
        .ends_with(&escape_key(&ok_key)));
    assert_eq!(results[1]["error"], "network reset");
    assert_eq!(results[2]["success"], false);

    let ok_row = server.audit.get_upload(&ok_key).await.unwrap().unwrap();
    let bad_row = server.audit.get_upload(&bad_key).await.unwrap().unwrap();
    assert_eq!(ok_row.status, UploadStatus::Completed);
    assert_eq!(bad_row.status, UploadStatus::Failed);
}

#[tokio::test]
async fn completion_for_unknown_key_still_answers() {
    let server = TestServer::new().await;
    let (_, body) = server
        .post(
            "/api/v1/storage/upload_complete",
            json!({ "key": "t1/never/issued.txt", "success": true }),
        )
        .await;
    assert_eq!(body["code"], 0);
    assert!(body["data"]["download_url"]
        .as_str()
        .unwrap()
        .ends_with("t1%2Fnever%2Fissued.txt"));
    assert_eq!(server.upload_row_count().await, 0);
}

#[tokio::test]
async fn proxied_download_streams_bytes_and_is_audited() {
    let server = TestServer::new().await;
    let key = server
        .upload_bytes("t1/app", "report.txt", b"quarterly numbers")
        .await;

    let request = Request::get(format!("/api/v1/storage/download/{}", escape_key(&key)))
        .header("x-forwarded-for", "10.1.2.3, 10.0.0.1")
        .header("user-agent", "test-agent")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.headers()["content-length"], "17");
    let disposition = response.headers()["content-disposition"].to_str().unwrap();
    assert!(disposition.starts_with("attachment;"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"quarterly numbers");

    // The ledger write runs detached from the response.
    let mut recorded = 0;
    for _ in 0..50 {
        recorded = server.download_row_count().await;
        if recorded > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(recorded, 1);
    let ip: String = sqlx::query_scalar("SELECT ip_address FROM file_downloads LIMIT 1")
        .fetch_one(server.db.as_ref())
        .await
        .unwrap();
    assert_eq!(ip, "10.1.2.3");
}

#[tokio::test]
async fn download_of_missing_object_answers_with_an_error_envelope() {
    let server = TestServer::new().await;
    let (status, body) = server
        .get("/api/v1/storage/download/t1%2Fmissing.txt")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], -404);
}

#[tokio::test]
async fn presigned_download_urls_fetch_the_object() {
    let server = TestServer::new().await;
    let key = server.upload_bytes("t1/app", "notes.txt", b"hello").await;

    let (_, body) = server
        .get(&format!("/api/v1/storage/download_url/{}", escape_key(&key)))
        .await;
    assert_eq!(body["code"], 0);
    let url = body["data"]["url"].as_str().unwrap();
    assert!(!body["data"]["server_url"].as_str().unwrap().is_empty());

    let response = reqwest::get(url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .contains("attachment"));
    assert_eq!(&response.bytes().await.unwrap()[..], b"hello");

    let tampered = url.replace("signature=", "signature=00");
    let response = reqwest::get(tampered).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn info_reports_size_and_type() {
    let server = TestServer::new().await;
    let key = server.upload_bytes("t1/app", "x.txt", b"12345").await;
    let (_, body) = server
        .get(&format!("/api/v1/storage/info/{}", escape_key(&key)))
        .await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["key"], key.as_str());
    assert_eq!(body["data"]["size"], 5);
    assert_eq!(body["data"]["content_type"], "text/plain");
}

#[tokio::test]
async fn upload_records_only_show_completed_uploads() {
    let server = TestServer::new().await;
    server.upload_bytes("t1/app", "a.txt", b"aaaa").await;
    server.upload_bytes("t1/app/sub", "b.txt", b"bb").await;
    server
        .post(
            "/api/v1/storage/upload_token",
            json!({ "file_name": "pending.txt", "file_size": 9, "router": "t1/app" }),
        )
        .await;

    let (_, body) = server.get("/api/v1/storage/upload_records?router=t1/app").await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["records"].as_array().unwrap().len(), 2);

    let (_, body) = server
        .get("/api/v1/storage/upload_records/stats?user=alice")
        .await;
    assert_eq!(
        body["data"],
        json!({ "file_count": 2, "total_size": 6, "size_human": "6 B" })
    );

    let (_, body) = server.get("/api/v1/storage/upload_records").await;
    assert_eq!(body["code"], -400);
}

#[tokio::test]
async fn health_and_readiness() {
    let server = TestServer::new().await;
    let (status, body) = server.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = server.get("/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["ledger"]["ok"], true);
    assert_eq!(body["checks"]["bucket"]["ok"], true);
}

#[tokio::test]
async fn ledger_outage_does_not_block_uploads_or_downloads() {
    let server = TestServer::new().await;
    server.ledger.fail_writes(true);

    let (status, body) = server
        .post(
            "/api/v1/storage/upload_token",
            json!({
                "file_name": "notes.txt",
                "content_type": "text/plain",
                "file_size": 5,
                "router": "t1/app",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0, "{body}");
    let key = body["data"]["key"].as_str().unwrap().to_string();
    let url = body["data"]["url"].as_str().unwrap();
    assert!(!url.is_empty());

    let response = reqwest::Client::new()
        .put(url)
        .header("content-type", "text/plain")
        .body(&b"hello"[..])
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let (_, done) = server
        .post(
            "/api/v1/storage/upload_complete",
            json!({ "key": key, "success": true }),
        )
        .await;
    assert_eq!(done["code"], 0, "{done}");
    assert!(done["data"]["download_url"]
        .as_str()
        .unwrap()
        .ends_with(&escape_key(&key)));

    let request = Request::get(format!("/api/v1/storage/download/{}", escape_key(&key)))
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"hello");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.upload_row_count().await, 0);
    assert_eq!(server.download_row_count().await, 0);
}
