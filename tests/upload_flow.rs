use reqwest::{
    StatusCode,
    multipart::{Form, Part},
};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use temp_file_host::{
    client::{
        api::{FileHostApi, HttpClient},
        gallery::Gallery,
        manager::UploadHandle,
        worker::{ChunkPolicy, UploadSource},
    },
    config::AppConfig,
    server::{self, AppState},
    services::storage_gateway::StorageGateway,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use uuid::Uuid;

struct TestServer {
    base: String,
    state: AppState,
    _dir: TempDir,
}

async fn start() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base = format!("http://{}", addr);

    let cfg = AppConfig {
        host: "127.0.0.1".into(),
        port: addr.port(),
        storage_dir: dir.path().join("objects").to_string_lossy().into_owned(),
        staging_dir: dir.path().join("staging").to_string_lossy().into_owned(),
        database_url: "sqlite::memory:".into(),
        public_url: base.clone(),
        folder: "tests".into(),
        max_request_bytes: 1024 * 1024,
        sweep_interval: Duration::from_secs(3600),
        orphan_grace: Duration::ZERO,
        session_ttl: Duration::from_secs(3600),
    };
    server::prepare_dirs(&cfg).await.unwrap();
    let db = server::connect_db(&cfg.database_url, 1).await.unwrap();
    server::run_migrations(&db).await.unwrap();

    let state = AppState::new(cfg, db);
    let app = server::app(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });

    TestServer {
        base,
        state,
        _dir: dir,
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn chunk_form(id: Uuid, index: u32, total: u32, data: &[u8]) -> Form {
    Form::new()
        .text("id", id.to_string())
        .text("name", "raw.bin")
        .text("chunk_index", index.to_string())
        .text("total_chunks", total.to_string())
        .text("is_complete", (index + 1 == total).to_string())
        .part("file", Part::bytes(data.to_vec()).file_name("raw.bin"))
}

#[tokio::test]
async fn queued_uploads_are_listed_served_and_deleted() {
    let srv = start().await;
    let client = HttpClient::new(&srv.base).unwrap();
    let api: Arc<dyn FileHostApi> = Arc::new(client.clone());
    let policy = ChunkPolicy {
        single_request_limit: 1024,
        chunk_size: 1000,
    };
    let queue = UploadHandle::spawn(api.clone(), policy);

    let big = patterned(2500);
    queue
        .enqueue(vec![
            UploadSource::from_bytes("hello.txt", b"hello world".to_vec()),
            UploadSource::from_bytes("big.bin", big.clone()),
        ])
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), queue.wait_idle())
        .await
        .unwrap()
        .unwrap();
    assert!(queue.snapshot().await.unwrap().is_empty());

    let files = client.list_files().await.unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.original_name.as_str()).collect();
    assert_eq!(names, vec!["big.bin", "hello.txt"]);
    let big_file = files[0].clone();
    assert_eq!(big_file.size_bytes, 2500);
    assert!(big_file.public_id.starts_with("tests/"));
    assert!(big_file.url.ends_with(&big_file.public_id));

    let http = reqwest::Client::new();
    let served = http.get(&big_file.url).send().await.unwrap();
    assert_eq!(served.status(), StatusCode::OK);
    assert_eq!(served.bytes().await.unwrap().as_ref(), big.as_slice());

    let text = http.get(&files[1].url).send().await.unwrap();
    assert_eq!(
        text.headers()[reqwest::header::CONTENT_TYPE],
        "text/plain"
    );

    let out = tempfile::tempdir().unwrap();
    let mut gallery = Gallery::new(api);
    gallery.refresh().await.unwrap();
    let dest = out.path().join("copy.bin");
    let (_, written) = gallery
        .download(&big_file.public_id, Some(dest.as_path()))
        .await
        .unwrap();
    assert_eq!(written, 2500);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), big);

    gallery.delete(&big_file.public_id).await.unwrap();
    assert_eq!(gallery.items().len(), 1);
    assert_eq!(client.list_files().await.unwrap().len(), 1);
    assert!(srv.state.files.gateway.stat(&big_file.public_id).await.is_err());
    let head = http.head(&big_file.url).send().await.unwrap();
    assert_eq!(head.status(), StatusCode::NOT_FOUND);

    let again = client.delete_file(&big_file.public_id).await.unwrap_err();
    assert!(again.is_not_found());
}

#[tokio::test]
async fn errors_use_the_canonical_body() {
    let srv = start().await;
    let http = reqwest::Client::new();

    let missing_file = Form::new()
        .text("id", Uuid::new_v4().to_string())
        .text("name", "a.txt")
        .text("chunk_index", "0")
        .text("total_chunks", "1")
        .text("is_complete", "true");
    let res = http
        .post(format!("{}/api/upload", srv.base))
        .multipart(missing_file)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["status"], json!(400));
    assert!(body["error"].as_str().unwrap().contains("file"));

    let res = http
        .delete(format!("{}/api/files", srv.base))
        .json(&json!({ "url": "x", "public_id": "y" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = http
        .get(format!("{}/media/tests/nothing.png", srv.base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn out_of_order_chunks_are_rejected() {
    let srv = start().await;
    let http = reqwest::Client::new();
    let id = Uuid::new_v4();

    let res = http
        .post(format!("{}/api/upload", srv.base))
        .multipart(chunk_form(id, 1, 2, b"second"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = http
        .post(format!("{}/api/upload", srv.base))
        .multipart(chunk_form(id, 0, 2, b"first-"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["complete"], json!(false));

    let res = http
        .post(format!("{}/api/upload", srv.base))
        .multipart(chunk_form(id, 1, 2, b"second"))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["complete"], json!(true));
    assert_eq!(
        body["etag"].as_str().unwrap(),
        format!("{:x}", md5::compute(b"first-second"))
    );
}

#[tokio::test]
async fn record_and_object_deletes_are_independent() {
    let srv = start().await;
    let client = HttpClient::new(&srv.base).unwrap();
    let http = reqwest::Client::new();

    let res = http
        .post(format!("{}/api/upload", srv.base))
        .multipart(chunk_form(Uuid::new_v4(), 0, 1, b"payload"))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    let url = body["url"].as_str().unwrap().to_string();
    let public_id = body["public_id"].as_str().unwrap().to_string();

    let req = temp_file_host::models::api::CreateFileRequest {
        url: url.clone(),
        public_id: public_id.clone(),
        original_name: "raw.bin".into(),
    };
    client.register_file(&req).await.unwrap();
    let dup = client.register_file(&req).await.unwrap_err();
    assert!(matches!(
        dup,
        temp_file_host::client::api::ApiError::Rejected { status: 409, .. }
    ));

    // Metadata-only: the payload is still served.
    let res = http
        .delete(format!("{}/api/files", srv.base))
        .json(&json!({ "url": url }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(client.list_files().await.unwrap().is_empty());
    assert_eq!(http.get(&url).send().await.unwrap().status(), StatusCode::OK);

    // Storage-only.
    let res = http
        .post(format!("{}/api/delete", srv.base))
        .json(&json!({ "public_id": public_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        http.get(&url).send().await.unwrap().status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn reconcile_removes_unregistered_objects() {
    let srv = start().await;
    let http = reqwest::Client::new();

    let res = http
        .post(format!("{}/api/upload", srv.base))
        .multipart(chunk_form(Uuid::new_v4(), 0, 1, b"orphan"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(srv.state.files.gateway.list().await.unwrap().len(), 1);

    let report = srv.state.files.reconcile(Duration::ZERO).await.unwrap();
    assert_eq!(report.orphans_removed, 1);
    assert!(srv.state.files.gateway.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let srv = start().await;
    let http = reqwest::Client::new();
    for path in ["/healthz", "/readyz"] {
        let res = http
            .get(format!("{}{}", srv.base, path))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK, "{}", path);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["success"], json!(true), "{}", path);
        assert_eq!(body["status"], json!("ok"));
    }
}
