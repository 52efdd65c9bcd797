use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use dog_axum::{ServerConfig, TusApp};
use dog_blob::{MemoryObjectStore, RetryParams};
use dog_tus::{encode_filename, MemorySessionStore, TusConfig, TusCoordinator};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

const OFFSET_STREAM: &str = "application/offset+octet-stream";

fn app() -> (Router, MemoryObjectStore) {
    let store = MemoryObjectStore::new();
    let uploads = TusCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(MemorySessionStore::new()),
        TusConfig::default()
            .with_buffer_size(4)
            .with_max_upload_length(1024)
            .with_retry(RetryParams::none()),
    );
    let app = TusApp::new(Arc::new(uploads), ServerConfig::default());
    (app.router, store)
}

fn create(key: &str, length: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/files/upload")
        .header("tus-resumable", "1.0.0")
        .header("upload-length", length)
        .header("upload-metadata", encode_filename(key))
}

fn patch(key: &str, offset: u64, data: &'static [u8]) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(format!("/files/upload/{key}"))
        .header("tus-resumable", "1.0.0")
        .header("upload-offset", offset.to_string())
        .header("content-type", OFFSET_STREAM)
        .header("content-length", data.len().to_string())
        .body(Body::from(data))
        .unwrap()
}

fn head(key: &str) -> Request<Body> {
    Request::builder()
        .method("HEAD")
        .uri(format!("/files/upload/{key}"))
        .header("tus-resumable", "1.0.0")
        .body(Body::empty())
        .unwrap()
}

fn header<'a>(res: &'a Response, name: &str) -> &'a str {
    res.headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing {name}"))
        .to_str()
        .unwrap()
}

async fn json_body(res: Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn options_advertises_the_protocol() {
    let (router, _) = app();
    let res = router
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/files/upload")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&res, "tus-version"), "1.0.0");
    assert_eq!(header(&res, "tus-resumable"), "1.0.0");
    assert_eq!(header(&res, "tus-max-size"), "1024");
    assert!(header(&res, "tus-extension").contains("creation-with-upload"));
    assert_eq!(header(&res, "access-control-allow-origin"), "*");
    assert!(header(&res, "access-control-expose-headers").contains("Upload-Offset"));
    assert!(res.headers().get("x-request-id").is_some());
}

#[tokio::test]
async fn full_upload_over_http() {
    let (router, store) = app();

    let res = router
        .clone()
        .oneshot(create("docs/a.txt", "6").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(header(&res, "location"), "/files/upload/docs/a.txt");
    assert_eq!(header(&res, "upload-offset"), "0");
    assert!(header(&res, "upload-expires").ends_with(" GMT"));

    let res = router.clone().oneshot(patch("docs/a.txt", 0, b"abc")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&res, "upload-offset"), "3");

    let res = router.clone().oneshot(head("docs/a.txt")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(header(&res, "upload-offset"), "3");
    assert_eq!(header(&res, "upload-length"), "6");
    assert_eq!(header(&res, "cache-control"), "no-store");

    let res = router.clone().oneshot(patch("docs/a.txt", 3, b"def")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&res, "upload-offset"), "6");

    let res = router.oneshot(head("docs/a.txt")).await.unwrap();
    assert_eq!(header(&res, "upload-offset"), "6");
    assert_eq!(header(&res, "upload-length"), "6");
    assert_eq!(store.object("docs/a.txt").as_deref(), Some(&b"abcdef"[..]));
}

#[tokio::test]
async fn creation_with_upload() {
    let (router, store) = app();
    let res = router
        .oneshot(
            create("one.bin", "5")
                .header("content-type", OFFSET_STREAM)
                .header("content-length", "5")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(header(&res, "upload-offset"), "5");
    assert_eq!(store.object("one.bin").as_deref(), Some(&b"hello"[..]));
}

#[tokio::test]
async fn deferred_length_is_reported_on_head() {
    let (router, _) = app();
    let res = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/files/upload")
                .header("upload-defer-length", "1")
                .header("upload-metadata", encode_filename("later.bin"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = router.oneshot(head("later.bin")).await.unwrap();
    assert_eq!(header(&res, "upload-defer-length"), "1");
    assert!(res.headers().get("upload-length").is_none());
}

#[tokio::test]
async fn offset_conflict_is_a_feathers_error() {
    let (router, _) = app();
    router
        .clone()
        .oneshot(create("c.bin", "10").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let res = router.oneshot(patch("c.bin", 4, b"abc")).await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(header(&res, "tus-resumable"), "1.0.0");
    assert!(res.headers().get("x-request-id").is_some());

    let body = json_body(res).await;
    assert_eq!(body["name"], "Conflict");
    assert_eq!(body["code"], 409);
    assert_eq!(body["className"], "conflict");
    assert_eq!(body["data"]["reason"], "offset-mismatch");
    assert_eq!(body["data"]["expectedOffset"], 0);
    assert_eq!(body["data"]["receivedOffset"], 4);
}

#[tokio::test]
async fn malformed_length_reads_as_missing() {
    let (router, _) = app();
    let res = router
        .oneshot(create("m.bin", "ten").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(res).await["data"]["reason"], "missing-length");
}

#[tokio::test]
async fn untyped_body_is_unsupported() {
    let (router, _) = app();
    let res = router
        .oneshot(
            create("u.bin", "3")
                .header("content-length", "3")
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(json_body(res).await["data"]["reason"], "unsupported-media-type");
}

#[tokio::test]
async fn parameterised_content_type_is_unsupported() {
    let (router, _) = app();
    router
        .clone()
        .oneshot(create("p.bin", "3").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let res = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/files/upload/p.bin")
                .header("tus-resumable", "1.0.0")
                .header("upload-offset", "0")
                .header("content-type", "application/offset+octet-stream; charset=utf-8")
                .header("content-length", "3")
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let res = router.oneshot(head("p.bin")).await.unwrap();
    assert_eq!(header(&res, "upload-offset"), "0");
}

#[tokio::test]
async fn oversized_declaration_is_rejected() {
    let (router, _) = app();
    let res = router
        .oneshot(create("big.bin", "4096").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = json_body(res).await;
    assert_eq!(body["name"], "PayloadTooLarge");
    assert_eq!(body["data"]["maxLength"], 1024);
}

#[tokio::test]
async fn unknown_upload_is_not_found() {
    let (router, _) = app();
    let res = router.oneshot(head("nope.bin")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&res, "tus-resumable"), "1.0.0");
}

#[tokio::test]
async fn request_id_is_preserved_when_provided() {
    let (router, _) = app();
    let provided = HeaderValue::from_static("req-test-123");
    let res = router
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/files/upload")
                .header("x-request-id", provided.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.headers().get("x-request-id"), Some(&provided));
}
