mod common;

use buildsearch::{BuildSearchError, ExtensionRegistry, RemoteEngine, SearchEngine};
use common::build;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COLLECTION: &str = "builds";

/// Server whose schema already has every field and copy field.
async fn provisioned_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/builds/schema/fields/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "field": {} })))
        .mount(&server)
        .await;
    let copy_fields: Vec<_> = ["j", "pd", "d", "p", "r", "builton", "cause", "c"]
        .iter()
        .map(|s| json!({ "source": s, "dest": "text" }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/builds/schema/copyfields"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "copyFields": copy_fields })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/builds/schema"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;
    server
}

/// The engine uses a blocking client, so every call runs off the runtime.
async fn connect(server: &MockServer) -> buildsearch::Result<Arc<RemoteEngine>> {
    let url = server.uri();
    tokio::task::spawn_blocking(move || {
        RemoteEngine::connect(&url, COLLECTION, Arc::new(ExtensionRegistry::new())).map(Arc::new)
    })
    .await
    .unwrap()
}

async fn blocking<T, F>(engine: &Arc<RemoteEngine>, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&RemoteEngine) -> T + Send + 'static,
{
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || f(&engine)).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_declares_missing_schema() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/builds/schema/fields/.+$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/builds/schema/copyfields"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "copyFields": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/builds/schema"))
        .and(body_partial_json(json!({
            "add-field": { "name": "text", "type": "text_general", "multiValued": true }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/builds/schema"))
        .and(body_partial_json(json!({
            "add-field": { "name": "n", "type": "plong", "stored": true }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/builds/schema"))
        .and(body_partial_json(json!({
            "add-field": { "name": "builton", "type": "text_general", "stored": false }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/builds/schema"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(13)
        .mount(&server)
        .await;

    connect(&server).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_fails_on_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = connect(&server).await.err().unwrap();
    assert!(matches!(err, BuildSearchError::RemoteStatus { status: 500, .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_replaces_document() {
    let server = provisioned_server().await;
    Mock::given(method("GET"))
        .and(path("/builds/get"))
        .and(query_param("id", "project1#1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "doc": { "id": "project1#1", "j": "project1", "n": 1, "c": "old log" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/builds/update"))
        .and(query_param("commit", "true"))
        .and(body_partial_json(json!({
            "delete": { "id": "project1#1" },
            "add": { "doc": { "id": "project1#1", "j": "project1", "n": 1, "_job": "project1", "c": "echo" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "responseHeader": { "status": 0 } })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = connect(&server).await.unwrap();
    let previous = blocking(&engine, |e| e.store(&build("project1", 1, "echo")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(previous.text("c"), Some("old log"));
    assert_eq!(previous.long("n"), Some(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_maps_hits_and_highlights() {
    let server = provisioned_server().await;
    let body = json!({
        "response": {
            "numFound": 2,
            "docs": [
                { "id": "project1#2", "j": "project1", "pd": "Project One", "n": 2, "d": "#2",
                  "starttime": 2000, "color": "red", "score": 1.5 },
                { "id": "project1#1", "j": "project1", "n": 1, "starttime": 1000, "score": 1.5 }
            ]
        },
        "highlighting": {
            "project1#2": { "c": ["<B>echo</B>\r\nnext"] }
        }
    });
    Mock::given(method("GET"))
        .and(path("/builds/select"))
        .and(query_param("q", "echo"))
        .and(query_param("df", "text"))
        .and(query_param("q.op", "AND"))
        .and(query_param("hl.fl", "c"))
        .and(query_param("hl.snippets", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/builds/select"))
        .and(query_param("q", "echo"))
        .and(query_param("rows", "10000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let engine = connect(&server).await.unwrap();
    let hits = blocking(&engine, |e| e.query("echo", true, None)).await.unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].display_name, "Project One #2");
    assert_eq!(hits[0].status_category, "red");
    assert_eq!(hits[0].highlight_fragments, vec!["<B>echo</B><br/>next"]);
    assert_eq!(hits[1].display_name, "project1 #1");
    assert_eq!(hits[1].status_category, "grey");
    assert!(hits[1].highlight_fragments.is_empty());

    let cursor = hits[0].cursor();
    let rest = blocking(&engine, move |e| e.query("echo", false, Some(&cursor)))
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, "project1#1");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_queries_yield_nothing() {
    let server = provisioned_server().await;
    Mock::given(method("GET"))
        .and(path("/builds/select"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let engine = connect(&server).await.unwrap();
    assert!(blocking(&engine, |e| e.query("echo AND", false, None))
        .await
        .unwrap()
        .is_empty());
    assert!(blocking(&engine, |e| e.query("n:[x TO", false, None))
        .await
        .unwrap()
        .is_empty());
    assert!(blocking(&engine, |e| e.query("rejected", false, None))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_error_surfaces() {
    let server = provisioned_server().await;
    Mock::given(method("GET"))
        .and(path("/builds/select"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let engine = connect(&server).await.unwrap();
    let err = blocking(&engine, |e| e.query("echo", false, None))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildSearchError::RemoteStatus { status: 503, .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_names_and_delete() {
    let server = provisioned_server().await;
    Mock::given(method("GET"))
        .and(path("/builds/select"))
        .and(query_param("facet.field", "_job"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": { "numFound": 4, "docs": [] },
            "facet_counts": { "facet_fields": { "_job": ["folder/app", 3, "other", 1] } }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/builds/update"))
        .and(body_partial_json(json!({ "delete": { "query": "_job:\"folder/app\"" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let engine = connect(&server).await.unwrap();
    let jobs = blocking(&engine, |e| e.job_names()).await.unwrap();
    assert_eq!(jobs, vec!["folder/app", "other"]);
    blocking(&engine, |e| e.delete_job("folder/app")).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_remote_engine() {
    let server = provisioned_server().await;
    let engine = connect(&server).await.unwrap();
    engine.close();
    assert!(engine.is_closed());
    let err = blocking(&engine, |e| e.count("echo")).await.unwrap_err();
    assert_eq!(err, BuildSearchError::EngineClosed);
}
