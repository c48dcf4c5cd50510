mod support;

use mcpreg::discovery::DiscoveryError;
use mcpreg::{DiscoveryClient, ServerLookup, Settings};
use rstest::rstest;
use serde_json::json;
use sha2::{Digest, Sha256};

use support::{page, query_param, serve};

fn client() -> DiscoveryClient {
    DiscoveryClient::new(&Settings::default()).unwrap()
}

#[tokio::test]
async fn follows_cursors_and_keeps_last_metadata() {
    let server = serve(|target| match query_param(target, "cursor") {
        None => (200, page(&["io.example/a"], Some("c1"))),
        Some("c1") => (200, page(&["io.example/b"], Some("c2"))),
        Some("c2") => (200, page(&["io.example/c"], None)),
        Some(_) => (404, "{}".to_string()),
    })
    .await;

    let list = client().list_servers(&server.base_url, None).await.unwrap();
    let names: Vec<_> = list.servers.iter().map(|s| s.server.name.as_str()).collect();
    assert_eq!(names, ["io.example/a", "io.example/b", "io.example/c"]);

    let metadata = list.metadata.unwrap();
    assert_eq!(metadata.next_cursor, None);
    assert_eq!(metadata.count, Some(1));

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.starts_with("/v0/servers?")));
    assert!(requests.iter().all(|r| query_param(r, "version") == Some("latest")));
}

#[tokio::test]
async fn starts_at_given_cursor() {
    let server = serve(|target| match query_param(target, "cursor") {
        Some("c2") => (200, page(&["io.example/c"], None)),
        _ => (200, page(&["io.example/a"], Some("c2"))),
    })
    .await;

    let list = client().list_servers(&server.base_url, Some("c2")).await.unwrap();
    assert_eq!(list.servers.len(), 1);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn repeated_cursor_stops_pagination() {
    let server = serve(|_| (200, page(&["io.example/loop"], Some("same")))).await;

    let list = client().list_servers(&server.base_url, None).await.unwrap();
    assert_eq!(list.servers.len(), 2);
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn one_failing_registry_does_not_hide_the_others() {
    let server = serve(|target| {
        if target.starts_with("/r2/") {
            (404, r#"{"error":"not found"}"#.to_string())
        } else if target.starts_with("/r1/") {
            (200, page(&["io.example/one"], None))
        } else {
            (200, page(&["io.example/three"], None))
        }
    })
    .await;

    let urls: Vec<String> = ["r1", "r2", "r3"]
        .iter()
        .map(|p| format!("{}/{}", server.base_url, p))
        .collect();
    let (servers, errors) = client().list_all_servers(&urls).await;

    let mut names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
    names.sort();
    assert_eq!(names, ["io.example/one", "io.example/three"]);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].registry(), Some(urls[1].as_str()));
    assert!(matches!(errors[0], DiscoveryError::Status { status, .. } if status.as_u16() == 404));
}

#[rstest]
#[case(404)]
#[case(500)]
#[case(503)]
#[tokio::test]
async fn non_success_status_is_an_error(#[case] status: u16) {
    let server = serve(move |_| (status, "{}".to_string())).await;

    let err = client().list_registry(&server.base_url).await.unwrap_err();
    match err {
        DiscoveryError::Status { url, status: got } => {
            assert_eq!(url, server.base_url);
            assert_eq!(got.as_u16(), status);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_registry_is_a_request_error() {
    let err = client().list_registry("http://127.0.0.1:1").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Request { .. }));
}

#[tokio::test]
async fn server_ids_are_stable_across_listings() {
    let server = serve(|_| (200, page(&["io.example/x"], None))).await;
    let client = client();

    let first = client.list_registry(&server.base_url).await.unwrap();
    let second = client.list_registry(&server.base_url).await.unwrap();
    assert_eq!(first[0].id, second[0].id);

    let expected = format!("{:x}", Sha256::digest(format!("{}::io.example/x", server.base_url)));
    assert_eq!(first[0].id, expected);
    assert_eq!(first[0].registry_url, server.base_url);
    assert!(first[0].valid_schema);
}

#[tokio::test]
async fn official_id_and_invalid_entries() {
    let body = json!({
        "servers": [
            {
                "server": {"name": "io.example/official", "description": "d", "version": "1"},
                "_meta": {"io.modelcontextprotocol.registry/official": {"id": "abc-123"}}
            },
            {
                "server": {"name": "no slash", "description": "d", "version": "1"},
                "_meta": {}
            },
            {"server": "not an object"}
        ]
    })
    .to_string();
    let server = serve(move |_| (200, body.clone())).await;

    let servers = client().list_registry(&server.base_url).await.unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0].id, "abc-123");
    assert!(servers[0].valid_schema);
    assert!(!servers[1].valid_schema);
}

#[tokio::test]
async fn find_server_searches_every_registry() {
    let server = serve(|target| {
        if target.starts_with("/a/") {
            (200, page(&["io.example/a"], None))
        } else {
            (200, page(&["io.example/b"], None))
        }
    })
    .await;
    let urls = vec![format!("{}/a", server.base_url), format!("{}/b", server.base_url)];
    let client = client();

    let all = client.list_registry(&urls[1]).await.unwrap();
    let found = client.find_server(&urls, &all[0].id).await.unwrap();
    assert_eq!(found.name, "io.example/b");

    let missing = client.find_server(&urls, "nope").await.unwrap_err();
    assert!(matches!(missing, DiscoveryError::ServerNotFound(id) if id == "nope"));
}

#[tokio::test]
async fn missing_server_with_failed_registry_reports_the_failure() {
    let server = serve(|target| {
        if target.starts_with("/down/") {
            (503, "{}".to_string())
        } else {
            (200, page(&["io.example/up"], None))
        }
    })
    .await;
    let urls = vec![format!("{}/up", server.base_url), format!("{}/down", server.base_url)];

    let err = client().find_server(&urls, "hosted-on-down").await.unwrap_err();
    match &err {
        DiscoveryError::Unavailable { server_id, failures } => {
            assert_eq!(server_id, "hosted-on-down");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].registry(), Some(urls[1].as_str()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains(&urls[1]));
}

#[tokio::test]
async fn details_from_a_cursor_keep_validity() {
    let body = json!({
        "servers": [
            {"server": {"name": "io.example/good", "description": "d", "version": "1"}},
            {"server": {"name": "no slash", "description": "d", "version": "1"}}
        ]
    })
    .to_string();
    let server = serve(move |_| (200, body.clone())).await;
    let client = client();

    let servers = client.list_details(&server.base_url, Some("c1")).await.unwrap();
    assert_eq!(server.requests().len(), 1);
    assert_eq!(query_param(&server.requests()[0], "cursor"), Some("c1"));
    assert!(servers[0].valid_schema);
    assert!(!servers[1].valid_schema);

    let listed = client.list_registry(&server.base_url).await.unwrap();
    assert_eq!(servers[0].id, listed[0].id);
}

#[tokio::test]
async fn trailing_slash_url_gives_catalog_ids() {
    use mcpreg::registries::normalize_url;

    let server = serve(|_| (200, page(&["io.example/x"], None))).await;
    let client = client();

    let with_slash = format!("{}/", server.base_url);
    let browsed = client.list_details(normalize_url(&with_slash), None).await.unwrap();
    let listed = client.list_registry(&server.base_url).await.unwrap();
    assert_eq!(browsed[0].id, listed[0].id);
    assert_eq!(browsed[0].registry_url, server.base_url);
}
