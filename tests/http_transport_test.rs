//! Wiremock tests for the HTTP transport and its use by the client.
#![cfg(feature = "http")]

use std::sync::Arc;
use std::time::Duration;

use repsync::traits::{PersistentStore, Transport};
use repsync::transport::HttpTransport;
use repsync::{
    EntityRef, FetchCandidate, FetchConfig, FetchOutcome, MemoryStore, Request,
    ResourceDescriptor, SyncClient, SyncError, TransportConfig,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::new(server.uri()).unwrap()
}

#[tokio::test]
async fn read_sends_params_as_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/workouts"))
        .and(query_param("page", "2"))
        .and(query_param("status", "completed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = ResourceDescriptor::new("workouts")
        .param("page", 2)
        .param("status", "completed");
    let value = transport(&server)
        .perform(&Request::Read(descriptor))
        .await
        .unwrap();
    assert_eq!(value, json!([{"id": 1}]));
}

#[tokio::test]
async fn entity_read_puts_id_in_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/goal/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"target": 10})))
        .mount(&server)
        .await;

    let entity = EntityRef::new("goal", "7");
    let value = transport(&server)
        .perform(&Request::Read(ResourceDescriptor::entity(&entity)))
        .await
        .unwrap();
    assert_eq!(value, json!({"target": 10}));
}

#[tokio::test]
async fn write_puts_desired_state_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/goal/7"))
        .and(header("authorization", "Bearer tok-123"))
        .and(body_json(json!({"target": 12})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"target": 12, "v": 2})))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    store.set("auth_token", "tok-123").unwrap();
    let transport = transport(&server).with_store(store);

    let value = transport
        .perform(&Request::Write {
            entity: EntityRef::new("goal", "7"),
            body: json!({"target": 12}),
        })
        .await
        .unwrap();
    assert_eq!(value, json!({"target": 12, "v": 2}));
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() {
    let server = MockServer::start().await;
    for (route, status) in [("/a", 401u16), ("/b", 404), ("/c", 503)] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/d"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "message": "invalid",
            "errors": {"name": "required"}
        })))
        .mount(&server)
        .await;

    let transport = transport(&server);
    let fetch = |source: &str| Request::Fetch {
        source: source.to_string(),
    };

    assert_eq!(
        transport.perform(&fetch("a")).await.unwrap_err(),
        SyncError::Unauthorized
    );
    assert!(matches!(
        transport.perform(&fetch("b")).await.unwrap_err(),
        SyncError::NotFound(_)
    ));
    assert!(matches!(
        transport.perform(&fetch("c")).await.unwrap_err(),
        SyncError::ServerError { status: 503, .. }
    ));
    let SyncError::ValidationFailed { fields, .. } =
        transport.perform(&fetch("d")).await.unwrap_err()
    else {
        panic!("expected validation failure");
    };
    assert_eq!(fields["name"], "required");
}

#[tokio::test]
async fn empty_and_text_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/text"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let transport = transport(&server);
    let empty = transport
        .perform(&Request::Fetch {
            source: "/empty".into(),
        })
        .await
        .unwrap();
    assert!(empty.is_null());
    let text = transport
        .perform(&Request::Fetch {
            source: "text".into(),
        })
        .await
        .unwrap();
    assert_eq!(text, json!("hello"));
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let config = TransportConfig {
        base_url: Some(server.uri()),
        request_timeout: Duration::from_millis(100),
        ..TransportConfig::default()
    };
    let transport = HttpTransport::from_config(&config).unwrap();
    let err = transport
        .perform(&Request::Fetch {
            source: "slow".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::Timeout);
}

#[tokio::test]
async fn relative_source_without_base_url_is_rejected() {
    let transport = HttpTransport::from_config(&TransportConfig::default()).unwrap();
    let err = transport
        .perform(&Request::Fetch {
            source: "video.mp4".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Configuration(_)));
}

#[tokio::test]
async fn resilient_load_fails_over_between_servers() {
    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&broken)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"url": "ok"})))
        .mount(&healthy)
        .await;

    let client = SyncClient::builder()
        .transport(Arc::new(transport(&broken)))
        .build()
        .unwrap();
    let options = FetchConfig::new()
        .max_retries_per_candidate(1)
        .base_delay(Duration::from_millis(10));
    let session = client.load_resilient(
        FetchCandidate::ordered([
            format!("{}/media/1", broken.uri()),
            format!("{}/media/1", healthy.uri()),
        ]),
        Some(options),
    );

    let FetchOutcome::Ready { candidate, value } = session.wait().await else {
        panic!("expected the healthy server to answer");
    };
    assert_eq!(candidate.order, 1);
    assert_eq!(value, json!({"url": "ok"}));
}

#[tokio::test]
async fn ids_are_encoded_as_single_path_segments() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/goal/a%2Fb%3Fc%23d"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"target": 3})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/goal/a%2Fb%3Fc%23d"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server);
    let entity = EntityRef::new("goal", "a/b?c#d");
    let value = transport
        .perform(&Request::Read(ResourceDescriptor::entity(&entity)))
        .await
        .unwrap();
    assert_eq!(value, json!({"target": 3}));
    let written = transport
        .perform(&Request::Write {
            entity,
            body: json!({"target": 4}),
        })
        .await
        .unwrap();
    assert!(written.is_null());
}

#[tokio::test]
async fn nested_resource_keeps_its_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users/me/goals"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(format!("{}/api/", server.uri())).unwrap();
    let value = transport
        .perform(&Request::Read(ResourceDescriptor::new("users/me/goals")))
        .await
        .unwrap();
    assert_eq!(value, json!([]));
}

#[tokio::test]
async fn binary_body_is_a_data_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cover.jpg"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(vec![0xff, 0xd8, 0xff, 0xe0], "image/jpeg"),
        )
        .mount(&server)
        .await;

    let err = transport(&server)
        .perform(&Request::Fetch {
            source: "cover.jpg".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Data(_)), "got {err:?}");
}
