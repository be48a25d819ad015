//! Consul client against a mock agent.

use consul_notifier::registry::{Registry, RegistryError};
use consul_notifier::{startup, ConsulClient};
use notifier_reconcile::{extract, Registration, ServiceDescriptor, ServiceId};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registration() -> Registration {
    extract(
        &ServiceDescriptor::new("svc_web", "web")
            .with_env("CONSUL_SERVICE_PORT", "8080")
            .with_env("CONSUL_HEALTH_CHECK", "ready"),
    )
    .unwrap()
}

#[tokio::test]
async fn test_register_sends_agent_payload() {
    let server = MockServer::start().await;
    let registration = registration();
    let client = ConsulClient::new(&server.uri(), Some("secret".into()), "10.0.0.7").unwrap();

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(header("X-Consul-Token", "secret"))
        .and(body_partial_json(json!({
            "ID": "svc_web",
            "Name": "web",
            "Address": "10.0.0.7",
            "Port": 8080,
            "Tags": ["consul-notifier"],
            "Meta": {
                "managed-by": "consul-notifier",
                "spec-hash": client.fingerprint(&registration).to_string(),
            },
            "Check": {
                "HTTP": "http://10.0.0.7:8080/ready",
                "Interval": "10s",
                "TLSSkipVerify": false,
            },
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client.register_service(&registration).await.unwrap();
}

#[tokio::test]
async fn test_deregister_uses_service_id() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/svc_web"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = ConsulClient::new(&server.uri(), None, "10.0.0.7").unwrap();
    client
        .deregister_service(&ServiceId::new("svc_web"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_returns_only_managed_services() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/agent/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "svc_b": {
                "ID": "svc_b",
                "Service": "b",
                "Meta": {"managed-by": "consul-notifier", "spec-hash": "sha256:abcd"}
            },
            "svc_a": {
                "ID": "svc_a",
                "Service": "a",
                "Meta": {"managed-by": "consul-notifier"}
            },
            "consul": {
                "ID": "consul",
                "Service": "consul",
                "Meta": {}
            },
            "redis": {
                "ID": "redis",
                "Service": "redis"
            }
        })))
        .mount(&server)
        .await;

    let client = ConsulClient::new(&server.uri(), None, "10.0.0.7").unwrap();
    let entries = client.list_registered_services().await.unwrap();

    let ids: Vec<&str> = entries.iter().map(|e| e.service_id.as_str()).collect();
    assert_eq!(ids, vec!["svc_a", "svc_b"]);
    assert!(entries[0].spec_hash.is_none());
    assert_eq!(
        entries[1].spec_hash.as_ref().map(|h| h.as_str()),
        Some("sha256:abcd")
    );
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(500).set_body_string("agent unavailable"))
        .mount(&server)
        .await;

    let client = ConsulClient::new(&server.uri(), None, "10.0.0.7").unwrap();
    let err = client.register_service(&registration()).await.unwrap_err();

    match err {
        RegistryError::Api { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "agent unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_agent_is_http_error() {
    // Bind and release a port so nothing is listening on it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = ConsulClient::new(&format!("http://127.0.0.1:{port}"), None, "10.0.0.7").unwrap();
    let err = client.list_registered_services().await.unwrap_err();
    assert!(matches!(err, RegistryError::Http(_)));
}

#[tokio::test]
async fn test_startup_reregisters_after_address_change() {
    let server = MockServer::start().await;
    let registration = registration();
    let previous = ConsulClient::new(&server.uri(), None, "10.0.0.1").unwrap();
    let client = ConsulClient::new(&server.uri(), None, "10.0.0.2").unwrap();

    Mock::given(method("GET"))
        .and(path("/v1/agent/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "svc_web": {
                "ID": "svc_web",
                "Service": "web",
                "Address": "10.0.0.1",
                "Meta": {
                    "managed-by": "consul-notifier",
                    "spec-hash": previous.fingerprint(&registration).to_string(),
                }
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(body_partial_json(json!({
            "ID": "svc_web",
            "Address": "10.0.0.2",
            "Check": {"HTTP": "http://10.0.0.2:8080/ready"},
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let services = vec![ServiceDescriptor::new("svc_web", "web")
        .with_env("CONSUL_SERVICE_PORT", "8080")
        .with_env("CONSUL_HEALTH_CHECK", "ready")];
    let registered = client.list_registered_services().await.unwrap();

    let report = startup::reconcile(&services, &registered, &client).await;

    assert_eq!(report.registered, 1);
    assert_eq!(report.failed, 0);
}
