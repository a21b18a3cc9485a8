//! Integration tests for the HTTP byte store
//!
//! Tests HTTP client behavior using wiremock for request/response mocking.

use std::sync::Arc;

use serde_json::json;
use wiremock::{
    matchers::{body_bytes, body_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use devflow_store::config::{DatabaseConfig, RequestConfig};
use devflow_store::error::TransportError;
use devflow_store::storage::{AnswerStore, NewAnswer, SqliteStore};
use devflow_store::transport::{ByteStore, HttpByteStore, MemoryByteStore};

/// Create a test client pointing to mock server
fn create_test_store(base_url: &str, max_retries: u32) -> HttpByteStore {
    let request_config = RequestConfig {
        timeout_ms: 5000,
        max_retries,
        retry_delay_ms: 10,
    };

    HttpByteStore::new(base_url, request_config).expect("Failed to create client")
}

#[cfg(test)]
mod blob_tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_uses_health_endpoint() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        assert!(store.probe().await);
    }

    #[tokio::test]
    async fn test_probe_false_on_server_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        assert!(!store.probe().await);
    }

    #[tokio::test]
    async fn test_read_missing_blob_is_none() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        assert_eq!(store.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_empty_body_is_none() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        assert_eq!(store.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_returns_bytes() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"SQLite blob".to_vec()))
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        assert_eq!(store.read().await.unwrap(), Some(b"SQLite blob".to_vec()));
    }

    #[tokio::test]
    async fn test_write_puts_octet_stream() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/store"))
            .and(header("Content-Type", "application/octet-stream"))
            .and(body_bytes(b"payload".to_vec()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        store.write(b"payload").await.unwrap();
    }
}

#[cfg(test)]
mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(500).set_body_string("busy"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 2);
        assert!(store.write(b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(413).set_body_string("too large"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 3);
        match store.write(b"x").await {
            Err(TransportError::Api { status, message }) => {
                assert_eq!(status, 413);
                assert_eq!(message, "too large");
            }
            other => panic!("expected api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 2);
        assert!(matches!(
            store.read().await,
            Err(TransportError::Api { status: 502, .. })
        ));
    }
}

#[cfg(test)]
mod location_tests {
    use super::*;

    #[tokio::test]
    async fn test_get_location() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/config/location"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "location": "/srv/devflow.db" })),
            )
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        assert_eq!(
            store.configured_location().await.unwrap(),
            Some("/srv/devflow.db".to_string())
        );
    }

    #[tokio::test]
    async fn test_null_location_is_none() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/config/location"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "location": null })))
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        assert_eq!(store.configured_location().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_and_clear_location() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/config/location"))
            .and(body_json(json!({ "location": "/mnt/shared/devflow.db" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("DELETE"))
            .and(path("/config/location"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        store
            .set_configured_location("/mnt/shared/devflow.db")
            .await
            .unwrap();
        store.clear_configured_location().await.unwrap();
    }

    #[tokio::test]
    async fn test_location_remembered_after_backend_goes_away() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/config/location"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "location": "/srv/devflow.db" })),
            )
            .mount(&mock_server)
            .await;

        let store = create_test_store(&mock_server.uri(), 0);
        store.configured_location().await.unwrap();

        drop(mock_server);

        assert_eq!(
            store.configured_location().await.unwrap(),
            Some("/srv/devflow.db".to_string())
        );
    }
}

#[cfg(test)]
mod store_over_http_tests {
    use super::*;

    #[tokio::test]
    async fn test_store_persists_each_write_remotely() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("PUT"))
            .and(path("/store"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1..)
            .mount(&mock_server)
            .await;

        let cache = MemoryByteStore::new();
        let config = DatabaseConfig {
            path: dir.path().join("devflow.db"),
            max_connections: 1,
        };
        let transport: Arc<dyn ByteStore> = Arc::new(create_test_store(&mock_server.uri(), 0));
        let store = SqliteStore::open(&config, transport, Arc::new(cache.clone()))
            .await
            .unwrap();

        store
            .save_answer(&NewAnswer::new(
                "intent-summary-text",
                "DefiningIntent",
                "Reduce churn",
            ))
            .await
            .unwrap();

        // Mirrored into the cache alongside the remote write.
        assert!(cache.bytes().is_some());
        store.pool().close().await;
    }
}
