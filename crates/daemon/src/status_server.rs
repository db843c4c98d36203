//! Status HTTP Server
//!
//! Read-only JSON view of the queue and host for monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::status::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum StatusServerError {
    #[error("Failed to bind status endpoint: {0}")]
    Bind(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Serve `GET /status` on `addr` until `shutdown` fires.
pub async fn run_status_server(
    addr: &str,
    status: SharedStatus,
    shutdown: CancellationToken,
) -> Result<(), StatusServerError> {
    let app = create_status_router(status);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "status endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::StateReport;
    use crate::status::new_shared_status;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn fetch(status: SharedStatus, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = create_status_router(status)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let code = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (code, body.to_vec())
    }

    #[tokio::test]
    async fn test_get_status_returns_json() {
        let status = new_shared_status();
        {
            let mut snapshot = status.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.queue_len = 5;
            snapshot.counts.insert("queued".to_string(), 3);
            snapshot.counts.insert("running".to_string(), 2);
            snapshot.state = StateReport {
                running: true,
                parallelism: 2,
                progress: 0.5,
                ..StateReport::default()
            };
        }

        let (code, body) = fetch(status, "/status").await;
        assert_eq!(code, StatusCode::OK);
        let snapshot: StatusSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.queue_len, 5);
        assert_eq!(snapshot.counts.get("running"), Some(&2));
        assert!(snapshot.state.running);
    }

    #[tokio::test]
    async fn test_field_names() {
        let (_, body) = fetch(new_shared_status(), "/status").await;
        let text = String::from_utf8(body).unwrap();
        for field in ["timestamp_unix_ms", "state", "counts", "queue_len", "gpu", "system"] {
            assert!(text.contains(field), "missing {}", field);
        }
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (code, _) = fetch(new_shared_status(), "/metrics").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
