//! Mock apiserver used by controller tests.
use std::sync::Arc;

use anyhow::Result;
use hyper::{body::to_bytes, Body};
use kube::{error::ErrorResponse, Client};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use crate::{keyring::CephAuth, utils::Context};

/// Handle of the mock apiserver side of a test client.
pub type ApiServerHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;
type SendResponse = tower_test::mock::SendResponse<http::Response<Body>>;

/// Serves the requests of a reconcile in the order the controller makes them.
pub struct ApiServerVerifier(ApiServerHandle);

// Add test specific implementation to the Context
impl<A> Context<A>
where
    A: CephAuth,
{
    /// Create a test context with a mocked kube client and ceph auth backend.
    pub fn test(ceph_auth: A) -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) =
            tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
        let mock_k_client = Client::new(mock_service, "default");
        let ctx = Self::new(mock_k_client, ceph_auth);
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}

/// Await the mock apiserver task, failing after one second.
pub async fn timeout_after_1s<T>(handle: tokio::task::JoinHandle<T>) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("stub succeeded")
}

/// A request received by the mock apiserver.
#[derive(Debug)]
pub struct Request {
    /// HTTP method.
    pub method: String,
    /// Request path without the query.
    pub path: String,
    /// Query string without a leading `&`.
    pub query: String,
    /// Decoded body, null when empty.
    pub body: serde_json::Value,
}

impl Request {
    async fn from_request(request: http::Request<Body>) -> Result<Self> {
        let method = request.method().to_string();
        let path = request.uri().path().to_owned();
        // List params are appended to an empty query, i.e. `?&labelSelector=..`.
        let query = request
            .uri()
            .query()
            .unwrap_or_default()
            .trim_start_matches('&')
            .to_owned();
        let body_bytes = to_bytes(request.into_body()).await?;
        let body = if body_bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body_bytes)?
        };
        Ok(Self {
            method,
            path,
            query,
            body,
        })
    }

    /// Decode the request body.
    pub fn body_as<T: DeserializeOwned>(&self) -> T {
        serde_json::from_value(self.body.clone()).expect("request body should decode")
    }
}

fn json_response(status: u16, body: &impl Serialize) -> http::Response<Body> {
    http::Response::builder()
        .status(status)
        .body(Body::from(
            serde_json::to_vec(body).expect("response should serialize"),
        ))
        .expect("response should build")
}

fn error_response(code: u16, reason: &str) -> http::Response<Body> {
    let error = ErrorResponse {
        status: "Failure".to_owned(),
        code,
        message: "stub message".to_owned(),
        reason: reason.to_owned(),
    };
    json_response(code, &error)
}

impl ApiServerVerifier {
    async fn next(&mut self, method: &str, path: &str) -> (Request, SendResponse) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        let request = Request::from_request(request)
            .await
            .expect("request should be readable");
        assert_eq!(
            (request.method.as_str(), request.path.as_str()),
            (method, path),
            "unexpected request {request:?}"
        );
        (request, send)
    }

    /// Reply to a GET with an object.
    pub async fn handle_get(&mut self, path: &str, object: &impl Serialize) -> Request {
        let (request, send) = self.next("GET", path).await;
        send.send_response(json_response(200, object));
        request
    }

    /// Reply to a list request.
    pub async fn handle_list<T: Serialize>(
        &mut self,
        path: &str,
        api_version: &str,
        kind: &str,
        items: &[T],
    ) -> Request {
        let (request, send) = self.next("GET", path).await;
        let list = json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "resourceVersion": "1" },
            "items": items,
        });
        send.send_response(json_response(200, &list));
        request
    }

    /// Reply with a 404 NotFound error.
    pub async fn handle_not_found(&mut self, method: &str, path: &str) -> Request {
        let (request, send) = self.next(method, path).await;
        send.send_response(error_response(404, "NotFound"));
        request
    }

    /// Reply with a 409 Conflict error.
    pub async fn handle_conflict(&mut self, method: &str, path: &str) -> Request {
        let (request, send) = self.next(method, path).await;
        send.send_response(error_response(409, "Conflict"));
        request
    }

    /// Reply to a DELETE with the deleted object.
    pub async fn handle_delete(&mut self, path: &str, deleted: &impl Serialize) -> Request {
        let (request, send) = self.next("DELETE", path).await;
        send.send_response(json_response(200, deleted));
        request
    }

    /// Reply to a server side apply with the applied object at `resource_version`.
    pub async fn handle_apply(&mut self, path: &str, resource_version: &str) -> Request {
        let (request, send) = self.next("PATCH", path).await;
        let mut applied = request.body.clone();
        applied["metadata"]["resourceVersion"] = json!(resource_version);
        send.send_response(json_response(200, &applied));
        request
    }

    /// Reply to a status replacement by echoing the object.
    pub async fn handle_replace_status(&mut self, path: &str) -> Request {
        let (request, send) = self.next("PUT", path).await;
        send.send_response(json_response(200, &request.body));
        request
    }

    /// Reply to an event creation by echoing the event.
    pub async fn handle_event(&mut self, ns: &str) -> Request {
        let path = format!("/apis/events.k8s.io/v1/namespaces/{ns}/events");
        let (request, send) = self.next("POST", &path).await;
        send.send_response(json_response(201, &request.body));
        request
    }

    /// Reply to a server version request.
    pub async fn handle_version(&mut self, git_version: &str) -> Request {
        let mut parts = git_version.trim_start_matches('v').split('.');
        let major = parts.next().unwrap_or_default();
        let minor = parts.next().unwrap_or_default();
        let info = json!({
            "major": major,
            "minor": minor,
            "gitVersion": git_version,
            "gitCommit": "",
            "gitTreeState": "clean",
            "buildDate": "",
            "goVersion": "go1.20",
            "compiler": "gc",
            "platform": "linux/amd64",
        });
        let (request, send) = self.next("GET", "/version").await;
        send.send_response(json_response(200, &info));
        request
    }

    /// Fail if the controller made any request that was not served.
    pub async fn assert_no_more_requests(mut self) {
        let next = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            self.0.next_request(),
        )
        .await;
        if let Ok(Some((request, _))) = next {
            panic!(
                "unexpected request {} {}",
                request.method(),
                request.uri()
            );
        }
    }
}
