//! Canned HTTP responder for client tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;

/// A request as seen by the responder.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    /// Path and query.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Default)]
struct MockState {
    responses: Mutex<VecDeque<(u16, String)>>,
    requests: Mutex<Vec<Recorded>>,
}

/// Serves `responses` in order, one per request, whatever the route, and
/// records every request. Runs out with a 500.
pub struct MockHttp {
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockHttp {
    pub async fn start(responses: Vec<(u16, String)>) -> Self {
        let state = Arc::new(MockState {
            responses: Mutex::new(responses.into()),
            requests: Mutex::default(),
        });
        let app = Router::new().fallback(respond).with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn respond(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.requests.lock().unwrap().push(Recorded {
        method,
        uri: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    let next = state.responses.lock().unwrap().pop_front();
    let (status, body) = next.unwrap_or((500, "no canned response left".to_string()));
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunked_body_is_recorded_whole() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = MockHttp::start(vec![(201, r#"{"ok": true}"#.into())]).await;
        let addr = server.base_url.trim_start_matches("http://");
        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = "POST /upload?x=1 HTTP/1.1\r\n\
                       Host: localhost\r\n\
                       Authorization: Bearer t\r\n\
                       Transfer-Encoding: chunked\r\n\
                       Connection: close\r\n\r\n\
                       9\r\n{\"part\": \r\n\
                       7\r\n\"one\", \r\n\
                       a\r\n\"rest\": 2}\r\n\
                       0\r\n\r\n";
        socket.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        socket.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 201"), "{}", response);

        let requests = server.recorded();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::POST);
        assert_eq!(requests[0].uri, "/upload?x=1");
        assert_eq!(requests[0].header("authorization"), Some("Bearer t"));
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["part"], "one");
        assert_eq!(body["rest"], 2);
    }

    #[tokio::test]
    async fn test_exhausted_responses_are_server_errors() {
        let server = MockHttp::start(Vec::new()).await;
        let response = reqwest::get(format!("{}/anything", server.base_url)).await.unwrap();
        assert_eq!(response.status().as_u16(), 500);
        assert_eq!(server.recorded().len(), 1);
    }
}
