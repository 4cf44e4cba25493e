//! Minimal HTTP server for responses wiremock cannot produce, such as a body
//! that stops before its declared length.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone)]
pub struct RawResponse(String);

impl RawResponse {
    pub fn complete(content_type: &str, body: &str) -> Self {
        Self::with_length(content_type, body, body.len())
    }

    /// Announces more bytes than it sends, then closes the connection.
    pub fn truncated(content_type: &str, body: &str) -> Self {
        Self::with_length(content_type, body, body.len() + 1024)
    }

    fn with_length(content_type: &str, body: &str, length: usize) -> Self {
        Self(format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            content_type, length, body
        ))
    }
}

/// Serves each request with the response registered for its path and returns the base URL.
pub async fn serve(routes: Vec<(&'static str, RawResponse)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let routes = routes.clone();
            tokio::spawn(async move {
                let path = read_request_path(&mut socket).await;
                if let Some((_, response)) = routes.iter().find(|(route, _)| path.starts_with(route)) {
                    let _ = socket.write_all(response.0.as_bytes()).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    base
}

// Reads the head and any body so the client is never cut off mid-request
async fn read_request_path(socket: &mut TcpStream) -> String {
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return String::new();
        }
        received.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&received[..head_end]).into_owned();
    let body_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while received.len() < head_end + 4 + body_length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n]);
    }

    head.split_whitespace().nth(1).unwrap_or_default().to_string()
}
