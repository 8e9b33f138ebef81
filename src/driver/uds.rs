// Minimal HTTP/1.1 client for the hypervisor API socket.
//
// Firecracker's control API is plain HTTP over a Unix domain socket; one
// short-lived connection per request keeps this free of connection-pool
// state.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::DriverError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// PUT a JSON body to `path` on the API socket, expecting a 2xx answer.
pub async fn put_json(
    sock: &Path,
    path: &str,
    body: &serde_json::Value,
) -> Result<(), DriverError> {
    tokio::time::timeout(REQUEST_TIMEOUT, put_json_inner(sock, path, body))
        .await
        .map_err(|_| DriverError::Unreachable(format!("{}: request timed out", sock.display())))?
}

async fn put_json_inner(
    sock: &Path,
    path: &str,
    body: &serde_json::Value,
) -> Result<(), DriverError> {
    let stream = UnixStream::connect(sock)
        .await
        .map_err(|e| DriverError::Unreachable(format!("{}: {}", sock.display(), e)))?;

    let payload = body.to_string();
    let request = format!(
        "PUT {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        payload.len(),
        payload
    );

    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(request.as_bytes())
        .await
        .map_err(|e| DriverError::Unreachable(format!("{}: write: {}", sock.display(), e)))?;

    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| DriverError::Unreachable(format!("{}: read: {}", sock.display(), e)))?;

    let code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            DriverError::Unreachable(format!(
                "{}: malformed status line '{}'",
                sock.display(),
                status_line.trim()
            ))
        })?;

    if (200..300).contains(&code) {
        return Ok(());
    }

    // Drain the rest of the response for a usable error detail.
    let mut rest = String::new();
    while let Ok(n) = reader.read_line(&mut rest).await {
        if n == 0 {
            break;
        }
    }
    let detail = rest
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string();

    Err(DriverError::Configure {
        endpoint: path.to_string(),
        reason: format!("status {}: {}", code, detail),
    })
}

/// Wait for the backend to create its API socket after spawn.
pub async fn wait_for_socket(sock: &Path, timeout: Duration) -> Result<(), DriverError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if sock.exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DriverError::Unreachable(format!(
                "{}: socket did not appear within {:?}",
                sock.display(),
                timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
