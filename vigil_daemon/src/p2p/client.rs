//! One-shot HTTP client over a fresh TCP connection, used for peer
//! polling, propagation calls, HTTP health probes and the fence drivers.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::http::{ClientCodec, HttpError, Request, Response};

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("protocol error talking to {addr}: {source}")]
    Protocol {
        addr: SocketAddr,
        #[source]
        source: HttpError,
    },
    #[error("{addr} closed the connection before responding")]
    Closed { addr: SocketAddr },
    #[error("bad url {0:?}")]
    BadUrl(String),
}

/// Send one request and await the full response, bounded by `timeout`
/// (which covers connect, send and receive together).
pub async fn fetch(
    addr: SocketAddr,
    request: Request,
    timeout: Duration,
) -> Result<Response, FetchError> {
    let attempt = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| FetchError::Connect { addr, source })?;
        let mut framed = Framed::new(stream, ClientCodec);
        framed
            .send(request)
            .await
            .map_err(|source| FetchError::Protocol { addr, source })?;
        match framed.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(source)) => Err(FetchError::Protocol { addr, source }),
            None => Err(FetchError::Closed { addr }),
        }
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| FetchError::Timeout { addr, timeout })?
}

/// Split `http://host:port/path` into the socket address and the
/// path-with-query to request. The host part must be an address literal
/// or resolvable name; a missing port defaults to 80.
pub async fn resolve_url(url: &str) -> Result<(SocketAddr, String), FetchError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| FetchError::BadUrl(url.to_string()))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let with_port = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };
    let addr = tokio::net::lookup_host(&with_port)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| FetchError::BadUrl(url.to_string()))?;
    Ok((addr, path))
}

/// `GET` a plain-HTTP URL. Success means the response arrived, whatever
/// its status; callers inspect `is_success`.
pub async fn fetch_url(url: &str, timeout: Duration) -> Result<Response, FetchError> {
    let (addr, path) = resolve_url(url).await?;
    fetch(addr, Request::get(path), timeout).await
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn fetch_talks_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("GET /state HTTP/1.1\r\n"), "{head}");
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}")
                .await
                .unwrap();
        });

        let response = fetch(addr, Request::get("/state"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"{}");
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let err = fetch(addr, Request::get("/state"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn url_resolution_splits_authority_and_path() {
        let (addr, path) = resolve_url("http://127.0.0.1:8080/healthz?x=1").await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(path, "/healthz?x=1");

        let (addr, path) = resolve_url("http://127.0.0.1").await.unwrap();
        assert_eq!(addr.port(), 80);
        assert_eq!(path, "/");

        assert!(resolve_url("https://127.0.0.1/x").await.is_err());
    }
}
