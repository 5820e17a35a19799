//! Minimal HTTP/1.1 framing for the peer plane, the health probes and the
//! fence drivers. Requests and responses carry fixed-length bodies only;
//! one request per connection, `Connection: close` semantics.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("malformed HTTP message")]
    Malformed,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("HTTP head too large")]
    HeadTooLarge,
    #[error("HTTP body too large")]
    BodyTooLarge,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        let (path, query) = split_query(&path.into());
        Self {
            method: "GET".to_string(),
            path,
            query,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn post_json(path: impl Into<String>, value: &impl Serialize) -> Self {
        let body = serde_json::to_vec(value).expect("json body");
        let (path, query) = split_query(&path.into());
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            method: "POST".to_string(),
            path,
            query,
            headers,
            body,
        }
    }

    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// The deliberately uninformative reply for anything unauthorised or
    /// unknown, so the plane does not disclose its endpoints.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn json(value: &impl Serialize) -> Self {
        let mut response = Self::ok();
        response.body = serde_json::to_vec(value).expect("json body");
        response
            .headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

fn split_query(raw: &str) -> (String, HashMap<String, String>) {
    match raw.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (raw.to_string(), HashMap::new()),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn render_query(query: &HashMap<String, String>) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<_> = query.iter().collect();
    pairs.sort();
    let joined: Vec<String> = pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("?{}", joined.join("&"))
}

/// Find the end of the head (`\r\n\r\n`) and the declared body length.
fn body_length(headers: &[httparse::Header<'_>]) -> Result<usize, HttpError> {
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            let text =
                std::str::from_utf8(header.value).map_err(|_| HttpError::InvalidContentLength)?;
            let length: usize = text
                .trim()
                .parse()
                .map_err(|_| HttpError::InvalidContentLength)?;
            if length > MAX_BODY_BYTES {
                return Err(HttpError::BodyTooLarge);
            }
            return Ok(length);
        }
    }
    Ok(0)
}

fn header_map(headers: &[httparse::Header<'_>]) -> HashMap<String, String> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

/// Server side: decodes [`Request`], encodes [`Response`].
#[derive(Debug, Default)]
pub struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Request::new(&mut headers);
        let head_len = match parsed.parse(src) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if src.len() > MAX_HEAD_BYTES {
                    return Err(HttpError::HeadTooLarge);
                }
                return Ok(None);
            }
            Err(_) => return Err(HttpError::Malformed),
        };
        let content_length = body_length(parsed.headers)?;
        if src.len() < head_len + content_length {
            return Ok(None);
        }
        let (path, query) = split_query(parsed.path.ok_or(HttpError::Malformed)?);
        let request = Request {
            method: parsed.method.ok_or(HttpError::Malformed)?.to_string(),
            path,
            query,
            headers: header_map(parsed.headers),
            body: src[head_len..head_len + content_length].to_vec(),
        };
        src.advance(head_len + content_length);
        Ok(Some(request))
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = HttpError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), HttpError> {
        dst.put(format!("HTTP/1.1 {} {}\r\n", item.status, item.reason).as_bytes());
        for (name, value) in &item.headers {
            dst.put(format!("{name}: {value}\r\n").as_bytes());
        }
        dst.put(format!("Content-Length: {}\r\n", item.body.len()).as_bytes());
        dst.put(&b"Connection: close\r\n\r\n"[..]);
        dst.put(&item.body[..]);
        Ok(())
    }
}

/// Client side: encodes [`Request`], decodes [`Response`].
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Encoder<Request> for ClientCodec {
    type Error = HttpError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), HttpError> {
        dst.put(
            format!(
                "{} {}{} HTTP/1.1\r\n",
                item.method,
                item.path,
                render_query(&item.query)
            )
            .as_bytes(),
        );
        for (name, value) in &item.headers {
            dst.put(format!("{name}: {value}\r\n").as_bytes());
        }
        dst.put(format!("Content-Length: {}\r\n", item.body.len()).as_bytes());
        dst.put(&b"Connection: close\r\n\r\n"[..]);
        dst.put(&item.body[..]);
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Response::new(&mut headers);
        let head_len = match parsed.parse(src) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if src.len() > MAX_HEAD_BYTES {
                    return Err(HttpError::HeadTooLarge);
                }
                return Ok(None);
            }
            Err(_) => return Err(HttpError::Malformed),
        };
        let content_length = body_length(parsed.headers)?;
        if src.len() < head_len + content_length {
            return Ok(None);
        }
        let response = Response {
            status: parsed.code.ok_or(HttpError::Malformed)?,
            reason: parsed.reason.unwrap_or("").to_string(),
            headers: header_map(parsed.headers),
            body: src[head_len..head_len + content_length].to_vec(),
        };
        src.advance(head_len + content_length);
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_both_codecs() {
        let request = Request::post_json("/add-peer?authKey=k", &serde_json::json!({"name": "ns3"}));
        let mut wire = BytesMut::new();
        ClientCodec.encode(request, &mut wire).unwrap();

        let decoded = ServerCodec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.method, "POST");
        assert_eq!(decoded.path, "/add-peer");
        assert_eq!(decoded.query.get("authKey").map(String::as_str), Some("k"));
        let body: serde_json::Value = decoded.json_body().unwrap();
        assert_eq!(body["name"], "ns3");
        assert!(wire.is_empty(), "decoder must consume the full message");
    }

    #[test]
    fn response_round_trips() {
        let mut wire = BytesMut::new();
        ServerCodec
            .encode(Response::json(&serde_json::json!({"ok": true})), &mut wire)
            .unwrap();
        let decoded = ClientCodec.decode(&mut wire).unwrap().unwrap();
        assert!(decoded.is_success());
        let body: serde_json::Value = decoded.json_body().unwrap();
        assert_eq!(body["ok"], true);
    }

    #[test]
    fn partial_input_asks_for_more() {
        let mut partial = BytesMut::from(&b"GET /state HTTP/1.1\r\nHost: x"[..]);
        assert!(ServerCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn body_waits_for_content_length() {
        let mut wire = BytesMut::from(&b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nab"[..]);
        assert!(ServerCodec.decode(&mut wire).unwrap().is_none());
        wire.put(&b"cde"[..]);
        let request = ServerCodec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(request.body, b"abcde");
    }

    #[test]
    fn oversized_content_length_is_rejected() {
        let mut wire = BytesMut::from(
            &b"POST /x HTTP/1.1\r\nContent-Length: 99999999\r\n\r\n"[..],
        );
        assert!(matches!(
            ServerCodec.decode(&mut wire),
            Err(HttpError::BodyTooLarge)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let mut wire = BytesMut::from(&b"\x00\x01\x02 nonsense\r\n\r\n"[..]);
        assert!(ServerCodec.decode(&mut wire).is_err());
    }
}
