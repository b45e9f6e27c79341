use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method};
use futures::Stream;

use crate::error::Error;
use crate::extras::OperationExtras;
use crate::scm::Vcs;

/// Headers that must not be forwarded verbatim between the client and the
/// proxied VCS server.
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "keep-alive",
    "content-encoding",
    "transfer-encoding",
    "content-length",
];

/// A fully buffered inbound request, ready to hand to a sub-application.
/// Bodies are buffered (and gunzipped) by the dispatcher before any
/// classification happens.
#[derive(Debug)]
pub struct ForwardedRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// The first phase of a sub-application's response: status and headers are
/// read eagerly, so every rejection happens before a single body byte goes
/// back to the client. The body is relayed only once [`UpstreamBody::stream`]
/// is called.
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamBody,
}

/// The unread body of an upstream response.
pub struct UpstreamBody {
    reader: Box<dyn Read + Send + 'static>,
}

impl UpstreamBody {
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::from_reader(io::Cursor::new(bytes))
    }

    /// Second phase of the response: relays the upstream bytes to the
    /// client, chunk by chunk. `on_done` runs once the relay stops, whether
    /// the upstream was drained, errored, or the client went away, and
    /// strictly before the returned body reports its end.
    pub fn stream(self, on_done: impl FnOnce() + Send + 'static) -> Body {
        let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(1);
        let mut reader = self.reader;

        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                            // Client went away mid-stream.
                            break;
                        }
                    }
                    Err(err) => {
                        tx.blocking_send(Err(err)).ok();
                        break;
                    }
                }
            }
            on_done();
        });

        Body::from_stream(UpstreamStream { rx })
    }
}

/// Adapter between the relay thread and the response body.
struct UpstreamStream {
    rx: tokio::sync::mpsc::Receiver<io::Result<Bytes>>,
}

impl Stream for UpstreamStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Delegates Git and Mercurial smart HTTP calls to the VCS execution
/// service, carrying the serialized operation extras in a request header.
pub struct ServiceApp {
    base_url: String,
    scm: Vcs,
    repo_name: String,
    extras: OperationExtras,
}

impl ServiceApp {
    pub const EXTRAS_HEADER: &'static str = "X-Gateway-Extras";

    pub fn new(base_url: String, scm: Vcs, repo_name: String, extras: OperationExtras) -> Self {
        Self {
            base_url,
            scm,
            repo_name,
            extras,
        }
    }

    fn url(&self, req: &ForwardedRequest) -> String {
        let marker = format!("/{}/", self.repo_name);
        let tail = match req.path.find(&marker) {
            Some(pos) => &req.path[pos + marker.len() - 1..],
            None => req.path.as_str(),
        };
        let mut url = format!(
            "{}/{}/{}{}",
            self.base_url.trim_end_matches('/'),
            self.scm,
            self.repo_name,
            tail,
        );
        if !req.query.is_empty() {
            url.push('?');
            url.push_str(&req.query);
        }
        url
    }

    pub fn handle(&self, req: &ForwardedRequest) -> Result<ProxiedResponse, Error> {
        let url = self.url(req);
        tracing::debug!("delegating {} `{}` to `{}`", req.method, req.path, url);

        let mut outbound = ureq::request(req.method.as_str(), &url);
        for (name, value) in filtered_request_headers(&req.headers) {
            outbound = outbound.set(&name, &value);
        }
        outbound = outbound.set(Self::EXTRAS_HEADER, &self.extras.encoded());

        read_response(outbound.send_bytes(&req.body))
    }
}

/// Request headers safe to forward upstream.
pub fn filtered_request_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != "host" && !HOP_BY_HOP.contains(&name)
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect()
}

/// Reads the status and headers of a ureq response (including non-2xx
/// statuses, which ureq reports as errors), leaving the body unread so it
/// can be streamed.
pub fn read_response(
    result: Result<ureq::Response, ureq::Error>,
) -> Result<ProxiedResponse, Error> {
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(ureq::Error::Transport(err)) => {
            return Err(Error::Backend(err.to_string()));
        }
    };

    let status = response.status();
    let mut headers = Vec::new();
    for name in response.headers_names() {
        if HOP_BY_HOP.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        for value in response.all(&name) {
            headers.push((name.clone(), value.to_owned()));
        }
    }

    Ok(ProxiedResponse {
        status,
        headers,
        body: UpstreamBody::from_reader(response.into_reader()),
    })
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use axum::http::{HeaderMap, Method};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::scm::Vcs;

    #[test]
    fn test_service_url() {
        let app = ServiceApp::new(
            "http://localhost:9900/".to_owned(),
            Vcs::Git,
            "teams/alpha".to_owned(),
            OperationExtras::default(),
        );
        let req = ForwardedRequest {
            method: Method::GET,
            path: "/teams/alpha/info/refs".to_owned(),
            query: "service=git-upload-pack".to_owned(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        };
        assert_eq!(
            app.url(&req),
            "http://localhost:9900/git/teams/alpha/info/refs?service=git-upload-pack"
        );
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "application/x-git-upload-pack-request".parse().unwrap());
        headers.insert("Transfer-Encoding", "chunked".parse().unwrap());
        headers.insert("Host", "gateway.example.com".parse().unwrap());

        let filtered = filtered_request_headers(&headers);
        assert_eq!(
            filtered,
            vec![(
                "content-type".to_owned(),
                "application/x-git-upload-pack-request".to_owned()
            )]
        );
    }

    #[tokio::test]
    async fn test_upstream_body_streams_and_signals_completion() {
        let done = Arc::new(AtomicBool::new(false));
        let signal = done.clone();

        let body = UpstreamBody::from_bytes(b"0008NAK\n".to_vec())
            .stream(move || signal.store(true, Ordering::SeqCst));
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();

        assert_eq!(&bytes[..], b"0008NAK\n");
        // The body only reports its end after the completion callback ran.
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_upstream_body_relays_large_payloads_in_chunks() {
        let payload = vec![0x42u8; 100_000];
        let body = UpstreamBody::from_reader(io::Cursor::new(payload.clone())).stream(|| {});
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();

        assert_eq!(bytes.len(), payload.len());
        assert_eq!(&bytes[..], &payload[..]);
    }
}
