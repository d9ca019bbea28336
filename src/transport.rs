//! Fetching manifests and page payloads.
//!
//! The cache only talks to the [`Transport`] trait. [`HttpTransport`] is the
//! real implementation: a blocking `ureq` agent driven from
//! `tokio::task::spawn_blocking` so the cache never blocks its runtime.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::io::Read as _;
use url::Url;

use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::manifest::Manifest;

/// Largest page payload accepted (64MB).
const MAX_PAYLOAD_BYTES: u64 = 64 * 1024 * 1024;

/// Largest manifest accepted (8MB).
const MAX_MANIFEST_BYTES: u64 = 8 * 1024 * 1024;

/// Source of manifests and page payloads.
pub trait Transport: Send + Sync + 'static {
    /// GET a thread manifest.
    fn fetch_manifest(&self, locator: &str) -> BoxFuture<'static, Result<Manifest, FetchError>>;

    /// GET a page payload. Non-success statuses are errors.
    fn fetch_bytes(&self, locator: &str) -> BoxFuture<'static, Result<Vec<u8>, FetchError>>;
}

/// HTTP transport backed by a shared `ureq` agent.
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(cfg: &CacheConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(cfg.connect_timeout)
            .timeout_read(cfg.read_timeout)
            .redirects(8)
            .user_agent(concat!("pagecache/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Transport for HttpTransport {
    fn fetch_manifest(&self, locator: &str) -> BoxFuture<'static, Result<Manifest, FetchError>> {
        let agent = self.agent.clone();
        let locator = locator.to_string();
        async move {
            tokio::task::spawn_blocking(move || -> Result<Manifest, FetchError> {
                let body = get(&agent, &locator, Some("application/json"), MAX_MANIFEST_BYTES)?;
                let mut manifest =
                    Manifest::from_slice(&body).map_err(|e| FetchError::Decode {
                        locator: locator.clone(),
                        message: e.to_string(),
                    })?;
                // Page locators are relative to the manifest, like a browser
                // resolves them against the document.
                for page in &mut manifest.pages {
                    page.image_url = resolve(&locator, &page.image_url);
                }
                Ok(manifest)
            })
            .await
            .unwrap_or_else(|e| Err(FetchError::Task(e.to_string())))
        }
        .boxed()
    }

    fn fetch_bytes(&self, locator: &str) -> BoxFuture<'static, Result<Vec<u8>, FetchError>> {
        let agent = self.agent.clone();
        let locator = locator.to_string();
        async move {
            tokio::task::spawn_blocking(move || get(&agent, &locator, None, MAX_PAYLOAD_BYTES))
                .await
                .unwrap_or_else(|e| Err(FetchError::Task(e.to_string())))
        }
        .boxed()
    }
}

/// Blocking GET returning the body of a successful response.
fn get(
    agent: &ureq::Agent,
    locator: &str,
    accept: Option<&str>,
    limit: u64,
) -> Result<Vec<u8>, FetchError> {
    let mut request = agent.get(locator);
    if let Some(accept) = accept {
        request = request.set("Accept", accept);
    }

    let response = match request.call() {
        Ok(r) => r,
        Err(ureq::Error::Status(code, _)) => {
            return Err(FetchError::Status {
                locator: locator.to_string(),
                code,
            });
        }
        Err(e) => {
            return Err(FetchError::Network {
                locator: locator.to_string(),
                message: e.to_string(),
            });
        }
    };

    // One byte past the limit tells an oversized body from one that fits.
    let mut body = Vec::new();
    response
        .into_reader()
        .take(limit.saturating_add(1))
        .read_to_end(&mut body)
        .map_err(|e| FetchError::Network {
            locator: locator.to_string(),
            message: format!("Error reading body: {}", e),
        })?;
    if body.len() as u64 > limit {
        return Err(FetchError::Decode {
            locator: locator.to_string(),
            message: format!("payload exceeds {} bytes", limit),
        });
    }
    Ok(body)
}

/// Resolve `locator` against `base` the way a browser resolves a
/// reference against its document. Absolute locators pass through, and so
/// does everything when `base` is not a URL.
pub fn resolve(base: &str, locator: &str) -> String {
    match Url::parse(base).and_then(|base| base.join(locator)) {
        Ok(url) => url.into(),
        Err(_) => locator.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;

    /// Serve one canned response per connection, then stop.
    fn serve(responses: Vec<(u16, &'static str, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for (code, reason, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let head = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    code,
                    reason,
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
                let _ = stream.flush();
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_resolve() {
        let base = "https://comics.example/api/installment/4/pages.json?v=2";
        assert_eq!(
            resolve(base, "https://cdn.example/p1.png"),
            "https://cdn.example/p1.png"
        );
        assert_eq!(resolve(base, "//cdn.example/p1.png"), "https://cdn.example/p1.png");
        assert_eq!(
            resolve(base, "/media/p1.png"),
            "https://comics.example/media/p1.png"
        );
        assert_eq!(
            resolve(base, "p1.png"),
            "https://comics.example/api/installment/4/p1.png"
        );
        assert_eq!(resolve("https://comics.example", "p1.png"), "https://comics.example/p1.png");
        assert_eq!(resolve("not a url", "/a"), "/a");
    }

    #[test]
    fn test_resolve_dot_segments_and_queries() {
        let base = "https://comics.example/api/installment/4/pages.json";
        assert_eq!(
            resolve(base, "../p.png"),
            "https://comics.example/api/installment/p.png"
        );
        assert_eq!(
            resolve(base, "./p.png"),
            "https://comics.example/api/installment/4/p.png"
        );
        // A URL inside the query does not make the reference absolute.
        assert_eq!(
            resolve(base, "p.png?next=https://x"),
            "https://comics.example/api/installment/4/p.png?next=https://x"
        );
        assert_eq!(resolve(base, "blob:pagecache/1/1"), "blob:pagecache/1/1");
    }

    #[tokio::test]
    async fn test_fetch_manifest_resolves_pages() {
        let body = br#"{"pages":[{"image_url":"/media/a.png"},{"image_url":"b.png"}]}"#.to_vec();
        let base = serve(vec![(200, "OK", body)]);
        let transport = HttpTransport::new(&CacheConfig::default());

        let manifest = transport
            .fetch_manifest(&format!("{}/thread/7/", base))
            .await
            .unwrap();

        assert_eq!(manifest.pages[0].image_url, format!("{}/media/a.png", base));
        assert_eq!(manifest.pages[1].image_url, format!("{}/thread/7/b.png", base));
    }

    #[tokio::test]
    async fn test_fetch_bytes_and_status() {
        let base = serve(vec![
            (200, "OK", b"imagebytes".to_vec()),
            (404, "Not Found", b"missing".to_vec()),
        ]);
        let transport = HttpTransport::new(&CacheConfig::default());

        let bytes = transport.fetch_bytes(&format!("{}/a", base)).await.unwrap();
        assert_eq!(bytes, b"imagebytes");

        let err = transport.fetch_bytes(&format!("{}/b", base)).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { code: 404, .. }));
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let base = serve(vec![
            (200, "OK", b"imagebytes".to_vec()),
            (200, "OK", b"page".to_vec()),
        ]);
        let agent = ureq::AgentBuilder::new().build();

        let err = get(&agent, &format!("{}/big", base), None, 4).unwrap_err();
        match err {
            FetchError::Decode { message, .. } => assert_eq!(message, "payload exceeds 4 bytes"),
            other => panic!("expected Decode, got {:?}", other),
        }

        // Exactly at the limit is fine.
        let body = get(&agent, &format!("{}/fits", base), None, 4).unwrap();
        assert_eq!(body, b"page");
    }

    #[tokio::test]
    async fn test_bad_manifest_is_decode_error() {
        let base = serve(vec![(200, "OK", b"<html>".to_vec())]);
        let transport = HttpTransport::new(&CacheConfig::default());

        let err = transport.fetch_manifest(&base).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
