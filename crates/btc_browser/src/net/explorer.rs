use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Public explorer used when no base URL is configured.
pub const DEFAULT_API_BASE: &str = "https://blockstream.info/api";

/// Deadline applied to one logical fetch when the caller does not pick one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Errors that can occur when talking to an Esplora-style block explorer.
///
/// The `Display` output is what ends up in front of the user, so it is kept short.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("failed to fetch {context}: {status}")]
    Http {
        context: &'static str,
        status: StatusCode,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid explorer URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_decode() {
            FetchError::InvalidResponse(e.to_string())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

/// A block as reported by the explorer. Identity is the hash in `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDetails {
    pub id: String,
    pub height: u64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_count: Option<u64>,
}

/// The latest block together with its predecessor, when the predecessor could be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPair {
    pub current: BlockDetails,
    pub previous: Option<BlockDetails>,
}

/// Wire shape of `GET /block/{hash}`. Some deployments spell the count `txCount`.
#[derive(Deserialize)]
struct RawBlock {
    id: String,
    height: u64,
    timestamp: i64,
    #[serde(default)]
    tx_count: Option<u64>,
    #[serde(default, rename = "txCount")]
    tx_count_alt: Option<u64>,
}

impl From<RawBlock> for BlockDetails {
    fn from(raw: RawBlock) -> Self {
        BlockDetails {
            id: raw.id,
            height: raw.height,
            timestamp: raw.timestamp,
            tx_count: raw.tx_count.or(raw.tx_count_alt),
        }
    }
}

/// Anything that can hand the sync store a fresh (current, previous) pair.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn latest_pair(&self) -> Result<BlockPair, FetchError>;
}

/// Minimal REST client for an Esplora-compatible explorer (Blockstream, mempool.space, ...).
///
/// Every public fetch runs under a single deadline covering all of its sub-requests.
#[derive(Clone)]
pub struct ExplorerClient {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl ExplorerClient {
    /// Creates a client for the given API base, e.g. `https://blockstream.info/api`.
    ///
    /// Only `http://` and `https://` URLs are accepted. A trailing `/` is ignored.
    pub fn new(base: &str) -> Result<Self, FetchError> {
        let url = Url::parse(base).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "http" | "https" if !url.cannot_be_a_base() => {}
            other => {
                return Err(FetchError::InvalidUrl(format!(
                    "unsupported scheme `{other}`"
                )));
            }
        }

        let client = Client::builder()
            .user_agent(concat!("btc-browser/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(ExplorerClient {
            client,
            base: url,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the deadline used by the [`BlockSource`] implementation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the tip height (`GET /blocks/tip/height`).
    pub async fn fetch_latest_block_height(&self, timeout: Duration) -> Result<u64, FetchError> {
        with_deadline(timeout, async {
            let text = self.get_text(&["blocks", "tip", "height"], "latest block height").await?;
            parse_height(&text)
        })
        .await
    }

    /// Resolves the tip hash and then fetches that block.
    pub async fn fetch_latest_block_details(
        &self,
        timeout: Duration,
    ) -> Result<BlockDetails, FetchError> {
        with_deadline(timeout, self.resolve_tip()).await
    }

    /// Fetches the tip and, best effort, the block right below it.
    ///
    /// Only failures resolving the tip are returned; a missing predecessor yields
    /// `previous: None`. Running out of time is always an error.
    pub async fn fetch_latest_and_previous_block_details(
        &self,
        timeout: Duration,
    ) -> Result<BlockPair, FetchError> {
        with_deadline(timeout, async {
            let current = self.resolve_tip().await?;
            let previous = match current.height.checked_sub(1) {
                Some(height) => self.previous_or_absent(height).await,
                None => None,
            };
            Ok::<_, FetchError>(BlockPair { current, previous })
        })
        .await
    }

    /// Fetches a block by hash (`GET /block/{hash}`).
    pub async fn fetch_block(&self, hash: &str) -> Result<BlockDetails, FetchError> {
        let res = self
            .client
            .get(self.endpoint(&["block", hash]))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(FetchError::Http {
                context: "block details",
                status: res.status(),
            });
        }
        let raw: RawBlock = res.json().await?;
        Ok(raw.into())
    }

    /// Returns the hash of the block at `height` (`GET /block-height/{height}`).
    pub async fn fetch_block_hash_at_height(&self, height: u64) -> Result<String, FetchError> {
        self.get_text(&["block-height", &height.to_string()], "block hash by height")
            .await
    }

    /// Hash lookup followed by block lookup for `height`.
    pub async fn fetch_block_at_height(&self, height: u64) -> Result<BlockDetails, FetchError> {
        let hash = self.fetch_block_hash_at_height(height).await?;
        self.fetch_block(&hash).await
    }

    /// Degrades any failure looking up the predecessor to `None`.
    async fn previous_or_absent(&self, height: u64) -> Option<BlockDetails> {
        match self.fetch_block_at_height(height).await {
            Ok(block) => Some(block),
            Err(e) => {
                warn!("previous block at height {height} unavailable: {e}");
                None
            }
        }
    }

    async fn resolve_tip(&self) -> Result<BlockDetails, FetchError> {
        let hash = self.get_text(&["blocks", "tip", "hash"], "latest block hash").await?;
        debug!("tip hash {hash}");
        let block = self.fetch_block(&hash).await?;
        debug!("tip height {}", block.height);
        Ok(block)
    }

    async fn get_text(
        &self,
        segments: &[&str],
        context: &'static str,
    ) -> Result<String, FetchError> {
        let res = self.client.get(self.endpoint(segments)).send().await?;
        if !res.status().is_success() {
            return Err(FetchError::Http {
                context,
                status: res.status(),
            });
        }
        Ok(res.text().await?.trim().to_string())
    }

    /// Appends percent-encoded segments to the base, so a hash from the wire stays one segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // http(s) bases always have a path, checked in `new`
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl BlockSource for ExplorerClient {
    async fn latest_pair(&self) -> Result<BlockPair, FetchError> {
        self.fetch_latest_and_previous_block_details(self.timeout)
            .await
    }
}

/// Runs `fut` under one deadline; whichever sub-request is in flight when it fires is dropped.
async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| FetchError::Timeout)?
}

fn parse_height(text: &str) -> Result<u64, FetchError> {
    text.trim()
        .parse::<u64>()
        .map_err(|_| FetchError::InvalidResponse(format!("invalid block height `{text}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Mock, Server, ServerGuard};
    use std::io::Write;
    use std::net::TcpListener;

    fn localhost_binding_permitted() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn block_json(id: &str, height: u64, timestamp: i64, tx_count: u64) -> String {
        format!(r#"{{"id":"{id}","height":{height},"timestamp":{timestamp},"tx_count":{tx_count},"size":1234}}"#)
    }

    async fn mock_tip(server: &mut ServerGuard, hash: &str, body: String) -> (Mock, Mock) {
        let tip = server
            .mock("GET", "/blocks/tip/hash")
            .with_status(200)
            .with_body(hash)
            .create_async()
            .await;
        let block = server
            .mock("GET", format!("/block/{hash}").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;
        (tip, block)
    }

    #[test]
    fn parse_height_accepts_whitespace_and_rejects_garbage() {
        assert_eq!(parse_height(" 870000\n").unwrap(), 870_000);
        assert!(matches!(
            parse_height("not-a-number"),
            Err(FetchError::InvalidResponse(_))
        ));
        assert!(matches!(parse_height("-1"), Err(FetchError::InvalidResponse(_))));
    }

    #[test]
    fn raw_block_prefers_tx_count_over_alternate_spelling() {
        let raw: RawBlock =
            serde_json::from_str(r#"{"id":"x","height":1,"timestamp":2,"tx_count":3,"txCount":9}"#)
                .unwrap();
        assert_eq!(BlockDetails::from(raw).tx_count, Some(3));

        let raw: RawBlock =
            serde_json::from_str(r#"{"id":"x","height":1,"timestamp":2,"txCount":9}"#).unwrap();
        assert_eq!(BlockDetails::from(raw).tx_count, Some(9));

        let raw: RawBlock = serde_json::from_str(r#"{"id":"x","height":1,"timestamp":2}"#).unwrap();
        assert_eq!(BlockDetails::from(raw).tx_count, None);
    }

    #[test]
    fn new_rejects_non_http_urls_and_strips_trailing_slash() {
        assert!(matches!(
            ExplorerClient::new("ftp://example.com"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            ExplorerClient::new("not a url"),
            Err(FetchError::InvalidUrl(_))
        ));
        let client = ExplorerClient::new("https://blockstream.info/api/").unwrap();
        assert_eq!(client.base(), "https://blockstream.info/api");
    }

    #[test]
    fn endpoint_keeps_base_path_and_escapes_segments() {
        let client = ExplorerClient::new("https://mempool.space/api/").unwrap();
        assert_eq!(
            client.endpoint(&["blocks", "tip", "hash"]).as_str(),
            "https://mempool.space/api/blocks/tip/hash"
        );
        assert_eq!(
            client.endpoint(&["block", "ab/cd?x#y"]).as_str(),
            "https://mempool.space/api/block/ab%2Fcd%3Fx%23y"
        );
    }

    #[test]
    fn http_error_message_names_the_step_and_status() {
        let err = FetchError::Http {
            context: "latest block hash",
            status: StatusCode::SERVICE_UNAVAILABLE,
        };
        assert_eq!(
            err.to_string(),
            "failed to fetch latest block hash: 503 Service Unavailable"
        );
    }

    #[tokio::test]
    async fn latest_height_parses_plain_text() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/blocks/tip/height")
            .with_status(200)
            .with_body("870123")
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let height = client.fetch_latest_block_height(DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(height, 870_123);
    }

    #[tokio::test]
    async fn latest_height_rejects_non_numeric_body() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/blocks/tip/height")
            .with_status(200)
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let err = client
            .fetch_latest_block_height(DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn latest_height_surfaces_http_status() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/blocks/tip/height")
            .with_status(502)
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let err = client
            .fetch_latest_block_height(DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::Http {
                context: "latest block height",
                status: StatusCode::BAD_GATEWAY,
            }
        );
    }

    #[tokio::test]
    async fn latest_details_maps_alternate_tx_count_field() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _tip = mock_tip(
            &mut server,
            "00aa",
            r#"{"id":"00aa","height":12,"timestamp":1700000000,"txCount":42}"#.to_string(),
        )
        .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let block = client
            .fetch_latest_block_details(DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(
            block,
            BlockDetails {
                id: "00aa".into(),
                height: 12,
                timestamp: 1_700_000_000,
                tx_count: Some(42),
            }
        );
    }

    #[tokio::test]
    async fn latest_details_fails_when_block_lookup_fails() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _hash = server
            .mock("GET", "/blocks/tip/hash")
            .with_status(200)
            .with_body("00bb")
            .create_async()
            .await;
        let _block = server
            .mock("GET", "/block/00bb")
            .with_status(404)
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let err = client
            .fetch_latest_block_details(DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::Http {
                context: "block details",
                status: StatusCode::NOT_FOUND,
            }
        );
    }

    #[tokio::test]
    async fn pair_resolves_both_blocks() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _tip = mock_tip(&mut server, "bbbb", block_json("bbbb", 101, 1_700_000_600, 2500)).await;
        let _prev_hash = server
            .mock("GET", "/block-height/100")
            .with_status(200)
            .with_body("aaaa\n")
            .create_async()
            .await;
        let _prev = server
            .mock("GET", "/block/aaaa")
            .with_status(200)
            .with_body(block_json("aaaa", 100, 1_700_000_000, 2000))
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let pair = client
            .fetch_latest_and_previous_block_details(DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(pair.current.id, "bbbb");
        let previous = pair.previous.expect("previous block");
        assert_eq!(previous.id, "aaaa");
        assert_eq!(previous.height, pair.current.height - 1);
    }

    #[tokio::test]
    async fn pair_degrades_when_previous_hash_is_unknown() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _tip = mock_tip(&mut server, "cccc", block_json("cccc", 50, 1_700_000_000, 7)).await;
        let _prev_hash = server
            .mock("GET", "/block-height/49")
            .with_status(404)
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let pair = client
            .fetch_latest_and_previous_block_details(DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(pair.current.height, 50);
        assert!(pair.previous.is_none());
    }

    #[tokio::test]
    async fn pair_degrades_when_previous_block_lookup_fails() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _tip = mock_tip(&mut server, "dddd", block_json("dddd", 8, 1_700_000_000, 1)).await;
        let _prev_hash = server
            .mock("GET", "/block-height/7")
            .with_status(200)
            .with_body("eeee")
            .create_async()
            .await;
        let _prev = server
            .mock("GET", "/block/eeee")
            .with_status(500)
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let pair = client
            .fetch_latest_and_previous_block_details(DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert!(pair.previous.is_none());
    }

    #[tokio::test]
    async fn pair_at_genesis_skips_previous_lookup() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _tip = mock_tip(&mut server, "0000", block_json("0000", 0, 1_231_006_505, 1)).await;
        let by_height = server
            .mock("GET", mockito::Matcher::Regex(r"^/block-height/.*$".to_string()))
            .expect(0)
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let pair = client
            .fetch_latest_and_previous_block_details(DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert!(pair.previous.is_none());
        by_height.assert_async().await;
    }

    #[tokio::test]
    async fn hash_from_the_wire_cannot_change_the_request_path() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _hash = server
            .mock("GET", "/blocks/tip/hash")
            .with_status(200)
            .with_body("ab/admin?x=1#frag")
            .create_async()
            .await;
        let escaped = server
            .mock("GET", "/block/ab%2Fadmin%3Fx=1%23frag")
            .with_status(200)
            .with_body(block_json("ab", 3, 1_700_000_000, 1))
            .expect(1)
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let block = client
            .fetch_latest_block_details(DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(block.height, 3);
        escaped.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_during_previous_lookup_is_a_timeout() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _tip = mock_tip(&mut server, "ffff", block_json("ffff", 5, 1_700_000_000, 4)).await;
        let _stalled = server
            .mock("GET", "/block-height/4")
            .with_status(200)
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_millis(600));
                w.write_all(b"eeee")
            })
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let result = client
            .fetch_latest_and_previous_block_details(Duration::from_millis(200))
            .await;
        assert_eq!(result, Err(FetchError::Timeout));
    }

    #[tokio::test]
    async fn current_block_failure_propagates_from_pair() {
        if !localhost_binding_permitted() {
            return;
        }
        let mut server = Server::new_async().await;
        let _hash = server
            .mock("GET", "/blocks/tip/hash")
            .with_status(503)
            .create_async()
            .await;

        let client = ExplorerClient::new(&server.url()).unwrap();
        let err = client
            .fetch_latest_and_previous_block_details(DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Http { .. }));
    }

    #[tokio::test]
    async fn connection_failure_is_a_network_error() {
        let port = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener.local_addr().unwrap().port(),
            Err(_) => return,
        };
        // listener dropped, nothing accepts on the port anymore
        let client = ExplorerClient::new(&format!("http://127.0.0.1:{port}")).unwrap();
        let err = client
            .fetch_latest_block_height(DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_covers_the_whole_sequence() {
        let fut = with_deadline(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, FetchError>(())
        });
        assert_eq!(fut.await, Err(FetchError::Timeout));
    }

    #[tokio::test]
    async fn deadline_passes_through_inner_result() {
        let ok = with_deadline(Duration::from_secs(1), async { Ok::<_, FetchError>(7) }).await;
        assert_eq!(ok, Ok(7));
        let err = with_deadline(Duration::from_secs(1), async {
            Err::<u8, _>(FetchError::InvalidResponse("x".into()))
        })
        .await;
        assert_eq!(err, Err(FetchError::InvalidResponse("x".into())));
    }
}
