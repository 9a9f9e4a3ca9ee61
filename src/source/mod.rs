//! HTTP byte source
//!
//! One GET per (re)open, streamed chunk by chunk into the engine channel.
//! Reopens carry a `Range:` header when resuming mid-resource. The engine
//! "unschedules" a source under backpressure by flipping a watch-channel
//! gate the reader task awaits before every read, and closes it by aborting
//! the task; a generation id lets the engine discard events from a source it
//! already abandoned.

pub(crate) mod sniffer;

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::streamer::engine::EngineMessage;

/// How long to wait for the TCP/TLS handshake. Stalls after connection are
/// the watchdog's job, so no overall request timeout is set.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str = concat!("streamcast/", env!("CARGO_PKG_VERSION"));

/// Proxy selection for the byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    /// Use the system (environment) proxy configuration.
    System,
    Http,
    Socks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

/// Events a source task delivers, tagged with its generation id.
#[derive(Debug, Clone)]
pub(crate) enum SourceEvent {
    /// Response headers arrived; body follows.
    Opened {
        status: u16,
        headers: HashMap<String, String>,
        content_length: Option<u64>,
    },
    Bytes(Vec<u8>),
    End,
    Error(String),
}

/// Everything needed to issue one GET.
#[derive(Debug, Clone)]
pub(crate) struct SourceRequest {
    pub url: String,
    pub proxy: Option<ProxyConfig>,
    /// `(seek_byte_offset, file_length)`; formatted as `bytes=S-(L-1)`.
    pub range: Option<(u64, u64)>,
}

/// Format the resume header for a byte offset into a resource of known
/// length.
pub fn format_range(seek_byte_offset: u64, file_length: u64) -> String {
    format!(
        "bytes={}-{}",
        seek_byte_offset,
        file_length.saturating_sub(1)
    )
}

/// Invert `format_range`: recover `(seek_byte_offset, file_length)`.
pub fn parse_range(header: &str) -> Option<(u64, u64)> {
    let value = header.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    Some((start, end + 1))
}

/// Handle to one running source task.
pub(crate) struct ByteSource {
    gate: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ByteSource {
    /// Spawn the GET for `request` onto `runtime`, delivering events tagged
    /// with `id` into `tx`.
    pub(crate) fn open(
        runtime: &tokio::runtime::Runtime,
        request: SourceRequest,
        id: u64,
        tx: Sender<EngineMessage>,
    ) -> Self {
        let (gate, gate_rx) = watch::channel(true);
        let task = runtime.spawn(run_source(request, id, tx, gate_rx));
        Self { gate, task }
    }

    /// Schedule or unschedule reads. An unscheduled source keeps its
    /// connection but stops pulling from the body.
    pub(crate) fn set_scheduled(&self, scheduled: bool) {
        let _ = self.gate.send(scheduled);
    }

    /// Abort the task. Any event it raced into the channel carries a stale
    /// generation id and gets dropped by the engine.
    pub(crate) fn close(self) {
        self.task.abort();
    }
}

fn build_client(proxy: Option<&ProxyConfig>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(proxy) = proxy {
        match proxy.kind {
            // reqwest reads the environment proxy settings by default.
            ProxyKind::System => {}
            ProxyKind::Http => {
                let address = format!("http://{}:{}", proxy.host, proxy.port);
                builder = builder
                    .proxy(reqwest::Proxy::http(&address)?)
                    .proxy(reqwest::Proxy::https(&address)?);
            }
            ProxyKind::Socks => {
                let address = format!("socks5://{}:{}", proxy.host, proxy.port);
                builder = builder.proxy(reqwest::Proxy::all(&address)?);
            }
        }
    }

    builder.build()
}

async fn run_source(
    request: SourceRequest,
    id: u64,
    tx: Sender<EngineMessage>,
    mut gate: watch::Receiver<bool>,
) {
    let send = |event: SourceEvent| tx.send(EngineMessage::Source { id, event }).is_ok();

    let client = match build_client(request.proxy.as_ref()) {
        Ok(client) => client,
        Err(e) => {
            send(SourceEvent::Error(format!("client setup failed: {e}")));
            return;
        }
    };

    let mut get = client.get(&request.url);
    if let Some((offset, length)) = request.range {
        get = get.header(reqwest::header::RANGE, format_range(offset, length));
        log::debug!("requesting {} from byte {}", request.url, offset);
    }

    let response = match get.send().await {
        Ok(response) => response,
        Err(e) => {
            send(SourceEvent::Error(e.to_string()));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        send(SourceEvent::Error(format!("HTTP error: {status}")));
        return;
    }

    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let content_length = response.content_length();

    if !send(SourceEvent::Opened {
        status: status.as_u16(),
        headers,
        content_length,
    }) {
        return;
    }

    let mut body = response.bytes_stream();
    loop {
        let scheduled = *gate.borrow();
        if !scheduled {
            if gate.changed().await.is_err() {
                return;
            }
            continue;
        }

        match body.next().await {
            Some(Ok(chunk)) => {
                // Zero-length frames carry no information; skip them.
                if chunk.is_empty() {
                    continue;
                }
                if !send(SourceEvent::Bytes(chunk.to_vec())) {
                    return;
                }
            }
            Some(Err(e)) => {
                send(SourceEvent::Error(e.to_string()));
                return;
            }
            None => {
                send(SourceEvent::End);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_round_trips() {
        for &(offset, length) in &[(0u64, 1u64), (417, 1_000_000), (999_999, 1_000_000)] {
            let header = format_range(offset, length);
            assert_eq!(parse_range(&header), Some((offset, length)));
        }
    }

    #[test]
    fn range_header_shape() {
        assert_eq!(format_range(480_417, 1_000_000), "bytes=480417-999999");
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert_eq!(parse_range("bytes=17"), None);
        assert_eq!(parse_range("bytes=a-b"), None);
        assert_eq!(parse_range("17-20"), None);
    }
}
