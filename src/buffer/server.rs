//! The change stream RPC surface.
//!
//! Framing is JSON lines over TCP. A subscriber connects, sends one
//! request line `{"last_position": "…"}` and then receives an unbounded
//! stream of [`Change`] lines in ascending position order. `""` starts
//! from the oldest retained change, `"bootstrap"` from the synthetic
//! bootstrap range, anything else resumes strictly after that position.
//!
//! The server side lives in the capture service next to the tail writer;
//! the client side is owned by each apply loop, which reconnects with
//! backoff and re-requests from its own durable position.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ChangeStore, StartFrom, Subscription};
use crate::change::Change;
use crate::error::KashoError;

/// Changes sent per write burst before the stream is flushed.
const BATCH_LIMIT: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub last_position: String,
}

// ── Server ─────────────────────────────────────────────────────────────────

pub struct ChangeStreamServer<S: ChangeStore> {
    store: Arc<S>,
    poll_interval: Duration,
}

impl<S: ChangeStore> ChangeStreamServer<S> {
    pub fn new(store: Arc<S>, poll_interval: Duration) -> Self {
        ChangeStreamServer { store, poll_interval }
    }

    /// Bind `addr` and serve until `shutdown` flips to true.
    pub async fn serve(
        &self,
        addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), KashoError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| KashoError::connect("stream-server", e))?;
        info!(addr, "change stream listening");
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), KashoError> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted
                        .map_err(|e| KashoError::connect("stream-server", e))?;
                    debug!(%peer, "subscriber connected");
                    let store = Arc::clone(&self.store);
                    let poll_interval = self.poll_interval;
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            serve_subscriber(store, socket, poll_interval, shutdown).await
                        {
                            debug!(%peer, error = %err, "subscriber disconnected");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_subscriber<S: ChangeStore>(
    store: Arc<S>,
    socket: TcpStream,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), KashoError> {
    let (read_half, write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut writer = BufWriter::new(write_half);

    let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| KashoError::connect("stream-server", e))?
    else {
        return Ok(());
    };
    let request: StreamRequest = serde_json::from_str(&line)
        .map_err(|e| KashoError::Protocol(format!("bad stream request: {e}")))?;

    let start = StartFrom::from_request(&request.last_position);
    let mut subscription = Subscription::new(store, start, poll_interval);

    loop {
        let batch = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    writer.flush().await.ok();
                    return Ok(());
                }
                continue;
            }
            batch = subscription.next_batch(BATCH_LIMIT) => batch?,
        };

        for change in &batch {
            let line = serde_json::to_string(change)
                .map_err(|e| KashoError::Internal(format!("encode change: {e}")))?;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|e| KashoError::connect("stream-server", e))?;
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| KashoError::connect("stream-server", e))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| KashoError::connect("stream-server", e))?;
    }
}

// ── Client ─────────────────────────────────────────────────────────────────

/// Consumer half of the stream RPC. One connection per subscription;
/// reconnect is the caller's loop (it knows its durable position).
pub struct ChangeStreamClient {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    // Keeps the write half open for the lifetime of the subscription.
    _writer: OwnedWriteHalf,
}

impl ChangeStreamClient {
    pub async fn connect(addr: &str, last_position: &str) -> Result<Self, KashoError> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|e| KashoError::connect("change-stream", e))?;
        let (read_half, mut write_half) = socket.into_split();

        let request = serde_json::to_string(&StreamRequest {
            last_position: last_position.to_string(),
        })
        .map_err(|e| KashoError::Internal(format!("encode stream request: {e}")))?;
        write_half
            .write_all(format!("{request}\n").as_bytes())
            .await
            .map_err(|e| KashoError::connect("change-stream", e))?;

        Ok(ChangeStreamClient {
            lines: BufReader::new(read_half).lines(),
            _writer: write_half,
        })
    }

    /// Next change from the stream. A closed connection surfaces as a
    /// retryable connect error so the caller's backoff loop reconnects.
    pub async fn next_change(&mut self) -> Result<Change, KashoError> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| KashoError::connect("change-stream", e))?
            .ok_or_else(|| KashoError::connect("change-stream", "stream closed"))?;
        serde_json::from_str(&line).map_err(|e| {
            warn!(error = %e, "undecodable change frame");
            KashoError::Protocol(format!("decode change: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::log::ChangeLog;
    use crate::change::{Column, DmlChange, Operation, Position, SqlValue};

    fn insert_at(pos: Position, id: i64) -> Change {
        Change::dml(
            pos,
            DmlChange {
                table: "users".into(),
                op: Operation::Insert,
                columns: vec![Column::new("id", SqlValue::Int(id))],
                old_keys: vec![],
            },
        )
    }

    async fn start_server(store: Arc<ChangeLog>) -> (String, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let server = ChangeStreamServer::new(store, Duration::from_millis(10));
            server.serve_on(listener, shutdown_rx).await.unwrap();
        });
        (addr, shutdown_tx)
    }

    #[tokio::test]
    async fn test_stream_from_oldest() {
        let store = Arc::new(ChangeLog::unbounded());
        store.append(&insert_at(Position::from_lsn(1), 1)).await.unwrap();
        store.append(&insert_at(Position::from_lsn(2), 2)).await.unwrap();
        let (addr, _shutdown) = start_server(Arc::clone(&store)).await;

        let mut client = ChangeStreamClient::connect(&addr, "").await.unwrap();
        assert_eq!(client.next_change().await.unwrap().position, Position::from_lsn(1));
        assert_eq!(client.next_change().await.unwrap().position, Position::from_lsn(2));
    }

    #[tokio::test]
    async fn test_stream_resumes_after_position() {
        let store = Arc::new(ChangeLog::unbounded());
        for i in 1..=3 {
            store.append(&insert_at(Position::from_lsn(i), i as i64)).await.unwrap();
        }
        let (addr, _shutdown) = start_server(Arc::clone(&store)).await;

        let mut client =
            ChangeStreamClient::connect(&addr, Position::from_lsn(2).as_str()).await.unwrap();
        assert_eq!(client.next_change().await.unwrap().position, Position::from_lsn(3));
    }

    #[tokio::test]
    async fn test_stream_tails_live_appends() {
        let store = Arc::new(ChangeLog::unbounded());
        let (addr, _shutdown) = start_server(Arc::clone(&store)).await;

        let mut client = ChangeStreamClient::connect(&addr, "bootstrap").await.unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.append(&insert_at(Position::bootstrap(1), 1)).await
            })
        };

        assert_eq!(
            client.next_change().await.unwrap().position,
            Position::bootstrap(1)
        );
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_two_subscribers_fan_out() {
        let store = Arc::new(ChangeLog::unbounded());
        store.append(&insert_at(Position::from_lsn(5), 5)).await.unwrap();
        let (addr, _shutdown) = start_server(Arc::clone(&store)).await;

        let mut a = ChangeStreamClient::connect(&addr, "").await.unwrap();
        let mut b = ChangeStreamClient::connect(&addr, "").await.unwrap();
        assert_eq!(a.next_change().await.unwrap().position, Position::from_lsn(5));
        assert_eq!(b.next_change().await.unwrap().position, Position::from_lsn(5));
    }
}
