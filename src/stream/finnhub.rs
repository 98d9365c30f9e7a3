use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::StreamError;
use crate::metrics::Metrics;
use crate::models::Trade;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const TRADE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub api_key: String,
    pub websocket_url: String,
    pub symbols: Vec<String>,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
}

/// Finnhub WebSocket market stream.
///
/// `read` spawns a ping ticker and a read loop for the current
/// connection; the trade channel is bounded and tail-drops when full
/// (the feed is lossy by design at this boundary). A socket error
/// surfaces one terminal error and ends both tasks.
pub struct FinnhubStream {
    cfg: StreamConfig,
    metrics: Arc<Metrics>,
    writer: Arc<Mutex<Option<WsSink>>>,
    reader: std::sync::Mutex<Option<WsSource>>,
    connected: Arc<AtomicBool>,
}

/// Inbound trade frame item: `{"s":.., "p":.., "v":.., "t":<ms>}`.
#[derive(Debug, Deserialize)]
struct FeedTrade {
    s: String,
    p: f64,
    v: f64,
    t: i64,
}

#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<FeedTrade>,
}

impl FinnhubStream {
    pub fn new(cfg: StreamConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            writer: Arc::new(Mutex::new(None)),
            reader: std::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens the WebSocket connection. Failure here at startup is
    /// fatal for the collector.
    pub async fn connect(&self) -> Result<()> {
        let url = format!("{}?token={}", self.cfg.websocket_url, self.cfg.api_key);
        let (ws, _response) = connect_async(&url).await.context("finnhub connect")?;
        let (sink, source) = ws.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().expect("stream lock poisoned") = Some(source);
        self.connected.store(true, Ordering::SeqCst);
        info!("finnhub: connected");
        Ok(())
    }

    /// Sends one subscription frame per configured symbol.
    pub async fn subscribe(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().context("finnhub not connected")?;
        for symbol in &self.cfg.symbols {
            let frame = json!({"type": "subscribe", "symbol": symbol}).to_string();
            sink.send(Message::Text(frame.into()))
                .await
                .with_context(|| format!("subscribe {symbol}"))?;
            debug!("finnhub: subscribed {symbol}");
        }
        Ok(())
    }

    /// Spawns the ping ticker and read loop for the current
    /// connection and returns the trade and error channels. Both
    /// close when the connection dies.
    pub fn read(&self) -> (mpsc::Receiver<Trade>, mpsc::Receiver<StreamError>) {
        let (trades_tx, trades_rx) = mpsc::channel(TRADE_CHANNEL_CAPACITY);
        let (errs_tx, errs_rx) = mpsc::channel(1);

        let Some(mut source) = self.reader.lock().expect("stream lock poisoned").take() else {
            let _ = errs_tx.try_send(StreamError::NotConnected);
            return (trades_rx, errs_rx);
        };

        // Ping ticker: keepalives at a fixed interval. The read loop
        // signals `dead` on exit so a stale ticker never outlives its
        // connection into the next one.
        let (dead_tx, mut dead_rx) = tokio::sync::watch::channel(false);
        let writer = Arc::clone(&self.writer);
        let ping_interval = self.cfg.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = dead_rx.changed() => return,
                    _ = ticker.tick() => {
                        let mut writer = writer.lock().await;
                        let Some(sink) = writer.as_mut() else { return };
                        if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                            debug!("finnhub: ping failed: {e}");
                            return;
                        }
                    }
                }
            }
        });

        // Read loop: only "trade" frames produce emissions; feed
        // timestamps are milliseconds and normalize to seconds here.
        let writer = Arc::clone(&self.writer);
        let connected = Arc::clone(&self.connected);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            let _dead = dead_tx; // dropped (and observed) when this task ends
            loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(msg) = serde_json::from_str::<FeedMessage>(&text) else {
                            continue;
                        };
                        if msg.kind != "trade" {
                            continue;
                        }
                        for d in msg.data {
                            let trade = Trade {
                                symbol: d.s,
                                timestamp: d.t / 1000,
                                price: d.p,
                                volume: d.v,
                            };
                            if trades_tx.try_send(trade).is_err() {
                                metrics.record_error("stream_drop");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let mut writer = writer.lock().await;
                        if let Some(sink) = writer.as_mut() {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = errs_tx.try_send(StreamError::Closed);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = errs_tx.try_send(StreamError::Socket(e.to_string()));
                        return;
                    }
                }
            }
        });

        (trades_rx, errs_rx)
    }

    /// Closes the socket, waits the configured delay, reconnects and
    /// resubscribes. Safe to call repeatedly.
    pub async fn reconnect(&self) -> Result<()> {
        self.close().await;
        tokio::time::sleep(self.cfg.reconnect_delay).await;
        self.connect().await?;
        self.subscribe().await
    }

    /// Closes the current socket best-effort.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.reader.lock().expect("stream lock poisoned").take();
    }

    /// Advisory connection state: the last observed value, not a
    /// liveness probe.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_frame_parses_and_ignores_other_kinds() {
        let raw = r#"{"type":"trade","data":[{"s":"BTCUSDT","p":42000.5,"v":0.1,"t":1700000000123}]}"#;
        let msg: FeedMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.kind, "trade");
        assert_eq!(msg.data.len(), 1);
        assert_eq!(msg.data[0].t / 1000, 1_700_000_000);

        let ping: FeedMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping.kind, "ping");
        assert!(ping.data.is_empty());
    }

    #[test]
    fn read_without_connect_surfaces_not_connected() {
        let stream = FinnhubStream::new(
            StreamConfig {
                api_key: "k".to_string(),
                websocket_url: "wss://example.invalid".to_string(),
                symbols: vec![],
                reconnect_delay: Duration::from_millis(1),
                ping_interval: Duration::from_secs(30),
            },
            Metrics::new().unwrap(),
        );
        let (_trades, mut errs) = stream.read();
        assert!(matches!(errs.try_recv(), Ok(StreamError::NotConnected)));
    }
}
