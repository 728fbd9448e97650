//! Per-connection subscriber engine.
//!
//! Merges a bounded historical replay with a live notification feed while
//! keeping delivery strictly ordered, and unwinds the backend subscription
//! on every exit path: client disconnect, producer close, and backend
//! failure.

use crate::backend::{self, Backend};
use crate::config::Settings;
use crate::envelope::{decode_metadata, decode_payload, Envelope, EnvelopeFormat, WireFrame};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// WebSocket close code for normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close reason sent when the producer ends the stream.
pub const REASON_PRODUCER_ENDED: &str = "Producer ended stream";

/// The client side of the connection went away.
#[derive(Debug)]
pub struct SinkClosed;

/// Transport half owned by the subscriber engine.
///
/// The engine is the only sender on a connection; a send error is the
/// disconnect signal.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one encoded envelope.
    async fn send(&mut self, frame: WireFrame) -> Result<(), SinkClosed>;

    /// Close the transport with a code and reason. Errors are ignored; the
    /// connection is being torn down either way.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Why the subscriber loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The producer wrote the end-of-stream sentinel.
    ProducerClosed,
    /// A send failed; the client has disconnected.
    ClientDisconnected,
}

enum Step {
    Delivered { end_of_stream: bool },
    /// Frame missing, expired, or unreadable.
    Skipped,
}

/// Per-connection streaming state machine.
///
/// Exactly two tasks serve a connection: the caller's task runs this state
/// machine and owns the transport; a listener task owns the backend
/// subscription and forwards sequences into a bounded queue.
pub struct Subscriber {
    backend: Arc<dyn Backend>,
    settings: Arc<Settings>,
    node_id: String,
    format: EnvelopeFormat,
    server_host: String,
    /// Highest sequence already delivered or covered by replay. Live
    /// sequences at or below it are dropped.
    high_water: u64,
}

impl Subscriber {
    pub fn new(
        backend: Arc<dyn Backend>,
        settings: Arc<Settings>,
        node_id: impl Into<String>,
        format: EnvelopeFormat,
        server_host: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            settings,
            node_id: node_id.into(),
            format,
            server_host: server_host.into(),
            high_water: 0,
        }
    }

    /// Run the state machine to completion, then tear down the listener.
    ///
    /// With `start_seq`, frames from that sequence through the counter value
    /// at connect time are replayed before any live delivery.
    pub async fn run<S: FrameSink>(mut self, sink: &mut S, start_seq: Option<u64>) -> StreamEnd {
        let (live_tx, mut live_rx) = mpsc::channel(self.settings.live_queue_capacity);
        // The listener must be subscribed before replay reads the counter so
        // that frames appended mid-replay surface on the live queue.
        let listener = spawn_listener(
            self.backend.clone(),
            backend::notify_channel(&self.node_id),
            live_tx,
        )
        .await;

        let end = self.stream(sink, start_seq, &mut live_rx).await;
        info!(node_id = %self.node_id, ?end, "subscriber stream ended");

        if end == StreamEnd::ProducerClosed {
            sink.close(CLOSE_NORMAL, REASON_PRODUCER_ENDED).await;
        }
        self.teardown(listener).await;
        end
    }

    async fn stream<S: FrameSink>(
        &mut self,
        sink: &mut S,
        start_seq: Option<u64>,
        live: &mut mpsc::Receiver<u64>,
    ) -> StreamEnd {
        if let Some(start) = start_seq {
            let current = match self
                .backend
                .counter_get(&backend::seq_key(&self.node_id))
                .await
            {
                Ok(counter) => counter.unwrap_or(0),
                Err(err) => {
                    warn!(node_id = %self.node_id, %err, "counter read failed; skipping replay");
                    0
                }
            };
            // Everything up to the counter value is covered by replay; live
            // duplicates of this range are dropped.
            self.high_water = current;

            for seq in start..=current {
                match self.deliver(sink, seq).await {
                    Ok(Step::Delivered { end_of_stream: true }) => {
                        return StreamEnd::ProducerClosed
                    }
                    Ok(_) => {}
                    Err(SinkClosed) => return StreamEnd::ClientDisconnected,
                }
            }
        }

        loop {
            match timeout(self.settings.live_poll_interval, live.recv()).await {
                Ok(Some(seq)) => {
                    if seq <= self.high_water {
                        debug!(node_id = %self.node_id, seq, "dropping live sequence at or below high-water");
                        continue;
                    }
                    self.high_water = seq;
                    match self.deliver(sink, seq).await {
                        Ok(Step::Delivered { end_of_stream: true }) => {
                            return StreamEnd::ProducerClosed
                        }
                        Ok(_) => {}
                        Err(SinkClosed) => return StreamEnd::ClientDisconnected,
                    }
                }
                Ok(None) => {
                    // Listener exited and the queue is drained. Nothing more
                    // can arrive; hold the connection open until the client
                    // goes away.
                    tokio::time::sleep(self.settings.live_poll_interval).await;
                }
                Err(_) => {
                    // Poll tick with nothing pending. Termination is detected
                    // on delivery, so just loop.
                }
            }
        }
    }

    /// Fetch, encode, and send one frame.
    async fn deliver<S: FrameSink>(&mut self, sink: &mut S, seq: u64) -> Result<Step, SinkClosed> {
        let key = backend::data_key(&self.node_id, seq);
        let stored = match self.backend.hash_get(&key).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(node_id = %self.node_id, seq, %err, "frame read failed");
                None
            }
        };
        let Some(stored) = stored else {
            debug!(node_id = %self.node_id, seq, "frame missing or expired; skipping");
            return Ok(Step::Skipped);
        };

        let payload = decode_payload(&stored.payload);
        let end_of_stream = payload.is_end_of_stream();
        let envelope = Envelope {
            sequence: seq,
            metadata: decode_metadata(&stored.metadata),
            payload,
            server_host: self.server_host.clone(),
        };
        let frame = envelope.encode(self.format, self.settings.max_websocket_frame_size);
        sink.send(frame).await?;
        Ok(Step::Delivered { end_of_stream })
    }

    /// Cancel the listener and wait, bounded, for it to release the backend
    /// subscription.
    async fn teardown(&self, listener: Option<JoinHandle<()>>) {
        let Some(handle) = listener else { return };
        handle.abort();
        if timeout(self.settings.listener_shutdown_timeout, handle)
            .await
            .is_err()
        {
            warn!(node_id = %self.node_id, "listener did not shut down in time; abandoning");
        }
    }
}

/// Subscribe to the notification channel and forward sequences into the live
/// queue until cancelled.
///
/// A subscribe failure is non-fatal for the connection: the engine continues
/// without live notifications and relies on the client to disconnect.
async fn spawn_listener(
    backend: Arc<dyn Backend>,
    channel: String,
    queue: mpsc::Sender<u64>,
) -> Option<JoinHandle<()>> {
    let mut subscription = match backend.subscribe(&channel).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(%channel, %err, "backend subscribe failed; live notifications unavailable");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        loop {
            match subscription.next().await {
                Some(Ok(seq)) => {
                    // A full queue means the subscriber is behind; block until
                    // it drains rather than dropping notifications.
                    if queue.send(seq).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(%channel, %err, "notification stream error; listener exiting");
                    break;
                }
                None => {
                    debug!(%channel, "notification stream ended");
                    break;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::memory::MemoryBackend;
    use crate::producer::Producer;
    use bytes::Bytes;
    use http::HeaderMap;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::time::Duration;

    #[derive(Default)]
    struct SinkLog {
        frames: Vec<WireFrame>,
        closed: Option<(u16, String)>,
    }

    #[derive(Clone)]
    struct TestSink {
        log: Arc<Mutex<SinkLog>>,
        fail_after: Option<usize>,
    }

    impl TestSink {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(SinkLog::default())),
                fail_after: None,
            }
        }

        fn failing_after(sends: usize) -> Self {
            Self {
                fail_after: Some(sends),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl FrameSink for TestSink {
        async fn send(&mut self, frame: WireFrame) -> Result<(), SinkClosed> {
            let mut log = self.log.lock();
            if let Some(limit) = self.fail_after {
                if log.frames.len() >= limit {
                    return Err(SinkClosed);
                }
            }
            log.frames.push(frame);
            Ok(())
        }

        async fn close(&mut self, code: u16, reason: &str) {
            self.log.lock().closed = Some((code, reason.to_string()));
        }
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        settings: Arc<Settings>,
        producer: Producer,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_settings(Settings::default())
        }

        fn with_settings(settings: Settings) -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let settings = Arc::new(settings);
            let producer = Producer::new(backend.clone(), settings.clone());
            Self {
                backend,
                settings,
                producer,
            }
        }

        async fn create_dataset(&self, node_id: &str) {
            self.backend
                .counter_init_if_absent(&backend::seq_key(node_id))
                .await
                .unwrap();
        }

        async fn append_doubles(&self, node_id: &str, values: &[f64]) -> u64 {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            self.producer
                .append(node_id, Bytes::from(bytes), &HeaderMap::new())
                .await
                .unwrap()
        }

        fn subscriber(&self, node_id: &str) -> Subscriber {
            Subscriber::new(
                self.backend.clone(),
                self.settings.clone(),
                node_id,
                EnvelopeFormat::Json,
                "testhost",
            )
        }
    }

    fn decode_json(frame: &WireFrame) -> Value {
        let WireFrame::Text(text) = frame else {
            panic!("expected text frame");
        };
        serde_json::from_str(text).unwrap()
    }

    fn sequences(log: &Arc<Mutex<SinkLog>>) -> Vec<u64> {
        log.lock()
            .frames
            .iter()
            .map(|frame| decode_json(frame)["sequence"].as_u64().unwrap())
            .collect()
    }

    async fn wait_for_frames(log: &Arc<Mutex<SinkLog>>, count: usize) {
        for _ in 0..5000 {
            if log.lock().frames.len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("timed out waiting for {count} frames");
    }

    #[tokio::test(start_paused = true)]
    async fn replay_precedes_live_and_close_terminates() {
        // Scenario: replay two frames, receive a third live, then the
        // producer closes the stream.
        let fixture = Fixture::new();
        fixture.create_dataset("7").await;
        fixture.append_doubles("7", &[1.0; 5]).await;
        fixture.append_doubles("7", &[2.0; 5]).await;

        let mut sink = TestSink::new();
        let log = sink.log.clone();
        let subscriber = fixture.subscriber("7");
        let handle = tokio::spawn(async move {
            let end = subscriber.run(&mut sink, Some(1)).await;
            (end, sink)
        });

        wait_for_frames(&log, 2).await;
        assert_eq!(sequences(&log), vec![1, 2]);
        let first = decode_json(&log.lock().frames[0]);
        assert_eq!(first["payload"], serde_json::json!([1.0, 1.0, 1.0, 1.0, 1.0]));
        assert_eq!(first["server_host"], "testhost");

        fixture.append_doubles("7", &[3.0; 5]).await;
        wait_for_frames(&log, 3).await;
        assert_eq!(sequences(&log), vec![1, 2, 3]);

        fixture.producer.close("7", None).await.unwrap();
        let (end, _sink) = handle.await.unwrap();
        assert_eq!(end, StreamEnd::ProducerClosed);

        let log = log.lock();
        assert_eq!(
            log.closed,
            Some((CLOSE_NORMAL, REASON_PRODUCER_ENDED.to_string()))
        );
        let last = decode_json(log.frames.last().unwrap());
        assert!(last["payload"].is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn live_only_subscriber_sees_only_new_frames() {
        let fixture = Fixture::new();
        fixture.create_dataset("7").await;

        let mut sink = TestSink::new();
        let log = sink.log.clone();
        let subscriber = fixture.subscriber("7");
        let handle = tokio::spawn(async move {
            let end = subscriber.run(&mut sink, None).await;
            (end, sink)
        });
        // Let the listener subscribe before producing.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        fixture.append_doubles("7", &[1.0; 5]).await;
        fixture.append_doubles("7", &[2.0; 5]).await;
        wait_for_frames(&log, 2).await;
        assert_eq!(sequences(&log), vec![1, 2]);

        fixture.producer.close("7", None).await.unwrap();
        let (end, _sink) = handle.await.unwrap();
        assert_eq!(end, StreamEnd::ProducerClosed);
        assert!(!sequences(&log).contains(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_sequences_are_not_delivered_twice_from_live() {
        let fixture = Fixture::new();
        fixture.create_dataset("7").await;
        fixture.append_doubles("7", &[1.0]).await;
        fixture.append_doubles("7", &[2.0]).await;

        let mut sink = TestSink::new();
        let log = sink.log.clone();
        let subscriber = fixture.subscriber("7");
        let handle = tokio::spawn(async move {
            let end = subscriber.run(&mut sink, Some(1)).await;
            (end, sink)
        });
        wait_for_frames(&log, 2).await;

        // A stale notification for an already-replayed sequence must be
        // dropped by the high-water check.
        fixture
            .backend
            .publish(&backend::notify_channel("7"), 1)
            .await
            .unwrap();
        fixture.append_doubles("7", &[3.0]).await;
        wait_for_frames(&log, 3).await;
        assert_eq!(sequences(&log), vec![1, 2, 3]);

        fixture.producer.close("7", None).await.unwrap();
        let (end, _sink) = handle.await.unwrap();
        assert_eq!(end, StreamEnd::ProducerClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_frames_are_skipped_silently() {
        let fixture = Fixture::with_settings(Settings::default().ttl(Duration::from_secs(5)));
        fixture.create_dataset("7").await;
        fixture.append_doubles("7", &[1.0]).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        fixture.append_doubles("7", &[2.0]).await;
        fixture.producer.close("7", None).await.unwrap();

        let mut sink = TestSink::new();
        let log = sink.log.clone();
        let end = fixture.subscriber("7").run(&mut sink, Some(1)).await;

        assert_eq!(end, StreamEnd::ProducerClosed);
        // Frame 1 expired; replay continues with 2 and the sentinel at 3.
        assert_eq!(sequences(&log), vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_means_client_disconnected() {
        let fixture = Fixture::new();
        fixture.create_dataset("7").await;
        fixture.append_doubles("7", &[1.0]).await;
        fixture.append_doubles("7", &[2.0]).await;

        let mut sink = TestSink::failing_after(1);
        let log = sink.log.clone();
        let end = fixture.subscriber("7").run(&mut sink, Some(1)).await;

        assert_eq!(end, StreamEnd::ClientDisconnected);
        let log = log.lock();
        // No close frame is attempted on a dead transport.
        assert!(log.closed.is_none());
        assert_eq!(log.frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_of_empty_range_delivers_nothing() {
        let fixture = Fixture::new();
        fixture.create_dataset("7").await;

        let mut sink = TestSink::new();
        let log = sink.log.clone();
        let subscriber = fixture.subscriber("7");
        let handle = tokio::spawn(async move {
            let end = subscriber.run(&mut sink, Some(1)).await;
            (end, sink)
        });
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(sequences(&log).is_empty());

        fixture.producer.close("7", None).await.unwrap();
        let (end, _sink) = handle.await.unwrap();
        assert_eq!(end, StreamEnd::ProducerClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_envelope_substitutes_error_and_stream_continues() {
        let fixture = Fixture::with_settings(
            Settings::default().max_websocket_frame_size(256),
        );
        fixture.create_dataset("7").await;
        fixture.append_doubles("7", &[0.12345; 64]).await;
        fixture.append_doubles("7", &[1.0]).await;
        fixture.producer.close("7", None).await.unwrap();

        let mut sink = TestSink::new();
        let log = sink.log.clone();
        let end = fixture.subscriber("7").run(&mut sink, Some(1)).await;
        assert_eq!(end, StreamEnd::ProducerClosed);

        let log = log.lock();
        let first = decode_json(&log.frames[0]);
        assert_eq!(first["error"], "Frame too large");
        let second = decode_json(&log.frames[1]);
        assert_eq!(second["sequence"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn msgpack_subscriber_receives_binary_frames() {
        let fixture = Fixture::new();
        fixture.create_dataset("7").await;
        fixture.append_doubles("7", &[4.0, 5.0]).await;
        fixture.producer.close("7", None).await.unwrap();

        let mut sink = TestSink::new();
        let log = sink.log.clone();
        let subscriber = Subscriber::new(
            fixture.backend.clone(),
            fixture.settings.clone(),
            "7",
            EnvelopeFormat::MsgPack,
            "testhost",
        );
        let end = subscriber.run(&mut sink, Some(1)).await;
        assert_eq!(end, StreamEnd::ProducerClosed);

        let log = log.lock();
        let WireFrame::Binary(bytes) = &log.frames[0] else {
            panic!("expected binary frame");
        };
        let value: Value = rmp_serde::from_slice(bytes).unwrap();
        assert_eq!(value["sequence"], 1);
        assert_eq!(value["payload"], serde_json::json!([4.0, 5.0]));
    }
}
