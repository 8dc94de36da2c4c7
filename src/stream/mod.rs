//! Frame bus connecting one publisher to many readers
//!
//! Media payloads are opaque to the relay. A path owns a [`StreamBus`];
//! the publisher writes through a [`StreamWriter`] and every reader holds a
//! [`StreamReader`]. `bytes::Bytes` keeps the fan-out zero-copy: the channel
//! clones the frame struct, the payload is only reference-counted.
//!
//! Slow readers are not buffered indefinitely: when a reader lags past the
//! channel capacity it observes [`StreamReadError::Lagged`] and its
//! front-end is expected to drop it with reason `ClientGone`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

/// Default per-path fan-out channel capacity, in frames
pub const DEFAULT_BUS_CAPACITY: usize = 512;

/// A single media frame relayed from the publisher to the readers
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFrame {
    /// Index into the path's track list
    pub track: usize,
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
    /// Opaque payload (codec bitstream, reference-counted)
    pub payload: Bytes,
}

impl UnitFrame {
    /// Create a frame for the given track
    pub fn new(track: usize, timestamp_us: u64, payload: Bytes) -> Self {
        Self {
            track,
            timestamp_us,
            payload,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Fan-out channel owned by a path
#[derive(Debug)]
pub struct StreamBus {
    tx: broadcast::Sender<UnitFrame>,
    bytes_received: Arc<AtomicU64>,
}

impl StreamBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            bytes_received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Writer half handed to the admitted publisher
    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            tx: self.tx.clone(),
            bytes_received: Arc::clone(&self.bytes_received),
        }
    }

    /// Reader half handed to an attached reader
    ///
    /// `bytes_sent` is the owning session's sent-byte counter; it is bumped
    /// on every received frame.
    pub fn reader(&self, bytes_sent: Arc<AtomicU64>) -> StreamReader {
        StreamReader {
            rx: self.tx.subscribe(),
            bytes_sent,
        }
    }

    /// Total payload bytes written since the bus was created
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Shared handle to the received-byte counter
    pub fn bytes_received_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_received)
    }
}

/// Publisher-side handle
#[derive(Debug, Clone)]
pub struct StreamWriter {
    tx: broadcast::Sender<UnitFrame>,
    bytes_received: Arc<AtomicU64>,
}

impl StreamWriter {
    /// Forward a frame to all attached readers
    ///
    /// Returns the number of readers that received it. Zero readers is not
    /// an error; the frame is counted and dropped.
    pub fn send(&self, frame: UnitFrame) -> usize {
        self.bytes_received
            .fetch_add(frame.size() as u64, Ordering::Relaxed);
        self.tx.send(frame).unwrap_or(0)
    }
}

/// Error observed by a reader pulling from the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamReadError {
    /// The publisher detached and the bus was dropped
    Closed,
    /// The reader fell behind the channel capacity; carries the number of
    /// frames it missed
    Lagged(u64),
}

impl std::fmt::Display for StreamReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamReadError::Closed => write!(f, "stream closed"),
            StreamReadError::Lagged(n) => write!(f, "reader lagged, {} frames lost", n),
        }
    }
}

impl std::error::Error for StreamReadError {}

/// Reader-side handle
#[derive(Debug)]
pub struct StreamReader {
    rx: broadcast::Receiver<UnitFrame>,
    bytes_sent: Arc<AtomicU64>,
}

impl StreamReader {
    /// Receive the next frame, updating the owning session's sent counter
    pub async fn recv(&mut self) -> std::result::Result<UnitFrame, StreamReadError> {
        match self.rx.recv().await {
            Ok(frame) => {
                self.bytes_sent
                    .fetch_add(frame.size() as u64, Ordering::Relaxed);
                Ok(frame)
            }
            Err(broadcast::error::RecvError::Closed) => Err(StreamReadError::Closed),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(StreamReadError::Lagged(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_counts_bytes() {
        let bus = StreamBus::new(16);
        let writer = bus.writer();
        let sent_a = Arc::new(AtomicU64::new(0));
        let sent_b = Arc::new(AtomicU64::new(0));
        let mut ra = bus.reader(Arc::clone(&sent_a));
        let mut rb = bus.reader(Arc::clone(&sent_b));

        let n = writer.send(UnitFrame::new(0, 0, Bytes::from_static(&[0u8; 100])));
        assert_eq!(n, 2);

        let fa = ra.recv().await.unwrap();
        let fb = rb.recv().await.unwrap();
        assert_eq!(fa.size(), 100);
        assert_eq!(fb.size(), 100);

        assert_eq!(bus.bytes_received(), 100);
        assert_eq!(sent_a.load(Ordering::Relaxed), 100);
        assert_eq!(sent_b.load(Ordering::Relaxed), 100);
    }

    #[tokio::test]
    async fn test_lagged_reader_is_reported() {
        let bus = StreamBus::new(2);
        let writer = bus.writer();
        let mut reader = bus.reader(Arc::new(AtomicU64::new(0)));

        for ts in 0..8 {
            writer.send(UnitFrame::new(0, ts, Bytes::from_static(b"x")));
        }

        match reader.recv().await {
            Err(StreamReadError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_after_writer_drop() {
        let bus = StreamBus::new(4);
        let mut reader = bus.reader(Arc::new(AtomicU64::new(0)));
        drop(bus);

        assert_eq!(reader.recv().await, Err(StreamReadError::Closed));
    }
}
