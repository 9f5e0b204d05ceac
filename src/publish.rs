//! # Publish Queue and Publisher
//!
//! Decouples record producers (the correlator, the CAN forwarder) from the upload step.
//!
//! - [`PublishQueue`]: bounded lock-free queue, drop-newest when full, never blocks
//! - [`Publisher`]: drains its queue on a caller-driven cadence into a [`Sink`]
//! - [`Sink`]: the external upload target; failures are counted and logged, and the
//!   failed record is not re-queued (at-most-once delivery)
//!
//! A drain against a disconnected sink is a no-op. Records wait in the queue, whose
//! drop-newest policy bounds what piles up until the sink comes back.

use crossbeam_queue::ArrayQueue;
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink is not connected")]
    Disconnected,

    #[error("sink rejected payload: {0}")]
    Rejected(String),
}

/// A record that knows its logical stream and wire encoding.
pub trait Publishable {
    /// Logical stream name, e.g. `"tracker"` or `"can"`
    fn stream(&self) -> &'static str;

    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }

    fn encode(&self) -> Result<Vec<u8>, SinkError>;
}

/// External upload target.
pub trait Sink {
    /// While this is `false` the publisher leaves its queue untouched.
    fn is_connected(&self) -> bool {
        true
    }

    fn publish(
        &mut self,
        stream: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<(), SinkError>;
}

/// Writes one JSON object per line: `{"stream": ..., "payload": ...}`.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for JsonLinesSink<W> {
    fn publish(
        &mut self,
        stream: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<(), SinkError> {
        if content_type != CONTENT_TYPE_JSON {
            return Err(SinkError::Rejected(format!(
                "unsupported content type {content_type}"
            )));
        }
        let body: serde_json::Value = serde_json::from_slice(payload)?;
        let line = json!({ "stream": stream, "payload": body });
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Bounded drop-newest queue. Clones share the same storage.
#[derive(Debug)]
pub struct PublishQueue<T> {
    queue: Arc<ArrayQueue<T>>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for PublishQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> PublishQueue<T> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue without blocking. A full queue hands the item back and counts a drop.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.queue.push(item).map_err(|item| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            item
        })
    }

    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Items rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of one drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
}

impl PublishReport {
    pub fn merge(self, other: PublishReport) -> PublishReport {
        PublishReport {
            published: self.published + other.published,
            failed: self.failed + other.failed,
        }
    }
}

pub struct Publisher<T> {
    queue: PublishQueue<T>,
}

impl<T: Publishable> Publisher<T> {
    pub fn new(queue: PublishQueue<T>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &PublishQueue<T> {
        &self.queue
    }

    /// Hand every queued record to `sink` until the queue is empty.
    ///
    /// Does nothing while the sink reports itself disconnected.
    pub fn drain<S: Sink + ?Sized>(&mut self, sink: &mut S) -> PublishReport {
        let mut report = PublishReport::default();
        if !sink.is_connected() {
            debug!(queued = self.queue.len(), "sink offline, holding records");
            return report;
        }
        while let Some(record) = self.queue.try_pop() {
            match publish_one(&record, sink) {
                Ok(()) => {
                    debug!(stream = record.stream(), "record published");
                    report.published += 1;
                }
                Err(e) => {
                    warn!(stream = record.stream(), error = %e, "publish failed, record dropped");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn publish_one<T, S>(record: &T, sink: &mut S) -> Result<(), SinkError>
where
    T: Publishable,
    S: Sink + ?Sized,
{
    let payload = record.encode()?;
    sink.publish(record.stream(), record.content_type(), &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Numbered(u32);

    impl Publishable for Numbered {
        fn stream(&self) -> &'static str {
            "test"
        }

        fn encode(&self) -> Result<Vec<u8>, SinkError> {
            Ok(serde_json::to_vec(&json!({ "n": self.0 }))?)
        }
    }

    /// Records payloads and fails on the listed call numbers.
    #[derive(Default)]
    struct RecordingSink {
        payloads: Vec<String>,
        fail_calls: Vec<usize>,
        calls: usize,
        connected: bool,
    }

    impl Sink for RecordingSink {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn publish(&mut self, _: &str, _: &str, payload: &[u8]) -> Result<(), SinkError> {
            self.calls += 1;
            if self.fail_calls.contains(&self.calls) {
                return Err(SinkError::Rejected("boom".into()));
            }
            self.payloads.push(String::from_utf8_lossy(payload).into_owned());
            Ok(())
        }
    }

    #[test]
    fn test_fill_then_overflow_keeps_oldest() {
        let queue = PublishQueue::new(3);
        for n in 0..3 {
            assert!(queue.try_push(Numbered(n)).is_ok());
        }
        assert_eq!(queue.try_push(Numbered(3)), Err(Numbered(3)));
        assert_eq!(queue.try_push(Numbered(4)), Err(Numbered(4)));
        assert_eq!(queue.dropped(), 2);

        let contents: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).map(|n| n.0).collect();
        assert_eq!(contents, vec![0, 1, 2]);
    }

    #[test]
    fn test_drain_counts_failures_without_requeueing() {
        let queue = PublishQueue::new(8);
        for n in 0..4 {
            queue.try_push(Numbered(n)).unwrap();
        }
        let mut publisher = Publisher::new(queue.clone());
        let mut sink = RecordingSink {
            fail_calls: vec![2],
            connected: true,
            ..Default::default()
        };

        let report = publisher.drain(&mut sink);
        assert_eq!(
            report,
            PublishReport {
                published: 3,
                failed: 1
            }
        );
        assert_eq!(sink.payloads, vec![r#"{"n":0}"#, r#"{"n":2}"#, r#"{"n":3}"#]);
        assert!(queue.is_empty());
        assert_eq!(publisher.drain(&mut sink), PublishReport::default());
    }

    #[test]
    fn test_disconnected_sink_holds_records_until_reconnect() {
        let queue = PublishQueue::new(4);
        for n in 0..3 {
            queue.try_push(Numbered(n)).unwrap();
        }
        let mut publisher = Publisher::new(queue);
        let mut sink = RecordingSink::default();

        assert_eq!(publisher.drain(&mut sink), PublishReport::default());
        assert_eq!(sink.calls, 0);
        assert_eq!(publisher.queue().len(), 3);

        sink.connected = true;
        let report = publisher.drain(&mut sink);
        assert_eq!(report.published, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(sink.payloads, vec![r#"{"n":0}"#, r#"{"n":1}"#, r#"{"n":2}"#]);
        assert!(publisher.queue().is_empty());
    }

    #[test]
    fn test_json_lines_sink_wraps_payload() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.publish("tracker", CONTENT_TYPE_JSON, br#"{"a":1}"#).unwrap();
        assert!(sink.publish("tracker", "application/cbor", &[0xA0]).is_err());

        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(written, "{\"payload\":{\"a\":1},\"stream\":\"tracker\"}\n");
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let queue: PublishQueue<Numbered> = PublishQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }
}
