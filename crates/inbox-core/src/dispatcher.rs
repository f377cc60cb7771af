//! Inbound push frames: parsing, the append-only push log, and fan-out.
//!
//! Arrival order defines log order. Timestamps embedded in the payload are
//! not consulted here; ordering by creation time is the poller's job.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::events::{EventBus, Subscription};
use crate::item::Item;

/// A successfully parsed push frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    /// Position in arrival order, starting at 0.
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    pub value: Value,
}

impl PushMessage {
    /// Interprets the payload as a collection item, if it has that shape.
    pub fn as_item(&self) -> Option<Item> {
        serde_json::from_value(self.value.clone()).ok()
    }
}

/// Event delivered to dispatcher subscribers.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Message(PushMessage),
    ParseError(ParseError),
}

#[derive(Default)]
struct PushLog {
    messages: VecDeque<PushMessage>,
    /// Parsed frames ever appended, including any trimmed by the retention cap.
    received: u64,
    errors: u64,
}

/// Parses frames, appends them to the push log, and notifies subscribers.
#[derive(Default)]
pub struct MessageDispatcher {
    log: RwLock<PushLog>,
    /// Oldest messages are trimmed past this many. None keeps everything.
    retain: Option<usize>,
    bus: Arc<EventBus<DispatchEvent>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retain` messages in the log; sequence numbers keep
    /// counting across trimmed entries.
    pub fn with_retention(retain: Option<usize>) -> Self {
        Self {
            retain,
            ..Self::default()
        }
    }

    /// Handle one raw inbound frame.
    ///
    /// The frame must be a single UTF-8 JSON value. Malformed frames are
    /// counted and reported to subscribers, never appended.
    pub fn on_frame(&self, raw: &[u8]) -> Result<PushMessage, ParseError> {
        match parse_frame(raw) {
            Ok(value) => Ok(self.record_message(value)),
            Err(error) => Err(self.record_error(error)),
        }
    }

    /// Record a frame the transport refused to deliver (over the size limit).
    ///
    /// Counted and reported like any malformed frame.
    pub fn on_rejected(&self, len: usize, reason: impl Into<String>) -> ParseError {
        self.record_error(ParseError {
            reason: reason.into(),
            len,
        })
    }

    fn record_message(&self, value: Value) -> PushMessage {
        let message = {
            let mut log = self.log.write().unwrap_or_else(|e| e.into_inner());
            let message = PushMessage {
                seq: log.received,
                received_at: Utc::now(),
                value,
            };
            log.received += 1;
            log.messages.push_back(message.clone());
            if let Some(retain) = self.retain {
                while log.messages.len() > retain {
                    log.messages.pop_front();
                }
            }
            message
        };

        // Deliver outside the lock so subscribers may read the log.
        self.emit(DispatchEvent::Message(message.clone()));
        message
    }

    fn record_error(&self, error: ParseError) -> ParseError {
        self.log.write().unwrap_or_else(|e| e.into_inner()).errors += 1;
        warn!("Dropping malformed push frame: {}", error);
        self.emit(DispatchEvent::ParseError(error.clone()));
        error
    }

    fn emit(&self, event: DispatchEvent) {
        let failures = self.bus.emit(&event);
        if failures > 0 {
            debug!("{} push subscriber(s) failed", failures);
        }
    }

    /// Subscribe to parsed messages and parse errors.
    pub fn subscribe(
        &self,
        callback: impl Fn(&DispatchEvent) + Send + Sync + 'static,
    ) -> Subscription<DispatchEvent> {
        self.bus.subscribe(callback)
    }

    pub fn unsubscribe_all(&self) {
        self.bus.unsubscribe_all();
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Snapshot of the push log in arrival order.
    pub fn push_log(&self) -> Vec<PushMessage> {
        self.log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .messages
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap_or_else(|e| e.into_inner()).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames rejected as malformed.
    pub fn error_count(&self) -> u64 {
        self.log.read().unwrap_or_else(|e| e.into_inner()).errors
    }

    /// Empty the push log and reset the error count (session teardown).
    pub fn clear(&self) {
        let mut log = self.log.write().unwrap_or_else(|e| e.into_inner());
        log.messages.clear();
        log.received = 0;
        log.errors = 0;
    }
}

fn parse_frame(raw: &[u8]) -> Result<Value, ParseError> {
    let reject = |reason: String| ParseError {
        reason,
        len: raw.len(),
    };

    let text = std::str::from_utf8(raw).map_err(|e| reject(format!("invalid UTF-8: {e}")))?;
    if text.trim().is_empty() {
        return Err(reject("empty frame".to_string()));
    }
    serde_json::from_str(text).map_err(|e| reject(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_push_log_counts_only_parsed_frames() {
        let dispatcher = MessageDispatcher::new();
        let frames: [&[u8]; 6] = [
            br#"{"owner": 1}"#,
            b"not json",
            b"42",
            b"",
            &[0xff, 0xfe],
            br#""hello""#,
        ];

        for frame in frames {
            let _ = dispatcher.on_frame(frame);
        }

        let log = dispatcher.push_log();
        assert_eq!(log.len(), 3);
        assert_eq!(dispatcher.error_count(), 3);
        assert_eq!(log[0].value, serde_json::json!({"owner": 1}));
        assert_eq!(log[1].value, serde_json::json!(42));
        assert_eq!(log[2].value, serde_json::json!("hello"));
        assert_eq!(
            log.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_rejected_frame_counted_and_reported() {
        let dispatcher = MessageDispatcher::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        let _sub = dispatcher.subscribe(move |event| {
            if let DispatchEvent::ParseError(e) = event {
                assert_eq!(e.len, 2 * 1024 * 1024);
                errors_clone.fetch_add(1, Ordering::Relaxed);
            }
        });

        let error = dispatcher.on_rejected(2 * 1024 * 1024, "frame exceeds size limit");
        dispatcher.on_frame(b"1").unwrap();

        assert!(error.to_string().contains("size limit"));
        assert_eq!(dispatcher.error_count(), 1);
        assert_eq!(errors.load(Ordering::Relaxed), 1);
        assert_eq!(dispatcher.len(), 1);
        assert_eq!(dispatcher.push_log()[0].seq, 0);
    }

    #[test]
    fn test_retention_trims_oldest() {
        let dispatcher = MessageDispatcher::with_retention(Some(2));
        for n in 0..5 {
            dispatcher.on_frame(n.to_string().as_bytes()).unwrap();
        }

        let log = dispatcher.push_log();
        assert_eq!(dispatcher.len(), 2);
        assert_eq!(
            log.iter().map(|m| (m.seq, m.value.clone())).collect::<Vec<_>>(),
            vec![(3, serde_json::json!(3)), (4, serde_json::json!(4))]
        );
    }

    #[test]
    fn test_arrival_order_not_timestamp_order() {
        let dispatcher = MessageDispatcher::new();
        dispatcher
            .on_frame(br#"{"id": 2, "created": "2024-01-03T00:00:00Z"}"#)
            .unwrap();
        dispatcher
            .on_frame(br#"{"id": 1, "created": "2024-01-01T00:00:00Z"}"#)
            .unwrap();

        let ids: Vec<_> = dispatcher
            .push_log()
            .iter()
            .map(|m| m.value["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_parse_error_reported_to_subscribers() {
        let dispatcher = MessageDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = dispatcher.subscribe(move |event| {
            let label = match event {
                DispatchEvent::Message(_) => "message",
                DispatchEvent::ParseError(_) => "error",
            };
            seen_clone.lock().unwrap().push(label);
        });

        assert!(dispatcher.on_frame(b"{").is_err());
        assert!(dispatcher.on_frame(b"{}").is_ok());

        assert_eq!(*seen.lock().unwrap(), vec!["error", "message"]);
    }

    #[test]
    fn test_failing_subscriber_does_not_corrupt_log() {
        let dispatcher = MessageDispatcher::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = Arc::clone(&delivered);

        let _bad = dispatcher.subscribe(|_| panic!("view crashed"));
        let _good = dispatcher.subscribe(move |_| {
            delivered_clone.fetch_add(1, Ordering::Relaxed);
        });

        for _ in 0..3 {
            dispatcher.on_frame(b"{}").unwrap();
        }

        assert_eq!(dispatcher.len(), 3);
        assert_eq!(delivered.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_subscriber_can_read_log_during_delivery() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = Arc::clone(&observed);
        let weak = Arc::downgrade(&dispatcher);

        let _sub = dispatcher.subscribe(move |_| {
            if let Some(d) = weak.upgrade() {
                observed_clone.store(d.len(), Ordering::Relaxed);
            }
        });

        dispatcher.on_frame(b"[1, 2]").unwrap();

        assert_eq!(observed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_as_item() {
        let dispatcher = MessageDispatcher::new();
        let item_frame = dispatcher
            .on_frame(br#"{"id": 7, "owner": 1, "created": "2024-01-01T00:00:00Z"}"#)
            .unwrap();
        let bare_owner = dispatcher.on_frame(b"1").unwrap();

        assert_eq!(item_frame.as_item().map(|i| i.id), Some(7));
        assert!(bare_owner.as_item().is_none());
    }

    #[test]
    fn test_unsubscribe_all_and_clear() {
        let dispatcher = MessageDispatcher::new();
        let _sub = dispatcher.subscribe(|_| {});
        dispatcher.on_frame(b"{}").unwrap();
        let _ = dispatcher.on_frame(b"}");

        dispatcher.unsubscribe_all();
        dispatcher.clear();

        assert_eq!(dispatcher.subscriber_count(), 0);
        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.error_count(), 0);
    }
}
