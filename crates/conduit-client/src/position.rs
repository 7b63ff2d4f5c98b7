// Event positions and their attach filter expressions.
use conduit_wire::Message;
use std::sync::atomic::{AtomicI64, Ordering};

pub const SEQUENCE_NUMBER_ANNOTATION: &str = "x-opt-sequence-number";
pub const OFFSET_ANNOTATION: &str = "x-opt-offset";
pub const ENQUEUED_TIME_ANNOTATION: &str = "x-opt-enqueued-time";

const START_OF_STREAM: &str = "-1";
const END_OF_STREAM: &str = "@latest";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Anchor {
    Offset(String),
    SequenceNumber(i64),
    /// Milliseconds since the Unix epoch.
    EnqueuedTime(i64),
}

/// Where a receiver starts reading a partition.
///
/// ```
/// use conduit_client::EventPosition;
///
/// assert_eq!(
///     EventPosition::sequence_number(41, false).filter_expression(),
///     "amqp.annotation.x-opt-sequence-number > '41'"
/// );
/// assert_eq!(
///     EventPosition::earliest().filter_expression(),
///     "amqp.annotation.x-opt-offset > '-1'"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPosition {
    anchor: Anchor,
    inclusive: bool,
}

impl EventPosition {
    pub fn earliest() -> Self {
        Self::offset(START_OF_STREAM, false)
    }

    pub fn latest() -> Self {
        Self::offset(END_OF_STREAM, false)
    }

    pub fn offset(offset: impl Into<String>, inclusive: bool) -> Self {
        Self {
            anchor: Anchor::Offset(offset.into()),
            inclusive,
        }
    }

    pub fn sequence_number(sequence_number: i64, inclusive: bool) -> Self {
        Self {
            anchor: Anchor::SequenceNumber(sequence_number),
            inclusive,
        }
    }

    pub fn enqueued_time(epoch_millis: i64) -> Self {
        Self {
            anchor: Anchor::EnqueuedTime(epoch_millis),
            inclusive: false,
        }
    }

    pub fn is_inclusive(&self) -> bool {
        self.inclusive
    }

    pub fn filter_expression(&self) -> String {
        let op = if self.inclusive { ">=" } else { ">" };
        match &self.anchor {
            Anchor::Offset(offset) => {
                format!("amqp.annotation.{OFFSET_ANNOTATION} {op} '{offset}'")
            }
            Anchor::SequenceNumber(sequence_number) => {
                format!("amqp.annotation.{SEQUENCE_NUMBER_ANNOTATION} {op} '{sequence_number}'")
            }
            Anchor::EnqueuedTime(millis) => {
                format!("amqp.annotation.{ENQUEUED_TIME_ANNOTATION} {op} '{millis}'")
            }
        }
    }
}

/// Position a replacement link attaches at: just after the last buffered
/// event, or the initial position if nothing has been buffered yet.
#[derive(Debug)]
pub struct PositionTracker {
    initial: EventPosition,
    last_sequence_number: AtomicI64,
}

const NOTHING_BUFFERED: i64 = i64::MIN;

impl PositionTracker {
    pub fn new(initial: EventPosition) -> Self {
        Self {
            initial,
            last_sequence_number: AtomicI64::new(NOTHING_BUFFERED),
        }
    }

    pub fn record(&self, message: &Message) {
        if let Some(sequence_number) = message.annotation_i64(SEQUENCE_NUMBER_ANNOTATION) {
            self.last_sequence_number
                .fetch_max(sequence_number, Ordering::AcqRel);
        }
    }

    pub fn last_sequence_number(&self) -> Option<i64> {
        match self.last_sequence_number.load(Ordering::Acquire) {
            NOTHING_BUFFERED => None,
            sequence_number => Some(sequence_number),
        }
    }

    pub fn current(&self) -> EventPosition {
        match self.last_sequence_number() {
            Some(sequence_number) => EventPosition::sequence_number(sequence_number, false),
            None => self.initial.clone(),
        }
    }
}
