/*!
 * Events raised by a device and dispatched to its plugins.
 *
 * The set of event types is closed. Plugins match on [`EventKind`] directly,
 * or ask [`Event::matches`] whether an event is of a given type, a given type
 * arriving through a particular IO channel, or equal to another event.
 */
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::Level;

use crate::attrs::Change;
use crate::product::Serial;
use crate::protocol::{Message, MessageKind, Packet, Service};

/// The closed set of event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// A packet arrived through an IO channel
    Incoming,
    /// A packet was sent through an IO channel
    Outgoing,
    /// No plugin recognised an incoming packet
    Unhandled,
    /// A plugin saw an incoming packet and chose not to act on it
    Ignored,
    /// An incoming packet was dropped before processing
    Lost,
    /// Attributes changed
    AttributeChange,
    /// Diagnostic note, usually a plugin failure
    Annotation,
    /// The device is being reset
    Reset,
    /// The device gained power
    PowerOn,
    /// The device lost power
    PowerOff,
    /// The device or one of its channels is shutting down
    ShuttingDown,
    /// The device is being deleted
    Delete,
    /// A discovery probe is asking whether the device is visible
    Discoverable,
}

impl EventType {
    /// All event types
    pub const ALL: [EventType; 13] = [
        EventType::Incoming,
        EventType::Outgoing,
        EventType::Unhandled,
        EventType::Ignored,
        EventType::Lost,
        EventType::AttributeChange,
        EventType::Annotation,
        EventType::Reset,
        EventType::PowerOn,
        EventType::PowerOff,
        EventType::ShuttingDown,
        EventType::Delete,
        EventType::Discoverable,
    ];

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            EventType::Incoming => "INCOMING",
            EventType::Outgoing => "OUTGOING",
            EventType::Unhandled => "UNHANDLED",
            EventType::Ignored => "IGNORED",
            EventType::Lost => "LOST",
            EventType::AttributeChange => "ATTRIBUTE_CHANGE",
            EventType::Annotation => "ANNOTATION",
            EventType::Reset => "RESET",
            EventType::PowerOn => "POWER_ON",
            EventType::PowerOff => "POWER_OFF",
            EventType::ShuttingDown => "SHUTTING_DOWN",
            EventType::Delete => "DELETE",
            EventType::Discoverable => "DISCOVERABLE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What plugins decided about an incoming packet
#[derive(Debug, Clone, Default)]
pub struct ReplyState {
    replies: Vec<Message>,
    handled: bool,
    ignored: bool,
}

/// Type specific payload of an event
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A packet arrived
    Incoming {
        /// Channel the packet came through
        io: String,
        /// The decoded packet
        packet: Packet,
        /// Transport address of the sender
        addr: Option<String>,
        /// Replies collected while plugins handle the packet
        replies: Arc<Mutex<ReplyState>>,
    },
    /// A packet was sent
    Outgoing {
        /// Channel the packet went through
        io: String,
        /// The packet that was sent
        packet: Packet,
        /// The request it answers
        request: Packet,
    },
    /// Nothing recognised a packet
    Unhandled {
        /// Channel the packet came through
        io: String,
        /// The packet
        packet: Packet,
    },
    /// A packet was deliberately not acted on
    Ignored {
        /// Channel the packet came through
        io: String,
        /// The packet
        packet: Packet,
    },
    /// A packet was dropped before processing
    Lost {
        /// Channel the packet came through
        io: String,
        /// The packet
        packet: Packet,
    },
    /// Attributes changed
    AttributeChange {
        /// Every change in the batch, applied or failed
        changes: Vec<Change>,
        /// Whether the store had finished initialising
        attrs_started: bool,
        /// The event that caused the batch
        because: Option<Box<Event>>,
    },
    /// Diagnostic note
    Annotation {
        /// Severity
        level: Level,
        /// What happened
        message: String,
    },
    /// Reset in progress
    Reset {
        /// Whether attributes go back to zero values
        zerod: bool,
    },
    /// Power restored
    PowerOn,
    /// Power removed
    PowerOff,
    /// Shutting down
    ShuttingDown,
    /// Deleted
    Delete,
    /// Discovery probe
    Discoverable {
        /// Service the probe arrived on
        service: Service,
        /// Address the device would answer from
        address: String,
    },
}

impl EventKind {
    /// The type of this payload
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::Incoming { .. } => EventType::Incoming,
            EventKind::Outgoing { .. } => EventType::Outgoing,
            EventKind::Unhandled { .. } => EventType::Unhandled,
            EventKind::Ignored { .. } => EventType::Ignored,
            EventKind::Lost { .. } => EventType::Lost,
            EventKind::AttributeChange { .. } => EventType::AttributeChange,
            EventKind::Annotation { .. } => EventType::Annotation,
            EventKind::Reset { .. } => EventType::Reset,
            EventKind::PowerOn => EventType::PowerOn,
            EventKind::PowerOff => EventType::PowerOff,
            EventKind::ShuttingDown => EventType::ShuttingDown,
            EventKind::Delete => EventType::Delete,
            EventKind::Discoverable { .. } => EventType::Discoverable,
        }
    }

    /// Create an incoming payload with an empty reply state
    pub fn incoming<S: Into<String>>(io: S, packet: Packet, addr: Option<String>) -> Self {
        EventKind::Incoming {
            io: io.into(),
            packet,
            addr,
            replies: Arc::new(Mutex::new(ReplyState::default())),
        }
    }
}

// Equality only looks at the fields that show up in logs.
impl PartialEq for EventKind {
    fn eq(&self, other: &Self) -> bool {
        use EventKind::*;
        match (self, other) {
            (
                Incoming {
                    io: a, packet: pa, ..
                },
                Incoming {
                    io: b, packet: pb, ..
                },
            ) => a == b && pa == pb,
            (
                Outgoing {
                    io: a,
                    packet: pa,
                    request: ra,
                },
                Outgoing {
                    io: b,
                    packet: pb,
                    request: rb,
                },
            ) => a == b && pa == pb && ra == rb,
            (Unhandled { io: a, packet: pa }, Unhandled { io: b, packet: pb })
            | (Ignored { io: a, packet: pa }, Ignored { io: b, packet: pb })
            | (Lost { io: a, packet: pa }, Lost { io: b, packet: pb }) => a == b && pa == pb,
            (
                AttributeChange {
                    changes: ca,
                    attrs_started: sa,
                    because: ba,
                },
                AttributeChange {
                    changes: cb,
                    attrs_started: sb,
                    because: bb,
                },
            ) => ca == cb && sa == sb && ba == bb,
            (
                Annotation {
                    level: la,
                    message: ma,
                },
                Annotation {
                    level: lb,
                    message: mb,
                },
            ) => la == lb && ma == mb,
            (Reset { zerod: a }, Reset { zerod: b }) => a == b,
            (
                Discoverable {
                    service: sa,
                    address: aa,
                },
                Discoverable {
                    service: sb,
                    address: ab,
                },
            ) => sa == sb && aa == ab,
            (PowerOn, PowerOn)
            | (PowerOff, PowerOff)
            | (ShuttingDown, ShuttingDown)
            | (Delete, Delete) => true,
            _ => false,
        }
    }
}

/// Something that happened to a device
#[derive(Debug, Clone)]
pub struct Event {
    /// Device the event belongs to
    pub serial: Serial,
    /// When the event was created
    pub created_at: DateTime<Utc>,
    /// Type specific fields
    pub kind: EventKind,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial && self.kind == other.kind
    }
}

/// What an event can be compared against
#[derive(Debug, Clone)]
pub enum EventMatcher {
    /// Any event of this type
    Type(EventType),
    /// Events of this type tied to the named IO channel
    TypeIo(EventType, String),
    /// Events equal to this one
    Event(Box<Event>),
}

impl From<EventType> for EventMatcher {
    fn from(t: EventType) -> Self {
        EventMatcher::Type(t)
    }
}

impl<S: Into<String>> From<(EventType, S)> for EventMatcher {
    fn from((t, io): (EventType, S)) -> Self {
        EventMatcher::TypeIo(t, io.into())
    }
}

impl From<Event> for EventMatcher {
    fn from(e: Event) -> Self {
        EventMatcher::Event(Box::new(e))
    }
}

impl From<&Event> for EventMatcher {
    fn from(e: &Event) -> Self {
        EventMatcher::Event(Box::new(e.clone()))
    }
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(serial: Serial, kind: EventKind) -> Self {
        Self {
            serial,
            created_at: Utc::now(),
            kind,
        }
    }

    /// Type of this event
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Whether this event is of `matcher`'s type, type and channel, or equal to it
    pub fn matches<M: Into<EventMatcher>>(&self, matcher: M) -> bool {
        match matcher.into() {
            EventMatcher::Type(t) => self.event_type() == t,
            EventMatcher::TypeIo(t, io) => self.event_type() == t && self.io() == Some(io.as_str()),
            EventMatcher::Event(other) => *self == *other,
        }
    }

    /// IO channel this event is tied to
    pub fn io(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Incoming { io, .. }
            | EventKind::Outgoing { io, .. }
            | EventKind::Unhandled { io, .. }
            | EventKind::Ignored { io, .. }
            | EventKind::Lost { io, .. } => Some(io),
            _ => None,
        }
    }

    /// Packet this event is about
    pub fn packet(&self) -> Option<&Packet> {
        match &self.kind {
            EventKind::Incoming { packet, .. }
            | EventKind::Outgoing { packet, .. }
            | EventKind::Unhandled { packet, .. }
            | EventKind::Ignored { packet, .. }
            | EventKind::Lost { packet, .. } => Some(packet),
            _ => None,
        }
    }

    /// The incoming message, if this is an INCOMING event
    pub fn incoming(&self) -> Option<&Message> {
        match &self.kind {
            EventKind::Incoming { packet, .. } => Some(&packet.payload),
            _ => None,
        }
    }

    /// Whether this is an INCOMING event carrying `kind`
    pub fn is_incoming(&self, kind: MessageKind) -> bool {
        self.incoming().map(|m| m.kind() == kind).unwrap_or(false)
    }

    fn with_replies<T>(&self, f: impl FnOnce(&mut ReplyState) -> T) -> Option<T> {
        match &self.kind {
            EventKind::Incoming { replies, .. } => {
                let mut state = replies.lock().unwrap_or_else(|e| e.into_inner());
                Some(f(&mut state))
            }
            _ => None,
        }
    }

    /// Queue a reply to an incoming packet, marking it handled
    pub fn add_reply(&self, reply: Message) {
        self.with_replies(|s| {
            s.handled = true;
            s.replies.push(reply);
        });
    }

    /// Queue several replies to an incoming packet
    pub fn add_replies<I: IntoIterator<Item = Message>>(&self, replies: I) {
        self.with_replies(|s| {
            s.handled = true;
            s.replies.extend(replies);
        });
    }

    /// Mark an incoming packet handled without replying
    pub fn mark_handled(&self) {
        self.with_replies(|s| s.handled = true);
    }

    /// Mark an incoming packet as deliberately ignored
    pub fn mark_ignored(&self) {
        self.with_replies(|s| s.ignored = true);
    }

    /// Replies queued so far
    pub fn replies(&self) -> Vec<Message> {
        self.with_replies(|s| s.replies.clone()).unwrap_or_default()
    }

    /// Whether any plugin handled the incoming packet
    pub fn handled(&self) -> bool {
        self.with_replies(|s| s.handled).unwrap_or(false)
    }

    /// Whether a plugin chose to ignore the incoming packet
    pub fn ignored(&self) -> bool {
        self.with_replies(|s| s.ignored).unwrap_or(false)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}", self.serial, self.event_type())?;
        match &self.kind {
            EventKind::Incoming { io, packet, .. }
            | EventKind::Unhandled { io, packet }
            | EventKind::Ignored { io, packet }
            | EventKind::Lost { io, packet } => {
                write!(f, " {}:{}", io, packet.kind())?;
            }
            EventKind::Outgoing {
                io,
                packet,
                request,
            } => {
                write!(f, " {}:{} for {}", io, packet.kind(), request.kind())?;
            }
            EventKind::AttributeChange {
                changes,
                attrs_started,
                ..
            } => {
                write!(f, " started={}", attrs_started)?;
                for change in changes {
                    write!(f, " {}", change)?;
                }
            }
            EventKind::Annotation { level, message } => write!(f, " {} {}", level, message)?,
            EventKind::Reset { zerod } => write!(f, " zerod={}", zerod)?,
            EventKind::Discoverable { service, address } => {
                write!(f, " {:?} {}", service, address)?;
            }
            EventKind::PowerOn | EventKind::PowerOff | EventKind::ShuttingDown | EventKind::Delete => {}
        }
        write!(f, ">")
    }
}

/// Predicate deciding whether dispatch stops after a plugin handled an event
pub type StopWhen = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// How an event is dispatched
#[derive(Clone)]
pub struct EventOptions {
    /// Whether viewers see the event
    pub visible: bool,
    /// Whether only viewers see the event
    pub viewers_only: bool,
    /// Checked after each plugin; dispatch stops when it returns true
    pub stop_when: Option<StopWhen>,
}

impl Default for EventOptions {
    fn default() -> Self {
        Self {
            visible: true,
            viewers_only: false,
            stop_when: None,
        }
    }
}

impl EventOptions {
    /// Hide the event from viewers
    pub fn invisible() -> Self {
        Self {
            visible: false,
            ..Self::default()
        }
    }

    /// Only deliver the event to viewers
    pub fn viewers_only() -> Self {
        Self {
            viewers_only: true,
            ..Self::default()
        }
    }

    /// Stop dispatch once `f` returns true
    pub fn stop_when<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.stop_when = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for EventOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventOptions")
            .field("visible", &self.visible)
            .field("viewers_only", &self.viewers_only)
            .field("stop_when", &self.stop_when.is_some())
            .finish()
    }
}
