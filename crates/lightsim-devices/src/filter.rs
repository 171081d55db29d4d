/*!
 * Fault injection between a device and its transport.
 *
 * Every IO channel has a [`Filter`]. It decides whether an incoming packet is
 * processed, and which acknowledgements and replies actually go out. Tests
 * bend that policy with hooks and mute lists, each installed through a
 * [`FilterGuard`] that removes it again when dropped.
 */
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::event::Event;
use crate::product::Serial;
use crate::protocol::{MessageKind, Packet};

/// Outcome of request filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Handle the packet
    Process,
    /// Not for this device
    Reject,
    /// Pretend the packet never arrived
    Lost,
}

/// Observes incoming packets
pub type SeeRequest = Arc<dyn Fn(&Event) + Send + Sync>;
/// Overrides the request decision, `None` defers to the next hook
pub type InterceptRequest = Arc<dyn Fn(&Event) -> Option<Decision> + Send + Sync>;
/// Observes outgoing packets
pub type SeeOutgoing = Arc<dyn Fn(&Packet, &Event) + Send + Sync>;
/// Overrides what goes out for a reply, `None` defers to the next hook
pub type InterceptOutgoing = Arc<dyn Fn(&Packet, &Event) -> Option<Vec<Packet>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    SeeRequest,
    InterceptRequest,
    SeeOutgoing,
    InterceptOutgoing,
    LostRequest,
    LostAcks,
    LostReplies,
}

#[derive(Default)]
struct State {
    next_id: u64,
    see_request: Vec<(u64, SeeRequest)>,
    intercept_request: Vec<(u64, InterceptRequest)>,
    see_outgoing: Vec<(u64, SeeOutgoing)>,
    intercept_outgoing: Vec<(u64, InterceptOutgoing)>,
    lost_request: Vec<(u64, Vec<MessageKind>)>,
    lost_acks: Vec<(u64, Vec<MessageKind>)>,
    lost_replies: Vec<(u64, Vec<MessageKind>)>,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, slot: Slot, id: u64) {
        match slot {
            Slot::SeeRequest => self.see_request.retain(|(i, _)| *i != id),
            Slot::InterceptRequest => self.intercept_request.retain(|(i, _)| *i != id),
            Slot::SeeOutgoing => self.see_outgoing.retain(|(i, _)| *i != id),
            Slot::InterceptOutgoing => self.intercept_outgoing.retain(|(i, _)| *i != id),
            Slot::LostRequest => self.lost_request.retain(|(i, _)| *i != id),
            Slot::LostAcks => self.lost_acks.retain(|(i, _)| *i != id),
            Slot::LostReplies => self.lost_replies.retain(|(i, _)| *i != id),
        }
    }
}

fn muted(list: &[(u64, Vec<MessageKind>)], kind: MessageKind) -> bool {
    list.iter().any(|(_, kinds)| kinds.contains(&kind))
}

/// Request and reply policy of one IO channel
#[derive(Clone, Default)]
pub struct Filter {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Filter")
            .field("intercept_request", &state.intercept_request.len())
            .field("intercept_outgoing", &state.intercept_outgoing.len())
            .field("lost_request", &state.lost_request.len())
            .field("lost_acks", &state.lost_acks.len())
            .field("lost_replies", &state.lost_replies.len())
            .finish()
    }
}

/// Removes a filter override when dropped
#[must_use = "the override is removed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct FilterGuard {
    filter: Filter,
    slot: Slot,
    id: u64,
}

impl Drop for FilterGuard {
    fn drop(&mut self) {
        self.filter.lock().remove(self.slot, self.id);
    }
}

impl Filter {
    /// Create a filter with the default policy
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn install(&self, slot: Slot, f: impl FnOnce(&mut State, u64)) -> FilterGuard {
        let mut state = self.lock();
        let id = state.id();
        f(&mut state, id);
        FilterGuard {
            filter: self.clone(),
            slot,
            id,
        }
    }

    /// Observe every incoming packet
    pub fn see_request<F>(&self, f: F) -> FilterGuard
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.install(Slot::SeeRequest, |s, id| s.see_request.push((id, Arc::new(f))))
    }

    /// Override the request decision
    pub fn intercept_request<F>(&self, f: F) -> FilterGuard
    where
        F: Fn(&Event) -> Option<Decision> + Send + Sync + 'static,
    {
        self.install(Slot::InterceptRequest, |s, id| {
            s.intercept_request.push((id, Arc::new(f)))
        })
    }

    /// Observe every reply offered for sending
    pub fn see_outgoing<F>(&self, f: F) -> FilterGuard
    where
        F: Fn(&Packet, &Event) + Send + Sync + 'static,
    {
        self.install(Slot::SeeOutgoing, |s, id| s.see_outgoing.push((id, Arc::new(f))))
    }

    /// Override what goes out for a reply
    pub fn intercept_outgoing<F>(&self, f: F) -> FilterGuard
    where
        F: Fn(&Packet, &Event) -> Option<Vec<Packet>> + Send + Sync + 'static,
    {
        self.install(Slot::InterceptOutgoing, |s, id| {
            s.intercept_outgoing.push((id, Arc::new(f)))
        })
    }

    /// Drop incoming packets of these kinds before processing
    pub fn lost_request<I: IntoIterator<Item = MessageKind>>(&self, kinds: I) -> FilterGuard {
        let kinds = kinds.into_iter().collect();
        self.install(Slot::LostRequest, |s, id| s.lost_request.push((id, kinds)))
    }

    /// Suppress acknowledgements to requests of these kinds
    pub fn lost_acks<I: IntoIterator<Item = MessageKind>>(&self, kinds: I) -> FilterGuard {
        let kinds = kinds.into_iter().collect();
        self.install(Slot::LostAcks, |s, id| s.lost_acks.push((id, kinds)))
    }

    /// Suppress replies of these kinds, or replies to requests of these kinds
    pub fn lost_replies<I: IntoIterator<Item = MessageKind>>(&self, kinds: I) -> FilterGuard {
        let kinds = kinds.into_iter().collect();
        self.install(Slot::LostReplies, |s, id| s.lost_replies.push((id, kinds)))
    }

    /// Decide what happens to an incoming packet addressed as in `event`
    pub fn process_request(&self, event: &Event, serial: Serial) -> Decision {
        let Some(packet) = event.packet() else {
            return Decision::Reject;
        };

        let (see, intercept, lost) = {
            let state = self.lock();
            (
                state.see_request.clone(),
                state.intercept_request.clone(),
                muted(&state.lost_request, packet.kind()),
            )
        };

        for (_, f) in see.iter() {
            f(event);
        }

        if lost {
            trace!("{} lost by filter", packet.kind());
            return Decision::Lost;
        }

        for (_, f) in intercept.iter().rev() {
            if let Some(decision) = f(event) {
                return decision;
            }
        }

        match packet.target {
            None => Decision::Process,
            Some(target) if target.is_broadcast() || target == serial => Decision::Process,
            Some(_) => Decision::Reject,
        }
    }

    /// Packets that actually go out for `reply` to the request in `request`
    pub fn outgoing(&self, reply: Packet, request: &Event) -> Vec<Packet> {
        let (see, intercept, lost_acks, lost_replies) = {
            let state = self.lock();
            (
                state.see_outgoing.clone(),
                state.intercept_outgoing.clone(),
                state.lost_acks.clone(),
                state.lost_replies.clone(),
            )
        };

        for (_, f) in see.iter() {
            f(&reply, request);
        }

        for (_, f) in intercept.iter().rev() {
            if let Some(packets) = f(&reply, request) {
                return packets;
            }
        }

        let Some(req) = request.packet() else {
            return vec![reply];
        };
        let reply_kind = reply.kind();
        let request_kind = req.kind();

        if reply_kind.is_ack() {
            if !req.ack_required || muted(&lost_acks, request_kind) {
                trace!("ack for {} suppressed", request_kind);
                return Vec::new();
            }
            return vec![reply];
        }

        if !req.res_required && !request_kind.is_get() {
            return Vec::new();
        }

        if muted(&lost_replies, reply_kind) || muted(&lost_replies, request_kind) {
            trace!("{} for {} suppressed", reply_kind, request_kind);
            return Vec::new();
        }

        vec![reply]
    }
}
