/*!
 * IO channels.
 *
 * An IO plugin owns one [`IoChannel`]: the codec, the packet filter, and a
 * session made of a bounded receive queue drained by a single consumer task.
 * Sessions are parented to the device's shutdown signal and task group, and a
 * restart always builds a fresh queue and consumer.
 */
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use lightsim_core::config::SessionConfig;
use lightsim_core::utils::with_timeout;

use crate::device::{Device, Dispatch};
use crate::error::{DeviceError, RespondError, Result};
use crate::event::{Event, EventKind, EventOptions};
use crate::filter::{Decision, Filter};
use crate::plugin::{Io, Operator, Plugin};
use crate::protocol::{Codec, JsonCodec, Message, MessageKind, Packet, Service};
use crate::registry::{PluginFactory, PluginRegistry};

/// Callback the transport gives for sending bytes back to a client
pub type ReplyFn = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Bytes delivered by a transport
#[derive(Clone)]
pub struct Received {
    /// Raw packet
    pub bytes: Bytes,
    /// Where replies go
    pub reply: ReplyFn,
    /// Transport address of the sender
    pub addr: Option<String>,
}

impl Received {
    /// Wrap delivered bytes
    pub fn new<F>(bytes: impl Into<Bytes>, reply: F, addr: Option<String>) -> Self
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        Self {
            bytes: bytes.into(),
            reply: Arc::new(reply),
            addr,
        }
    }
}

impl fmt::Debug for Received {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Received")
            .field("bytes", &self.bytes.len())
            .field("addr", &self.addr)
            .finish()
    }
}

struct Session {
    id: Uuid,
    sender: mpsc::Sender<Received>,
    consumer: AbortHandle,
    done: oneshot::Receiver<()>,
}

#[derive(Default)]
struct ChannelState {
    shutdown: Option<watch::Receiver<bool>>,
    session: Option<Session>,
}

/// Codec, filter and receive session of one IO plugin
pub struct IoChannel {
    source: String,
    codec: Arc<dyn Codec>,
    filter: Filter,
    capacity: usize,
    shutdown_timeout: Duration,
    state: Mutex<ChannelState>,
}

impl fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoChannel")
            .field("source", &self.source)
            .field("codec", &self.codec)
            .field("session", &self.session_id())
            .finish()
    }
}

impl IoChannel {
    /// Create a channel with no session
    pub fn new<S: Into<String>>(source: S, codec: Arc<dyn Codec>, config: &SessionConfig) -> Self {
        Self {
            source: source.into(),
            codec,
            filter: Filter::new(),
            capacity: config.receive_queue_capacity.max(1),
            shutdown_timeout: config.shutdown_timeout(),
            state: Mutex::new(ChannelState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Channel name
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Packet codec
    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    /// Fault injection filter
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Id of the running session
    pub fn session_id(&self) -> Option<Uuid> {
        self.lock().session.as_ref().map(|s| s.id)
    }

    /// Start a receive queue and consumer parented to `shutdown` and the device's tasks
    pub fn start_session(
        &self,
        device: &Arc<Device>,
        io: Arc<dyn Io>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Uuid> {
        let mut state = self.lock();
        if let Some(session) = &state.session {
            return Ok(session.id);
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        let (done_tx, done) = oneshot::channel();
        let consumer = device.spawn_task(
            format!("{} consumer", self.source),
            consume(Arc::downgrade(device), io, receiver, shutdown.clone(), done_tx),
        );

        let id = Uuid::new_v4();
        debug!("Started {} session {} for {}", self.source, id, device.serial());
        state.shutdown = Some(shutdown);
        state.session = Some(Session {
            id,
            sender,
            consumer,
            done,
        });
        Ok(id)
    }

    /// Drain and stop the running session
    pub async fn finish_session(&self, device: &Arc<Device>) -> Result<()> {
        let Some(session) = self.lock().session.take() else {
            return Ok(());
        };

        if device.is_prepared() {
            device.event(EventKind::ShuttingDown).await?;
        }

        let Session {
            id,
            sender,
            consumer,
            done,
        } = session;
        drop(sender);

        let drained = with_timeout(self.shutdown_timeout, async {
            let _ = done.await;
            Ok(())
        })
        .await;
        if drained.is_err() {
            warn!("{} session {} did not drain in time", self.source, id);
        }
        consumer.abort();
        debug!("Finished {} session {} for {}", self.source, id, device.serial());
        Ok(())
    }

    /// Replace the running session with a fresh one on the same shutdown signal
    pub async fn restart_session(&self, device: &Arc<Device>, io: Arc<dyn Io>) -> Result<Uuid> {
        let shutdown = self
            .lock()
            .shutdown
            .clone()
            .ok_or_else(|| DeviceError::RestartWithoutShutdown(self.source.clone()))?;
        self.finish_session(device).await?;
        self.start_session(device, io, shutdown)
    }

    /// Queue bytes for the consumer
    pub async fn received(&self, received: Received) -> Result<()> {
        let sender = self
            .lock()
            .session
            .as_ref()
            .map(|s| s.sender.clone())
            .ok_or_else(|| DeviceError::NoSession(self.source.clone()))?;
        sender
            .send(received)
            .await
            .map_err(|_| DeviceError::NoSession(self.source.clone()))
    }
}

async fn consume(
    device: Weak<Device>,
    io: Arc<dyn Io>,
    mut receiver: mpsc::Receiver<Received>,
    mut shutdown: watch::Receiver<bool>,
    _done: oneshot::Sender<()>,
) -> Result<()> {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = receiver.recv() => {
                let Some(received) = received else {
                    break;
                };
                let Some(device) = device.upgrade() else {
                    break;
                };
                if let Err(e) = process_incoming(&device, io.as_ref(), received).await {
                    warn!("{} failed to process packet: {}", io.io_source(), e);
                }
            }
        }
    }
    Ok(())
}

/// Run one delivered packet through filter, dispatch and reply policy
pub async fn process_incoming(device: &Arc<Device>, io: &dyn Io, received: Received) -> Result<()> {
    let channel = io.channel();
    let packet = channel.codec().decode(&received.bytes)?;
    let serial = device.serial();
    trace!("{} received {} from {:?}", serial, packet.kind(), received.addr);

    if packet.kind() == MessageKind::GetService {
        let address = received.addr.clone().unwrap_or_default();
        if !device.discoverable(io.service(), address).await? {
            return Ok(());
        }
    }

    let event = Event::new(
        serial,
        EventKind::incoming(io.io_source(), packet.clone(), received.addr.clone()),
    );

    let decision = channel.filter().process_request(&event, serial);
    if decision != Decision::Process {
        debug!("{} {:?} {}", serial, decision, packet.kind());
        device
            .event(EventKind::Lost {
                io: io.io_source().to_string(),
                packet,
            })
            .await?;
        return Ok(());
    }

    if device.dispatch(&event, &EventOptions::default()).await? == Dispatch::Stopped {
        return Ok(());
    }

    send(device, io, &event, packet.ack(serial), &received).await?;

    if event.ignored() {
        device
            .event(EventKind::Ignored {
                io: io.io_source().to_string(),
                packet,
            })
            .await?;
        return Ok(());
    }

    if !event.handled() {
        device
            .event(EventKind::Unhandled {
                io: io.io_source().to_string(),
                packet: packet.clone(),
            })
            .await?;
        if device.capability().has_unhandled {
            let reply = packet.reply(
                serial,
                Message::StateUnhandled {
                    unhandled_type: packet.kind().type_id(),
                },
            );
            send(device, io, &event, reply, &received).await?;
        }
        return Ok(());
    }

    for reply in event.replies() {
        send(device, io, &event, packet.reply(serial, reply), &received).await?;
    }
    Ok(())
}

async fn send(
    device: &Arc<Device>,
    io: &dyn Io,
    request: &Event,
    reply: Packet,
    received: &Received,
) -> Result<()> {
    let Some(request_packet) = request.packet() else {
        return Ok(());
    };
    for packet in io.channel().filter().outgoing(reply, request) {
        let bytes = io.channel().codec().encode(&packet)?;
        io.send(bytes, received);
        device
            .event(EventKind::Outgoing {
                io: io.io_source().to_string(),
                packet,
                request: request_packet.clone(),
            })
            .await?;
    }
    Ok(())
}

/// In-process transport: callers hand bytes straight to the channel
#[derive(Debug)]
pub struct MemoryIo {
    channel: IoChannel,
}

impl MemoryIo {
    /// Channel name of the memory transport
    pub const SOURCE: &'static str = "memory";

    /// Create a memory transport speaking JSON
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_codec(Arc::new(JsonCodec), config)
    }

    /// Create a memory transport with another codec
    pub fn with_codec(codec: Arc<dyn Codec>, config: &SessionConfig) -> Self {
        Self {
            channel: IoChannel::new(Self::SOURCE, codec, config),
        }
    }

    /// Deliver bytes from an in-process client
    pub async fn received(&self, received: Received) -> Result<()> {
        self.channel.received(received).await
    }
}

#[async_trait]
impl Operator for MemoryIo {
    fn name(&self) -> &str {
        Self::SOURCE
    }

    async fn respond(
        &self,
        _device: &Arc<Device>,
        event: &Event,
    ) -> std::result::Result<(), RespondError> {
        if event.is_incoming(MessageKind::GetService) {
            event.add_reply(Message::StateService {
                service: Service::Memory,
                port: 0,
            });
        }
        Ok(())
    }
}

impl Io for MemoryIo {
    fn io_source(&self) -> &str {
        Self::SOURCE
    }

    fn channel(&self) -> &IoChannel {
        &self.channel
    }

    fn service(&self) -> Service {
        Service::Memory
    }
}

pub(crate) fn register_builtins(registry: &PluginRegistry) {
    registry.register(PluginFactory::new(MemoryIo::SOURCE, |ctx| {
        Ok(Some(Plugin::Io(Arc::new(MemoryIo::new(&ctx.config.session)))))
    }));
}
