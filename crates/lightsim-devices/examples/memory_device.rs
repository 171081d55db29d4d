//! Drive a virtual strip over the in-process transport.
//!
//! Starts a session, paints a few zones, drops an acknowledgement on purpose
//! and prints every reply the client gets back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tracing::info;

use lightsim_devices::prelude::ConfigBuilder;
use lightsim_devices::protocol::ZoneApply;
use lightsim_devices::{
    Codec, Device, EventType, Firmware, Hsbk, JsonCodec, MemoryIo, Message, MessageKind, Packet,
    Plugin, Product, Received, Recorder,
};

#[tokio::main]
async fn main() -> Result<()> {
    lightsim_core::init()?;
    lightsim_devices::init()?;

    let config = ConfigBuilder::new()
        .with_environment_prefix("LIGHTSIM")
        .build()?;

    let recorder = Arc::new(Recorder::new());
    let device = Device::builder("d073d5000001".parse()?, Product::LCM2_Z, Firmware::new(3, 90, 0))
        .config(config)
        .value("power", 65535)
        .value("label", "shelf")
        .plugin(Plugin::Viewer(recorder.clone()))
        .build();

    device.reset(false).await?;
    device.start_session()?;

    let io = device.io(MemoryIo::SOURCE)?;
    let sent: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    let deliver = |packet: Packet| -> Result<Received> {
        let sent = Arc::clone(&sent);
        Ok(Received::new(
            JsonCodec.encode(&packet)?,
            move |bytes| sent.lock().unwrap_or_else(|e| e.into_inner()).push(bytes),
            Some("memory-client".into()),
        ))
    };

    let _lost = io.channel().filter().lost_acks([MessageKind::SetLabel]);

    io.channel()
        .received(deliver(Packet::new(Message::SetExtendedColorZones {
            zone_index: 2,
            colors: vec![Hsbk::new(0.0, 1.0, 1.0, 3500), Hsbk::new(120.0, 1.0, 1.0, 3500)],
            duration_ms: 0,
            apply: ZoneApply::Apply,
        }))?)
        .await?;
    io.channel()
        .received(deliver(Packet::new(Message::SetLabel {
            label: "strip".into(),
        }))?)
        .await?;
    recorder
        .wait_for(
            |e: &lightsim_devices::Event| {
                e.matches(EventType::Outgoing)
                    && e.packet().map(|p| p.kind()) == Some(MessageKind::StateLabel)
            },
            Duration::from_secs(1),
        )
        .await?;

    for bytes in sent.lock().unwrap_or_else(|e| e.into_inner()).iter() {
        let packet = JsonCodec.decode(bytes)?;
        info!("reply: {:?}", packet.payload);
    }
    info!(
        "{} outgoing, {} attribute changes",
        recorder.count(EventType::Outgoing),
        recorder.count(EventType::AttributeChange)
    );

    device.delete().await?;
    Ok(())
}
