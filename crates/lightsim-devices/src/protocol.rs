/*!
 * Protocol messages and the codec seam.
 *
 * The binary wire format lives outside this crate. Devices only see typed
 * [`Packet`]s, and a [`Codec`] turns transport bytes into packets and back.
 * [`JsonCodec`] is the in-tree codec used by the memory transport and tests.
 */
use std::fmt::Debug;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use lightsim_core::types::{RangeHook, Record, Value};

use crate::error::{DeviceError, Result};
use crate::product::Serial;

/// Hue, saturation, brightness and kelvin
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Hsbk {
    /// Hue in degrees
    pub hue: f64,
    /// Saturation from 0 to 1
    pub saturation: f64,
    /// Brightness from 0 to 1
    pub brightness: f64,
    /// Colour temperature
    pub kelvin: u16,
}

impl Hsbk {
    /// Create a colour
    pub const fn new(hue: f64, saturation: f64, brightness: f64, kelvin: u16) -> Self {
        Self {
            hue,
            saturation,
            brightness,
            kelvin,
        }
    }

    /// Read a colour back out of an attribute record
    pub fn from_value(value: &Value) -> Option<Self> {
        let record = value.as_record()?;
        Some(Self {
            hue: record.get("hue")?.as_float()?,
            saturation: record.get("saturation")?.as_float()?,
            brightness: record.get("brightness")?.as_float()?,
            kelvin: record.get("kelvin")?.as_integer()? as u16,
        })
    }
}

impl From<Hsbk> for Value {
    fn from(color: Hsbk) -> Self {
        Value::Record(
            Record::new()
                .with("hue", color.hue)
                .with("saturation", color.saturation)
                .with("brightness", color.brightness)
                .with("kelvin", color.kelvin)
                .with_hook(std::sync::Arc::new(
                    RangeHook::new("hsbk")
                        .range("hue", 0.0, 360.0)
                        .range("saturation", 0.0, 1.0)
                        .range("brightness", 0.0, 1.0)
                        .range("kelvin", 1500.0, 9000.0),
                )),
        )
    }
}

/// Transport a StateService advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    /// Datagram transport
    Udp,
    /// In-process transport
    Memory,
}

/// How a multizone set request is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZoneApply {
    /// Buffer the change
    NoApply,
    /// Apply buffered and requested changes
    #[default]
    Apply,
    /// Apply buffered changes only
    ApplyOnly,
}

/// Outcome of the most recent clean cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HevCycleResult {
    /// Ran to completion
    Success,
    /// Could not start
    Busy,
    /// Stopped by power loss or reset
    InterruptedByReset,
    /// Stopped from HomeKit
    InterruptedByHomekit,
    /// Stopped by a LAN message
    InterruptedByLan,
    /// Stopped from the cloud
    InterruptedByCloud,
    /// No cycle has run
    #[default]
    None,
}

impl HevCycleResult {
    /// Name stored in attributes
    pub fn as_str(&self) -> &'static str {
        match self {
            HevCycleResult::Success => "success",
            HevCycleResult::Busy => "busy",
            HevCycleResult::InterruptedByReset => "interrupted_by_reset",
            HevCycleResult::InterruptedByHomekit => "interrupted_by_homekit",
            HevCycleResult::InterruptedByLan => "interrupted_by_lan",
            HevCycleResult::InterruptedByCloud => "interrupted_by_cloud",
            HevCycleResult::None => "none",
        }
    }

    /// Parse the name stored in attributes
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => HevCycleResult::Success,
            "busy" => HevCycleResult::Busy,
            "interrupted_by_reset" => HevCycleResult::InterruptedByReset,
            "interrupted_by_homekit" => HevCycleResult::InterruptedByHomekit,
            "interrupted_by_lan" => HevCycleResult::InterruptedByLan,
            "interrupted_by_cloud" => HevCycleResult::InterruptedByCloud,
            _ => HevCycleResult::None,
        }
    }
}

macro_rules! messages {
    ($( $(#[$doc:meta])* $name:ident = $id:literal $({ $($field:ident : $ty:ty),* $(,)? })? ),* $(,)?) => {
        /// Typed payload of a packet
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "type")]
        #[allow(missing_docs)]
        pub enum Message {
            $( $(#[$doc])* $name $({ $($field: $ty),* })? ),*
        }

        /// Tag identifying a message type, used by events and filters
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum MessageKind {
            $( $(#[$doc])* $name ),*
        }

        impl Message {
            /// The kind of this message
            pub fn kind(&self) -> MessageKind {
                match self {
                    $( Message::$name { .. } => MessageKind::$name ),*
                }
            }
        }

        impl MessageKind {
            /// Protocol number of this message type
            pub fn type_id(&self) -> u16 {
                match self {
                    $( MessageKind::$name => $id ),*
                }
            }

            /// Name of this message type
            pub fn name(&self) -> &'static str {
                match self {
                    $( MessageKind::$name => stringify!($name) ),*
                }
            }
        }
    };
}

messages! {
    /// Discovery probe
    GetService = 2,
    /// Discovery answer
    StateService = 3 { service: Service, port: u32 },
    /// Ask for firmware
    GetHostFirmware = 14,
    /// Firmware answer
    StateHostFirmware = 15 { build: u64, version_major: u16, version_minor: u16 },
    /// Ask for power level
    GetPower = 20,
    /// Change power level
    SetPower = 21 { level: u16 },
    /// Power level answer
    StatePower = 22 { level: u16 },
    /// Ask for label
    GetLabel = 23,
    /// Change label
    SetLabel = 24 { label: String },
    /// Label answer
    StateLabel = 25 { label: String },
    /// Ask for product ids
    GetVersion = 32,
    /// Product ids answer
    StateVersion = 33 { vendor: u32, product: u32 },
    /// Acknowledgement of a request with ack_required
    Acknowledgement = 45,
    /// Echo probe
    EchoRequest = 58 { echoing: Vec<u8> },
    /// Echo answer
    EchoResponse = 59 { echoing: Vec<u8> },
    /// Ask for colour
    GetColor = 101,
    /// Change colour
    SetColor = 102 { color: Hsbk, duration_ms: u32 },
    /// Colour answer
    LightState = 107 { color: Hsbk, power: u16, label: String },
    /// Ask for light power
    GetLightPower = 116,
    /// Change light power with a transition
    SetLightPower = 117 { level: u16, duration_ms: u32 },
    /// Light power answer
    StateLightPower = 118 { level: u16 },
    /// Ask for infrared brightness
    GetInfrared = 120,
    /// Infrared answer
    StateInfrared = 121 { brightness: u16 },
    /// Change infrared brightness
    SetInfrared = 122 { brightness: u16 },
    /// Ask for the running clean cycle
    GetHevCycle = 142,
    /// Start or stop a clean cycle
    SetHevCycle = 143 { enable: bool, duration_s: u32 },
    /// Clean cycle answer
    StateHevCycle = 144 { duration_s: u32, remaining_s: u32, last_power: bool },
    /// Ask for clean cycle defaults
    GetHevCycleConfiguration = 145,
    /// Change clean cycle defaults
    SetHevCycleConfiguration = 146 { indication: bool, duration_s: u32 },
    /// Clean cycle defaults answer
    StateHevCycleConfiguration = 147 { indication: bool, duration_s: u32 },
    /// Ask how the last clean cycle ended
    GetLastHevCycleResult = 148,
    /// Last clean cycle answer
    StateLastHevCycleResult = 149 { result: HevCycleResult },
    /// Reply to a message nothing understood
    StateUnhandled = 223 { unhandled_type: u16 },
    /// Paint a range of zones one colour
    SetColorZones = 501 { start_index: u8, end_index: u8, color: Hsbk, duration_ms: u32, apply: ZoneApply },
    /// Ask for a range of zones
    GetColorZones = 502 { start_index: u8, end_index: u8 },
    /// One zone answer
    StateZone = 503 { zones_count: u8, zone_index: u8, color: Hsbk },
    /// Up to eight zones answer
    StateMultiZone = 506 { zones_count: u8, zone_index: u8, colors: Vec<Hsbk> },
    /// Paint many zones at once
    SetExtendedColorZones = 510 { zone_index: u16, colors: Vec<Hsbk>, duration_ms: u32, apply: ZoneApply },
    /// Ask for every zone at once
    GetExtendedColorZones = 511,
    /// Every zone answer
    StateExtendedColorZones = 512 { zones_count: u16, zone_index: u16, colors: Vec<Hsbk> },
    /// Ask for a relay
    GetRPower = 816 { relay_index: u8 },
    /// Switch a relay
    SetRPower = 817 { relay_index: u8, level: u16 },
    /// Relay answer
    StateRPower = 818 { relay_index: u8, level: u16 },
}

impl MessageKind {
    /// Whether this is a query for state
    pub fn is_get(&self) -> bool {
        self.name().starts_with("Get")
    }

    /// Whether this is the acknowledgement message
    pub fn is_ack(&self) -> bool {
        *self == MessageKind::Acknowledgement
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A typed protocol packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Client chosen source id
    pub source: u32,
    /// Client chosen sequence number
    pub sequence: u8,
    /// Target device, `None` addresses every device
    pub target: Option<Serial>,
    /// Whether the sender wants an acknowledgement
    pub ack_required: bool,
    /// Whether the sender wants a state reply to a set
    pub res_required: bool,
    /// The message itself
    pub payload: Message,
}

impl Packet {
    /// A broadcast packet wanting both an ack and a response
    pub fn new(payload: Message) -> Self {
        Self {
            source: 0,
            sequence: 0,
            target: None,
            ack_required: true,
            res_required: true,
            payload,
        }
    }

    /// Address the packet to one device
    pub fn to(mut self, serial: Serial) -> Self {
        self.target = Some(serial);
        self
    }

    /// Set the source and sequence
    pub fn from_client(mut self, source: u32, sequence: u8) -> Self {
        self.source = source;
        self.sequence = sequence;
        self
    }

    /// Set whether an acknowledgement is wanted
    pub fn ack_required(mut self, ack_required: bool) -> Self {
        self.ack_required = ack_required;
        self
    }

    /// Set whether a response is wanted
    pub fn res_required(mut self, res_required: bool) -> Self {
        self.res_required = res_required;
        self
    }

    /// Kind of the payload
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Whether the packet addresses every device
    pub fn is_broadcast(&self) -> bool {
        self.target.map(|t| t.is_broadcast()).unwrap_or(true)
    }

    /// Build a reply from `serial` carrying `payload`
    pub fn reply(&self, serial: Serial, payload: Message) -> Packet {
        Packet {
            source: self.source,
            sequence: self.sequence,
            target: Some(serial),
            ack_required: false,
            res_required: false,
            payload,
        }
    }

    /// The acknowledgement for this packet
    pub fn ack(&self, serial: Serial) -> Packet {
        self.reply(serial, Message::Acknowledgement)
    }
}

/// Converts between transport bytes and packets
pub trait Codec: Send + Sync + Debug {
    /// Decode one packet
    fn decode(&self, bytes: &[u8]) -> Result<Packet>;

    /// Encode one packet
    fn encode(&self, packet: &Packet) -> Result<Bytes>;
}

/// Codec that frames packets as JSON documents
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Packet> {
        serde_json::from_slice(bytes).map_err(|e| DeviceError::Codec(e.to_string()))
    }

    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        serde_json::to_vec(packet)
            .map(Bytes::from)
            .map_err(|e| DeviceError::Codec(e.to_string()))
    }
}
