/*!
 * Device identity: serials, firmware versions and product descriptors.
 *
 * Plugins decide whether they apply to a device by looking at the
 * [`Capability`] its product reports for the device's firmware.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DeviceError;

/// Fixed length hardware identifier of a device
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Serial([u8; 6]);

impl Serial {
    /// Create a serial from raw bytes
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// The all zero serial used to address every device
    pub const fn broadcast() -> Self {
        Self([0; 6])
    }

    /// Whether this is the broadcast serial
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self)
    }
}

impl FromStr for Serial {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 12 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DeviceError::InvalidSerial(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DeviceError::InvalidSerial(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Serial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Serial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Firmware version of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Firmware {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Build timestamp
    pub build: u64,
}

impl Firmware {
    /// Create a firmware version
    pub const fn new(major: u16, minor: u16, build: u64) -> Self {
        Self { major, minor, build }
    }

    /// Whether this firmware is at least `major.minor`
    pub fn at_least(&self, (major, minor): (u16, u16)) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Static description of a product line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    /// Vendor id
    pub vendor: u32,
    /// Product id
    pub pid: u32,
    /// Product name
    pub name: &'static str,
    /// Whether the product emits light at all
    pub is_light: bool,
    /// Whether the product can do colour, not just whites
    pub has_color: bool,
    /// Whether the product has individually addressable zones
    pub has_multizone: bool,
    /// Firmware from which extended multizone messages are understood
    pub extended_multizone_from: Option<(u16, u16)>,
    /// Whether the product is a matrix of pixels
    pub has_matrix: bool,
    /// Whether the product switches relays
    pub has_relays: bool,
    /// Whether the product has a germicidal (HEV) clean cycle
    pub has_hev: bool,
    /// Whether the product has infrared LEDs
    pub has_ir: bool,
    /// Firmware from which unknown messages are answered with StateUnhandled
    pub unhandled_from: Option<(u16, u16)>,
    /// Number of zones on a fresh device
    pub zones: usize,
    /// Number of relays on a fresh device
    pub relays: usize,
}

/// Capability flags of a product running a particular firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capability {
    /// Emits light
    pub is_light: bool,
    /// Supports colour
    pub has_color: bool,
    /// Has zones
    pub has_multizone: bool,
    /// Understands extended multizone messages
    pub has_extended_multizone: bool,
    /// Is a matrix device
    pub has_matrix: bool,
    /// Has relays
    pub has_relays: bool,
    /// Has a clean cycle
    pub has_hev: bool,
    /// Has infrared
    pub has_ir: bool,
    /// Replies StateUnhandled to unknown messages
    pub has_unhandled: bool,
}

impl Product {
    const BASE: Product = Product {
        vendor: 1,
        pid: 0,
        name: "",
        is_light: true,
        has_color: true,
        has_multizone: false,
        extended_multizone_from: None,
        has_matrix: false,
        has_relays: false,
        has_hev: false,
        has_ir: false,
        unhandled_from: Some((3, 70)),
        zones: 0,
        relays: 0,
    };

    /// LIFX A19
    pub const LCM3_A19: Product = Product {
        pid: 91,
        name: "LCM3_A19",
        ..Self::BASE
    };

    /// LIFX+ A19 with infrared
    pub const LCM2_A19_PLUS: Product = Product {
        pid: 29,
        name: "LCM2_A19_PLUS",
        has_ir: true,
        unhandled_from: None,
        ..Self::BASE
    };

    /// LIFX Z strip
    pub const LCM2_Z: Product = Product {
        pid: 32,
        name: "LCM2_Z",
        has_multizone: true,
        extended_multizone_from: Some((2, 77)),
        unhandled_from: None,
        zones: 16,
        ..Self::BASE
    };

    /// LIFX Tile
    pub const LCM3_TILE: Product = Product {
        pid: 55,
        name: "LCM3_TILE",
        has_matrix: true,
        ..Self::BASE
    };

    /// LIFX Clean
    pub const LCM3_A19_CLEAN: Product = Product {
        pid: 90,
        name: "LCM3_A19_CLEAN",
        has_hev: true,
        ..Self::BASE
    };

    /// LIFX Switch
    pub const LCM3_32_SWITCH_I: Product = Product {
        pid: 89,
        name: "LCM3_32_SWITCH_I",
        is_light: false,
        has_color: false,
        has_relays: true,
        relays: 4,
        ..Self::BASE
    };

    /// Capability flags for this product on the given firmware
    pub fn capability(&self, firmware: &Firmware) -> Capability {
        Capability {
            is_light: self.is_light,
            has_color: self.has_color,
            has_multizone: self.has_multizone,
            has_extended_multizone: self.has_multizone
                && self
                    .extended_multizone_from
                    .map(|v| firmware.at_least(v))
                    .unwrap_or(false),
            has_matrix: self.has_matrix,
            has_relays: self.has_relays,
            has_hev: self.has_hev,
            has_ir: self.has_ir,
            has_unhandled: self
                .unhandled_from
                .map(|v| firmware.at_least(v))
                .unwrap_or(false),
        }
    }
}

/// Identity of one simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Hardware identifier
    pub serial: Serial,
    /// Product line
    pub product: Product,
    /// Running firmware
    pub firmware: Firmware,
}

impl DeviceInfo {
    /// Capability flags of this device
    pub fn capability(&self) -> Capability {
        self.product.capability(&self.firmware)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_parse_and_display() {
        let serial: Serial = "d073d5000001".parse().unwrap();
        assert_eq!(serial.to_string(), "d073d5000001");
        assert_eq!(serial.as_bytes()[0], 0xd0);
        assert!(!serial.is_broadcast());
        assert!(Serial::broadcast().is_broadcast());
        assert!("d073".parse::<Serial>().is_err());
        assert!("zz73d5000001".parse::<Serial>().is_err());
        assert!("+173d5000001".parse::<Serial>().is_err());
        assert!("d073d5-00001".parse::<Serial>().is_err());
    }

    #[test]
    fn test_serial_serde_as_hex() {
        let serial: Serial = "d073d5000001".parse().unwrap();
        let json = serde_json::to_string(&serial).unwrap();
        assert_eq!(json, "\"d073d5000001\"");
        let back: Serial = serde_json::from_str(&json).unwrap();
        assert_eq!(back, serial);
    }

    #[test]
    fn test_extended_multizone_depends_on_firmware() {
        let old = Product::LCM2_Z.capability(&Firmware::new(2, 60, 0));
        let new = Product::LCM2_Z.capability(&Firmware::new(2, 80, 0));
        assert!(old.has_multizone && new.has_multizone);
        assert!(!old.has_extended_multizone);
        assert!(new.has_extended_multizone);
    }

    #[test]
    fn test_switch_is_not_a_light() {
        let cap = Product::LCM3_32_SWITCH_I.capability(&Firmware::new(3, 90, 0));
        assert!(!cap.is_light);
        assert!(cap.has_relays);
        assert!(cap.has_unhandled);
    }
}
