//! Peripheral Protocol
//!
//! Service identifiers advertised to the device chooser and the text codec
//! used on the duplex channel. The channel itself carries raw UTF-8 with no
//! framing.

use anyhow::Result;
use uuid::Uuid;

/// Bluetooth SIG base UUID (`00000000-0000-1000-8000-00805f9b34fb`)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Vendor serial service exposed by WCH BLE modules
pub const VENDOR_SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";

/// Optional services advertised so the platform permission layer exposes them
pub const DEFAULT_OPTIONAL_SERVICES: &[&str] = &[
    "battery_service",
    "device_information",
    "generic_access",
    "generic_attribute",
    VENDOR_SERVICE_UUID,
];

/// Well-known service names and their assigned 16-bit numbers
const KNOWN_SERVICES: &[(&str, u16)] = &[
    ("generic_access", 0x1800),
    ("generic_attribute", 0x1801),
    ("device_information", 0x180A),
    ("battery_service", 0x180F),
];

/// Expand a 16- or 32-bit assigned number onto the base UUID
pub fn short_uuid(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))
}

/// Parse a service identifier
///
/// Accepts a well-known name (`battery_service`), a 16- or 32-bit hex short
/// form (`fff0`, `0x180f`, `0000fff0`) or a full 128-bit UUID.
pub fn parse_service_identifier(identifier: &str) -> Result<Uuid> {
    let id = identifier.trim().to_ascii_lowercase();

    if let Some((_, number)) = KNOWN_SERVICES.iter().find(|(name, _)| *name == id) {
        return Ok(short_uuid(u32::from(*number)));
    }

    let hex = id.strip_prefix("0x").unwrap_or(&id);
    if (hex.len() == 4 || hex.len() == 8) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        let short = u32::from_str_radix(hex, 16)?;
        return Ok(short_uuid(short));
    }

    Uuid::parse_str(&id)
        .map_err(|e| anyhow::anyhow!("Invalid service identifier {:?}: {}", identifier, e))
}

/// Parse every identifier, failing on the first invalid one
pub fn parse_service_identifiers<S: AsRef<str>>(identifiers: &[S]) -> Result<Vec<Uuid>> {
    identifiers
        .iter()
        .map(|id| parse_service_identifier(id.as_ref()))
        .collect()
}

/// Encode outbound text
pub fn encode_text(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// Decode an inbound payload; invalid sequences become U+FFFD
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
