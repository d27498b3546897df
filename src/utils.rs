//! Identity helpers for hosts and tests

use bech32::Bech32m;
use uuid7::uuid7;

/// Derive a fresh bech32-encoded address with the given human readable
/// prefix, e.g. `id_` for identity ids.
pub fn new_address(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Hex-encoded serial number for a freshly issued certificate.
pub fn new_serial_number() -> String {
    hex::encode(uuid7().as_bytes())
}
