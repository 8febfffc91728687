//! Peripheral identifier helpers.

use btleplug::platform::PeripheralId;

/// Address some platforms report when the real address is hidden.
pub const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a plain string.
///
/// On macOS, peripheral IDs are UUIDs; elsewhere they wrap the MAC address.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_id_wrapper(&format!("{:?}", id)).to_string()
}

fn strip_id_wrapper(debug: &str) -> &str {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
}

/// Identifier to connect by: the Bluetooth address, or the peripheral ID
/// where the platform hides addresses.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if address == HIDDEN_ADDRESS {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

/// Compare two MAC-style addresses ignoring case and separators.
pub fn addresses_match(a: &str, b: &str) -> bool {
    let normalise = |s: &str| {
        s.chars()
            .filter(|c| *c != ':' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect::<String>()
    };
    !a.is_empty() && normalise(a) == normalise(b)
}
