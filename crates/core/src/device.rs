//! Device identity and downlink topic addressing.

use serde::{Deserialize, Serialize};

/// First segment of every device topic.
pub const TOPIC_PREFIX: &str = "NTZ";

/// Network type used when the caller does not know how the device is attached.
pub const DEFAULT_NET_TYPE: &str = "wifi";

/// Identity fields of the device a command is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub device_id: i64,
    pub mac: String,
    pub serial_number: String,
    pub net_type: String,
}

impl DeviceTarget {
    pub fn new(device_id: i64, mac: impl Into<String>, serial_number: impl Into<String>) -> Self {
        Self {
            device_id,
            mac: mac.into(),
            serial_number: serial_number.into(),
            net_type: DEFAULT_NET_TYPE.to_string(),
        }
    }

    pub fn with_net_type(mut self, net_type: impl Into<String>) -> Self {
        self.net_type = net_type.into();
        self
    }

    /// Downlink destination: `NTZ/{net_type}/{mac}/{serial_number}`.
    pub fn topic(&self) -> String {
        format!(
            "{TOPIC_PREFIX}/{}/{}/{}",
            self.net_type, self.mac, self.serial_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_derived_from_identity_fields() {
        let target = DeviceTarget::new(7, "AA:BB:CC", "SN-1");
        assert_eq!(target.topic(), "NTZ/wifi/AA:BB:CC/SN-1");

        let cellular = target.with_net_type("4g");
        assert_eq!(cellular.topic(), "NTZ/4g/AA:BB:CC/SN-1");
    }
}
