//! JSON envelopes exchanged with devices.
//!
//! Downlink commands are published verbatim as submitted. The device answers
//! with an uplink message carrying the same `OptCode` and echoing the
//! command's `MsgId`.

use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Operation codes (bidirectional unless noted).
pub mod opcode {
    pub const HEARTBEAT: i32 = 1001;
    pub const UNBIND: i32 = 1002;
    pub const MODE_CONTROL: i32 = 1003;
    pub const ALARM: i32 = 1004;
    pub const DEVICE_CODE_MATCH: i32 = 1005;
    pub const DEVICE_CODE_DELETE: i32 = 1006;
    /// Uplink only.
    pub const DOOR_CONNECT_EVENT: i32 = 1007;
    pub const QUERY_DEVICE_INFO: i32 = 8000;
}

/// Device-to-backend message.
///
/// `Data` is opaque here; the acknowledgement path stores it as the attempt's
/// response payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpMsg {
    #[serde(default)]
    pub opt_code: i32,
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub msg_id: String,
}

impl UpMsg {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Message id echoed by the device, if any.
    pub fn msg_id(&self) -> Option<&str> {
        let id = self.msg_id.trim();
        (!id.is_empty()).then_some(id)
    }

    /// Compact JSON text of `Data` (empty when absent or null).
    pub fn data_json(&self) -> String {
        match &self.data {
            None | Some(JsonValue::Null) => String::new(),
            Some(v) => v.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_msg_exposes_data_as_json() {
        let up = UpMsg::parse(
            br#"{"OptCode":1003,"Data":{"mac":"AA","res":1},"Timestamp":1,"MsgId":"m-1"}"#,
        )
        .unwrap();

        assert_eq!(up.opt_code, opcode::MODE_CONTROL);
        assert_eq!(up.msg_id(), Some("m-1"));
        assert_eq!(up.data_json(), r#"{"mac":"AA","res":1}"#);
    }

    #[test]
    fn up_msg_without_id() {
        let up = UpMsg::parse(br#"{"OptCode":1001,"MsgId":"  "}"#).unwrap();
        assert_eq!(up.msg_id(), None);
        assert_eq!(up.data_json(), "");
        assert!(UpMsg::parse(b"not json").is_err());
    }
}
