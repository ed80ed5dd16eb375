//! Outbound response envelope.
//!
//! Wire format (field order is preserved by `serde_json`):
//!
//! ```json
//! {"message":"Received your message","original":"23.5","timestamp":1700000000.123}
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed acknowledgement text carried by every response.
pub const RESPONSE_MESSAGE: &str = "Received your message";

/// Response published for every successfully decoded inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub message: String,
    /// Decoded inbound payload, verbatim.
    pub original: String,
    /// Seconds since the Unix epoch, with sub-second precision.
    pub timestamp: f64,
}

impl ResponseEnvelope {
    /// Build an envelope stamped with the current wall-clock time.
    pub fn new(original: impl Into<String>) -> Self {
        Self::at(original, SystemTime::now())
    }

    /// Build an envelope stamped with the given time.
    pub fn at(original: impl Into<String>, time: SystemTime) -> Self {
        Self {
            message: RESPONSE_MESSAGE.to_string(),
            original: original.into(),
            timestamp: epoch_seconds(time),
        }
    }

    /// Serialize to UTF-8 JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }
}

/// Decode an inbound payload and build its response bytes in one step.
pub fn respond_to(topic: &str, payload: &[u8]) -> Result<(String, Vec<u8>)> {
    let text = std::str::from_utf8(payload).map_err(|source| Error::Decode {
        topic: topic.to_string(),
        source,
    })?;
    let bytes = ResponseEnvelope::new(text).to_bytes()?;
    Ok((text.to_string(), bytes))
}

/// Seconds since the Unix epoch as a float. Times before the epoch map to 0.
pub fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn serializes_fields_in_wire_order() {
        let time = UNIX_EPOCH + Duration::from_millis(1_700_000_000_500);
        let env = ResponseEnvelope::at("23.5", time);
        let json = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"message":"Received your message","original":"23.5","timestamp":1700000000.5}"#
        );
    }

    #[test]
    fn escapes_original_text() {
        let env = ResponseEnvelope::new("say \"hi\"\n");
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(value["original"], "say \"hi\"\n");
        assert_eq!(value["message"], RESPONSE_MESSAGE);
    }

    #[test]
    fn timestamp_is_close_to_now() {
        let now = epoch_seconds(SystemTime::now());
        let env = ResponseEnvelope::new("x");
        assert!((env.timestamp - now).abs() < 5.0);
    }

    #[test]
    fn respond_to_rejects_invalid_utf8() {
        let err = respond_to("sensors/temp", &[0xc3, 0x28]).unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn respond_to_keeps_unicode() {
        let (text, bytes) = respond_to("t", "température 23.5°".as_bytes()).unwrap();
        assert_eq!(text, "température 23.5°");
        let env: ResponseEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(env.original, "température 23.5°");
    }

    #[test]
    fn pre_epoch_time_maps_to_zero() {
        let before = UNIX_EPOCH - Duration::from_secs(10);
        assert!(epoch_seconds(before).abs() < f64::EPSILON);
    }
}
