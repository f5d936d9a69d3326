//! Text/JSON/binary classification of relayed payloads.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize, Serializer, ser::SerializeStruct};
use std::{borrow::Cow, fmt::Write};

/// Reversible text encoding used when a payload has to be logged as binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryEncoding {
    #[default]
    Base64,
    Hex,
}

impl BinaryEncoding {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Base64 => "base64",
            Self::Hex => "hex",
        }
    }

    #[must_use]
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Base64 => STANDARD.encode(bytes),
            Self::Hex => to_hex(bytes),
        }
    }
}

#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Returns whether `bytes` can be shown as text.
///
/// Lossy UTF-8 decoding must not introduce any replacement character. A raw
/// byte can never be U+FFFD on its own, so this reduces to "valid UTF-8 with
/// no U+FFFD in it". Payloads that genuinely carry U+FFFD are therefore
/// reported as binary.
#[must_use]
pub fn is_likely_text(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok_and(|text| !text.contains(char::REPLACEMENT_CHARACTER))
}

/// A decoded payload, ready to be rendered into an event record.
///
/// Serializes as the `body` and `bodyType` pair of a `message` record.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Json(serde_json::Value),
    Binary {
        encoding: BinaryEncoding,
        data: String,
    },
}

impl Body {
    #[must_use]
    pub fn body_type(&self) -> Cow<'static, str> {
        match self {
            Self::Text(_) => Cow::Borrowed("string"),
            Self::Json(_) => Cow::Borrowed("json"),
            Self::Binary { encoding, .. } => Cow::Owned(format!("binary:{}", encoding.as_str())),
        }
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Body", 2)?;
        match self {
            Self::Text(text) => state.serialize_field("body", text)?,
            Self::Json(value) => state.serialize_field("body", value)?,
            Self::Binary { data, .. } => state.serialize_field("body", data)?,
        }
        state.serialize_field("bodyType", &self.body_type())?;
        state.end()
    }
}

/// Classifies one delimited payload: text that parses as JSON becomes
/// [`Body::Json`], other text [`Body::Text`], everything else is encoded.
#[must_use]
pub fn classify_payload(bytes: &[u8], encoding: BinaryEncoding) -> Body {
    if !is_likely_text(bytes) {
        return Body::Binary {
            encoding,
            data: encoding.encode(bytes),
        };
    }
    match serde_json::from_slice(bytes) {
        Ok(value) => Body::Json(value),
        Err(_) => Body::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}
