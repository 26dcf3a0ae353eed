use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// MIME declared for uploads whose type can't be told from the header or the bytes.
pub const FALLBACK_UPLOAD_MIME: &str = "image/jpeg";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataUriError {
    #[error("image must be a data URI (data:<mime>;base64,<payload>)")] NotDataUri,
    #[error("image data URI must be base64 encoded")] NotBase64Encoded,
    #[error("image payload is empty")] EmptyPayload,
    #[error("image payload is not valid base64: {0}")] InvalidPayload(String),
}

/// A base64 image payload plus its MIME type, rendered as `data:<mime>;base64,<payload>`.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct DataUri {
    mime_type: String,
    data: String,
}

impl DataUri {
    /// Wraps an already base64-encoded payload, e.g. the `inlineData` of a service response.
    pub fn from_base64(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self { mime_type: mime_type.into(), data: data.into() }
    }

    pub fn mime_type(&self) -> &str { &self.mime_type }

    /// The raw base64 payload, without the `data:` header.
    pub fn data(&self) -> &str { &self.data }
}

impl FromStr for DataUri {
    type Err = DataUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.trim().strip_prefix("data:").ok_or(DataUriError::NotDataUri)?;
        let (header, payload) = rest.split_once(',').ok_or(DataUriError::NotDataUri)?;
        let mut params = header.split(';');
        let declared = params.next().unwrap_or_default().trim().to_ascii_lowercase();
        if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
            return Err(DataUriError::NotBase64Encoded);
        }
        if payload.is_empty() {
            return Err(DataUriError::EmptyPayload);
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.as_bytes())
            .map_err(|e| DataUriError::InvalidPayload(e.to_string()))?;

        let mime_type = if declared.starts_with("image/") {
            declared
        } else {
            sniff_mime(&bytes).unwrap_or(FALLBACK_UPLOAD_MIME).to_string()
        };

        Ok(Self { mime_type, data: payload.to_string() })
    }
}

impl fmt::Display for DataUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.mime_type, self.data)
    }
}

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|format| format.to_mime_type())
}
