//! Upstream source descriptors and packet-level source identifiers.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;

/// URL schemes accepted as pull sources.
const SUPPORTED_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "rtmps", "srt", "http", "https", "udp", "file"];

/// A validated upstream source descriptor.
///
/// Descriptors are normalized through [`Url`], so `RTSP://Cam1/` and
/// `rtsp://cam1/` share one [`key`](Self::key) and are treated as the same
/// upstream for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceDescriptor {
    url: Url,
}

impl SourceDescriptor {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("source descriptor must not be empty"));
        }

        let mut url = Url::parse(trimmed)
            .map_err(|e| Error::validation(format!("invalid source descriptor '{trimmed}': {e}")))?;

        // Opaque hosts of non-special schemes keep their case after parsing.
        if let Some(host) = url.host_str().map(str::to_ascii_lowercase) {
            url.set_host(Some(&host))
                .map_err(|e| Error::validation(format!("invalid source host '{host}': {e}")))?;
        }

        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(Error::validation(format!(
                "unsupported source scheme '{}'",
                url.scheme()
            )));
        }
        if url.scheme() != "file" && url.host_str().is_none() {
            return Err(Error::validation(format!(
                "source descriptor '{trimmed}' has no host"
            )));
        }

        Ok(Self { url })
    }

    /// Deduplication key for this upstream.
    pub fn key(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Host (and port) for log fields, without credentials.
    pub fn redacted(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{}://{}:{}", self.url.scheme(), host, port),
            (Some(host), None) => format!("{}://{}", self.url.scheme(), host),
            _ => format!("{}://", self.url.scheme()),
        }
    }
}

impl TryFrom<String> for SourceDescriptor {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SourceDescriptor> for String {
    fn from(value: SourceDescriptor) -> Self {
        value.url.into()
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// RTP synchronization source identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ssrc(pub u32);

impl Ssrc {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Ssrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
