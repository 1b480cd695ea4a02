//! Source locator parsing and normalization.
//!
//! A source locator is the URL of a live camera or ingest point. Its scheme
//! decides how the encoder opens it; the normalized form is the key under
//! which sessions are deduplicated.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::SessionError;

/// Transport family of a source, derived from its URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceScheme {
    Rtsp,
    Rtsps,
    Rtmp,
    Rtmps,
}

impl SourceScheme {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "rtsp" => Some(Self::Rtsp),
            "rtsps" => Some(Self::Rtsps),
            "rtmp" => Some(Self::Rtmp),
            "rtmps" => Some(Self::Rtmps),
            _ => None,
        }
    }

    /// RTSP sources are pulled over interleaved TCP instead of UDP.
    pub fn wants_reliable_transport(self) -> bool {
        matches!(self, Self::Rtsp | Self::Rtsps)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rtsp => "rtsp",
            Self::Rtsps => "rtsps",
            Self::Rtmp => "rtmp",
            Self::Rtmps => "rtmps",
        }
    }
}

impl fmt::Display for SourceScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized source URL. At most one session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated source: its dedup key plus the transport it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocator {
    key: SourceKey,
    scheme: SourceScheme,
}

impl SourceLocator {
    /// Validate and normalize a raw locator.
    ///
    /// Surrounding whitespace is trimmed and the scheme is lowercased; the
    /// rest of the URL is kept verbatim since paths and credentials can be
    /// case-sensitive. Unknown schemes and empty remainders are rejected
    /// before anything is allocated for a session.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let trimmed = raw.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| SessionError::UnsupportedSource(trimmed.to_string()))?;

        let scheme_lower = scheme.to_ascii_lowercase();
        let scheme = SourceScheme::from_scheme(&scheme_lower)
            .ok_or_else(|| SessionError::UnsupportedSource(trimmed.to_string()))?;

        if rest.is_empty() || rest.chars().any(char::is_whitespace) {
            return Err(SessionError::UnsupportedSource(trimmed.to_string()));
        }

        Ok(Self {
            key: SourceKey(format!("{}://{}", scheme_lower, rest)),
            scheme,
        })
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn scheme(&self) -> SourceScheme {
        self.scheme
    }

    /// The URL handed to the encoder.
    pub fn url(&self) -> &str {
        self.key.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rtsp_is_accepted_with_reliable_transport() {
        let source = SourceLocator::parse("rtsp://cam1/stream").unwrap();
        assert_eq!(source.scheme(), SourceScheme::Rtsp);
        assert!(source.scheme().wants_reliable_transport());
        assert_eq!(source.url(), "rtsp://cam1/stream");
    }

    #[test]
    fn test_rtmp_uses_default_transport() {
        let source = SourceLocator::parse("rtmp://ingest.local/live/key").unwrap();
        assert_eq!(source.scheme(), SourceScheme::Rtmp);
        assert!(!source.scheme().wants_reliable_transport());
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let err = SourceLocator::parse("ftp://bad-scheme/x").unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedSource(ref s) if s == "ftp://bad-scheme/x"));
    }

    #[test]
    fn test_missing_scheme_is_rejected() {
        assert!(SourceLocator::parse("cam1/stream").is_err());
        assert!(SourceLocator::parse("").is_err());
        assert!(SourceLocator::parse("rtsp://").is_err());
    }

    #[test]
    fn test_scheme_substring_is_not_enough() {
        // An http URL that merely mentions rtsp:// must not pass
        assert!(SourceLocator::parse("http://proxy/?u=rtsp://cam").is_err());
    }

    #[test]
    fn test_normalization_trims_and_lowercases_scheme() {
        let a = SourceLocator::parse("  RTSP://Cam1/Stream \n").unwrap();
        let b = SourceLocator::parse("rtsp://Cam1/Stream").unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), "rtsp://Cam1/Stream");
    }

    proptest! {
        #[test]
        fn prop_case_of_scheme_does_not_change_key(
            upper in proptest::bool::ANY,
            path in "[a-zA-Z0-9./_-]{1,30}",
        ) {
            let scheme = if upper { "RTMP" } else { "rtmp" };
            let raw = format!("{}://{}", scheme, path);
            let parsed = SourceLocator::parse(&raw).unwrap();
            prop_assert_eq!(parsed.key().as_str(), format!("rtmp://{}", path));
        }
    }
}
