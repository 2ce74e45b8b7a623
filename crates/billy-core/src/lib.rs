//! Core domain model for Billy: sources, tracks and the canonical link identity.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "billy-core";

/// Opaque source identity assigned by the catalog store on first registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub Uuid);

impl SourceId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Storage id of a track. Never used for deduplication, see [`CanonicalLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub Uuid);

impl TrackId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Syndication feed (RSS) whose entries embed or enclose audio.
    Feed,
    /// Video platform channel listing, newest first.
    Channel,
    /// Video platform playlist listing.
    Playlist,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Feed => "feed",
            SourceKind::Channel => "channel",
            SourceKind::Playlist => "playlist",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source kind `{0}` (expected feed, channel or playlist)")]
pub struct UnknownSourceKind(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed" | "rss" => Ok(SourceKind::Feed),
            "channel" => Ok(SourceKind::Channel),
            "playlist" => Ok(SourceKind::Playlist),
            other => Err(UnknownSourceKind(other.to_string())),
        }
    }
}

/// A registered, independently pollable origin of candidate tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub kind: SourceKind,
    /// Adapter-specific fetch target: feed URL, channel id or playlist id.
    pub locator: String,
    /// Epoch seconds of the start of the last cycle this source completed cleanly. 0 until then.
    pub watermark: i64,
}

impl Source {
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind, self.locator)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkParseError {
    #[error("canonical link `{0}` has no `<protocol>:` prefix")]
    MissingProtocol(String),
    #[error("canonical link `{0}` has an empty native id")]
    EmptyId(String),
    #[error("canonical link `{0}` has an invalid protocol")]
    InvalidProtocol(String),
}

/// Cross-source track identity, `"<protocol>:<native-id>"` such as `youtube:abc123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalLink(String);

impl CanonicalLink {
    pub fn parse(raw: impl Into<String>) -> Result<Self, LinkParseError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        let Some((protocol, id)) = trimmed.split_once(':') else {
            return Err(LinkParseError::MissingProtocol(raw));
        };
        if protocol.is_empty()
            || !protocol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
        {
            return Err(LinkParseError::InvalidProtocol(raw));
        }
        if id.trim().is_empty() {
            return Err(LinkParseError::EmptyId(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn from_parts(protocol: &str, native_id: &str) -> Result<Self, LinkParseError> {
        Self::parse(format!("{protocol}:{native_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn protocol(&self) -> &str {
        self.0.split_once(':').map(|(p, _)| p).unwrap_or_default()
    }

    pub fn native_id(&self) -> &str {
        self.0.split_once(':').map(|(_, id)| id).unwrap_or_default()
    }
}

impl fmt::Display for CanonicalLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CanonicalLink {
    type Error = LinkParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CanonicalLink> for String {
    fn from(value: CanonicalLink) -> Self {
        value.0
    }
}

impl FromStr for CanonicalLink {
    type Err = LinkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One item surfaced by a single adapter invocation. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub title: String,
    pub link: CanonicalLink,
    /// Epoch seconds reported by the source; `-1` when the source gave none.
    pub discovered_at: i64,
    pub image: Option<String>,
}

/// Persisted catalog entry; exactly one per canonical link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub link: CanonicalLink,
    pub title: String,
    pub discovered_at: i64,
    pub image: Option<String>,
    /// Every source that surfaced this link. Only ever grows.
    pub sources: BTreeSet<SourceId>,
}

/// Insert payload for a link the catalog has not seen yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrack {
    pub link: CanonicalLink,
    pub title: String,
    pub discovered_at: i64,
    pub image: Option<String>,
    pub sources: BTreeSet<SourceId>,
}

impl NewTrack {
    /// `sources` holds every source that surfaced the link in the batch being merged.
    pub fn from_candidate(item: CandidateItem, sources: BTreeSet<SourceId>) -> Self {
        Self {
            link: item.link,
            title: item.title,
            discovered_at: item.discovered_at,
            image: item.image,
            sources,
        }
    }

    pub fn into_track(self, id: TrackId) -> Track {
        Track {
            id,
            link: self.link,
            title: self.title,
            discovered_at: self.discovered_at,
            image: self.image,
            sources: self.sources,
        }
    }
}

pub fn from_unix_seconds(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}
