use std::fmt::Display;

use serde::{Deserialize, Serialize};
use url::Url;

/// Longest handle the profile source allows.
const MAX_HANDLE_LENGTH: usize = 30;

/// A single normalized handle: lowercase, no leading `@`, only `[a-z0-9._]`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(String);

impl Handle {
    /// Parse user input as a handle. Accepts `name`, `@Name`, and profile URLs like
    /// `instagram.com/name/` or `https://www.instagram.com/name?igsh=...`.
    ///
    /// Returns [`None`] if there's no valid handle in there.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();

        let raw = if input.contains('/') {
            Self::from_profile_url(input)?
        } else {
            input.strip_prefix('@').unwrap_or(input).to_lowercase()
        };

        let valid = !raw.is_empty()
            && raw.chars().count() <= MAX_HANDLE_LENGTH
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_');

        valid.then_some(Self(raw))
    }

    /// Take the handle out of a profile link, allowing an implicit `https://`.
    fn from_profile_url(input: &str) -> Option<String> {
        let url = match Url::parse(input) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(&format!("https://{input}")).ok()?
            }
            Err(_) => return None,
        };

        let host = url.host_str()?.to_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        if host != "instagram.com" {
            return None;
        }

        url.path_segments()?
            .find(|segment| !segment.is_empty())
            .map(|segment| segment.trim_start_matches('@').to_lowercase())
    }

    /// Build a handle without any checks. Only for trusted data, i.e. the database.
    pub(crate) fn new_unchecked(raw: String) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Which of the two lists a handle sits on. A handle is only ever on one.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListKind {
    /// Presumed live, waiting to get banned.
    Watched = 0,
    /// Presumed banned, waiting to come back.
    Flagged = 1,
}

impl ListKind {
    /// The list that isn't this one.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            ListKind::Watched => ListKind::Flagged,
            ListKind::Flagged => ListKind::Watched,
        }
    }

    /// The probe status that, once confirmed, moves a handle off this list.
    #[must_use]
    pub fn leaving_status(self) -> ProbeStatus {
        match self {
            ListKind::Watched => ProbeStatus::Banned,
            ListKind::Flagged => ProbeStatus::Active,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ListKind::Watched),
            1 => Some(ListKind::Flagged),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Display for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ListKind::Watched => "watch list",
            ListKind::Flagged => "ban list",
        })
    }
}

/// What a probe saw when it looked at a handle.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    /// Profile is up.
    Active = 0,
    /// Profile is banned or suspended.
    Banned = 1,
    /// Couldn't tell.
    Unknown = 2,
    /// Profile is up but private, so nothing more can be said.
    Private = 3,
    /// The probe itself failed.
    Error = 4,
}

impl ProbeStatus {
    /// The list a handle with this status belongs on, if this status means anything.
    #[must_use]
    pub fn target_list(self) -> Option<ListKind> {
        match self {
            ProbeStatus::Active => Some(ListKind::Watched),
            ProbeStatus::Banned => Some(ListKind::Flagged),
            ProbeStatus::Unknown | ProbeStatus::Private | ProbeStatus::Error => None,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        use ProbeStatus::*;
        [Active, Banned, Unknown, Private, Error]
            .into_iter()
            .find(|status| *status as u8 == code)
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProbeStatus::Active => "active",
            ProbeStatus::Banned => "banned",
            ProbeStatus::Unknown => "unknown",
            ProbeStatus::Private => "private",
            ProbeStatus::Error => "error",
        })
    }
}

/// Whatever the probe could find out about a profile besides its status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDetails {
    pub name: Option<String>,
    pub followers: u64,
    pub following: u64,
    pub posts: u64,
    pub private: bool,
    pub verified: bool,
    pub business: bool,
}
