//! `ConfigSource` external collaborator (spec.md §6) and the defaults the
//! core falls back to when a `Request` leaves a field unset.

use std::time::Duration;

use http::HeaderMap;

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

pub trait ConfigSource: Send + Sync {
    fn base_url(&self) -> Option<&str>;
    fn default_timeouts(&self) -> Timeouts;
    fn default_headers(&self) -> HeaderMap;
}

/// Plain, caller-constructed configuration. No hot-reload, no presets —
/// those are explicitly out of scope (spec.md §1).
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    pub base_url: Option<String>,
    pub timeouts: Timeouts,
    pub headers: HeaderMap,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl ConfigSource for StaticConfig {
    fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    fn default_timeouts(&self) -> Timeouts {
        self.timeouts
    }

    fn default_headers(&self) -> HeaderMap {
        self.headers.clone()
    }
}
