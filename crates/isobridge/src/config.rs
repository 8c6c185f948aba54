//! Tunables for sessions, streaming and marshalling.
//!
//! Every timing constant of the protocol lives here so embedders and tests
//! can adjust it.

use std::time::Duration;

/// How long exported functions and their receivers stay reachable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Retention {
    /// Handles hold weak references; dropping the referent reclaims the
    /// handle and later invocations resolve `undefined`.
    #[default]
    Weak,
    /// Handles pin their referents until the owning context is torn down.
    Session,
}

/// How `globals` are sent with an eval request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Marshalling {
    /// Full tagged encoding, minting handles for functions, promises and
    /// streams.
    #[default]
    Structural,
    /// Plain data only; values that would need a handle are rejected.
    Raw,
}

/// Producer/consumer timing for iterable and stream transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Continuous production time after which the producer yields.
    pub slice: Duration,
    /// Time without a `pull` after which the producer pauses.
    pub grace: Duration,
    /// Maximum number of buffered items before the producer pauses.
    pub max_buffered: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            slice: Duration::from_millis(200),
            grace: Duration::from_millis(180),
            max_buffered: 1024,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub const fn slice(mut self, slice: Duration) -> Self {
        self.slice = slice;
        self
    }

    #[must_use]
    pub const fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub const fn max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered;
        self
    }
}

/// Per serialization-context settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextConfig {
    pub stream: StreamConfig,
    pub retention: Retention,
}

/// Session establishment settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline covering launch and handshake together.
    pub handshake_deadline: Duration,
    /// Interval between init probes while handshaking.
    pub probe_interval: Duration,
    /// Origin handed to the launcher.
    pub origin: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_deadline: Duration::from_secs(35),
            probe_interval: Duration::from_millis(100),
            origin: "null".to_string(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn handshake_deadline(mut self, deadline: Duration) -> Self {
        self.handshake_deadline = deadline;
        self
    }

    #[must_use]
    pub const fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }
}

/// Configuration of a [`SandboxedExecutionHost`](crate::SandboxedExecutionHost).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    pub session: SessionConfig,
    pub context: ContextConfig,
    pub marshalling: Marshalling,
    /// Cap on a forwarded request body; larger bodies fail the fetch.
    pub max_request_body_bytes: usize,
    /// Time allowed to buffer a forwarded request body.
    pub request_body_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            context: ContextConfig::default(),
            marshalling: Marshalling::default(),
            max_request_body_bytes: 16 * 1024 * 1024,
            request_body_timeout: Duration::from_secs(30),
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    #[must_use]
    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.context.stream = stream;
        self
    }

    #[must_use]
    pub const fn retention(mut self, retention: Retention) -> Self {
        self.context.retention = retention;
        self
    }

    #[must_use]
    pub const fn marshalling(mut self, marshalling: Marshalling) -> Self {
        self.marshalling = marshalling;
        self
    }

    #[must_use]
    pub const fn max_request_body_bytes(mut self, max: usize) -> Self {
        self.max_request_body_bytes = max;
        self
    }

    #[must_use]
    pub const fn request_body_timeout(mut self, timeout: Duration) -> Self {
        self.request_body_timeout = timeout;
        self
    }
}

/// Configuration of the sandbox side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    pub context: ContextConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            // Values returned by a script have no other owner once serialized.
            context: ContextConfig {
                stream: StreamConfig::default(),
                retention: Retention::Session,
            },
        }
    }
}

impl SandboxConfig {
    #[must_use]
    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.context.stream = stream;
        self
    }

    #[must_use]
    pub const fn retention(mut self, retention: Retention) -> Self {
        self.context.retention = retention;
        self
    }
}
