//! Connection options.

use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::BusError;

const DEFAULT_PORT: u16 = 4222;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Where and how to connect to the broker.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    /// Ask the broker to acknowledge every command with `+OK`.
    pub verbose: bool,
    /// Ask the broker to report protocol misuse (e.g. unknown sids) with `-ERR`.
    pub pedantic: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl ConnectOptions {
    /// Parses `nats://[user:pass@]host[:port]`.
    pub fn from_uri(uri: &str) -> Result<Self, BusError> {
        let url = Url::parse(uri).map_err(|e| BusError::InvalidUri(format!("{uri}: {e}")))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BusError::InvalidUri(format!("{uri}: missing host")))?
            .to_string();

        let user = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let pass = url.password().map(str::to_string);

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            user,
            pass,
            verbose: false,
            pedantic: false,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    pub(crate) fn connect_info(&self) -> ConnectInfo<'_> {
        ConnectInfo {
            verbose: self.verbose,
            pedantic: self.pedantic,
            user: self.user.as_deref(),
            pass: self.pass.as_deref(),
        }
    }
}

/// Body of the CONNECT command.
#[derive(Debug, Serialize)]
pub struct ConnectInfo<'a> {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<&'a str>,
}
