use std::time::Duration;

use crate::{Error, NetworkHost};

const USER_AGENT: &str = "Isobridge/1.0";

#[must_use]
#[derive(Debug, Clone, Default)]
pub struct NetworkHostBuilder {
    proxy: Option<String>,
    user_agent: Option<String>,
    connect_timeout: Option<Duration>,
}

impl NetworkHostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route HTTP traffic through `proxy`. Websockets always connect directly.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<NetworkHost, Error> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.as_deref().unwrap_or(USER_AGENT));
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(NetworkHost {
            client: builder.build()?,
        })
    }
}
