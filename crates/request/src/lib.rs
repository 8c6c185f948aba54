//! [`isobridge::Host`] backed by a real network stack.
//!
//! HTTP goes through `reqwest`, websockets through `tokio-tungstenite`. Every
//! outbound request gets a client span carrying the usual HTTP attributes.

mod builder;
mod error;
mod http;
mod trace;
mod websocket;

use isobridge::{BoxError, HttpBodyStream, HttpRequest, HttpResponse, WebSocketConnection};

pub use builder::NetworkHostBuilder;
pub use error::Error;

#[derive(Debug, Clone)]
pub struct NetworkHost {
    client: reqwest::Client,
}

impl NetworkHost {
    pub fn new() -> Result<Self, Error> {
        Self::builder().build()
    }

    pub fn builder() -> NetworkHostBuilder {
        NetworkHostBuilder::new()
    }
}

#[async_trait::async_trait]
impl isobridge::Host for NetworkHost {
    async fn http_request(&self, req: HttpRequest) -> Result<HttpResponse, BoxError> {
        let span = trace::request_span("fetch", &req.method, &req.uri);
        let response = http::http_impl(self.client.clone(), span, req).await?;
        Ok(response.map(|body| Box::pin(body) as HttpBodyStream))
    }

    async fn connect_websocket(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<WebSocketConnection, BoxError> {
        let uri: ::http::Uri = url.parse()?;
        let span = trace::request_span("websocket", &::http::Method::GET, &uri);
        Ok(websocket::websocket_impl(span, url, protocols).await?)
    }
}
