use http::header::USER_AGENT;
use http::{HeaderValue, Request, Response};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build HTTP request: {0}")]
    BuildRequest(http::Error),

    #[error("failed to make HTTP(S) request: {0}")]
    CallRequest(#[from] hyper::Error),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected status code {0}")]
    UnexpectedStatusCode(http::StatusCode),
}

/// A shared HTTP(S) client for scraping. Cheap to clone, one
/// connection pool behind all clones.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>>,
    user_agent: HeaderValue,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Self {
            client: Client::builder().build(connector),
            user_agent: HeaderValue::from_static(concat!("scout/", env!("CARGO_PKG_VERSION"))),
        }
    }

    /// Send `request` with the default user agent applied, unless the
    /// caller set its own.
    pub async fn send(&self, mut request: Request<Body>) -> Result<Response<Body>, HttpError> {
        request
            .headers_mut()
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());

        self.client.request(request).await.map_err(Into::into)
    }
}
