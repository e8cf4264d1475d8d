//! The boundary between the load-generation core and the system under test.
//!
//! The core never speaks a protocol itself. Task bodies issue requests through
//! a [`Transport`], and the [`TaskContext`](crate::TaskContext) they receive
//! accounts the received bytes and turns rejections into task failures.
//!
//! # Aborting in-flight requests
//!
//! `execute` returns a future. Dropping that future aborts the request, which
//! is exactly what a forced stop does. Transports that notice cancellation on
//! their own (for example because the connection was torn down underneath
//! them) report [`TransportError::Aborted`].
use std::future::Future;

use crate::error::TransportError;

/// What a transport reports back for one request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Bytes received.
    pub bytes: u64,
    /// Set when the request completed but the target refused it, for example
    /// an HTTP 5xx. The task fails with this reason.
    pub rejection: Option<String>,
}

impl Response {
    pub fn ok(bytes: u64) -> Self {
        Self {
            bytes,
            rejection: None,
        }
    }

    pub fn rejected(bytes: u64, reason: impl Into<String>) -> Self {
        Self {
            bytes,
            rejection: Some(reason.into()),
        }
    }
}

/// A client able to execute requests against the target service.
///
/// One transport instance is shared by every simulated user of a run, so
/// implementations should be cheap to call concurrently (connection pools and
/// the like live inside).
///
/// # Example
/// ```rust
/// use volley::{Response, Transport, TransportError};
///
/// struct Echo;
///
/// impl Transport for Echo {
///     type Request = String;
///
///     async fn execute(&self, request: String) -> Result<Response, TransportError> {
///         Ok(Response::ok(request.len() as u64))
///     }
/// }
/// ```
pub trait Transport
where
    Self: Send + Sync + 'static,
{
    type Request: Send + 'static;

    fn execute(
        &self,
        request: Self::Request,
    ) -> impl Future<Output = Result<Response, TransportError>> + Send;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    use typed_builder::TypedBuilder;

    use super::*;

    /// A transport that answers every request after a fixed latency.
    ///
    /// Useful for exercising a run without a real target.
    #[derive(Debug, TypedBuilder)]
    pub struct MockTransport {
        #[builder(default = Duration::from_millis(100))]
        pub latency: Duration,
        #[builder(default = 0)]
        pub response_size: u64,
        /// When set, every request is rejected with this reason.
        #[builder(default, setter(strip_option, into))]
        pub rejection: Option<String>,
        #[builder(default, setter(skip))]
        calls: AtomicU64,
    }

    impl MockTransport {
        /// Number of requests started so far, including aborted ones.
        pub fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl Transport for MockTransport {
        type Request = String;

        async fn execute(&self, _request: String) -> Result<Response, TransportError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.latency).await;
            Ok(match &self.rejection {
                Some(reason) => Response::rejected(self.response_size, reason.clone()),
                None => Response::ok(self.response_size),
            })
        }
    }
}

#[cfg(feature = "http")]
pub use http::*;

#[cfg(feature = "http")]
mod http {
    use reqwest::{Client, Method};

    use super::*;

    /// One HTTP request relative to the transport's base URL.
    #[derive(Debug, Clone)]
    pub struct HttpRequest {
        pub method: Method,
        pub path: String,
        pub body: Option<Vec<u8>>,
    }

    impl HttpRequest {
        pub fn get(path: impl Into<String>) -> Self {
            Self {
                method: Method::GET,
                path: path.into(),
                body: None,
            }
        }

        pub fn post(path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
            Self {
                method: Method::POST,
                path: path.into(),
                body: Some(body.into()),
            }
        }
    }

    impl From<&str> for HttpRequest {
        fn from(path: &str) -> Self {
            Self::get(path)
        }
    }

    /// [`Transport`] over a shared `reqwest` client.
    ///
    /// Responses with a 4xx or 5xx status are reported as rejections, so the
    /// task that issued them fails with `HTTP <status>`.
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: Client,
        base_url: String,
    }

    impl HttpTransport {
        pub fn new(base_url: impl Into<String>) -> Self {
            Self::with_client(Client::new(), base_url)
        }

        pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
            Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            }
        }

        pub fn base_url(&self) -> &str {
            &self.base_url
        }
    }

    impl Transport for HttpTransport {
        type Request = HttpRequest;

        async fn execute(&self, request: HttpRequest) -> Result<Response, TransportError> {
            let url = format!("{}{}", self.base_url, request.path);
            let mut builder = self.client.request(request.method, url);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(classify)?;
            let status = response.status();
            let body = response.bytes().await.map_err(classify)?;
            let bytes = body.len() as u64;

            if status.is_client_error() || status.is_server_error() {
                Ok(Response::rejected(bytes, format!("HTTP {}", status.as_u16())))
            } else {
                Ok(Response::ok(bytes))
            }
        }
    }

    fn classify(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Failed(e.to_string())
        }
    }

}
