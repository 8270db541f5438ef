//! Reef-Netutils
//!
//! This crate provides the `HttpConnector` struct,
//! used to communicate with a reef wallet server.

#![warn(missing_docs)]
use bytes::Bytes;
use http::Uri;
use serde::de::DeserializeOwned;

/// Errors raised by the transport. None of them are retried here.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The request could not be sent or the body could not be read.
    #[error("request to {url} failed. {source}")]
    Request {
        /// Requested url
        url: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("request to {url} returned status {status}")]
    Status {
        /// Requested url
        url: String,
        /// Returned status code
        status: http::StatusCode,
    },
    /// The body could not be decoded as the expected json document.
    #[error("failed to decode response from {url}. {source}")]
    Decode {
        /// Requested url
        url: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },
}

/// The connector, containing the URI to connect to.
/// Paths passed to the request methods are resolved against this URI, absolute urls are
/// requested as they are.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    uri: Uri,
    client: reqwest::Client,
}

impl HttpConnector {
    /// Takes a URI, and wraps in a HttpConnector
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            client: reqwest::Client::new(),
        }
    }

    /// The URI to connect to
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Resolves `path` against the server uri.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.uri.to_string();
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// GETs `path` with the given query parameters and decodes the json body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, NetError> {
        let url = self.url_for(path);
        tracing::debug!("GET {} {:?}", url, query);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|source| NetError::Request {
                url: url.clone(),
                source,
            })?;
        let response = check_status(&url, response)?;

        response
            .json::<T>()
            .await
            .map_err(|source| NetError::Decode { url, source })
    }

    /// GETs `path` and returns the raw body.
    pub async fn get_bytes(&self, path: &str) -> Result<Bytes, NetError> {
        let url = self.url_for(path);
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| NetError::Request {
                url: url.clone(),
                source,
            })?;
        let response = check_status(&url, response)?;

        response
            .bytes()
            .await
            .map_err(|source| NetError::Request { url, source })
    }
}

fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response, NetError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(NetError::Status {
            url: url.to_string(),
            status,
        })
    }
}
