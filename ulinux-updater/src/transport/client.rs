// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{
    HeaderValue, Method, Request,
    header::{CONTENT_TYPE, HOST},
    response::Parts,
};
use http_body_util::{BodyExt, Full, Limited, LengthLimitError};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::{Instrument, instrument};

use super::DistributionPoint;
use crate::{
    config::Config,
    error::TransportError,
    protocol::{NewUpdateResponse, UpdateCandidate, UpdateId, paths},
    trust::TrustStore,
};

/// Characters left as-is when an update identifier is placed in a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A client for the distribution point.
///
/// Every exchange uses a fresh connection; the device talks to the distribution point rarely
/// enough that there is nothing to gain from keeping one open.
#[derive(Debug, Clone)]
pub struct DistributionClient {
    host: String,
    port: u16,
    trust: Arc<TrustStore>,
    request_timeout: Duration,
    max_body_size: usize,
}

impl DistributionClient {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        trust: Arc<TrustStore>,
        request_timeout: Duration,
        max_body_size: usize,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            trust,
            request_timeout,
            max_body_size,
        }
    }

    pub fn from_config(config: &Config, trust: Arc<TrustStore>) -> Self {
        Self::new(
            config.distribution_host.clone(),
            config.distribution_port,
            trust,
            config.request_timeout,
            config.max_image_size,
        )
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    async fn connect(&self) -> Result<SendRequest<Full<Bytes>>, TransportError> {
        let ssl = self.trust.connector().configure()?.into_ssl(&self.host)?;
        let tcp_stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let mut stream = SslStream::new(ssl, tcp_stream)?;
        Pin::new(&mut stream).connect().await?;
        tracing::trace!(host = %self.host, port = self.port, "TLS session established");

        let (sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(
            async move {
                if let Err(error) = connection.await {
                    tracing::debug!(?error, "Connection to the distribution point failed");
                }
            }
            .instrument(tracing::Span::current()),
        );

        Ok(sender)
    }

    /// Perform a single request, bounded by the request timeout from connect to the last byte.
    async fn exchange(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<(Parts, Bytes), TransportError> {
        let limit = self.max_body_size;
        let exchange = async {
            let mut sender = self.connect().await?;
            let response = sender.send_request(request).await?;
            let (parts, body) = response.into_parts();
            let body = Limited::new(body, limit)
                .collect()
                .await
                .map_err(|error| {
                    if error.is::<LengthLimitError>() {
                        TransportError::TooLarge { limit }
                    } else {
                        match error.downcast::<hyper::Error>() {
                            Ok(error) => TransportError::Http(*error),
                            Err(error) => TransportError::Io(std::io::Error::other(error)),
                        }
                    }
                })?
                .to_bytes();
            tracing::debug!(status = %parts.status, size = body.len(), "Received response");
            Ok::<_, TransportError>((parts, body))
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.request_timeout))?
    }

    fn request(&self, method: Method, path: &str) -> http::request::Builder {
        Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, self.authority())
    }

    fn form_request(
        &self,
        path: &str,
        fields: &[(&str, &str)],
    ) -> Result<Request<Full<Bytes>>, TransportError> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        Ok(self
            .request(Method::POST, path)
            .header(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE))
            .body(Full::new(Bytes::from(form)))?)
    }

    /// Submit a form and decode the JSON response.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        fields: &[(&str, &str)],
    ) -> Result<T, TransportError> {
        let (parts, body) = self.exchange(self.form_request(path, fields)?).await?;
        if !parts.status.is_success() {
            return Err(error_response(&parts, &body));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Submit a form, ignoring the response body on success.
    pub async fn post_form(
        &self,
        path: &str,
        fields: &[(&str, &str)],
    ) -> Result<(), TransportError> {
        let (parts, body) = self.exchange(self.form_request(path, fields)?).await?;
        if !parts.status.is_success() {
            return Err(error_response(&parts, &body));
        }
        Ok(())
    }

    /// Fetch a binary resource.
    ///
    /// A JSON response is always treated as an error report, even with a success status.
    pub async fn get_binary(&self, path: &str) -> Result<Bytes, TransportError> {
        let request = self
            .request(Method::GET, path)
            .body(Full::new(Bytes::new()))?;
        let (parts, body) = self.exchange(request).await?;
        if is_json(&parts) || !parts.status.is_success() {
            return Err(error_response(&parts, &body));
        }
        Ok(body)
    }
}

impl DistributionPoint for DistributionClient {
    #[instrument(skip_all, err, fields(since = since))]
    async fn check_for_update(&self, since: i64) -> Result<Option<UpdateCandidate>, TransportError> {
        let since_text = since.to_string();
        let response: NewUpdateResponse = self
            .post_json(paths::NEW_UPDATE, &[("timestamp", since_text.as_str())])
            .await?;
        if !response.message {
            tracing::debug!("No newer update is available");
            return Ok(None);
        }

        let id = response.update_id.ok_or_else(|| {
            TransportError::Decode(<serde_json::Error as serde::de::Error>::custom(
                "the distribution point announced an update without an updateId",
            ))
        })?;
        // The distribution point may not say when the update was published; the check itself
        // is the best approximation and keeps the same update from being applied twice.
        let timestamp = response.timestamp.unwrap_or_else(unix_now);
        tracing::info!(update_id = %id, timestamp, "A newer update is available");

        Ok(Some(UpdateCandidate { id, timestamp }))
    }

    #[instrument(skip_all, err, fields(update_id = %id))]
    async fn download(&self, id: &UpdateId) -> Result<Bytes, TransportError> {
        let path = format!(
            "{}{}",
            paths::UPDATES,
            utf8_percent_encode(id.as_str(), PATH_SEGMENT)
        );
        let container = self.get_binary(&path).await?;
        tracing::info!(size = container.len(), "Downloaded update container");
        Ok(container)
    }
}

fn is_json(parts: &Parts) -> bool {
    parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

fn error_response(parts: &Parts, body: &Bytes) -> TransportError {
    let status = parts.status;
    if is_json(parts) {
        match serde_json::from_slice(body) {
            Ok(body) => TransportError::Remote { status, body },
            Err(source) => TransportError::UnparsableError { status, source },
        }
    } else {
        TransportError::Status {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

/// Seconds since the Unix epoch according to the local clock.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    fn parts(status: StatusCode, content_type: Option<&'static str>) -> Parts {
        let mut builder = http::Response::builder().status(status);
        if let Some(content_type) = content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        builder.body(()).expect("valid response").into_parts().0
    }

    #[test]
    fn json_detection() {
        assert!(is_json(&parts(StatusCode::OK, Some("application/json"))));
        assert!(is_json(&parts(
            StatusCode::OK,
            Some("Application/JSON; charset=utf-8")
        )));
        assert!(!is_json(&parts(StatusCode::OK, Some("application/octet-stream"))));
        assert!(!is_json(&parts(StatusCode::OK, None)));
    }

    #[test]
    fn structured_errors() {
        let not_found = parts(StatusCode::NOT_FOUND, Some("application/json"));
        match error_response(&not_found, &Bytes::from_static(br#"{"error": "no such update"}"#)) {
            TransportError::Remote { status, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body["error"], "no such update");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        match error_response(&not_found, &Bytes::from_static(b"{oops")) {
            TransportError::UnparsableError { status, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unstructured_errors() {
        let unavailable = parts(StatusCode::SERVICE_UNAVAILABLE, Some("text/plain"));
        match error_response(&unavailable, &Bytes::from_static(b"try later")) {
            TransportError::Status { status, body } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "try later");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn update_ids_are_escaped() {
        let path = format!(
            "{}{}",
            paths::UPDATES,
            utf8_percent_encode("fw 1.2/../x", PATH_SEGMENT)
        );
        assert_eq!(path, "/updates/fw%201.2%2F..%2Fx");
    }
}
