// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The push listener.

use std::{convert::Infallible, future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::{body::Body, server::conn::http1};
use hyper_util::rt::{TokioIo, TokioTimer};
use openssl::ssl::Ssl;
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, instrument};

use super::peer_common_name;
use crate::{
    protocol::{PushNotification, paths},
    trust::TrustStore,
};

/// Push notifications are tiny; anything larger is not one.
const MAX_NOTIFICATION_SIZE: usize = 16 * 1024;

pub struct Listener {
    /// The socket address push notifications are expected to arrive on. This is primarily
    /// useful for tests when binding to port 0.
    local_addr: SocketAddr,
    /// A task that is accepting incoming connections. Once the halt token has been cancelled,
    /// this task completes after all open connections and the notification handlers they
    /// started have finished.
    task: tokio::task::JoinHandle<Result<(), anyhow::Error>>,
    halt_token: CancellationToken,
}

impl Listener {
    /// Get the port number the listener is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get a cancellation token which can be used to start the graceful shutdown of this
    /// listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await?
    }

    /// Stop accepting new connections and wait for existing connections to complete.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }
}

/// Accept update notifications on `address`.
///
/// Peers must present a certificate that chains to the configured certificate authority. Each
/// valid notification is passed to `handler` on its own task after the peer has been told it
/// was received. This function returns once the TCP listener has been established.
#[instrument(skip_all, err, fields(address = %address))]
pub async fn listen<H, Fut>(
    address: SocketAddr,
    trust: Arc<TrustStore>,
    handshake_timeout: Duration,
    handler: H,
    halt_token: CancellationToken,
) -> anyhow::Result<Listener>
where
    H: Fn(PushNotification) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let tcp_listener = TcpListener::bind(address).await?;
    let local_addr = tcp_listener.local_addr()?;
    tracing::info!(%local_addr, "Listening for update notifications");

    let task = tokio::spawn(
        inner_listen(
            tcp_listener,
            trust,
            handshake_timeout,
            handler,
            halt_token.clone(),
        )
        .instrument(tracing::Span::current()),
    );
    Ok(Listener {
        local_addr,
        task,
        halt_token,
    })
}

async fn inner_listen<H, Fut>(
    tcp_listener: TcpListener,
    trust: Arc<TrustStore>,
    handshake_timeout: Duration,
    handler: H,
    halt_token: CancellationToken,
) -> anyhow::Result<()>
where
    H: Fn(PushNotification) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let request_tracker = TaskTracker::new();

    'accept: loop {
        tokio::select! {
            _ = halt_token.cancelled() => {
                tracing::info!("Shutdown requested, no new notifications will be accepted");
                break 'accept;
            },
            accepted = tcp_listener.accept() => {
                match accepted {
                    Ok((tcp_stream, peer_addr)) => {
                        tracing::debug!(?peer_addr, "New TCP connection established");
                        let ssl = Ssl::new(trust.acceptor().context())?;
                        request_tracker.spawn(
                            serve_connection(
                                tcp_stream,
                                peer_addr,
                                ssl,
                                handshake_timeout,
                                handler.clone(),
                                request_tracker.clone(),
                                halt_token.clone(),
                            )
                            .instrument(tracing::Span::current()),
                        );
                    }
                    Err(error) => tracing::warn!(?error, "Failed to accept new connection"),
                }
            }
        }
    }

    request_tracker.close();
    request_tracker.wait().await;

    Ok(())
}

#[instrument(skip_all, fields(peer_addr = %peer_addr, peer = tracing::field::Empty))]
async fn serve_connection<H, Fut>(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    ssl: Ssl,
    handshake_timeout: Duration,
    handler: H,
    request_tracker: TaskTracker,
    halt_token: CancellationToken,
) where
    H: Fn(PushNotification) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut stream = match SslStream::new(ssl, tcp_stream) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(?error, "Failed to set up TLS for the connection");
            return;
        }
    };
    match tokio::time::timeout(handshake_timeout, Pin::new(&mut stream).accept()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(?error, "TLS handshake failed; dropping connection");
            return;
        }
        Err(_elapsed) => {
            tracing::warn!("TLS handshake timed out; dropping connection");
            return;
        }
    }
    let peer = peer_common_name(stream.ssl());
    tracing::Span::current().record("peer", peer.as_deref().unwrap_or("<no common name>"));
    tracing::debug!("TLS session established");

    let service = hyper::service::service_fn(move |request| {
        route(
            request,
            handler.clone(),
            request_tracker.clone(),
            handshake_timeout,
        )
    });
    let connection = http1::Builder::new()
        .keep_alive(false)
        .timer(TokioTimer::new())
        .header_read_timeout(handshake_timeout)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = halt_token.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(error) = result {
        tracing::debug!(?error, "Push connection closed with an error");
    }
}

/// Handle a single request on the push listener.
///
/// Valid notifications are acknowledged before `handler` runs; the peer never waits on an
/// update. The whole body must arrive within `body_timeout`.
async fn route<B, H, Fut>(
    request: Request<B>,
    handler: H,
    request_tracker: TaskTracker,
    body_timeout: Duration,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H: Fn(PushNotification) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    if request.uri().path() != paths::NEW_UPDATE {
        return Ok(empty_response(StatusCode::NOT_FOUND));
    }
    if request.method() != Method::POST {
        return Ok(empty_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let body = Limited::new(request.into_body(), MAX_NOTIFICATION_SIZE).collect();
    let body = match tokio::time::timeout(body_timeout, body).await {
        Ok(Ok(body)) => body.to_bytes(),
        Ok(Err(error)) => {
            tracing::warn!(%error, "Failed to read the update notification");
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
        Err(_) => {
            tracing::warn!(?body_timeout, "Timed out reading the update notification");
            return Ok(empty_response(StatusCode::REQUEST_TIMEOUT));
        }
    };
    let notification: PushNotification = match serde_json::from_slice(&body) {
        Ok(notification) => notification,
        Err(error) => {
            tracing::warn!(?error, "Rejecting malformed update notification");
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
    };

    tracing::info!(
        update_id = %notification.id,
        timestamp = notification.timestamp,
        "Received update notification"
    );
    request_tracker.spawn(handler(notification).instrument(tracing::Span::current()));

    Ok(empty_response(StatusCode::OK))
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        task::{Context, Poll},
    };

    use hyper::body::Frame;

    use super::*;
    use crate::protocol::UpdateId;

    type Received = Arc<Mutex<Vec<PushNotification>>>;

    const BODY_TIMEOUT: Duration = Duration::from_secs(5);

    /// A request body whose sender never gets around to sending it.
    struct StalledBody;

    impl Body for StalledBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Pending
        }
    }

    fn recorder() -> (
        Received,
        impl Fn(PushNotification) -> std::future::Ready<()> + Clone,
    ) {
        let received = Received::default();
        let sink = received.clone();
        let handler = move |notification| {
            sink.lock().expect("not poisoned").push(notification);
            std::future::ready(())
        };
        (received, handler)
    }

    fn request(method: Method, path: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .expect("valid request")
    }

    #[tokio::test]
    async fn notification_is_acknowledged_and_dispatched() -> anyhow::Result<()> {
        let (received, handler) = recorder();
        let tracker = TaskTracker::new();
        let response = route(
            request(Method::POST, "/newUpdate", r#"{"timestamp": 12, "id": "fw-12"}"#),
            handler,
            tracker.clone(),
            BODY_TIMEOUT,
        )
        .await?;
        assert_eq!(response.status(), StatusCode::OK);

        tracker.close();
        tracker.wait().await;
        let received = received.lock().expect("not poisoned");
        assert_eq!(
            *received,
            vec![PushNotification {
                timestamp: 12,
                id: UpdateId::new("fw-12")
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejected_requests() -> anyhow::Result<()> {
        let (received, handler) = recorder();
        let tracker = TaskTracker::new();
        let cases = [
            (Method::POST, "/newUpdate", "not json", StatusCode::BAD_REQUEST),
            (Method::POST, "/newUpdate", r#"{"id": "x"}"#, StatusCode::BAD_REQUEST),
            (Method::GET, "/newUpdate", "", StatusCode::METHOD_NOT_ALLOWED),
            (Method::POST, "/elsewhere", "{}", StatusCode::NOT_FOUND),
        ];
        for (method, path, body, expected) in cases {
            let response = route(
                request(method, path, body),
                handler.clone(),
                tracker.clone(),
                BODY_TIMEOUT,
            )
            .await?;
            assert_eq!(response.status(), expected, "{path} {body}");
        }

        tracker.close();
        tracker.wait().await;
        assert!(received.lock().expect("not poisoned").is_empty());
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn stalled_body_times_out() -> anyhow::Result<()> {
        let (received, handler) = recorder();
        let tracker = TaskTracker::new();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/newUpdate")
            .body(StalledBody)?;

        let response = tokio::time::timeout(
            BODY_TIMEOUT,
            route(request, handler, tracker.clone(), Duration::from_millis(50)),
        )
        .await??;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(logs_contain("Timed out reading the update notification"));

        tracker.close();
        tracker.wait().await;
        assert!(received.lock().expect("not poisoned").is_empty());
        Ok(())
    }
}
