/*
 * smtpd - embeddable SMTP receiving server
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use crate::error::Error;
use crate::handler::{default_mux, ServeMux};
use crate::listener::{default_banner, Banner, Listener, ListenerMode};
use crate::receiver::{Receiver, SessionConfig};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

/// Idle timeout applied to each connection, RFC 5321 §4.5.3.2.
const DEFAULT_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// The assembled SMTP server: a set of listeners sharing server-wide
/// defaults, ready to serve until cancelled.
pub struct Server {
    listeners: Vec<ResolvedListener>,
}

/// A listener descriptor with every default applied, ready to bind.
struct ResolvedListener {
    addr: String,
    mode: ListenerMode,
    /// Acceptor context for implicit-TLS listeners.
    acceptor_tls: Option<Arc<rustls::ServerConfig>>,
    session: SessionConfig,
}

/// Builder assembling a [`Server`] configuration. Validation happens in
/// [`build`](ServerBuilder::build); binding happens in
/// [`listen_and_serve`](Server::listen_and_serve).
#[derive(Default)]
pub struct ServerBuilder {
    listeners: Vec<Listener>,
    banner: Option<Banner>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    handler: Option<Arc<ServeMux>>,
    idle_timeout: Option<std::time::Duration>,
}

impl ServerBuilder {
    /// Add a listener.
    #[must_use]
    pub fn listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Default greeting for listeners that do not set their own.
    #[must_use]
    pub fn banner<F>(mut self, banner: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.banner = Some(Arc::new(banner));
        self
    }

    /// Default TLS context for listeners that do not carry their own.
    #[must_use]
    pub fn tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Default handler chain for listeners that do not carry their own.
    /// Falls back to the process-default chain.
    #[must_use]
    pub fn handler(mut self, handler: Arc<ServeMux>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Per-connection idle timeout. Defaults to 5 minutes.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Validate the configuration and produce the server.
    ///
    /// # Errors
    ///
    /// * [`Error::MissingTlsConfig`] when a `tls` or `starttls` listener
    ///   ends up without a TLS context after the server default is applied.
    pub fn build(self) -> Result<Server, Error> {
        let idle_timeout = self.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT);

        let mut listeners = Vec::with_capacity(self.listeners.len());
        for (index, listener) in self.listeners.into_iter().enumerate() {
            let id = listener
                .id
                .clone()
                .unwrap_or_else(|| index.to_string());
            let banner = listener
                .banner
                .clone()
                .or_else(|| self.banner.clone())
                .unwrap_or_else(default_banner);
            let mux = listener
                .handler
                .clone()
                .or_else(|| self.handler.clone())
                .unwrap_or_else(default_mux);
            let tls_config = listener.tls_config.clone().or_else(|| self.tls_config.clone());

            let (acceptor_tls, session_tls, starttls) = match listener.mode {
                ListenerMode::Plain => (None, tls_config.clone(), tls_config.is_some()),
                ListenerMode::StartTls => match tls_config {
                    Some(tls) => (None, Some(tls), true),
                    None => return Err(Error::MissingTlsConfig(listener.mode)),
                },
                ListenerMode::Tls => match tls_config {
                    Some(tls) => (Some(tls), None, false),
                    None => return Err(Error::MissingTlsConfig(listener.mode)),
                },
            };

            listeners.push(ResolvedListener {
                addr: listener.addr(),
                mode: listener.mode,
                acceptor_tls,
                session: SessionConfig {
                    id,
                    banner,
                    mux,
                    tls_config: session_tls,
                    starttls,
                    idle_timeout,
                },
            });
        }

        Ok(Server { listeners })
    }
}

impl Server {
    /// Start describing a server.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Bind every configured listener and serve until `shutdown` is
    /// cancelled. On cancellation each listener is closed exactly once and
    /// in-flight connections are awaited before returning.
    ///
    /// Always returns an error: [`Error::ServerClosed`] marks a normal
    /// shutdown.
    ///
    /// # Errors
    ///
    /// * [`Error::NoListeners`] when the configuration holds no listener.
    /// * [`Error::Bind`] when a listener fails to bind its socket.
    /// * [`Error::ServerClosed`] after a clean shutdown.
    pub async fn listen_and_serve(self, shutdown: CancellationToken) -> Result<(), Error> {
        tracing::debug!(count = self.listeners.len(), "starting listeners");

        let mut accept_tasks = tokio::task::JoinSet::new();
        let mut handles = Vec::with_capacity(self.listeners.len());

        for listener in self.listeners {
            let socket = tokio::net::TcpListener::bind(listener.addr.as_str())
                .await
                .map_err(|source| Error::Bind {
                    id: listener.session.id.clone(),
                    addr: listener.addr.clone(),
                    source,
                })?;

            tracing::info!(
                id = %listener.session.id,
                addr = %listener.addr,
                mode = %listener.mode,
                "listener serving"
            );

            let handle = ListenerHandle {
                token: shutdown.child_token(),
            };
            accept_tasks.spawn(accept_loop(
                socket,
                listener.acceptor_tls.map(tokio_rustls::TlsAcceptor::from),
                listener.session,
                handle.token.clone(),
            ));
            handles.push(handle);
        }

        if handles.is_empty() {
            return Err(Error::NoListeners);
        }

        shutdown.cancelled().await;
        tracing::info!("SMTPd shutting down...");

        for handle in &handles {
            handle.close();
        }
        while accept_tasks.join_next().await.is_some() {}

        Err(Error::ServerClosed)
    }
}

/// Close latch over one listener. `close` is idempotent: the first call
/// cancels the listener's token, ending its accept loop, which drops the
/// socket; later calls observe the already-cancelled token.
struct ListenerHandle {
    token: CancellationToken,
}

impl ListenerHandle {
    fn close(&self) {
        self.token.cancel();
    }
}

/// One listener's accept loop. Ends when the shutdown token fires or a
/// non-transient accept error occurs, then waits for this listener's
/// connections to finish.
async fn accept_loop(
    socket: tokio::net::TcpListener,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    session: SessionConfig,
    shutdown: CancellationToken,
) {
    let mut connections = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    tracing::info!(listener = %session.id, %remote_addr, "accepted connection");
                    let session = session.clone();
                    match acceptor.clone() {
                        Some(acceptor) => {
                            connections.spawn(run_tls_connection(acceptor, stream, remote_addr, session));
                        }
                        None => {
                            connections.spawn(run_connection(stream, remote_addr, session));
                        }
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    tracing::debug!(listener = %session.id, error = %e, "accept error; retrying");
                }
                Err(e) => {
                    tracing::error!(listener = %session.id, error = %e, "accept error; closing");
                    break;
                }
            }
        }
    }

    // the socket stops accepting now; in-flight sessions run to completion
    drop(socket);
    while connections.join_next().await.is_some() {}
}

/// Accept errors worth retrying: the peer vanished between connect and
/// accept, or the call was interrupted.
fn is_transient_accept_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::Interrupted
    )
}

async fn run_connection(
    stream: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    session: SessionConfig,
) {
    let started = std::time::Instant::now();
    match Receiver::serve_plain(stream, remote_addr, session).await {
        Ok(()) => {
            tracing::info!(%remote_addr, elapsed = ?started.elapsed(), "connection closed cleanly");
        }
        Err(e) => {
            tracing::warn!(%remote_addr, error = %e, elapsed = ?started.elapsed(), "connection closed with an error");
        }
    }
}

async fn run_tls_connection(
    acceptor: tokio_rustls::TlsAcceptor,
    stream: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    session: SessionConfig,
) {
    let started = std::time::Instant::now();
    let tls_stream =
        match tokio::time::timeout(session.idle_timeout, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!(%remote_addr, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::error!(%remote_addr, "TLS handshake timed out");
                return;
            }
        };

    match Receiver::serve_tls(tls_stream, remote_addr, session).await {
        Ok(()) => {
            tracing::info!(%remote_addr, elapsed = ?started.elapsed(), "connection closed cleanly");
        }
        Err(e) => {
            tracing::warn!(%remote_addr, error = %e, elapsed = ?started.elapsed(), "connection closed with an error");
        }
    }
}
