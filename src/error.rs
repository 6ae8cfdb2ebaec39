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

use crate::listener::ListenerMode;

/// Error produced by server configuration and supervision.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Sentinel returned by [`listen_and_serve`](crate::Server::listen_and_serve)
    /// after a clean shutdown. Every other variant is an actual failure.
    #[error("SMTPd closed")]
    ServerClosed,

    /// The configuration holds no listener, or none could be started.
    #[error("no listeners started")]
    NoListeners,

    /// A listener was declared without the required `port` field.
    #[error("required field Listener.port is empty")]
    MissingPort,

    /// Modes `tls` and `starttls` need a TLS context, either on the
    /// listener or as the server-wide default.
    #[error("mode: {0}, need a TLS context")]
    MissingTlsConfig(ListenerMode),

    /// A listener failed to bind its socket.
    #[error("listener '{id}' on {addr}: {source}")]
    Bind {
        /// Diagnostic label of the listener that failed.
        id: String,
        /// The `address:port` pair that could not be bound.
        addr: String,
        /// Error reported by the socket layer.
        #[source]
        source: std::io::Error,
    },
}
