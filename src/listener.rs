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
use crate::handler::ServeMux;
use std::sync::Arc;
use tokio_rustls::rustls;

/// Transport mode of a listener.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[non_exhaustive]
pub enum ListenerMode {
    /// Plain TCP (port 25). STARTTLS is offered iff a TLS context is
    /// supplied.
    #[default]
    Plain,
    /// Implicit TLS at accept time (port 465). STARTTLS is disabled.
    Tls,
    /// Plain TCP with STARTTLS; a TLS context is required (port 587).
    StartTls,
}

/// Callable producing the greeting text sent in the `220` banner.
pub type Banner = Arc<dyn Fn() -> String + Send + Sync>;

pub(crate) fn default_banner() -> Banner {
    Arc::new(|| "DutchCoders SMTPd".to_string())
}

/// Immutable description of one listening socket.
///
/// Built with [`Listener::builder`]; fields left unset fall back to the
/// server-wide defaults when the [`Server`](crate::Server) is assembled.
#[derive(Clone)]
pub struct Listener {
    pub(crate) id: Option<String>,
    pub(crate) address: String,
    pub(crate) port: String,
    pub(crate) mode: ListenerMode,
    pub(crate) banner: Option<Banner>,
    pub(crate) tls_config: Option<Arc<rustls::ServerConfig>>,
    pub(crate) handler: Option<Arc<ServeMux>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("tls_config", &self.tls_config.is_some())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Start describing a listener.
    #[must_use]
    pub fn builder() -> ListenerBuilder {
        ListenerBuilder::default()
    }

    pub(crate) fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Builder for a [`Listener`] descriptor.
#[derive(Default)]
pub struct ListenerBuilder {
    id: Option<String>,
    address: Option<String>,
    port: Option<String>,
    mode: ListenerMode,
    banner: Option<Banner>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    handler: Option<Arc<ServeMux>>,
}

impl ListenerBuilder {
    /// Label used for this listener in logs. Defaults to the listener's
    /// index in the server configuration.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Network address to listen on. Defaults to `127.0.0.1`.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Port to listen on. Required.
    #[must_use]
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Transport mode. Defaults to [`ListenerMode::Plain`].
    #[must_use]
    pub fn mode(mut self, mode: ListenerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Greeting text callable. Defaults to the server banner, then to
    /// `"DutchCoders SMTPd"`.
    #[must_use]
    pub fn banner<F>(mut self, banner: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.banner = Some(Arc::new(banner));
        self
    }

    /// Prepared TLS context. Required for [`ListenerMode::Tls`] and
    /// [`ListenerMode::StartTls`]; in [`ListenerMode::Plain`] its presence
    /// enables opportunistic STARTTLS.
    #[must_use]
    pub fn tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Dedicated handler chain. Defaults to the process-default chain.
    #[must_use]
    pub fn handler(mut self, handler: Arc<ServeMux>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Validate and produce the descriptor.
    ///
    /// # Errors
    ///
    /// * [`Error::MissingPort`] when no port was given.
    pub fn build(self) -> Result<Listener, Error> {
        let port = match self.port {
            Some(port) if !port.is_empty() => port,
            _ => return Err(Error::MissingPort),
        };

        Ok(Listener {
            id: self.id,
            address: self.address.unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            mode: self.mode,
            banner: self.banner,
            tls_config: self.tls_config,
            handler: self.handler,
        })
    }
}
