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

//! In-process session tests: the receiver runs over in-memory cursors, the
//! scripted client input on the read side, every reply captured on the
//! write side.


use crate::handler::{Handler, ServeMux};
use crate::listener::default_banner;
use crate::message::Message;
use crate::receiver::{Receiver, SessionConfig};
use std::sync::{Arc, Mutex};
use tokio_rustls::rustls;

/// Everything one scripted session produced.
pub(crate) struct SessionResult {
    /// The full server-side transcript.
    pub(crate) output: String,
    /// Messages that reached the handler chain, in dispatch order.
    pub(crate) messages: Vec<Message>,
}

struct CaptureHandler(Arc<Mutex<Vec<Message>>>);

#[async_trait::async_trait]
impl Handler for CaptureHandler {
    async fn serve(&self, message: &Message) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct SessionOptions {
    /// Session already encrypted (implicit-TLS listener).
    pub(crate) secured: bool,
    /// STARTTLS offered.
    pub(crate) starttls: bool,
    pub(crate) tls_config: Option<Arc<rustls::ServerConfig>>,
    /// Extra handlers, registered ahead of the capture handler.
    pub(crate) mux: Option<Arc<ServeMux>>,
}

pub(crate) async fn run_session(input: &str) -> SessionResult {
    run_session_with(input, SessionOptions::default()).await
}

pub(crate) async fn run_session_with(input: &str, options: SessionOptions) -> SessionResult {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let mux = options.mux.unwrap_or_else(|| Arc::new(ServeMux::new()));
    mux.handle(Box::new(CaptureHandler(Arc::clone(&captured))))
        .await;

    let config = SessionConfig {
        id: "test".to_string(),
        banner: default_banner(),
        mux,
        tls_config: options.tls_config,
        starttls: options.starttls,
        idle_timeout: std::time::Duration::from_secs(5),
    };

    let mut receiver = Receiver::new(
        std::io::Cursor::new(input.as_bytes().to_vec()),
        std::io::Cursor::new(Vec::new()),
        config,
        "127.0.0.1:49152".to_string(),
        options.secured,
    );
    receiver.greet().await.unwrap();
    let _outcome = receiver.session_loop().await.unwrap();

    let output = String::from_utf8(receiver.writer.into_inner().into_inner()).unwrap();
    let messages = std::mem::take(&mut *captured.lock().unwrap());
    SessionResult { output, messages }
}

pub(crate) fn sha1_hex(data: &[u8]) -> String {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub(crate) fn test_tls_config() -> Arc<rustls::ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls::Certificate(cert.serialize_der().unwrap())],
            rustls::PrivateKey(cert.serialize_private_key_der()),
        )
        .unwrap();
    Arc::new(config)
}
