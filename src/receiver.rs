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

use crate::command::{BdatArgs, HeloArgs, MailFromArgs, RcptToArgs, UnparsedArgs, Verb};
use crate::handler::ServeMux;
use crate::listener::Banner;
use crate::message::Message;
use crate::reader::{self, Reader};
use crate::reply::Reply;
use crate::writer::Writer;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_stream::StreamExt as _;

/// Maximum message size, advertised in the EHLO `SIZE` capability and
/// enforced on both DATA and BDAT bodies.
const MESSAGE_SIZE_MAX: usize = 35_882_577;

/// Ceiling on commands accepted within one session.
const COMMAND_COUNT_MAX: u32 = 100;

/// Longest command line accepted (RFC 5321 §4.5.3.1.6).
const COMMAND_LINE_MAX: usize = 512;

/// Per-listener session parameters, shared by every connection the
/// listener accepts.
#[derive(Clone)]
pub(crate) struct SessionConfig {
    /// Listener label, for logs.
    pub(crate) id: String,
    pub(crate) banner: Banner,
    pub(crate) mux: Arc<ServeMux>,
    /// TLS context used for an in-session STARTTLS upgrade.
    pub(crate) tls_config: Option<Arc<rustls::ServerConfig>>,
    /// Whether STARTTLS is offered on this listener's sessions.
    pub(crate) starttls: bool,
    pub(crate) idle_timeout: std::time::Duration,
}

/// Session automaton states. Exactly one is active per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the client to identify itself with HELO/EHLO.
    Hello,
    /// Identified, no transaction open.
    Ready,
    /// MAIL FROM accepted; collecting recipients and the body.
    Transaction,
}

/// How the command loop ended.
pub(crate) enum LoopOutcome {
    /// Session over (QUIT, disconnect, or a fatal protocol error).
    Quit,
    /// `220 Ready to start TLS` has been sent; the caller drives the
    /// handshake and restarts the session over the encrypted stream.
    UpgradeTls,
}

/// Whether the current command leaves the session usable.
enum Flow {
    Continue,
    Terminate,
}

/// The per-connection SMTP engine: reads command lines, walks the session
/// automaton, frames message bodies and dispatches each completed
/// [`Message`] to the handler chain.
pub(crate) struct Receiver<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    pub(crate) reader: Reader<R>,
    pub(crate) writer: Writer<W>,
    config: SessionConfig,
    remote_addr: String,
    helo_domain: String,
    msg: Message,
    hasher: Sha1,
    command_count: u32,
    secured: bool,
}

impl Receiver<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf> {
    /// Serve a plain-TCP session, upgrading to TLS mid-stream when the
    /// client negotiates STARTTLS.
    pub(crate) async fn serve_plain(
        stream: tokio::net::TcpStream,
        remote_addr: std::net::SocketAddr,
        config: SessionConfig,
    ) -> std::io::Result<()> {
        let (read, write) = stream.into_split();
        let mut receiver = Self::new(read, write, config, remote_addr.to_string(), false);
        receiver.greet().await?;
        match receiver.session_loop().await? {
            LoopOutcome::Quit => Ok(()),
            LoopOutcome::UpgradeTls => receiver.upgrade_tls().await,
        }
    }

    /// Drive the server-side TLS handshake over the raw socket and run the
    /// session again over the encrypted stream, with the envelope cleared.
    async fn upgrade_tls(self) -> std::io::Result<()> {
        let Self {
            reader,
            writer,
            config,
            remote_addr,
            command_count,
            ..
        } = self;

        let tcp_stream = reader
            .into_inner()
            .reunite(writer.into_inner())
            .expect("valid halves of a single stream");
        let tls_config = config
            .tls_config
            .clone()
            .expect("STARTTLS accepted only with a TLS context");

        let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
        let tls_stream =
            match tokio::time::timeout(config.idle_timeout, acceptor.accept(tcp_stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::error!(%remote_addr, error = %e, "TLS handshake failed");
                    return Ok(());
                }
                Err(_) => {
                    tracing::error!(%remote_addr, "TLS handshake timed out");
                    return Ok(());
                }
            };
        let (read, write) = tokio::io::split(tls_stream);

        // RFC 3207: no new banner; the client must identify itself again
        // and previously accumulated envelope state is gone.
        let mut secured = Receiver::new(read, write, config, remote_addr, true);
        secured.command_count = command_count;
        match secured.session_loop().await? {
            LoopOutcome::Quit | LoopOutcome::UpgradeTls => Ok(()),
        }
    }
}

impl
    Receiver<
        tokio::io::ReadHalf<tokio_rustls::server::TlsStream<tokio::net::TcpStream>>,
        tokio::io::WriteHalf<tokio_rustls::server::TlsStream<tokio::net::TcpStream>>,
    >
{
    /// Serve a session accepted on an implicit-TLS listener. The handshake
    /// has already completed; STARTTLS is not offered.
    pub(crate) async fn serve_tls(
        stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
        remote_addr: std::net::SocketAddr,
        config: SessionConfig,
    ) -> std::io::Result<()> {
        let (read, write) = tokio::io::split(stream);
        let mut receiver = Self::new(read, write, config, remote_addr.to_string(), true);
        receiver.greet().await?;
        match receiver.session_loop().await? {
            LoopOutcome::Quit | LoopOutcome::UpgradeTls => Ok(()),
        }
    }
}

impl<R, W> Receiver<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(
        read: R,
        write: W,
        config: SessionConfig,
        remote_addr: String,
        secured: bool,
    ) -> Self {
        Self {
            reader: Reader::new(read),
            writer: Writer::new(write),
            msg: Message::new("", remote_addr.clone()),
            config,
            remote_addr,
            helo_domain: String::new(),
            hasher: Sha1::new(),
            command_count: 0,
            secured,
        }
    }

    pub(crate) async fn greet(&mut self) -> std::io::Result<()> {
        let banner = (self.config.banner)();
        self.send(&Reply::new(220, banner)).await
    }

    async fn send(&mut self, reply: &Reply) -> std::io::Result<()> {
        self.writer.send_reply(reply).await
    }

    fn starttls_available(&self) -> bool {
        self.config.starttls && !self.secured && self.config.tls_config.is_some()
    }

    /// Read the next command line, bounded by the idle timeout. `None`
    /// means the session is over: disconnect or timeout.
    async fn next_command(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::time::timeout(self.config.idle_timeout, self.reader.next_line()).await {
            Ok(line) => line,
            Err(_) => {
                tracing::debug!(remote_addr = %self.remote_addr, "session idle timeout");
                self.send(&Reply::new(451, "Timeout - closing connection"))
                    .await
                    .ok();
                Ok(None)
            }
        }
    }

    /// The session automaton. Runs until the client quits, disconnects,
    /// commits a fatal error, or negotiates a TLS upgrade.
    pub(crate) async fn session_loop(&mut self) -> std::io::Result<LoopOutcome> {
        let mut state = State::Hello;

        loop {
            let Some(line) = self.next_command().await? else {
                return Ok(LoopOutcome::Quit);
            };
            let (verb, args) = Verb::parse_line(&line);

            if state == State::Hello {
                match verb {
                    Verb::Helo => match HeloArgs::try_from(args) {
                        Ok(HeloArgs { client_name }) => {
                            self.record_client_name(&client_name);
                            self.send(&Reply::new(
                                250,
                                format!("Hello {client_name}, I am glad to meet you"),
                            ))
                            .await?;
                            state = State::Ready;
                        }
                        Err(e) => {
                            self.send(&Reply::new(500, e.to_string())).await?;
                            return Ok(LoopOutcome::Quit);
                        }
                    },
                    Verb::Ehlo => match HeloArgs::try_from(args) {
                        Ok(HeloArgs { client_name }) => {
                            self.record_client_name(&client_name);
                            let reply = self.ehlo_reply(&client_name);
                            self.send(&reply).await?;
                            state = State::Ready;
                        }
                        Err(e) => {
                            self.send(&Reply::new(500, e.to_string())).await?;
                            return Ok(LoopOutcome::Quit);
                        }
                    },
                    _ => {
                        self.send(&Reply::new(
                            500,
                            "Before we shake hands it will be appropriate to tell me who you are.",
                        ))
                        .await?;
                        return Ok(LoopOutcome::Quit);
                    }
                }
                continue;
            }

            // blank and whitespace-only lines are ignored outside of DATA
            if line
                .iter()
                .all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
            {
                continue;
            }

            self.command_count += 1;
            if self.command_count > COMMAND_COUNT_MAX {
                self.send(&Reply::new(500, "Error: invalid.")).await?;
                return Ok(LoopOutcome::Quit);
            }

            if line.len() > COMMAND_LINE_MAX {
                self.send(&Reply::new(500, "line too long")).await?;
                continue;
            }

            match (state, verb) {
                (_, Verb::Rset) => {
                    self.reset_transaction();
                    self.send(&Reply::new(250, "Ok")).await?;
                    state = State::Ready;
                }
                (State::Ready, Verb::MailFrom) => match MailFromArgs::try_from(args) {
                    Ok(MailFromArgs { reverse_path }) => {
                        self.msg.set_sender(reverse_path);
                        self.send(&Reply::new(250, "Ok")).await?;
                        state = State::Transaction;
                    }
                    Err(e) => {
                        tracing::debug!(remote_addr = %self.remote_addr, error = %e, "rejecting MAIL FROM argument");
                        self.send(&Reply::new(501, "Syntax error in parameters or arguments"))
                            .await?;
                    }
                },
                (State::Ready, Verb::StartTls) => {
                    if self.starttls_available() {
                        self.send(&Reply::new(220, "Ready to start TLS")).await?;
                        return Ok(LoopOutcome::UpgradeTls);
                    }
                    self.send(&Reply::new(500, "unrecognized command")).await?;
                }
                (State::Ready, Verb::Noop) => {
                    self.send(&Reply::new(250, "Ok")).await?;
                }
                (State::Ready, Verb::Quit) => {
                    self.send(&Reply::new(221, "Bye")).await?;
                    return Ok(LoopOutcome::Quit);
                }
                (State::Transaction, Verb::RcptTo) => match RcptToArgs::try_from(args) {
                    Ok(RcptToArgs { forward_path }) => {
                        self.msg.append_recipient(forward_path);
                        self.send(&Reply::new(250, "Ok")).await?;
                    }
                    Err(e) => {
                        tracing::debug!(remote_addr = %self.remote_addr, error = %e, "rejecting RCPT TO argument");
                        self.send(&Reply::new(501, "Syntax error in parameters or arguments"))
                            .await?;
                    }
                },
                (State::Transaction, Verb::Data) => match self.receive_data().await? {
                    Flow::Continue => state = State::Ready,
                    Flow::Terminate => return Ok(LoopOutcome::Quit),
                },
                (State::Transaction, Verb::Bdat) => {
                    match self.receive_bdat(args, &mut state).await? {
                        Flow::Continue => {}
                        Flow::Terminate => return Ok(LoopOutcome::Quit),
                    }
                }
                _ => {
                    self.send(&Reply::new(500, "unrecognized command")).await?;
                    state = State::Ready;
                }
            }
        }
    }

    fn record_client_name(&mut self, client_name: &str) {
        self.helo_domain = client_name.to_string();
        self.msg.set_helo_domain(client_name);
    }

    fn ehlo_reply(&self, client_name: &str) -> Reply {
        let mut text = format!("Hello {client_name}\r\nSIZE {MESSAGE_SIZE_MAX}\r\n8BITMIME\r\n");
        if self.starttls_available() {
            text.push_str("STARTTLS\r\n");
        }
        text.push_str("ENHANCEDSTATUSCODES\r\nPIPELINING\r\nCHUNKING\r\nSMTPUTF8");
        Reply::new(250, text)
    }

    /// Discard the transaction in progress and start over with a fresh
    /// message. The HELO domain survives, per RFC 5321 RSET semantics.
    fn reset_transaction(&mut self) {
        self.msg = Message::new(self.helo_domain.clone(), self.remote_addr.clone());
        self.hasher = Sha1::new();
    }

    /// DATA body transfer: stream the dot-unstuffed lines into the message
    /// while fingerprinting them, then finish the transaction.
    async fn receive_data(&mut self) -> std::io::Result<Flow> {
        self.send(&Reply::new(
            354,
            "Enter message, ending with \".\" on a line by itself",
        ))
        .await?;

        let idle_timeout = self.config.idle_timeout;
        let framing = {
            let stream = self.reader.as_message_stream(MESSAGE_SIZE_MAX);
            tokio::pin!(stream);

            loop {
                match tokio::time::timeout(idle_timeout, stream.try_next()).await {
                    Ok(Ok(Some(chunk))) => {
                        self.hasher.update(&chunk);
                        self.msg.append_body_chunk(&chunk);
                    }
                    Ok(Ok(None)) => break Ok(()),
                    Ok(Err(e)) => break Err(e),
                    Err(_) => {
                        break Err(reader::Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "timed out waiting for message data",
                        )))
                    }
                }
            }
        };

        match framing {
            Ok(()) => {
                self.complete_transaction().await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.send(&Reply::new(500, format!("[data]: error {e}")))
                    .await?;
                Ok(Flow::Terminate)
            }
        }
    }

    /// One BDAT chunk: read exactly the announced byte count off the raw
    /// stream, then either wait for more chunks or finish on LAST.
    async fn receive_bdat(
        &mut self,
        args: UnparsedArgs,
        state: &mut State,
    ) -> std::io::Result<Flow> {
        let BdatArgs { size, last } = match BdatArgs::try_from(args) {
            Ok(args) => args,
            Err(e) => {
                self.send(&Reply::new(500, format!("[bdat]: error {e}")))
                    .await?;
                return Ok(Flow::Terminate);
            }
        };

        if self.msg.raw_buffer.len() + size > MESSAGE_SIZE_MAX {
            self.send(&Reply::new(
                500,
                "[bdat]: error message exceeds fixed maximum message size",
            ))
            .await?;
            return Ok(Flow::Terminate);
        }

        let chunk =
            match tokio::time::timeout(self.config.idle_timeout, self.reader.read_chunk(size))
                .await
            {
                Ok(Ok(chunk)) => chunk,
                Ok(Err(e)) => {
                    self.send(&Reply::new(500, format!("[bdat]: error {e}")))
                        .await?;
                    return Ok(Flow::Terminate);
                }
                Err(_) => {
                    self.send(&Reply::new(451, "Timeout - closing connection"))
                        .await?;
                    return Ok(Flow::Terminate);
                }
            };
        self.hasher.update(&chunk);
        self.msg.append_body_chunk(&chunk);

        if last {
            self.complete_transaction().await?;
            *state = State::Ready;
        } else {
            self.send(&Reply::new(250, "Ok")).await?;
        }
        Ok(Flow::Continue)
    }

    /// Close the transaction: parse the accumulated body, acknowledge with
    /// the content fingerprint, hand the message to the handler chain and
    /// start a fresh one.
    async fn complete_transaction(&mut self) -> std::io::Result<()> {
        if !self.msg.finalise() {
            tracing::debug!(
                message_id = %self.msg.message_id,
                "header parse failed, delivering raw buffer only"
            );
        }

        let digest = std::mem::take(&mut self.hasher).finalize();
        let fingerprint = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        self.send(&Reply::new(250, format!("Ok : queued as +{fingerprint}")))
            .await?;

        let msg = std::mem::replace(
            &mut self.msg,
            Message::new(self.helo_domain.clone(), self.remote_addr.clone()),
        );
        tracing::info!(
            listener = %self.config.id,
            message_id = %msg.message_id,
            remote_addr = %self.remote_addr,
            recipients = msg.to.len(),
            size = msg.raw_buffer.len(),
            "message received"
        );

        if let Err(e) = self.config.mux.serve(&msg).await {
            tracing::error!(message_id = %msg.message_id, error = %e, "message handler failed");
        }
        Ok(())
    }
}
