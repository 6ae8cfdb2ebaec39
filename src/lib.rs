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

//! Embeddable SMTP receiving server.
//!
//! Accepts RFC 5321 sessions - including RFC 3030 BDAT chunking and
//! RFC 3207 STARTTLS - builds a [`Message`] per transaction and hands it to
//! an ordered chain of application handlers. Intended as a mail-ingestion
//! point for testing, relaying and capture: there is no authentication, no
//! outbound delivery and no persistence.
//!
//! ```no_run
//! use smtpd::{CancellationToken, Listener, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     smtpd::handle_fn(|message| {
//!         println!(
//!             "{}: {} recipient(s), {} byte(s)",
//!             message.message_id,
//!             message.to.len(),
//!             message.raw_buffer.len(),
//!         );
//!         Ok(())
//!     })
//!     .await;
//!
//!     let server = Server::builder()
//!         .listener(Listener::builder().id("mx").port("2525").build()?)
//!         .build()?;
//!
//!     // cancel the token (e.g. from a signal handler) to shut down
//!     let shutdown = CancellationToken::new();
//!     let result = server.listen_and_serve(shutdown).await;
//!     println!("{result:?}");
//!     Ok(())
//! }
//! ```

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//
#![allow(clippy::module_name_repetitions)]

mod command;
mod error;
mod handler;
mod listener;
mod message;
mod reader;
mod receiver;
mod reply;
mod server;
mod writer;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use handler::{default_mux, handle_fn, Handler, ServeMux};
pub use listener::{Banner, Listener, ListenerBuilder, ListenerMode};
pub use message::{HeaderMap, MailAddress, Message};
pub use server::{Server, ServerBuilder};

pub use tokio_rustls::rustls;
pub use tokio_util::sync::CancellationToken;
