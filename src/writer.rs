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

use crate::reply::Reply;
use tokio::io::AsyncWriteExt;

/// Sink for sending replies to the client.
pub(crate) struct Writer<W: tokio::io::AsyncWrite + Unpin + Send> {
    inner: W,
}

impl<W: tokio::io::AsyncWrite + Unpin + Send> Writer<W> {
    pub(crate) const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Consume the sink and return the underlying stream.
    pub(crate) fn into_inner(self) -> W {
        self.inner
    }

    pub(crate) async fn send_reply(&mut self, reply: &Reply) -> std::io::Result<()> {
        let folded = reply.fold();
        tracing::trace!(">> {:?}", folded);
        self.inner.write_all(folded.as_bytes()).await?;
        self.inner.flush().await
    }
}
