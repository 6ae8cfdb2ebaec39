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

use tokio::io::AsyncReadExt;

fn find(bytes: &[u8], search: &[u8]) -> Option<usize> {
    bytes
        .windows(search.len())
        .position(|window| window == search)
}

/// Error while framing the client byte stream.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// The message is longer than the advertised maximum.
    #[error("message is not supposed to be longer than {expected} bytes but got {got}")]
    BufferTooLong {
        expected: usize,
        got: usize,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Line-oriented adapter over the client byte stream.
///
/// The buffer is owned by the `Reader` and survives across reads, so bytes
/// the client pipelined behind a command line (a BDAT payload in the same
/// segment, the next command) are never lost.
pub(crate) struct Reader<R: tokio::io::AsyncRead + Unpin + Send> {
    inner: R,
    buffer: bytes::BytesMut,
    additional_reserve: usize,
}

impl<R: tokio::io::AsyncRead + Unpin + Send> Reader<R> {
    pub(crate) fn new(stream: R) -> Self {
        Self {
            inner: stream,
            buffer: bytes::BytesMut::with_capacity(80),
            additional_reserve: 100,
        }
    }

    /// Consume the adapter and return the underlying stream. Unread buffered
    /// bytes are discarded, so only call this at a protocol synchronization
    /// point (after STARTTLS has been acknowledged).
    pub(crate) fn into_inner(self) -> R {
        self.inner
    }

    /// Next `"\r\n"`-terminated line, terminator included. `None` on a
    /// cleanly closed connection.
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = find(&self.buffer, b"\r\n") {
                let line = self.buffer.split_to(pos + 2);
                tracing::trace!("<< {:?}", std::str::from_utf8(&line));
                return Ok(Some(Vec::<u8>::from(line)));
            }

            self.buffer.reserve(self.additional_reserve);
            let read_size = self.inner.read_buf(&mut self.buffer).await?;
            if read_size == 0 {
                if !self.buffer.is_empty() {
                    tracing::trace!(
                        remaining = self.buffer.len(),
                        "discarding partial line at end of stream"
                    );
                    self.buffer.clear();
                }
                return Ok(None);
            }
        }
    }

    /// Produce the dot-unstuffed DATA body as a stream of lines (CRLF
    /// included). The terminating `".\r\n"` line is consumed and not
    /// yielded; a leading dot on any other line is stripped.
    pub(crate) fn as_message_stream(
        &mut self,
        size_limit: usize,
    ) -> impl tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + '_ {
        async_stream::stream! {
            let mut size = 0;

            loop {
                let line = match self.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        yield Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed before terminating dot",
                        )));
                        return;
                    }
                    Err(e) => {
                        yield Err(Error::Io(e));
                        return;
                    }
                };

                if line == b".\r\n" {
                    return;
                }

                let line = if line.first() == Some(&b'.') {
                    line[1..].to_vec()
                } else {
                    line
                };

                size += line.len();
                if size >= size_limit {
                    yield Err(Error::BufferTooLong { expected: size_limit, got: size });
                    return;
                }

                yield Ok(line);
            }
        }
    }

    /// Read exactly `count` raw bytes (a BDAT chunk), regardless of content.
    /// Bytes already buffered behind the command line are served first.
    pub(crate) async fn read_chunk(&mut self, count: usize) -> std::io::Result<Vec<u8>> {
        while self.buffer.len() < count {
            self.buffer
                .reserve((count - self.buffer.len()).max(self.additional_reserve));
            let read_size = self.inner.read_buf(&mut self.buffer).await?;
            if read_size == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "connection closed inside chunk: expected {count} bytes, got {}",
                        self.buffer.len()
                    ),
                ));
            }
        }

        let chunk = self.buffer.split_to(count);
        tracing::trace!(size = count, "<< [chunk]");
        Ok(Vec::<u8>::from(chunk))
    }
}
