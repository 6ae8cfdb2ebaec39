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

use crate::message::MailAddress;

/// Buffer received from the client, verb prefix stripped, CRLF included.
pub(crate) struct UnparsedArgs(pub(crate) Vec<u8>);

/// SMTP command verb, matched case-insensitively against the start of a
/// command line. The serialized form is the wire prefix, so verbs taking
/// arguments end with the separator (`"HELO "`, `"MAIL FROM:"`) and
/// argument-less verbs include the line terminator (`"QUIT\r\n"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString, strum::EnumVariantNames)]
pub(crate) enum Verb {
    /// Historical client greeting.
    #[strum(serialize = "HELO ")]
    Helo,
    /// Extended client greeting, elicits the capability advertisement.
    #[strum(serialize = "EHLO ")]
    Ehlo,
    /// Opens a mail transaction with the reverse-path.
    #[strum(serialize = "MAIL FROM:")]
    MailFrom,
    /// Adds one forward-path to the open transaction.
    #[strum(serialize = "RCPT TO:")]
    RcptTo,
    /// Classic body transfer, terminated by a lone dot line.
    #[strum(serialize = "DATA\r\n")]
    Data,
    /// Chunked body transfer with an explicit byte count (RFC 3030).
    #[strum(serialize = "BDAT ")]
    Bdat,
    #[strum(serialize = "QUIT\r\n")]
    Quit,
    /// Aborts the open transaction, discarding sender, recipients and body.
    #[strum(serialize = "RSET\r\n")]
    Rset,
    #[strum(serialize = "NOOP\r\n")]
    Noop,
    /// Upgrades a plain session to TLS mid-stream (RFC 3207).
    #[strum(serialize = "STARTTLS\r\n")]
    StartTls,
    /// Any line that matches no other verb.
    Unknown,
}

impl Verb {
    /// Split a command line into its verb and the remaining bytes.
    pub(crate) fn parse_line(line: &[u8]) -> (Self, UnparsedArgs) {
        <Self as strum::VariantNames>::VARIANTS
            .iter()
            .find(|prefix| {
                line.len() >= prefix.len()
                    && line[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
            })
            .map_or_else(
                || (Self::Unknown, UnparsedArgs(line.to_vec())),
                |prefix| {
                    (
                        prefix.parse().expect("verb found above"),
                        UnparsedArgs(line[prefix.len()..].to_vec()),
                    )
                },
            )
    }
}

/// Error while parsing the arguments of a command.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseArgsError {
    #[error("{0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("Invalid domain")]
    InvalidDomain,
    #[error("'{0}' is not a valid address")]
    BadAddress(String),
    #[error("{0}")]
    BadChunkSize(String),
}

/// Argument of the HELO and EHLO commands.
pub(crate) struct HeloArgs {
    pub(crate) client_name: String,
}

impl TryFrom<UnparsedArgs> for HeloArgs {
    type Error = ParseArgsError;

    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        let client_name = String::from_utf8(value.0)?;
        let client_name = client_name.trim();
        if client_name.is_empty() {
            return Err(ParseArgsError::InvalidDomain);
        }
        Ok(Self {
            client_name: client_name.to_string(),
        })
    }
}

/// Argument of the MAIL FROM command. `None` is the null reverse-path `<>`.
pub(crate) struct MailFromArgs {
    pub(crate) reverse_path: Option<MailAddress>,
}

impl TryFrom<UnparsedArgs> for MailFromArgs {
    type Error = ParseArgsError;

    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            reverse_path: parse_path(&value.0)?,
        })
    }
}

/// Argument of the RCPT TO command.
pub(crate) struct RcptToArgs {
    pub(crate) forward_path: MailAddress,
}

impl TryFrom<UnparsedArgs> for RcptToArgs {
    type Error = ParseArgsError;

    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        match parse_path(&value.0)? {
            Some(forward_path) => Ok(Self { forward_path }),
            None => Err(ParseArgsError::BadAddress("<>".to_string())),
        }
    }
}

/// Extract the address part of an envelope path argument.
///
/// Angle brackets and leading whitespace are permitted per RFC 5321, and
/// ESMTP parameters following the path (`SIZE=...`, `BODY=8BITMIME`) are
/// tolerated and ignored. `<>` is the null path and yields `None`.
fn parse_path(value: &[u8]) -> Result<Option<MailAddress>, ParseArgsError> {
    let value = String::from_utf8(value.to_vec())?;
    let value = value.trim_start();

    let path = if let Some(rest) = value.strip_prefix('<') {
        match rest.split_once('>') {
            Some((inner, _params)) => format!("<{inner}>"),
            None => return Err(ParseArgsError::BadAddress(value.trim_end().to_string())),
        }
    } else {
        value
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string()
    };

    if path.is_empty() || path == "<>" {
        return Ok(None);
    }

    path.parse::<MailAddress>()
        .map(Some)
        .map_err(|_| ParseArgsError::BadAddress(path))
}

/// Argument of the BDAT command: a decimal chunk size and the LAST marker.
pub(crate) struct BdatArgs {
    pub(crate) size: usize,
    pub(crate) last: bool,
}

impl TryFrom<UnparsedArgs> for BdatArgs {
    type Error = ParseArgsError;

    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        let value = String::from_utf8(value.0)?;
        let mut parts = value.split_whitespace();

        let size = parts
            .next()
            .ok_or_else(|| ParseArgsError::BadChunkSize("missing chunk size".to_string()))?;
        let size = size
            .parse::<usize>()
            .map_err(|e| ParseArgsError::BadChunkSize(format!("parsing \"{size}\": {e}")))?;

        let last = match parts.next() {
            Some(token) if token.eq_ignore_ascii_case("LAST") => true,
            Some(token) => {
                return Err(ParseArgsError::BadChunkSize(format!(
                    "unexpected token \"{token}\""
                )))
            }
            None => false,
        };

        if let Some(token) = parts.next() {
            return Err(ParseArgsError::BadChunkSize(format!(
                "unexpected token \"{token}\""
            )));
        }

        Ok(Self { size, last })
    }
}
