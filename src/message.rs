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

/// A parsed RFC 5322 mailbox: optional display name plus `local@domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    /// Display name, when the client supplied one (`Jane <jane@example.com>`).
    pub display_name: Option<String>,
    /// The bare address, `local@domain`.
    pub address: String,
}

impl std::str::FromStr for MailAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = mailparse::addrparse(s)?;
        match parsed.first() {
            Some(mailparse::MailAddr::Single(single)) => Ok(Self {
                display_name: single.display_name.clone(),
                address: single.addr.clone(),
            }),
            _ => anyhow::bail!("'{s}' is not a single address"),
        }
    }
}

impl std::fmt::Display for MailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Message headers: case-insensitive lookup, insertion order preserved for
/// iteration. A repeated header name appends to the existing entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    /// Values recorded under `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no header has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn append(&mut self, name: String, value: String) {
        match self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }
}

/// The record produced by one SMTP transaction, handed to the handler chain
/// once the body has been received. Mutable only inside its owning
/// connection; immutable from dispatch onwards.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique, time-ordered identifier assigned at construction.
    pub message_id: uuid::Uuid,
    /// Envelope sender; `None` for the null reverse-path `<>`.
    pub from: Option<MailAddress>,
    /// Envelope recipients in the order received, duplicates preserved.
    pub to: Vec<MailAddress>,
    /// Domain announced by the most recent successful HELO/EHLO.
    pub helo_domain: String,
    /// Peer network address as observed at accept time.
    pub remote_addr: String,
    /// Body bytes as received: dot-unstuffed for DATA, concatenated chunks
    /// for BDAT.
    pub raw_buffer: Vec<u8>,
    /// Parsed headers; empty when header parsing failed.
    pub headers: HeaderMap,
    /// Bytes following the header/body separator; empty when header parsing
    /// failed (`raw_buffer` still carries the full payload).
    pub body: Vec<u8>,
}

impl Message {
    pub(crate) fn new(helo_domain: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::now_v7(),
            from: None,
            to: Vec::new(),
            helo_domain: helo_domain.into(),
            remote_addr: remote_addr.into(),
            raw_buffer: Vec::new(),
            headers: HeaderMap::default(),
            body: Vec::new(),
        }
    }

    pub(crate) fn set_sender(&mut self, from: Option<MailAddress>) {
        self.from = from;
    }

    pub(crate) fn append_recipient(&mut self, recipient: MailAddress) {
        self.to.push(recipient);
    }

    pub(crate) fn set_helo_domain(&mut self, domain: impl Into<String>) {
        self.helo_domain = domain.into();
    }

    pub(crate) fn append_body_chunk(&mut self, chunk: &[u8]) {
        self.raw_buffer.extend_from_slice(chunk);
    }

    /// Split `raw_buffer` into headers and body. Returns false when the
    /// header section does not parse; the raw bytes are kept either way so
    /// handlers may apply lenient policies.
    pub(crate) fn finalise(&mut self) -> bool {
        match mailparse::parse_headers(&self.raw_buffer) {
            Ok((headers, body_offset)) => {
                for header in headers {
                    self.headers.append(header.get_key(), header.get_value());
                }
                self.body = self.raw_buffer[body_offset..].to_vec();
                true
            }
            Err(_) => false,
        }
    }
}
