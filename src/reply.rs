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

/// SMTP reply sent by the server to the client as defined in RFC 5321 §4.2.
///
/// `text` may span several lines separated by `"\r\n"`; [`Reply::fold`]
/// renders the continuation form (`250-...` / `250 ...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    pub(crate) fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Render the reply to wire form, one `code` prefix per text line.
    /// All lines but the last carry the `-` continuation separator.
    pub(crate) fn fold(&self) -> String {
        let lines = self
            .text
            .split("\r\n")
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();

        let mut output = String::new();
        for (i, line) in lines.iter().enumerate() {
            let separator = if i + 1 == lines.len() { ' ' } else { '-' };
            output.push_str(&format!("{}{}{}\r\n", self.code, separator, line));
        }
        if output.is_empty() {
            output = format!("{}\r\n", self.code);
        }
        output
    }
}
