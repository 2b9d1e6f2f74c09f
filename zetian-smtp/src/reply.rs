use core::fmt::{self, Display, Formatter};

use zetian_common::status::Status;

/// One SMTP reply: a status code and one or more text lines.
///
/// Rendering follows RFC 5321 section 4.2: every line repeats the 3-digit
/// code, continuation lines use `-` after the code, the last line a space.
/// Each rendered line is terminated with CRLF on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    status: Status,
    lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub fn new(status: Status, text: impl Into<String>) -> Self {
        Self {
            status,
            lines: vec![text.into()],
        }
    }

    /// Multi-line reply; used by EHLO and HELP.
    ///
    /// An empty `lines` still renders one line with empty text, since a
    /// reply must carry at least the code.
    #[must_use]
    pub fn with_lines(status: Status, lines: Vec<String>) -> Self {
        Self {
            status,
            lines: if lines.is_empty() {
                vec![String::new()]
            } else {
                lines
            },
        }
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn code(&self) -> u16 {
        self.status.into()
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// 2xx/3xx replies neither abort anything nor count as client errors.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.status.is_positive()
    }

    /// Render to wire bytes, CRLF after every line.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.lines.iter().map(|l| l.len() + 6).sum());
        let last = self.lines.len() - 1;

        for (idx, line) in self.lines.iter().enumerate() {
            buffer.extend_from_slice(self.status.to_string().as_bytes());
            buffer.push(if idx == last { b' ' } else { b'-' });
            buffer.extend_from_slice(line.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        buffer
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len() - 1;
        for (idx, line) in self.lines.iter().enumerate() {
            if idx > 0 {
                fmt.write_str("\r\n")?;
            }
            write!(
                fmt,
                "{}{}{line}",
                self.status,
                if idx == last { ' ' } else { '-' }
            )?;
        }
        Ok(())
    }
}
