//! HTTP version. Only the two HTTP/1.x wire versions are representable —
//! ALPN-level protocol selection happens above the parser, so it never needs
//! `H2`/`H3` members.

use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"HTTP/1.0" => Some(Self::Http10),
            b"HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    /// Whether a connection at this version defaults to keep-alive absent
    /// an explicit `Connection` header (RFC 9112 §9.3).
    pub fn keep_alive_by_default(&self) -> bool {
        matches!(self, Self::Http11)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
