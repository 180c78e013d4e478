//! Close status codes (RFC 6455, Section 7.4).
use std::fmt;

/// Status code carried in the first two bytes of a close frame.
///
/// Named variants cover the codes registered by RFC 6455. Codes in `3000..=4999` are
/// [`CloseCode::UserDefined`], everything else is [`CloseCode::Reserved`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000, the purpose of the connection has been fulfilled.
    Normal,
    /// 1001, the endpoint is going away.
    Away,
    /// 1002, the peer violated the protocol.
    Protocol,
    /// 1003, the endpoint received a data type it cannot accept.
    Unsupported,
    /// 1005, no status code was present. Never sent on the wire.
    NoStatus,
    /// 1006, the connection was dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007, a message contained data inconsistent with its type, e.g. invalid UTF-8.
    Invalid,
    /// 1008, a message violated the endpoint's policy.
    Policy,
    /// 1009, a message was too big to process.
    Size,
    /// 1010, the client expected an extension the server did not negotiate.
    Extension,
    /// 1011, the server hit an unexpected condition.
    Error,
    /// 1015, TLS handshake failure. Never sent on the wire.
    Tls,
    /// Application-defined codes, `3000..=4999`.
    UserDefined(u16),
    /// Any other value. Not legal on the wire.
    Reserved(u16),
}

impl CloseCode {
    /// Returns the numeric value of the code.
    pub fn code(self) -> u16 {
        self.into()
    }

    /// Whether the code may appear in a close frame received from a peer:
    /// 1000-1003, 1007-1011 and 3000-4999.
    pub fn is_allowed(self) -> bool {
        matches!(
            self,
            Self::Normal
                | Self::Away
                | Self::Protocol
                | Self::Unsupported
                | Self::Invalid
                | Self::Policy
                | Self::Size
                | Self::Extension
                | Self::Error
                | Self::UserDefined(_)
        )
    }

    /// Whether the application may pick this code when closing a connection.
    ///
    /// This is the same set as [`CloseCode::is_allowed`]: 1005, 1006 and 1015 only exist to
    /// report what happened locally.
    pub fn is_sendable(self) -> bool {
        self.is_allowed()
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1015 => Self::Tls,
            3000..=4999 => Self::UserDefined(code),
            _ => Self::Reserved(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Tls => 1015,
            CloseCode::UserDefined(code) | CloseCode::Reserved(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}
