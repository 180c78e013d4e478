//! permessage-deflate negotiation (RFC 7692, Section 7.1).
//!
//! The server reads the client's `Sec-WebSocket-Extensions` value, picks the parameters for the
//! connection's compressor and decompressor, and builds the value sent back in the handshake
//! response. Negotiation never fails: anything it does not understand is skipped.
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::space0,
    combinator::{opt, rest},
    sequence::{pair, preceded},
    IResult, Parser,
};

pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";

const MAX_WINDOW_BITS: u8 = 15;

/// Compression settings agreed for one connection.
///
/// The deflater compresses what the server sends, the inflater decompresses what the client
/// sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionParameters {
    /// LZ77 window of the server's compressor, in `9..=15`.
    pub deflater_window_bits: u8,
    /// LZ77 window the client compresses with, in `8..=15`.
    pub inflater_window_bits: u8,
    /// The client resets its compression context after every message.
    pub client_no_context_takeover: bool,
    /// The server resets its compression context after every message.
    pub server_no_context_takeover: bool,
}

impl Default for ExtensionParameters {
    fn default() -> Self {
        Self {
            deflater_window_bits: MAX_WINDOW_BITS,
            inflater_window_bits: MAX_WINDOW_BITS,
            client_no_context_takeover: false,
            server_no_context_takeover: false,
        }
    }
}

/// Negotiates permessage-deflate from a `Sec-WebSocket-Extensions` request value.
///
/// Only the first offer is considered and it must be `permessage-deflate`. Returns the
/// parameters for the connection and the response header value, or `None` when the connection
/// runs without compression and the response carries no extension header.
///
/// ```rust
/// use wsengine::extensions::negotiate;
///
/// let (params, response) = negotiate(Some("permessage-deflate; server_max_window_bits=8")).unwrap();
/// assert_eq!(params.deflater_window_bits, 9);
/// assert_eq!(response, "permessage-deflate; server_max_window_bits=9");
/// ```
pub fn negotiate(header: Option<&str>) -> Option<(ExtensionParameters, String)> {
    let offer = header?.split(',').next()?;
    let params = match extension_name(offer) {
        Ok((params, _)) if params.is_empty() || params.starts_with(';') => params,
        _ => {
            log::debug!("no permessage-deflate offer in {offer:?}");
            return None;
        }
    };

    let mut negotiated = ExtensionParameters::default();
    let mut echoed: Vec<String> = Vec::new();

    for param in params.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Ok((_, (key, value))) = parameter(param) else {
            log::trace!("ignoring malformed extension parameter {param:?}");
            continue;
        };

        match (key, value) {
            (SERVER_MAX_WINDOW_BITS, Some(value)) => {
                if echoed.iter().any(|e| e.starts_with(SERVER_MAX_WINDOW_BITS)) {
                    continue;
                }
                let Some(bits) = window_bits(value) else {
                    log::trace!("ignoring non-numeric {SERVER_MAX_WINDOW_BITS}={value}");
                    continue;
                };
                // raw deflate streams cannot use a 256-byte window, 9 is the smallest usable
                negotiated.deflater_window_bits = match bits {
                    8 => 9,
                    9..=15 => bits as u8,
                    _ => MAX_WINDOW_BITS,
                };
                echoed.push(format!(
                    "{SERVER_MAX_WINDOW_BITS}={}",
                    negotiated.deflater_window_bits
                ));
            }
            (CLIENT_MAX_WINDOW_BITS, Some(value)) => {
                if let Some(bits @ 8..=15) = window_bits(value) {
                    negotiated.inflater_window_bits = bits as u8;
                }
            }
            (CLIENT_NO_CONTEXT_TAKEOVER, None) => {
                negotiated.client_no_context_takeover = true;
                echo_flag(&mut echoed, CLIENT_NO_CONTEXT_TAKEOVER);
            }
            (SERVER_NO_CONTEXT_TAKEOVER, None) => {
                negotiated.server_no_context_takeover = true;
                echo_flag(&mut echoed, SERVER_NO_CONTEXT_TAKEOVER);
            }
            _ => log::trace!("ignoring extension parameter {param:?}"),
        }
    }

    let mut response = String::from(PERMESSAGE_DEFLATE);
    for item in echoed {
        response.push_str("; ");
        response.push_str(&item);
    }

    log::debug!("negotiated {negotiated:?}, responding with {response:?}");
    Some((negotiated, response))
}

fn echo_flag(echoed: &mut Vec<String>, flag: &str) {
    if !echoed.iter().any(|e| e == flag) {
        echoed.push(flag.to_string());
    }
}

/// Parses a window size, accepting the quoted form allowed by RFC 7692. The range is checked
/// by the caller.
fn window_bits(value: &str) -> Option<i64> {
    value.trim().trim_matches('"').parse().ok()
}

fn extension_name(input: &str) -> IResult<&str, &str> {
    preceded(space0, tag(PERMESSAGE_DEFLATE))
        .parse(input)
        .map(|(remaining, name)| (remaining.trim_start(), name))
}

/// `key` or `key=value`, surrounding whitespace already trimmed.
fn parameter(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    pair(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        opt(preceded((space0, tag("="), space0), rest)),
    )
    .parse(input)
    .and_then(|(remaining, (key, value))| {
        // anything after a bare key is garbage, e.g. `client_no_context_takeover x`
        if remaining.is_empty() {
            Ok((remaining, (key, value.filter(|v| !v.is_empty()))))
        } else {
            Err(nom::Err::Error(nom::error::Error::new(
                remaining,
                nom::error::ErrorKind::Eof,
            )))
        }
    })
}
