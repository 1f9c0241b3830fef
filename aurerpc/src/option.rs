use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::codec::CodecKind;

/// Sentinel identifying an AureRPC connection in the handshake.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection handshake record.
///
/// A `ConnOption` is the first thing written on every RPC connection, always
/// JSON-encoded regardless of the negotiated body codec. The server echoes
/// the accepted record back before any codec traffic. `connect_timeout`
/// bounds dial plus handshake on the client, `handle_timeout` bounds a single
/// request's dispatch on the server; zero means unlimited for both.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ConnOption {
    #[serde_inline_default(MAGIC_NUMBER)]
    pub magic: u32,
    #[serde_inline_default(CodecKind::Binary.name().to_string())]
    pub codec: String,
    #[serde_inline_default(DEFAULT_CONNECT_TIMEOUT)]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde_inline_default(Duration::ZERO)]
    #[serde(with = "humantime_serde")]
    pub handle_timeout: Duration,
}

impl Default for ConnOption {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl ConnOption {
    /// Returns a copy ready to send in a handshake: the magic number is
    /// forced to [`MAGIC_NUMBER`] and an empty codec name is replaced with
    /// the default. The original value is left untouched.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut opt = self.clone();
        opt.magic = MAGIC_NUMBER;
        if opt.codec.is_empty() {
            opt.codec = CodecKind::Binary.name().to_string();
        }
        opt
    }
}
