//! Wire records.
//!
//! Two record shapes cross the wire: [`Request`] (client to server) and
//! [`Response`] (server to client). The response discriminator is an
//! explicit small integer so that every codec, including schema-strict
//! binary ones, sees a stable shape.

use serde::{Deserialize, Serialize};

/// A request sent to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation identifier, unique within a session (UUIDv4).
    pub id: String,
    /// Name of the registered receiver.
    pub receiver: String,
    /// Name of the method on that receiver.
    pub method: String,
    /// Codec-marshaled argument; empty when the call carries no argument.
    #[serde(with = "serde_bytes")]
    pub arg: Vec<u8>,
}

/// Discriminator for [`Response`] records, `0..=3` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ResponseType {
    /// A single-shot result, or one pushed channel element.
    Normal = 0,
    /// A failed call; the text lives in [`Response::error`].
    Error = 1,
    /// The call was promoted to a channel; [`Response::ret`] carries the
    /// codec-encoded channel ID.
    Channel = 2,
    /// A channel reached its end.
    ChannelDone = 3,
}

impl From<ResponseType> for u8 {
    fn from(t: ResponseType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for ResponseType {
    type Error = InvalidResponseType;

    fn try_from(v: u8) -> Result<Self, InvalidResponseType> {
        match v {
            0 => Ok(ResponseType::Normal),
            1 => Ok(ResponseType::Error),
            2 => Ok(ResponseType::Channel),
            3 => Ok(ResponseType::ChannelDone),
            other => Err(InvalidResponseType(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid response type {0}")]
pub struct InvalidResponseType(pub u8);

/// A response returned by the server.
///
/// For single-shot calls `id` echoes the request ID; for channel pushes and
/// [`ResponseType::ChannelDone`] it carries the channel ID instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub kind: ResponseType,
    pub id: String,
    /// Error text, present when `kind` is [`ResponseType::Error`].
    pub error: String,
    /// Codec-marshaled payload; meaning depends on `kind`.
    #[serde(with = "serde_bytes")]
    pub ret: Vec<u8>,
}

impl Response {
    pub fn normal(id: String, ret: Vec<u8>) -> Self {
        Response {
            kind: ResponseType::Normal,
            id,
            error: String::new(),
            ret,
        }
    }

    pub fn error(id: String, text: String) -> Self {
        Response {
            kind: ResponseType::Error,
            id,
            error: text,
            ret: Vec::new(),
        }
    }

    pub fn channel(id: String, channel_id: Vec<u8>) -> Self {
        Response {
            kind: ResponseType::Channel,
            id,
            error: String::new(),
            ret: channel_id,
        }
    }

    pub fn channel_done(channel_id: String) -> Self {
        Response {
            kind: ResponseType::ChannelDone,
            id: channel_id,
            error: String::new(),
            ret: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;

    #[test]
    fn response_type_is_a_plain_integer_on_the_wire() {
        let bytes = CodecKind::Json.marshal(&ResponseType::Channel).unwrap();
        assert_eq!(bytes, b"2");

        let t: ResponseType = CodecKind::Json.unmarshal(b"3").unwrap();
        assert_eq!(t, ResponseType::ChannelDone);

        assert!(CodecKind::Json.unmarshal::<ResponseType>(b"9").is_err());
    }

    #[test]
    fn response_roundtrips_in_every_codec() {
        let resp = Response::channel("call-1".into(), vec![0xaa, 0xbb]);
        for kind in [CodecKind::Msgpack, CodecKind::Json, CodecKind::Bincode] {
            let bytes = kind.marshal(&resp).unwrap();
            let got: Response = kind.unmarshal(&bytes).unwrap();
            assert_eq!(got.kind, ResponseType::Channel);
            assert_eq!(got.id, "call-1");
            assert_eq!(got.ret, vec![0xaa, 0xbb]);
        }
    }
}
