//! Serialization codecs over byte streams.
//!
//! A codec binds one of the supported formats to a bidirectional byte
//! stream, yielding an [`Encoder`] for the write half and a [`Decoder`] for
//! the read half, plus standalone [`marshal`](CodecKind::marshal) /
//! [`unmarshal`](CodecKind::unmarshal) operations for payload bytes carried
//! inside records. All three formats are self-delimiting on the wire: JSON
//! frames end with a newline, MessagePack and bincode carry their own
//! length information.
//!
//! Both peers of a session must construct the **same** [`CodecKind`].
//!
//! The encoder is not safe for concurrent use; sessions wrap it in a mutex
//! (see [`Codec`]). Decoding is single-threaded by construction - only the
//! session reader task decodes.

use std::io;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Boxed write half of a session stream.
pub(crate) type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;
/// Boxed read half of a session stream.
pub(crate) type BoxRead = Box<dyn AsyncRead + Send + Unpin>;

/// Consumed prefixes larger than this get compacted out of the receive
/// buffer.
const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Error from encoding, decoding, marshaling or unmarshaling.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("msgpack encode: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

/// The serialization format of a session.
///
/// Chosen once per session at construction time; the same kind also
/// marshals payload bytes carried inside [`Request`](crate::wire::Request)
/// and [`Response`](crate::wire::Response) records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// MessagePack via `rmp-serde`. The recommended default.
    Msgpack,
    /// Newline-delimited JSON via `serde_json`.
    Json,
    /// Typed binary format via `bincode`.
    Bincode,
}

impl Default for CodecKind {
    fn default() -> Self {
        CodecKind::Msgpack
    }
}

impl CodecKind {
    /// Marshal a value to standalone bytes.
    pub fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            CodecKind::Msgpack => Ok(rmp_serde::to_vec_named(value)?),
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
            CodecKind::Bincode => Ok(bincode::serialize(value)?),
        }
    }

    /// Unmarshal a value from standalone bytes.
    ///
    /// Decoding is permissive the way each format allows: integers widen,
    /// maps fill structs by field name, sequences fill arrays element-wise.
    pub fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            CodecKind::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
            CodecKind::Json => Ok(serde_json::from_slice(bytes)?),
            CodecKind::Bincode => Ok(bincode::deserialize(bytes)?),
        }
    }
}

/// Writes framed records to the write half of a session stream.
pub struct Encoder<W> {
    kind: CodecKind,
    writer: W,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(kind: CodecKind, writer: W) -> Self {
        Self { kind, writer }
    }

    /// Encode a single framed record and flush it.
    pub async fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let mut frame = self.kind.marshal(value)?;
        if self.kind == CodecKind::Json {
            frame.push(b'\n');
        }
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

enum Step<T> {
    Complete(T),
    /// Not enough buffered bytes for a whole record.
    Incomplete,
}

/// Reads framed records from the read half of a session stream.
///
/// Maintains a growing receive buffer: each [`decode`](Decoder::decode)
/// call tries to parse exactly one record from the buffered bytes and reads
/// more from the stream when the record is incomplete.
pub struct Decoder<R> {
    kind: CodecKind,
    reader: R,
    buf: Vec<u8>,
    /// Start of the unconsumed region of `buf`.
    pos: usize,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(kind: CodecKind, reader: R) -> Self {
        Self {
            kind,
            reader,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Decode the next framed record.
    ///
    /// Returns `Ok(None)` on clean end of stream. End of stream in the
    /// middle of a record is an error.
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        loop {
            match self.try_decode::<T>()? {
                Step::Complete(value) => return Ok(Some(value)),
                Step::Incomplete => {}
            }

            self.compact();
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                if self.remaining().is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("eof with {} trailing bytes", self.remaining().len()),
                )
                .into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos >= RECV_BUF_COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    fn try_decode<T: DeserializeOwned>(&mut self) -> Result<Step<T>, CodecError> {
        match self.kind {
            CodecKind::Json => self.try_decode_json(),
            CodecKind::Msgpack => self.try_decode_msgpack(),
            CodecKind::Bincode => self.try_decode_bincode(),
        }
    }

    fn try_decode_json<T: DeserializeOwned>(&mut self) -> Result<Step<T>, CodecError> {
        // Skip frame separators left over from previous records.
        while matches!(self.buf.get(self.pos), Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
        let Some(rel) = self.remaining().iter().position(|b| *b == b'\n') else {
            return Ok(Step::Incomplete);
        };
        let end = self.pos + rel;
        let line = &self.buf[self.pos..end];
        let value = serde_json::from_slice(line);
        self.pos = end + 1;
        Ok(Step::Complete(value?))
    }

    fn try_decode_msgpack<T: DeserializeOwned>(&mut self) -> Result<Step<T>, CodecError> {
        if self.remaining().is_empty() {
            return Ok(Step::Incomplete);
        }
        let (result, used) = {
            let mut rd: &[u8] = &self.buf[self.pos..];
            let total = rd.len();
            let result = {
                let mut de = rmp_serde::Deserializer::new(&mut rd);
                T::deserialize(&mut de)
            };
            (result, total - rd.len())
        };
        match result {
            Ok(value) => {
                self.pos += used;
                Ok(Step::Complete(value))
            }
            Err(e) if msgpack_incomplete(&e) => Ok(Step::Incomplete),
            Err(e) => Err(e.into()),
        }
    }

    fn try_decode_bincode<T: DeserializeOwned>(&mut self) -> Result<Step<T>, CodecError> {
        if self.remaining().is_empty() {
            return Ok(Step::Incomplete);
        }
        let (result, used) = {
            let mut rd: &[u8] = &self.buf[self.pos..];
            let total = rd.len();
            let result = bincode::deserialize_from::<_, T>(&mut rd);
            (result, total - rd.len())
        };
        match result {
            Ok(value) => {
                self.pos += used;
                Ok(Step::Complete(value))
            }
            Err(e) if bincode_incomplete(&e) => Ok(Step::Incomplete),
            Err(e) => Err(e.into()),
        }
    }
}

fn msgpack_incomplete(e: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error::{InvalidDataRead, InvalidMarkerRead};
    matches!(
        e,
        InvalidMarkerRead(io) | InvalidDataRead(io)
            if io.kind() == io::ErrorKind::UnexpectedEof
    )
}

fn bincode_incomplete(e: &bincode::Error) -> bool {
    matches!(&**e, bincode::ErrorKind::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof)
}

/// The codec of a live session: the session's format plus its shared,
/// mutex-guarded encoder.
///
/// Handed to server handlers via [`Context::codec`](crate::Context::codec)
/// so they can marshal payloads or push custom frames onto the session
/// stream. All frame writes on a session go through the same mutex, which
/// is what serializes the session loop, channel forwarders and handlers
/// onto one write half.
#[derive(Clone)]
pub struct Codec {
    kind: CodecKind,
    encoder: Arc<Mutex<Encoder<BoxWrite>>>,
}

impl Codec {
    pub(crate) fn new(kind: CodecKind, writer: BoxWrite) -> Self {
        Self {
            kind,
            encoder: Arc::new(Mutex::new(Encoder::new(kind, writer))),
        }
    }

    /// The session's format.
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Marshal a value to payload bytes in the session's format.
    pub fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        self.kind.marshal(value)
    }

    /// Unmarshal payload bytes in the session's format.
    pub fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.kind.unmarshal(bytes)
    }

    /// Write one framed record onto the session stream.
    pub async fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), CodecError> {
        self.encoder.lock().await.encode(value).await
    }

    pub(crate) async fn shutdown(&self) -> io::Result<()> {
        self.encoder.lock().await.shutdown().await
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").field("kind", &self.kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::duplex;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: String,
        n: u64,
        blob: Vec<u8>,
    }

    fn sample(n: u64) -> Record {
        Record {
            id: format!("rec-{n}"),
            n,
            blob: (0..64).map(|i| (i as u8).wrapping_mul(7)).collect(),
        }
    }

    async fn roundtrip(kind: CodecKind) {
        let (left, right) = duplex(4096);
        let (read, _w) = tokio::io::split(right);
        let (_r, write) = tokio::io::split(left);
        let mut enc = Encoder::new(kind, write);
        let mut dec = Decoder::new(kind, read);

        for n in 0..3u64 {
            enc.encode(&sample(n)).await.unwrap();
        }
        for n in 0..3u64 {
            let got: Record = dec.decode().await.unwrap().expect("expected record");
            assert_eq!(got, sample(n));
        }
    }

    #[tokio::test]
    async fn roundtrip_msgpack() {
        roundtrip(CodecKind::Msgpack).await;
    }

    #[tokio::test]
    async fn roundtrip_json() {
        roundtrip(CodecKind::Json).await;
    }

    #[tokio::test]
    async fn roundtrip_bincode() {
        roundtrip(CodecKind::Bincode).await;
    }

    #[tokio::test]
    async fn decode_across_split_reads() {
        // Feed one record a few bytes at a time; the decoder must keep
        // buffering until the record is whole.
        for kind in [CodecKind::Msgpack, CodecKind::Json, CodecKind::Bincode] {
            let mut frame = kind.marshal(&sample(9)).unwrap();
            if kind == CodecKind::Json {
                frame.push(b'\n');
            }

            let (mut tx, rx) = duplex(frame.len() + 1);
            let feeder = tokio::spawn(async move {
                for piece in frame.chunks(3) {
                    tx.write_all(piece).await.unwrap();
                    tx.flush().await.unwrap();
                    tokio::task::yield_now().await;
                }
            });

            let mut dec = Decoder::new(kind, rx);
            let got: Record = dec.decode().await.unwrap().expect("expected record");
            assert_eq!(got, sample(9));
            feeder.await.unwrap();
        }
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (tx, rx) = duplex(64);
        drop(tx);
        let mut dec = Decoder::new(CodecKind::Msgpack, rx);
        let got: Option<Record> = dec.decode().await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn eof_with_partial_record_is_an_error() {
        let frame = CodecKind::Msgpack.marshal(&sample(1)).unwrap();
        let (mut tx, rx) = duplex(frame.len());
        tx.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(tx);

        let mut dec = Decoder::new(CodecKind::Msgpack, rx);
        let err = dec.decode::<Record>().await.expect_err("expected eof error");
        match err {
            CodecError::Io(io) => assert_eq!(io.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn corrupt_msgpack_is_reported() {
        let (mut tx, rx) = duplex(64);
        // 0xc1 is never a valid msgpack marker.
        tx.write_all(&[0xc1, 0x00, 0x00]).await.unwrap();
        drop(tx);

        let mut dec = Decoder::new(CodecKind::Msgpack, rx);
        assert!(dec.decode::<Record>().await.is_err());
    }

    #[test]
    fn unmarshal_widens_integers() {
        // A small positive integer decodes into a wider signed type.
        let bytes = CodecKind::Msgpack.marshal(&7u8).unwrap();
        let got: i64 = CodecKind::Msgpack.unmarshal(&bytes).unwrap();
        assert_eq!(got, 7);
    }

    #[test]
    fn unmarshal_fills_struct_from_named_fields() {
        #[derive(Serialize)]
        struct Wide {
            n: u64,
            id: String,
            blob: Vec<u8>,
            extra: bool,
        }
        let bytes = CodecKind::Json
            .marshal(&Wide {
                n: 3,
                id: "rec-3".into(),
                blob: vec![1, 2, 3],
                extra: true,
            })
            .unwrap();
        let got: Record = CodecKind::Json.unmarshal(&bytes).unwrap();
        assert_eq!(got.n, 3);
        assert_eq!(got.id, "rec-3");
        assert_eq!(got.blob, vec![1, 2, 3]);
    }
}
