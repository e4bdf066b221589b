//! RPC client: call correlation, single-shot results and channel
//! consumption.
//!
//! A [`Client`] owns one session: the shared encoder (guarded by the
//! session write mutex inside [`Codec`]) and a reader task that decodes
//! responses and routes them to pending calls by ID. Single-shot calls
//! wait on a oneshot slot; channel calls install a buffered sink that a
//! [`ChannelStream`] consumes at its own pace.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{BoxRead, BoxWrite, Codec, CodecError, CodecKind, Decoder};
use crate::error::ClientError;
use crate::wire::{Request, Response, ResponseType};

/// Buffer size of a client-side channel sink.
const SINK_CAPACITY: usize = 5;

/// A pending entry in the call-site map.
enum Pending {
    /// Single-shot slot: exactly one response is expected.
    Call(oneshot::Sender<Response>),
    /// Channel sink: pushes arrive until ChannelDone.
    Channel(ChannelSink),
}

struct ChannelSink {
    tx: mpsc::Sender<Response>,
    /// Consumer half, parked by the reader until `call_channel` picks it
    /// up.
    rx: Option<mpsc::Receiver<Response>>,
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

/// An RPC client bound to one session.
pub struct Client {
    codec: Codec,
    pending: PendingMap,
    reader: JoinHandle<()>,
}

impl Client {
    /// Create a client over a bidirectional byte stream. Both peers must
    /// use the same [`CodecKind`].
    pub fn new<S>(stream: S, kind: CodecKind) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let codec = Codec::new(kind, Box::new(write) as BoxWrite);
        let decoder = Decoder::new(kind, Box::new(read) as BoxRead);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(kind, decoder, pending.clone()));
        Client {
            codec,
            pending,
            reader,
        }
    }

    /// The session's codec format.
    pub fn kind(&self) -> CodecKind {
        self.codec.kind()
    }

    /// Call `receiver.method(arg)` and decode its single-shot result.
    ///
    /// A unit argument (`&()`) means "no argument". A method with no
    /// return value decodes into `R = ()` (or `Option<T>`, which becomes
    /// `None`).
    ///
    /// Dropping the returned future abandons the call locally: the pending
    /// entry is removed and no cancel frame is sent; the server runs the
    /// handler to completion and its response is dropped.
    pub async fn call<A, R>(&self, receiver: &str, method: &str, arg: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized + 'static,
        R: DeserializeOwned,
    {
        let resp = roundtrip(&self.codec, &self.pending, receiver, method, arg).await?;
        match resp.kind {
            ResponseType::Error => Err(ClientError::Server(resp.error)),
            ResponseType::Channel => {
                // The reader pre-installed a sink for this channel; tear
                // both sides down before reporting the mismatch.
                if let Ok(channel_id) = self.codec.unmarshal::<String>(&resp.ret) {
                    self.pending.lock().unwrap().remove(&channel_id);
                    let _ =
                        roundtrip(&self.codec, &self.pending, "lrpc", "ChannelDone", &channel_id)
                            .await;
                }
                Err(ClientError::ReturnIsChannel)
            }
            ResponseType::ChannelDone => {
                Err(ClientError::Protocol("ChannelDone for a single-shot call"))
            }
            ResponseType::Normal => decode_return(self.codec.kind(), &resp.ret),
        }
    }

    /// Call `receiver.method(arg)` expecting the server to promote the
    /// call into a channel; returns the consumer stream.
    ///
    /// The stream ends when the server finishes the channel. Dropping or
    /// [`close`](ChannelStream::close)-ing it tears the server side down
    /// via the built-in `lrpc.ChannelDone` call.
    pub async fn call_channel<A, T>(
        &self,
        receiver: &str,
        method: &str,
        arg: &A,
    ) -> Result<ChannelStream<T>, ClientError>
    where
        A: Serialize + ?Sized + 'static,
        T: DeserializeOwned,
    {
        let resp = roundtrip(&self.codec, &self.pending, receiver, method, arg).await?;
        match resp.kind {
            ResponseType::Error => Err(ClientError::Server(resp.error)),
            ResponseType::Normal => Err(ClientError::ReturnNotChannel),
            ResponseType::ChannelDone => {
                Err(ClientError::Protocol("ChannelDone for a single-shot call"))
            }
            ResponseType::Channel => {
                let channel_id: String = self
                    .codec
                    .unmarshal(&resp.ret)
                    .map_err(|e| ClientError::MismatchedType(e.to_string()))?;
                // The reader installed the sink when it routed the Channel
                // response, absorbing pushes that raced this registration;
                // pick its consumer half up.
                let parked = {
                    let mut map = self.pending.lock().unwrap();
                    match map.get_mut(&channel_id) {
                        Some(Pending::Channel(sink)) => sink.rx.take(),
                        _ => None,
                    }
                };
                let rx = match parked {
                    Some(rx) => rx,
                    None => {
                        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
                        self.pending.lock().unwrap().insert(
                            channel_id.clone(),
                            Pending::Channel(ChannelSink { tx, rx: None }),
                        );
                        rx
                    }
                };
                Ok(ChannelStream {
                    id: channel_id,
                    rx,
                    codec: self.codec.clone(),
                    pending: self.pending.clone(),
                    done: false,
                    _marker: PhantomData,
                })
            }
        }
    }

    /// Close the session: stop the reader, shut the write half down and
    /// fail outstanding calls with [`ClientError::SessionClosed`].
    pub async fn close(&self) {
        self.reader.abort();
        let _ = self.codec.shutdown().await;
        self.pending.lock().unwrap().clear();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("kind", &self.codec.kind())
            .field("pending", &self.pending.lock().unwrap().len())
            .finish()
    }
}

/// Removes a pending entry on drop, covering error paths and callers that
/// drop the call future mid-wait.
struct EntryGuard {
    pending: PendingMap,
    id: String,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.id);
    }
}

/// Issue one request and wait for the response correlated to its ID.
async fn roundtrip<A>(
    codec: &Codec,
    pending: &PendingMap,
    receiver: &str,
    method: &str,
    arg: &A,
) -> Result<Response, ClientError>
where
    A: Serialize + ?Sized + 'static,
{
    let id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    pending.lock().unwrap().insert(id.clone(), Pending::Call(tx));
    let _guard = EntryGuard {
        pending: pending.clone(),
        id: id.clone(),
    };

    let arg = marshal_arg(codec.kind(), arg)?;
    codec
        .encode(&Request {
            id,
            receiver: receiver.to_string(),
            method: method.to_string(),
            arg,
        })
        .await?;

    rx.await.map_err(|_| ClientError::SessionClosed)
}

fn marshal_arg<A>(kind: CodecKind, arg: &A) -> Result<Vec<u8>, CodecError>
where
    A: Serialize + ?Sized + 'static,
{
    // A unit argument travels as an absent (empty) payload so that
    // methods declared without arguments accept it.
    if TypeId::of::<A>() == TypeId::of::<()>() {
        return Ok(Vec::new());
    }
    kind.marshal(arg)
}

fn decode_return<R: DeserializeOwned>(kind: CodecKind, ret: &[u8]) -> Result<R, ClientError> {
    if ret.is_empty() {
        // Success with no payload; R must accept a unit.
        use serde::de::value::{Error as ValueError, UnitDeserializer};
        return R::deserialize(UnitDeserializer::<ValueError>::new())
            .map_err(|_| ClientError::MismatchedType("call returned no payload".to_string()));
    }
    kind.unmarshal(ret)
        .map_err(|e| ClientError::MismatchedType(e.to_string()))
}

/// Decode responses and route them to pending entries until the session
/// ends.
async fn read_loop(kind: CodecKind, mut decoder: Decoder<BoxRead>, pending: PendingMap) {
    loop {
        let resp = match decoder.decode::<Response>().await {
            Ok(Some(resp)) => resp,
            Ok(None) => break,
            Err(e) => {
                warn!("response decode failed, closing session: {e}");
                break;
            }
        };

        let delivery = {
            let mut map = pending.lock().unwrap();
            match map.remove(&resp.id) {
                None => Delivery::Unmatched,
                // Terminal for the slot whatever the response type is.
                Some(Pending::Call(tx)) => {
                    // For a channel response, install the sink before
                    // waking the caller, so pushes racing the caller's
                    // registration land in the sink instead of being
                    // dropped.
                    if resp.kind == ResponseType::Channel {
                        if let Ok(channel_id) = kind.unmarshal::<String>(&resp.ret) {
                            let (sink_tx, sink_rx) = mpsc::channel(SINK_CAPACITY);
                            map.insert(
                                channel_id,
                                Pending::Channel(ChannelSink {
                                    tx: sink_tx,
                                    rx: Some(sink_rx),
                                }),
                            );
                        }
                    }
                    Delivery::Single(tx)
                }
                Some(Pending::Channel(sink)) if resp.kind == ResponseType::ChannelDone => {
                    drop(sink);
                    Delivery::Closed
                }
                Some(Pending::Channel(sink)) => {
                    let tx = sink.tx.clone();
                    map.insert(resp.id.clone(), Pending::Channel(sink));
                    Delivery::Sink(tx)
                }
            }
        };

        match delivery {
            Delivery::Single(tx) => {
                let _ = tx.send(resp);
            }
            // Delivered outside the lock so sink backpressure never blocks
            // map access.
            Delivery::Sink(tx) => {
                let _ = tx.send(resp).await;
            }
            Delivery::Closed => {}
            Delivery::Unmatched => {
                debug!(id = %resp.id, "dropping response with no pending entry");
            }
        }
    }

    // Failing the map wakes single-shot callers with SessionClosed and
    // ends every channel stream.
    pending.lock().unwrap().clear();
}

enum Delivery {
    Single(oneshot::Sender<Response>),
    Sink(mpsc::Sender<Response>),
    Closed,
    Unmatched,
}

/// Consumer side of a server-pushed channel.
///
/// Elements arrive in push order. [`recv`](ChannelStream::recv) returns
/// `None` once the server closes the channel; elements that fail to decode
/// as `T` are skipped.
pub struct ChannelStream<T> {
    id: String,
    rx: mpsc::Receiver<Response>,
    codec: Codec,
    pending: PendingMap,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ChannelStream<T> {
    /// The server-assigned channel ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive the next element, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let resp = match self.rx.recv().await {
                Some(resp) => resp,
                None => {
                    self.done = true;
                    return None;
                }
            };
            match self.codec.unmarshal::<T>(&resp.ret) {
                Ok(value) => return Some(value),
                Err(e) => warn!("skipping channel element that failed to decode: {e}"),
            }
        }
    }

    /// Stop consuming and tear the server side down via
    /// `lrpc.ChannelDone`. Waits for the server's acknowledgement.
    pub async fn close(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        // Unblock the reader if it is mid-delivery into a full sink,
        // otherwise it could never route the ChannelDone response below.
        self.rx.close();
        self.pending.lock().unwrap().remove(&self.id);
        let _ = roundtrip(&self.codec, &self.pending, "lrpc", "ChannelDone", &self.id).await;
    }
}

impl<T> Drop for ChannelStream<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.pending.lock().unwrap().remove(&self.id);
        let codec = self.codec.clone();
        let pending = self.pending.clone();
        let id = std::mem::take(&mut self.id);
        // Best effort: tell the server to stop pushing. Safe to repeat,
        // ChannelDone on an unknown ID is a no-op.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = roundtrip(&codec, &pending, "lrpc", "ChannelDone", &id).await;
            });
        }
    }
}

impl<T> std::fmt::Debug for ChannelStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_argument_marshals_to_empty_bytes() {
        assert!(marshal_arg(CodecKind::Msgpack, &()).unwrap().is_empty());
        assert!(!marshal_arg(CodecKind::Msgpack, &0u8).unwrap().is_empty());
    }

    #[test]
    fn empty_return_decodes_as_unit_or_none() {
        decode_return::<()>(CodecKind::Msgpack, &[]).unwrap();
        let opt: Option<u32> = decode_return(CodecKind::Msgpack, &[]).unwrap();
        assert!(opt.is_none());
        assert!(decode_return::<u32>(CodecKind::Msgpack, &[]).is_err());
    }

    #[test]
    fn entry_guard_removes_abandoned_slots() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = oneshot::channel();
        pending
            .lock()
            .unwrap()
            .insert("abandoned".to_string(), Pending::Call(tx));
        drop(EntryGuard {
            pending: pending.clone(),
            id: "abandoned".to_string(),
        });
        assert!(pending.lock().unwrap().is_empty());
    }
}
