//! Per-call server context.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::codec::{Codec, CodecKind};
use crate::error::{Cancelled, PushError};

/// Capacity of the in-memory push queue behind a promoted channel.
pub(crate) const CHANNEL_CAPACITY: usize = 5;

/// Per-call state handed to every method handler.
///
/// A `Context` is created when its request is decoded and lives until the
/// response is sent - or, when the call promotes itself into a channel via
/// [`make_channel`](Context::make_channel), until the channel is torn down
/// by the handler, the client, or session teardown.
///
/// The context is a cheap clonable handle; handlers that spawn producer
/// tasks clone it into them.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

struct Shared {
    codec: Codec,
    token: CancelToken,
    promoted: Mutex<Option<PendingChannel>>,
}

pub(crate) struct PendingChannel {
    pub(crate) id: String,
    pub(crate) rx: mpsc::Receiver<Vec<u8>>,
}

impl Context {
    pub(crate) fn new(codec: Codec, token: CancelToken) -> Self {
        Context {
            shared: Arc::new(Shared {
                codec,
                token,
                promoted: Mutex::new(None),
            }),
        }
    }

    /// Promote this call into a channel.
    ///
    /// Allocates a fresh channel ID and a bounded push queue, and returns a
    /// send handle. The handler is expected to spawn its own producer task
    /// that pushes into the handle; dropping every clone of the handle
    /// closes the channel, which makes the forwarder emit the terminal
    /// `ChannelDone` to the client.
    ///
    /// Whatever the handler returns is overwritten on the wire by the
    /// channel response.
    pub fn make_channel(&self) -> ChannelSender {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        *self.shared.promoted.lock().unwrap() = Some(PendingChannel { id, rx });
        ChannelSender {
            kind: self.shared.codec.kind(),
            tx,
        }
    }

    /// Take the promotion produced by [`make_channel`](Self::make_channel),
    /// if any. Called by the session loop after the handler returns.
    pub(crate) fn take_channel(&self) -> Option<PendingChannel> {
        self.shared.promoted.lock().unwrap().take()
    }

    /// The codec of the session this call arrived on, for handlers that
    /// need to marshal payloads or write custom frames.
    pub fn codec(&self) -> &Codec {
        &self.shared.codec
    }

    /// Resolves when this call is cancelled: the client sent
    /// `lrpc.ChannelDone`, the channel forwarder finished, or the session
    /// or server shut down.
    pub async fn done(&self) {
        self.shared.token.cancelled().await
    }

    /// Cancel this call.
    pub fn cancel(&self) {
        self.shared.token.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// [`Cancelled`] once the context is cancelled, `None` before.
    pub fn err(&self) -> Option<Cancelled> {
        self.is_cancelled().then_some(Cancelled)
    }

    /// Always `None`; call contexts carry no deadline.
    pub fn deadline(&self) -> Option<Instant> {
        None
    }

    /// Always `None`; call contexts carry no values.
    pub fn value<T: Any>(&self) -> Option<&T> {
        None
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Send handle for a promoted channel.
///
/// Elements are marshaled in the session codec at push time and forwarded
/// to the client in push order. The queue is bounded; `send` applies
/// backpressure when the forwarder falls behind.
#[derive(Clone)]
pub struct ChannelSender {
    kind: CodecKind,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelSender {
    /// Push one element to the client.
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), PushError> {
        let bytes = self.kind.marshal(value)?;
        self.tx.send(bytes).await.map_err(|_| PushError::Closed)
    }

    /// Whether the forwarding side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> Context {
        let codec = Codec::new(CodecKind::Msgpack, Box::new(tokio::io::sink()));
        Context::new(codec, CancelToken::new())
    }

    #[tokio::test]
    async fn make_channel_promotes_and_pushes_marshaled_elements() {
        let ctx = test_context();
        let push = ctx.make_channel();

        push.send(&41u32).await.unwrap();
        let mut pending = ctx.take_channel().expect("expected promotion");
        assert_eq!(pending.id.len(), 36); // uuid v4 text form

        let bytes = pending.rx.recv().await.unwrap();
        let got: u32 = CodecKind::Msgpack.unmarshal(&bytes).unwrap();
        assert_eq!(got, 41);

        drop(push);
        assert!(pending.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn take_channel_is_none_without_promotion() {
        let ctx = test_context();
        assert!(ctx.take_channel().is_none());
    }

    #[tokio::test]
    async fn cancel_resolves_done_and_err() {
        let ctx = test_context();
        assert!(ctx.err().is_none());
        ctx.cancel();
        ctx.done().await;
        assert_eq!(ctx.err(), Some(Cancelled));
        assert!(ctx.deadline().is_none());
        assert!(ctx.value::<u32>().is_none());
    }

    #[tokio::test]
    async fn push_after_teardown_reports_closed() {
        let ctx = test_context();
        let push = ctx.make_channel();
        drop(ctx.take_channel());
        match push.send(&1u8).await {
            Err(PushError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
