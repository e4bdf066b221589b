//! RPC server: receiver registry, session loops and channel forwarding.
//!
//! One session loop runs per connection. It decodes [`Request`] frames and
//! spawns a task per call, so handlers on the same session run
//! concurrently. Responses from the session loop, call tasks and channel
//! forwarders are serialized onto the shared encoder by the session write
//! mutex inside [`Codec`].

mod context;
mod receiver;

pub use context::{ChannelSender, Context};
pub use receiver::{MethodDesc, Receiver};

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::codec::{BoxRead, BoxWrite, Codec, CodecKind, Decoder};
use crate::error::{BoxError, ServerError};
use crate::wire::{Request, Response};
use crate::ws::WsStream;

/// An RPC server.
///
/// Holds the receiver registry and the map of active channel contexts.
/// Sessions are served with [`serve`](Server::serve) (TCP),
/// [`serve_ws`](Server::serve_ws) (WebSocket) or
/// [`serve_conn`](Server::serve_conn) (any byte stream);
/// [`close`](Server::close) cancels every session and active channel.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    receivers: RwLock<HashMap<String, Arc<Receiver>>>,
    /// Active channels: channel ID → the promoted call's context.
    channels: Mutex<HashMap<String, Context>>,
    shutdown: CancelToken,
}

impl Server {
    pub fn new() -> Self {
        let inner = Arc::new(ServerInner {
            receivers: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            shutdown: CancelToken::new(),
        });
        let server = Server { inner };
        server.register(builtin_receiver(Arc::downgrade(&server.inner)));
        server
    }

    /// Install a receiver under its name. A receiver previously registered
    /// under the same name is replaced.
    pub fn register(&self, receiver: Receiver) {
        let name = receiver.name().to_string();
        self.inner
            .receivers
            .write()
            .unwrap()
            .insert(name, Arc::new(receiver));
    }

    /// Accept connections until [`close`](Server::close) is called, serving
    /// each on its own task.
    pub async fn serve(&self, listener: TcpListener, kind: CodecKind) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tokio::spawn(session_loop(self.inner.clone(), stream, kind));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
        Ok(())
    }

    /// Serve a single pre-established bidirectional byte stream.
    pub async fn serve_conn<S>(&self, stream: S, kind: CodecKind)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        session_loop(self.inner.clone(), stream, kind).await
    }

    /// Accept WebSocket connections on `addr` until
    /// [`close`](Server::close) is called. Each connection is adapted into
    /// a byte stream carrying codec output in binary frames.
    pub async fn serve_ws(&self, addr: &str, kind: CodecKind) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_ws_listener(listener, kind).await
    }

    /// [`serve_ws`](Server::serve_ws) on an already-bound listener.
    pub async fn serve_ws_listener(&self, listener: TcpListener, kind: CodecKind) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted websocket connection");
                        let inner = self.inner.clone();
                        tokio::spawn(async move {
                            match tokio_tungstenite::accept_async(stream).await {
                                Ok(ws) => session_loop(inner, WsStream::new(ws), kind).await,
                                Err(e) => warn!("websocket handshake failed: {e}"),
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
        Ok(())
    }

    /// Cancel every active channel and shut every session down.
    pub fn close(&self) {
        let channels: Vec<Context> = {
            let map = self.inner.channels.lock().unwrap();
            map.values().cloned().collect()
        };
        for ctx in channels {
            ctx.cancel();
        }
        self.inner.shutdown.cancel();
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let receivers = self.inner.receivers.read().unwrap();
        f.debug_struct("Server")
            .field("receivers", &receivers.keys().collect::<Vec<_>>())
            .field("active_channels", &self.inner.channels.lock().unwrap().len())
            .finish()
    }
}

/// One session: read requests until the stream ends or the server shuts
/// down, dispatching each call on its own task.
async fn session_loop<S>(inner: Arc<ServerInner>, stream: S, kind: CodecKind)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let mut decoder = Decoder::new(kind, Box::new(read) as BoxRead);
    let codec = Codec::new(kind, Box::new(write) as BoxWrite);
    let session = inner.shutdown.child();

    loop {
        let request: Request = tokio::select! {
            _ = session.cancelled() => break,
            decoded = decoder.decode::<Request>() => match decoded {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    // The stream cannot be resynchronized after a decode
                    // failure; report it and tear the session down.
                    warn!("request decode failed, closing session: {e}");
                    let resp = Response::error(String::new(), format!("decode: {e}"));
                    let _ = codec.encode(&resp).await;
                    break;
                }
            },
        };

        let ctx = Context::new(codec.clone(), session.child());
        tokio::spawn(run_call(inner.clone(), codec.clone(), ctx, request));
    }

    session.cancel();
    debug!("session closed");
}

/// Execute one decoded request and send its response.
async fn run_call(inner: Arc<ServerInner>, codec: Codec, ctx: Context, request: Request) {
    let result = execute(&inner, &ctx, &request).await;

    let response = match result {
        // A handler error wins over channel promotion.
        Err(e) => Response::error(request.id, e.to_string()),
        Ok(ret) => match ctx.take_channel() {
            None => Response::normal(request.id, ret.unwrap_or_default()),
            Some(pending) => {
                let channel_id = pending.id;
                let payload = match codec.marshal(&channel_id) {
                    Ok(payload) => payload,
                    Err(e) => {
                        let resp = Response::error(request.id, e.to_string());
                        let _ = codec.encode(&resp).await;
                        return;
                    }
                };
                // Insert before responding so an immediate ChannelDone
                // from the client finds the entry.
                inner
                    .channels
                    .lock()
                    .unwrap()
                    .insert(channel_id.clone(), ctx.clone());
                let resp = Response::channel(request.id, payload);
                if codec.encode(&resp).await.is_err() {
                    inner.channels.lock().unwrap().remove(&channel_id);
                    ctx.cancel();
                    return;
                }
                tokio::spawn(forward_channel(inner, codec, ctx, channel_id, pending.rx));
                return;
            }
        },
    };

    if let Err(e) = codec.encode(&response).await {
        debug!("response write failed: {e}");
    }
}

/// Dispatch a request: receiver lookup, method lookup, argument decode,
/// handler invocation.
async fn execute(
    inner: &ServerInner,
    ctx: &Context,
    request: &Request,
) -> Result<Option<Vec<u8>>, BoxError> {
    let receiver = {
        let receivers = inner.receivers.read().unwrap();
        receivers.get(&request.receiver).cloned()
    }
    .ok_or(ServerError::NoSuchReceiver)?;

    let call = receiver.invoke(ctx.clone(), &request.method, request.arg.clone())?;
    call.await
}

/// Drain a promoted channel's push queue onto the wire, then close it out.
async fn forward_channel(
    inner: Arc<ServerInner>,
    codec: Codec,
    ctx: Context,
    channel_id: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(payload) = rx.recv().await {
        let resp = Response::normal(channel_id.clone(), payload);
        if codec.encode(&resp).await.is_err() {
            break;
        }
    }

    ctx.cancel();
    inner.channels.lock().unwrap().remove(&channel_id);
    let _ = codec.encode(&Response::channel_done(channel_id)).await;
}

/// The `lrpc` receiver registered on every server.
fn builtin_receiver(inner: Weak<ServerInner>) -> Receiver {
    let channel_done = {
        let inner = inner.clone();
        move |_ctx: Context, id: String| {
            let inner = inner.clone();
            async move {
                // Unknown IDs are a no-op so repeated ChannelDone calls
                // stay harmless.
                if let Some(inner) = inner.upgrade() {
                    let entry = inner.channels.lock().unwrap().remove(&id);
                    if let Some(ctx) = entry {
                        ctx.cancel();
                    }
                }
                Ok::<_, BoxError>(())
            }
        }
    };

    let introspect = {
        let inner = inner.clone();
        move |_ctx: Context, name: String| {
            let inner = inner.clone();
            async move {
                let inner = inner.upgrade().ok_or_else(server_gone)?;
                let receiver = {
                    let receivers = inner.receivers.read().unwrap();
                    receivers.get(&name).cloned()
                };
                let receiver = receiver.ok_or_else(|| BoxError::from(ServerError::NoSuchReceiver))?;
                Ok::<_, BoxError>(receiver.describe())
            }
        }
    };

    let introspect_all = move |_ctx: Context| {
        let inner = inner.clone();
        async move {
            let inner = inner.upgrade().ok_or_else(server_gone)?;
            let all: BTreeMap<String, Vec<MethodDesc>> = {
                let receivers = inner.receivers.read().unwrap();
                receivers
                    .iter()
                    .map(|(name, r)| (name.clone(), r.describe()))
                    .collect()
            };
            Ok::<_, BoxError>(all)
        }
    };

    Receiver::new("lrpc")
        .method("ChannelDone", channel_done)
        .method("Introspect", introspect)
        .method0("IntrospectAll", introspect_all)
}

fn server_gone() -> BoxError {
    "server has shut down".into()
}
