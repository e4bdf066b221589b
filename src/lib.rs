#![deny(unsafe_code)]

//! lrpc - lightweight RPC over any bidirectional byte stream.
//!
//! Clients invoke named methods on server-registered receivers; the server
//! answers each call with a single value, an error, or a server-pushed
//! stream of values (a "channel"). The wire layer is codec-agnostic:
//! MessagePack (the default), newline-delimited JSON and bincode all run
//! the same session protocol, over any `AsyncRead + AsyncWrite` transport
//! (TCP, Unix sockets, in-memory pipes, WebSocket).
//!
//! # Quick tour
//!
//! ```ignore
//! // Server
//! let server = Arc::new(Server::new());
//! server.register(
//!     Receiver::new("Arith").method("Add", |_ctx, [a, b]: [i64; 2]| async move {
//!         Ok::<_, BoxError>(a + b)
//!     }),
//! );
//! tokio::spawn({
//!     let server = server.clone();
//!     async move { server.serve(listener, CodecKind::Msgpack).await }
//! });
//!
//! // Client
//! let client = Client::new(TcpStream::connect(addr).await?, CodecKind::Msgpack);
//! let sum: i64 = client.call("Arith", "Add", &[2i64, 2]).await?;
//! ```
//!
//! Handlers can promote their call into a channel with
//! [`Context::make_channel`]; clients consume it with
//! [`Client::call_channel`]. Every server also exposes a built-in `lrpc`
//! receiver with `ChannelDone`, `Introspect` and `IntrospectAll`.

mod cancel;
pub mod client;
pub mod codec;
pub mod error;
pub mod server;
pub mod wire;
pub mod ws;

pub use client::{ChannelStream, Client};
pub use codec::{Codec, CodecError, CodecKind};
pub use error::{BoxError, Cancelled, ClientError, PushError, ServerError};
pub use server::{ChannelSender, Context, MethodDesc, Receiver, Server};
