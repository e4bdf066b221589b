//! Error types.

pub use crate::codec::CodecError;

/// Error type returned by registered method handlers.
///
/// Anything that converts into a boxed error works, including plain
/// strings; the text is what travels back to the caller in an error
/// response.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Dispatch errors, surfaced to callers as error responses.
///
/// Malformed method shapes cannot be represented here: the typed
/// registration builder rules them out at compile time.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no such receiver registered")]
    NoSuchReceiver,
    #[error("no such method was found")]
    NoSuchMethod,
    #[error("argument provided but the method does not accept any arguments")]
    UnexpectedArgument,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors returned from [`Client::call`](crate::Client::call) and
/// [`Client::call_channel`](crate::Client::call_channel).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with an error response; this is its text.
    #[error("server: {0}")]
    Server(String),
    /// The call was promoted to a channel on the server, but a single
    /// value was requested. Use `call_channel` for this method.
    #[error("call returned a channel, not a single value")]
    ReturnIsChannel,
    /// The call produced a single value, but a channel was requested.
    /// Use `call` for this method.
    #[error("call returned a single value, not a channel")]
    ReturnNotChannel,
    /// The return payload does not decode as the requested type.
    #[error("mismatched return type: {0}")]
    MismatchedType(String),
    /// Failure encoding the request or its argument.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The session ended before the response arrived.
    #[error("session closed")]
    SessionClosed,
    /// The peer violated the response protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

/// Error from pushing into a promoted channel.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The element failed to marshal in the session codec.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The channel was torn down; nobody is forwarding pushes anymore.
    #[error("channel closed")]
    Closed,
}

/// The cancellation error reported by [`Context::err`](crate::Context::err).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("context canceled")]
pub struct Cancelled;
