//! Receiver registry entries.
//!
//! A [`Receiver`] maps method names to erased handler closures. Handlers
//! are registered through a typed builder and stored as one of two method
//! variants - with or without an argument - so the valid call shapes are
//! enforced by the compiler rather than checked at dispatch time. The
//! argument is decoded against the handler's declared type with the
//! session codec; the return value is marshaled back, with unit returns
//! producing an empty payload on the wire.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{CodecError, CodecKind};
use crate::error::{BoxError, ServerError};
use crate::server::context::Context;

pub(crate) type MethodFuture =
    Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, BoxError>> + Send>>;

/// The two valid method shapes, with the return side folded into the
/// future's output.
enum MethodFn {
    /// `(Context) -> result`
    Nullary(Box<dyn Fn(Context) -> MethodFuture + Send + Sync>),
    /// `(Context, arg) -> result`
    Unary(Box<dyn Fn(Context, Vec<u8>) -> MethodFuture + Send + Sync>),
}

struct Method {
    call: MethodFn,
    arg: Option<&'static str>,
    ret: Option<&'static str>,
}

/// Description of one registered method, as reported by the built-in
/// `lrpc.Introspect` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDesc {
    pub name: String,
    /// Textual type names of the declared arguments after the context.
    pub args: Vec<String>,
    /// Textual type names of the declared returns.
    pub returns: Vec<String>,
}

/// A named set of methods callable by clients.
///
/// Built once, registered with [`Server::register`](crate::Server::register)
/// under its name. Handlers receive a per-call [`Context`] and return
/// `Result<R, BoxError>`; a unit `R` produces a response with no payload.
///
/// # Example
///
/// ```ignore
/// let arith = Receiver::new("Arith")
///     .method("Add", |_ctx, [a, b]: [i64; 2]| async move {
///         Ok::<_, BoxError>(a + b)
///     });
/// server.register(arith);
/// ```
pub struct Receiver {
    name: String,
    methods: BTreeMap<String, Method>,
}

impl Receiver {
    pub fn new(name: impl Into<String>) -> Self {
        Receiver {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a method taking one argument.
    ///
    /// The wire argument is decoded into `A` with the session codec;
    /// decode failure is a dispatch error reported to the caller.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    {
        let call = MethodFn::Unary(Box::new(move |ctx: Context, raw: Vec<u8>| -> MethodFuture {
            let kind = ctx.codec().kind();
            let arg: A = match kind.unmarshal(&raw) {
                Ok(arg) => arg,
                Err(e) => {
                    warn!("argument decode failed: {e}");
                    return fail(ServerError::InvalidArgument(e.to_string()));
                }
            };
            let fut = f(ctx, arg);
            Box::pin(async move {
                let value = fut.await?;
                Ok(encode_return(kind, &value)?)
            })
        }));
        self.methods.insert(
            name.into(),
            Method {
                call,
                arg: Some(std::any::type_name::<A>()),
                ret: ret_name::<R>(),
            },
        );
        self
    }

    /// Register a method taking no argument.
    ///
    /// Calls that nevertheless carry an argument fail dispatch.
    pub fn method0<R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        R: Serialize + Send + 'static,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    {
        let call = MethodFn::Nullary(Box::new(move |ctx: Context| -> MethodFuture {
            let kind = ctx.codec().kind();
            let fut = f(ctx);
            Box::pin(async move {
                let value = fut.await?;
                Ok(encode_return(kind, &value)?)
            })
        }));
        self.methods.insert(
            name.into(),
            Method {
                call,
                arg: None,
                ret: ret_name::<R>(),
            },
        );
        self
    }

    /// Look up `method` and start it, validating the argument's presence
    /// against the method's shape.
    pub(crate) fn invoke(
        &self,
        ctx: Context,
        method: &str,
        arg: Vec<u8>,
    ) -> Result<MethodFuture, ServerError> {
        let found = self.methods.get(method).ok_or(ServerError::NoSuchMethod)?;
        debug!(receiver = %self.name, method, "dispatching call");
        match &found.call {
            MethodFn::Nullary(f) => {
                if !arg.is_empty() {
                    return Err(ServerError::UnexpectedArgument);
                }
                Ok(f(ctx))
            }
            MethodFn::Unary(f) => Ok(f(ctx, arg)),
        }
    }

    pub(crate) fn describe(&self) -> Vec<MethodDesc> {
        self.methods
            .iter()
            .map(|(name, m)| MethodDesc {
                name: name.clone(),
                args: m.arg.iter().map(|t| short_type_name(t)).collect(),
                returns: m.ret.iter().map(|t| short_type_name(t)).collect(),
            })
            .collect()
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn fail(err: ServerError) -> MethodFuture {
    let result: Result<Option<Vec<u8>>, BoxError> = Err(err.into());
    Box::pin(std::future::ready(result))
}

fn encode_return<R: Serialize + 'static>(
    kind: CodecKind,
    value: &R,
) -> Result<Option<Vec<u8>>, CodecError> {
    if TypeId::of::<R>() == TypeId::of::<()>() {
        return Ok(None);
    }
    kind.marshal(value).map(Some)
}

fn ret_name<R: 'static>() -> Option<&'static str> {
    (TypeId::of::<R>() != TypeId::of::<()>()).then(std::any::type_name::<R>)
}

/// Strip module paths from a `type_name` rendering:
/// `alloc::string::String` becomes `String`, `[i64; 2]` stays as is.
fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut ident = String::new();
    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            ident.push(c);
        } else {
            push_last_segment(&mut out, &ident);
            ident.clear();
            out.push(c);
        }
    }
    push_last_segment(&mut out, &ident);
    out
}

fn push_last_segment(out: &mut String, ident: &str) {
    if let Some(last) = ident.rsplit("::").next() {
        out.push_str(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::codec::Codec;

    fn test_context() -> Context {
        let codec = Codec::new(CodecKind::Msgpack, Box::new(tokio::io::sink()));
        Context::new(codec, CancelToken::new())
    }

    fn adder() -> Receiver {
        Receiver::new("Adder")
            .method("Add", |_ctx, [a, b]: [i64; 2]| async move {
                Ok::<_, BoxError>(a + b)
            })
            .method0("Ping", |_ctx| async move { Ok::<_, BoxError>(()) })
    }

    #[tokio::test]
    async fn unary_method_decodes_runs_and_encodes() {
        let rcvr = adder();
        let arg = CodecKind::Msgpack.marshal(&[3i64, 4i64]).unwrap();
        let ret = rcvr
            .invoke(test_context(), "Add", arg)
            .unwrap()
            .await
            .unwrap()
            .expect("expected payload");
        let sum: i64 = CodecKind::Msgpack.unmarshal(&ret).unwrap();
        assert_eq!(sum, 7);
    }

    #[tokio::test]
    async fn unit_return_has_no_payload() {
        let rcvr = adder();
        let ret = rcvr
            .invoke(test_context(), "Ping", Vec::new())
            .unwrap()
            .await
            .unwrap();
        assert!(ret.is_none());
    }

    #[test]
    fn unknown_method_is_a_dispatch_error() {
        let rcvr = adder();
        let err = rcvr
            .invoke(test_context(), "Nope", Vec::new())
            .err()
            .expect("expected dispatch error");
        assert!(matches!(err, ServerError::NoSuchMethod), "{err}");
    }

    #[test]
    fn argument_on_nullary_method_is_rejected() {
        let rcvr = adder();
        let arg = CodecKind::Msgpack.marshal(&1u8).unwrap();
        let err = rcvr
            .invoke(test_context(), "Ping", arg)
            .err()
            .expect("expected dispatch error");
        assert!(matches!(err, ServerError::UnexpectedArgument), "{err}");
    }

    #[tokio::test]
    async fn bad_argument_reports_invalid_argument() {
        let rcvr = adder();
        let arg = CodecKind::Msgpack.marshal("not an array").unwrap();
        let err = rcvr
            .invoke(test_context(), "Add", arg)
            .unwrap()
            .await
            .expect_err("expected coercion failure");
        assert!(err.to_string().contains("invalid argument"));
    }

    #[test]
    fn describe_lists_methods_with_short_type_names() {
        let descs = adder().describe();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].name, "Add");
        assert_eq!(descs[0].args, vec!["[i64; 2]"]);
        assert_eq!(descs[0].returns, vec!["i64"]);
        assert_eq!(descs[1].name, "Ping");
        assert!(descs[1].args.is_empty());
        assert!(descs[1].returns.is_empty());
    }

    #[test]
    fn short_type_name_strips_paths_inside_generics() {
        assert_eq!(
            short_type_name("alloc::vec::Vec<alloc::string::String>"),
            "Vec<String>"
        );
        assert_eq!(short_type_name("[i64; 2]"), "[i64; 2]");
        assert_eq!(short_type_name("u64"), "u64");
    }
}
