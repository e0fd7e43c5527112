//! ADDRESS dispatch: the contract between the executor and host targets.
//!
//! A target is a named [`AddressHandler`] held by the [`AddressRegistry`].
//! Command clauses become [`AddressRequest::Command`]; calls to routines the
//! script cannot resolve while a non-default target is active become
//! [`AddressRequest::Method`]. Handlers answer with a [`HandlerReply`], which
//! the executor turns into `RC` and `RESULT` via [`DispatchOutcome`].

use std::any::Any;
use std::collections::HashMap;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::process::{Command, Stdio};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::checkpoint::{CancelFlag, ProgressObserver};
use crate::config::Config;
use crate::value::{ObjectMap, Value};

/// RC reported when the named target has no registered handler.
pub const RC_UNKNOWN_TARGET: i64 = -3;

#[derive(Debug, Clone, PartialEq)]
pub enum AddressRequest {
    /// Free-form command text with its shared tokenization.
    Command { text: String, tokens: CommandTokens },
    /// Method-style call: `name(args)` forwarded to the active target.
    Method { name: String, args: Vec<Value> },
}

impl AddressRequest {
    pub fn command(text: impl Into<String>) -> Self {
        let text = text.into();
        let tokens = CommandTokens::parse(&text);
        Self::Command { text, tokens }
    }

    pub fn method(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Method {
            name: name.into(),
            args,
        }
    }

    /// The verb for logging: first command word or the method name.
    pub fn operation(&self) -> &str {
        match self {
            Self::Command { tokens, .. } => tokens.verb().unwrap_or(""),
            Self::Method { name, .. } => name,
        }
    }
}

/// Whitespace-split command words plus `key=value` pairs.
///
/// Quotes group text containing blanks and are removed; a quoted `=` never
/// splits a pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTokens {
    pub words: Vec<String>,
    pub params: IndexMap<String, String>,
}

impl CommandTokens {
    pub fn parse(text: &str) -> Self {
        let mut tokens = Self::default();
        let mut chars = text.chars().peekable();
        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }
            let mut token = String::new();
            let mut split_at = None;
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                match c {
                    '"' | '\'' => {
                        for inner in chars.by_ref() {
                            if inner == c {
                                break;
                            }
                            token.push(inner);
                        }
                    }
                    '=' if split_at.is_none() => {
                        split_at = Some(token.len());
                        token.push(c);
                    }
                    _ => token.push(c),
                }
            }
            match split_at {
                Some(at) if at > 0 => {
                    let value = token.split_off(at + 1);
                    token.pop();
                    tokens.params.insert(token, value);
                }
                _ => tokens.words.push(token),
            }
        }
        tokens
    }

    pub fn verb(&self) -> Option<&str> {
        self.words.first().map(String::as_str)
    }

    /// Parameter lookup, ignoring key case.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// What a handler may see of the dispatching instance.
pub struct DispatchContext<'a> {
    /// Upper-cased target name the request was sent to.
    pub target: &'a str,
    pub config: &'a Config,
    pub cancel: &'a CancelFlag,
    pub progress: Option<&'a Arc<dyn ProgressObserver>>,
}

/// A handler's answer. Extra `fields` surface as `RESULT.<field>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerReply {
    pub success: bool,
    pub rc: Option<i64>,
    pub operation: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub fields: ObjectMap,
}

impl HandlerReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_rc(mut self, rc: i64) -> Self {
        self.rc = Some(rc);
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("unsupported method '{0}'")]
    UnsupportedMethod(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown ADDRESS target '{0}'")]
    UnknownTarget(String),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("ADDRESS handler panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    /// Negative codes are failures (the command could not run at all),
    /// positive ones are errors reported by a handler that did run.
    pub fn rc(&self) -> i64 {
        match self {
            Self::UnknownTarget(_) | Self::Handler(HandlerError::UnsupportedMethod(_)) => {
                RC_UNKNOWN_TARGET
            }
            Self::Handler(HandlerError::Io(_)) | Self::Panicked(_) => -1,
            Self::Handler(HandlerError::Failed(_)) => 1,
        }
    }
}

pub trait AddressHandler: Send {
    fn handle(
        &mut self,
        request: &AddressRequest,
        ctx: &DispatchContext<'_>,
    ) -> Result<HandlerReply, HandlerError>;
}

/// Result of one dispatch as seen by the script.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub success: bool,
    pub rc: i64,
    /// Always an object: `success`, `rc`, any of `operation`, `output`,
    /// `error`, then the handler's extra fields.
    pub result: Value,
}

impl DispatchOutcome {
    pub fn from_reply(reply: HandlerReply) -> Self {
        let rc = reply.rc.unwrap_or(i64::from(!reply.success));
        let mut result = ObjectMap::new();
        result.insert("success".into(), Value::Boolean(reply.success));
        result.insert("rc".into(), Value::from(rc));
        let optional = [
            ("operation", reply.operation),
            ("output", reply.output),
            ("error", reply.error),
        ];
        for (key, text) in optional {
            if let Some(text) = text {
                result.insert(key.into(), Value::String(text));
            }
        }
        result.extend(reply.fields);
        Self {
            success: reply.success,
            rc,
            result: Value::Object(result),
        }
    }

    pub fn from_error(err: &DispatchError) -> Self {
        Self::from_reply(HandlerReply::failed(err.to_string()).with_rc(err.rc()))
    }
}

/// Named handlers, matched case-insensitively.
#[derive(Default)]
pub struct AddressRegistry {
    handlers: HashMap<String, Box<dyn AddressHandler>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, handler: Box<dyn AddressHandler>) {
        let key = name.to_uppercase();
        if self.handlers.insert(key.clone(), handler).is_some() {
            tracing::debug!(address = %key, "replaced ADDRESS handler");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_uppercase())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn dispatch(
        &mut self,
        request: &AddressRequest,
        ctx: &DispatchContext<'_>,
    ) -> Result<HandlerReply, DispatchError> {
        let handler = self
            .handlers
            .get_mut(ctx.target)
            .ok_or_else(|| DispatchError::UnknownTarget(ctx.target.to_string()))?;
        let reply = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request, ctx)))
            .map_err(|payload| DispatchError::Panicked(panic_message(payload.as_ref())))??;
        tracing::debug!(
            address = %ctx.target,
            operation = request.operation(),
            success = reply.success,
            rc = ?reply.rc,
            "dispatched"
        );
        Ok(reply)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Replace `{name}` placeholders using `resolve`. Braces around anything
/// that is not a symbol, or around a name `resolve` does not know, are left
/// as written.
pub fn substitute_placeholders(text: &str, mut resolve: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after
            .find('}')
            .map(|close| &after[..close])
            .filter(|name| is_placeholder_name(name))
            .and_then(|name| resolve(name).map(|value| (value, name.len())));
        match replacement {
            Some((value, len)) => {
                out.push_str(&value);
                rest = &after[len + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '_' | '!' | '?'))
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '!' | '?'))
}

/// Host closure as a handler.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: FnMut(&AddressRequest, &DispatchContext<'_>) -> Result<HandlerReply, HandlerError> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> AddressHandler for FnHandler<F>
where
    F: FnMut(&AddressRequest, &DispatchContext<'_>) -> Result<HandlerReply, HandlerError> + Send,
{
    fn handle(
        &mut self,
        request: &AddressRequest,
        ctx: &DispatchContext<'_>,
    ) -> Result<HandlerReply, HandlerError> {
        (self.0)(request, ctx)
    }
}

/// `SYSTEM`: runs commands through `sh -c`. RC is the exit status and
/// stdout lands in `RESULT.output`.
#[derive(Debug, Default)]
pub struct SystemHandler {
    passthrough: bool,
}

impl SystemHandler {
    /// With `passthrough`, captured stdout is also copied to our stdout.
    pub fn new(passthrough: bool) -> Self {
        Self { passthrough }
    }
}

impl AddressHandler for SystemHandler {
    fn handle(
        &mut self,
        request: &AddressRequest,
        _ctx: &DispatchContext<'_>,
    ) -> Result<HandlerReply, HandlerError> {
        let AddressRequest::Command { text, tokens } = request else {
            return Err(HandlerError::UnsupportedMethod(request.operation().to_string()));
        };
        let output = Command::new("sh")
            .arg("-c")
            .arg(text)
            .stdin(Stdio::inherit())
            .stderr(Stdio::inherit())
            .output()?;
        if self.passthrough {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&output.stdout)?;
            stdout.flush()?;
        }
        let code = output.status.code().map_or(-1, i64::from);
        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        if captured.ends_with('\n') {
            captured.pop();
        }
        let mut reply = if output.status.success() {
            HandlerReply::ok()
        } else {
            HandlerReply::failed(format!("command exited with status {code}"))
        };
        if let Some(verb) = tokens.verb() {
            reply = reply.with_operation(verb);
        }
        Ok(reply.with_rc(code).with_output(captured))
    }
}

/// `ECHO`: answers every request with its own tokenization.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl AddressHandler for EchoHandler {
    fn handle(
        &mut self,
        request: &AddressRequest,
        _ctx: &DispatchContext<'_>,
    ) -> Result<HandlerReply, HandlerError> {
        let reply = HandlerReply::ok()
            .with_rc(0)
            .with_operation(request.operation());
        Ok(match request {
            AddressRequest::Command { text, tokens } => {
                let words: Vec<Value> = tokens.words.iter().map(|w| Value::from(w.as_str())).collect();
                let params: ObjectMap = tokens
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect();
                reply
                    .with_output(text.as_str())
                    .with_field("words", words)
                    .with_field("params", params)
            }
            AddressRequest::Method { args, .. } => reply.with_field("args", args.clone()),
        })
    }
}
