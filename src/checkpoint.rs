//! Progress reporting between a director and the workers it runs.
//!
//! A script calls `CHECKPOINT(tag, params)`. The instance hands the event to
//! its [`ProgressObserver`] and returns the acknowledgement to the script;
//! `CANCEL` also trips the instance's [`CancelFlag`], which the executor
//! checks before every clause. The `WORKER` ADDRESS target runs a script in
//! a nested instance whose observer is the director's, so worker checkpoints
//! reach the director's host.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::address::{AddressHandler, AddressRequest, DispatchContext, HandlerError, HandlerReply};
use crate::error::RexxError;
use crate::interpreter::Interpreter;
use crate::value::Value;

/// Cooperative cancellation shared between a host and a running instance.
///
/// A child flag also reads as cancelled once any of its ancestors is.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelFlag>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_cancelled())
    }

    /// Clear this flag. A cancelled ancestor still shows through.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }
}

/// One `CHECKPOINT(tag, params)` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub tag: String,
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ack {
    #[default]
    Continue,
    Cancel,
}

impl Ack {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait ProgressObserver: Send + Sync {
    fn checkpoint(&self, checkpoint: &Checkpoint) -> Ack;
}

impl<F> ProgressObserver for F
where
    F: Fn(&Checkpoint) -> Ack + Send + Sync,
{
    fn checkpoint(&self, checkpoint: &Checkpoint) -> Ack {
        self(checkpoint)
    }
}

/// `WORKER`: runs the request as a script in a nested instance.
///
/// The command form sends the script text itself (usually a HEREDOC). The
/// method form `RUN(script [, context])` also seeds the worker with the
/// entries of the `context` object. The reply carries `rc`, the worker's
/// SAY lines as `output`, and `cancelled`.
#[derive(Debug, Default)]
pub struct WorkerHandler;

impl AddressHandler for WorkerHandler {
    fn handle(
        &mut self,
        request: &AddressRequest,
        ctx: &DispatchContext<'_>,
    ) -> Result<HandlerReply, HandlerError> {
        let (script, context) = match request {
            AddressRequest::Command { text, .. } => (text.clone(), None),
            AddressRequest::Method { name, args } if name.eq_ignore_ascii_case("RUN") => {
                let script = args
                    .first()
                    .map(Value::to_text)
                    .ok_or_else(|| HandlerError::Failed("RUN expects a script".into()))?;
                (script, args.get(1))
            }
            AddressRequest::Method { name, .. } => {
                return Err(HandlerError::UnsupportedMethod(name.clone()));
            }
        };

        let mut config = ctx.config.clone();
        config.capture_output = true;
        let mut worker = Interpreter::new(config).with_cancel_flag(ctx.cancel.child());
        if let Some(observer) = ctx.progress {
            worker.set_progress_observer(Arc::clone(observer));
        }
        match context {
            Some(Value::Object(entries)) => {
                for (key, value) in entries {
                    worker.set_var(key, value.clone());
                }
            }
            Some(other) if !other.is_null() => {
                return Err(HandlerError::Failed(format!(
                    "RUN context must be an object, got '{other}'"
                )));
            }
            _ => {}
        }

        tracing::debug!(address = %ctx.target, lines = script.lines().count(), "starting worker");
        let reply = match worker.run_source(&script) {
            Ok(outcome) => {
                let rc = i64::from(outcome.exit_status);
                let mut reply = HandlerReply::ok()
                    .with_rc(rc)
                    .with_output(outcome.output.join("\n"))
                    .with_field("cancelled", false);
                if let Some(result) = outcome.result {
                    reply = reply.with_field("result", result);
                }
                reply
            }
            Err(diag) => {
                let cancelled = diag.error == RexxError::Halt;
                HandlerReply::failed(diag.to_string())
                    .with_rc(i64::from(diag.error.number()))
                    .with_output(worker.take_output().join("\n"))
                    .with_field("cancelled", cancelled)
            }
        };
        tracing::info!(address = %ctx.target, rc = ?reply.rc, success = reply.success, "worker finished");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex;

    fn run_worker(
        request: &AddressRequest,
        progress: Option<&Arc<dyn ProgressObserver>>,
    ) -> HandlerReply {
        let config = Config::default();
        let cancel = CancelFlag::new();
        let ctx = DispatchContext {
            target: "WORKER",
            config: &config,
            cancel: &cancel,
            progress,
        };
        WorkerHandler.handle(request, &ctx).unwrap()
    }

    #[test]
    fn child_flag_sees_parent_cancel() {
        let parent = CancelFlag::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        child.reset();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancel_reaches_every_descendant() {
        let director = CancelFlag::new();
        let worker = director.child();
        let nested = worker.child();
        director.cancel();
        assert!(worker.is_cancelled());
        assert!(nested.is_cancelled());
        director.reset();
        worker.cancel();
        assert!(nested.is_cancelled());
        assert!(!director.is_cancelled());
    }

    #[test]
    fn worker_output_and_exit_status() {
        let reply = run_worker(&AddressRequest::command("say 'hi'\nsay 1 + 1\nexit 3"), None);
        assert!(reply.success);
        assert_eq!(reply.rc, Some(3));
        assert_eq!(reply.output.as_deref(), Some("hi\n2"));
        assert_eq!(reply.fields["cancelled"], Value::Boolean(false));
    }

    #[test]
    fn method_form_seeds_context() {
        let mut context = crate::value::ObjectMap::new();
        context.insert("NAME".into(), Value::from("web"));
        let request = AddressRequest::method(
            "RUN",
            vec![Value::from("say 'deploy' name"), Value::Object(context)],
        );
        let reply = run_worker(&request, None);
        assert_eq!(reply.output.as_deref(), Some("deploy web"));
    }

    #[test]
    fn checkpoints_reach_the_director() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let observer: Arc<dyn ProgressObserver> = Arc::new(move |cp: &Checkpoint| {
            log.lock().unwrap().push(cp.tag.clone());
            Ack::Continue
        });
        let script = "a = CHECKPOINT('start')\nsay a\ncall CHECKPOINT 'done', {pct: 100}";
        let reply = run_worker(&AddressRequest::command(script), Some(&observer));
        assert_eq!(reply.output.as_deref(), Some("CONTINUE"));
        assert_eq!(*seen.lock().unwrap(), ["start", "done"]);
    }

    #[test]
    fn cancel_ack_stops_the_worker() {
        let observer: Arc<dyn ProgressObserver> = Arc::new(|_: &Checkpoint| Ack::Cancel);
        let script = "say CHECKPOINT('step')\nsay 'unreachable'";
        let reply = run_worker(&AddressRequest::command(script), Some(&observer));
        assert!(!reply.success);
        assert_eq!(reply.rc, Some(4));
        assert_eq!(reply.output.as_deref(), Some("CANCEL"));
        assert_eq!(reply.fields["cancelled"], Value::Boolean(true));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let config = Config::default();
        let cancel = CancelFlag::new();
        let ctx = DispatchContext {
            target: "WORKER",
            config: &config,
            cancel: &cancel,
            progress: None,
        };
        let err = WorkerHandler
            .handle(&AddressRequest::method("STOP", vec![]), &ctx)
            .unwrap_err();
        assert!(matches!(err, HandlerError::UnsupportedMethod(_)));
    }
}
