//! AST executor: runs a parsed [`Script`] against an [`Interpreter`].
//!
//! Control flow is an explicit [`ExecSignal`] value threaded back up through
//! the clause walkers. Every CALL pushes an [`Activation`] holding the
//! routine's script, arguments and open loops; every loop pushes a
//! [`LoopRecord`] on its activation, holding its pass count and limit, so
//! `LEAVE`/`ITERATE` can be checked against what is really open and
//! `SIGNAL` can drop them wholesale.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::address::{AddressRequest, DispatchContext, DispatchOutcome, substitute_placeholders};
use crate::ast::{
    AddressAction, AssignTarget, BinOp, Clause, ClauseKind, Condition, ControlledLoop, DoBlock,
    DoKind, Expr, NumericFormSetting, NumericSetting, ParseSource, ParseTemplate, Program,
    SignalAction, TailElement, TemplateElement, UnaryOp,
};
use crate::builtins;
use crate::checkpoint::{Ack, Checkpoint, ProgressObserver};
use crate::env::{ConditionInfoData, Environment, RC, RESULT};
use crate::error::{ErrorCategory, RexxDiagnostic, RexxError, RexxResult};
use crate::external::SearchPath;
use crate::interpreter::{Interpreter, nesting_levels};
use crate::parser::{parse, parse_tail_elements};
use crate::require::{self, LibraryCode};
use crate::value::{NumericForm, ObjectMap, Value};

/// A parsed program with its label index.
#[derive(Debug)]
pub struct Script {
    pub program: Program,
    /// Label name → clause index. The first definition of a name wins.
    pub labels: HashMap<String, usize>,
    pub path: Option<PathBuf>,
}

impl Script {
    pub fn new(program: Program, path: Option<PathBuf>) -> Self {
        let labels = label_index(&program.clauses);
        Self {
            program,
            labels,
            path,
        }
    }

    /// Directory REQUIRE searches first.
    pub fn dir(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }
}

fn label_index(clauses: &[Clause]) -> HashMap<String, usize> {
    let mut labels = HashMap::new();
    for (i, clause) in clauses.iter().enumerate() {
        if let ClauseKind::Label(name) = &clause.kind {
            labels.entry(name.clone()).or_insert(i);
        }
    }
    labels
}

/// Signal returned by clause/block execution for control flow.
#[derive(Debug)]
pub(crate) enum ExecSignal {
    Normal,
    Leave(Option<String>),
    Iterate(Option<String>),
    Exit(Option<Value>),
    Return(Option<Value>),
    /// SIGNAL transfers control to a label, abandoning all open loops.
    Signal(String),
}

/// Pending EXIT raised inside an expression (a function that ran EXIT).
enum PendingExit {
    None,
    WithValue(Option<Value>),
}

impl PendingExit {
    fn take_signal(&mut self) -> Option<ExecSignal> {
        match std::mem::replace(self, PendingExit::None) {
            PendingExit::None => Option::None,
            PendingExit::WithValue(v) => Some(ExecSignal::Exit(v)),
        }
    }

    const fn is_pending(&self) -> bool {
        matches!(self, PendingExit::WithValue(_))
    }
}

/// How a routine invocation ended, seen from the call site.
enum CallOutcome {
    Returned(Option<Value>),
    Exited(Option<Value>),
    Signalled(String),
}

/// One entry of the call stack.
struct Activation {
    routine: String,
    script: Arc<Script>,
    args: Vec<Value>,
    loops: Vec<LoopRecord>,
}

impl Activation {
    fn new(routine: &str, script: Arc<Script>, args: Vec<Value>) -> Self {
        Self {
            routine: routine.to_string(),
            script,
            args,
            loops: Vec::new(),
        }
    }
}

/// An open repetitive DO.
struct LoopRecord {
    name: Option<String>,
    /// Bodies started so far.
    passes: u64,
    /// Pass ceiling from a repetitor count or FOR.
    limit: Option<u64>,
}

impl LoopRecord {
    const fn exhausted(&self) -> bool {
        match self.limit {
            Some(limit) => self.passes >= limit,
            None => false,
        }
    }
}

/// What a loop does after one pass of its body.
enum Flow {
    Next,
    Break,
    Out(ExecSignal),
}

pub(crate) struct Evaluator<'a> {
    rt: &'a mut Interpreter,
    call_stack: Vec<Activation>,
    /// Active condition traps: condition → target label name.
    traps: HashMap<Condition, String>,
    pending_exit: PendingExit,
    /// Pending signal from a trap raised inside an expression.
    pending_signal: Option<String>,
    interpret_depth: usize,
    /// CALL plus INTERPRET levels the evaluator stack can hold.
    nesting_budget: usize,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(rt: &'a mut Interpreter) -> Self {
        let nesting_budget = nesting_levels(&rt.config);
        Self {
            rt,
            nesting_budget,
            call_stack: Vec::new(),
            traps: HashMap::new(),
            pending_exit: PendingExit::None,
            pending_signal: None,
            interpret_depth: 0,
        }
    }

    fn check_nesting(&self, what: &str) -> RexxResult<()> {
        let depth = self.call_stack.len() + self.interpret_depth;
        if depth >= self.nesting_budget {
            return Err(RexxDiagnostic::new(RexxError::ResourceExhausted)
                .with_detail(format!("{what} nested {depth} levels deep")));
        }
        Ok(())
    }

    /// Run `script` from the top as the main program. Returns the EXIT or
    /// RETURN value, if any.
    pub(crate) fn run(&mut self, script: &Arc<Script>, args: Vec<Value>) -> RexxResult<Option<Value>> {
        self.call_stack.push(Activation::new("", Arc::clone(script), args));
        let signal = self.exec_script(script, 0);
        self.call_stack.clear();
        match signal? {
            ExecSignal::Normal => Ok(None),
            ExecSignal::Exit(value) | ExecSignal::Return(value) => Ok(value),
            ExecSignal::Leave(_) | ExecSignal::Iterate(_) => {
                Err(RexxDiagnostic::new(RexxError::InvalidLeaveIterate)
                    .with_detail("LEAVE/ITERATE outside of DO loop"))
            }
            ExecSignal::Signal(label) => Err(RexxDiagnostic::new(RexxError::LabelNotFound)
                .with_detail(format!("label '{label}' not found"))),
        }
    }

    fn activation(&self) -> &Activation {
        self.call_stack.last().expect("executor has no activation")
    }

    fn activation_mut(&mut self) -> &mut Activation {
        self.call_stack.last_mut().expect("executor has no activation")
    }

    /// An EXIT or trap raised mid-expression abandons the current clause.
    fn interrupted(&self) -> bool {
        self.pending_exit.is_pending() || self.pending_signal.is_some()
    }

    fn check_cancel(&self) -> RexxResult<()> {
        if self.rt.cancel.is_cancelled() {
            return Err(RexxDiagnostic::new(RexxError::Halt).with_detail("run cancelled by host"));
        }
        Ok(())
    }

    /// Execute `script` from clause `start`, restarting at labels reached by
    /// SIGNAL. A label the script does not define is the caller's problem,
    /// unless this is the main program.
    fn exec_script(&mut self, script: &Arc<Script>, start: usize) -> RexxResult<ExecSignal> {
        let mut start = start;
        loop {
            match self.exec_clauses(&script.program.clauses[start..])? {
                ExecSignal::Signal(label) => {
                    let Some(&idx) = script.labels.get(&label) else {
                        if self.call_stack.len() > 1 {
                            return Ok(ExecSignal::Signal(label));
                        }
                        return Err(RexxDiagnostic::new(RexxError::LabelNotFound)
                            .with_detail(format!("label '{label}' not found")));
                    };
                    let activation = self.activation_mut();
                    let unwound = activation.loops.len();
                    activation.loops.clear();
                    tracing::debug!(label = %label, unwound, routine = %activation.routine, "SIGNAL");
                    start = idx + 1;
                }
                other => return Ok(other),
            }
        }
    }

    fn exec_clauses(&mut self, clauses: &[Clause]) -> RexxResult<ExecSignal> {
        for clause in clauses {
            let signal = self.exec_clause_outer(clause)?;
            if let Some(signal) = self.pending_exit.take_signal() {
                return Ok(signal);
            }
            if let Some(label) = self.pending_signal.take() {
                return Ok(ExecSignal::Signal(label));
            }
            if !matches!(signal, ExecSignal::Normal) {
                return Ok(signal);
            }
        }
        Ok(ExecSignal::Normal)
    }

    /// Clause wrapper: cancellation check, error location and SYNTAX trap.
    fn exec_clause_outer(&mut self, clause: &Clause) -> RexxResult<ExecSignal> {
        if let Err(halt) = self.check_cancel() {
            tracing::info!(line = clause.loc.line, "halted");
            return Err(halt.at(clause.loc.clone()));
        }
        match self.exec_clause(clause) {
            Ok(signal) => Ok(signal),
            Err(diag) => {
                let diag = diag.or_at(&clause.loc);
                if !matches!(diag.category(), ErrorCategory::Parse | ErrorCategory::Condition) {
                    return Err(diag);
                }
                let description = diag
                    .detail
                    .clone()
                    .unwrap_or_else(|| diag.error.message().to_string());
                let Some(label) = self.take_trap(Condition::Syntax, description) else {
                    return Err(diag);
                };
                self.rt
                    .env
                    .set(RC, Value::from(i64::from(diag.error.number())));
                Ok(ExecSignal::Signal(label))
            }
        }
    }

    /// Disarm the trap for `condition` and record condition info. Returns
    /// the label to signal, if the trap was armed.
    fn take_trap(&mut self, condition: Condition, description: String) -> Option<String> {
        let label = self.traps.remove(&condition)?;
        self.rt.env.set_condition_info(ConditionInfoData {
            condition: condition.name().to_string(),
            description,
            instruction: "SIGNAL".to_string(),
            status: "ON".to_string(),
        });
        Some(label)
    }

    fn exec_clause(&mut self, clause: &Clause) -> RexxResult<ExecSignal> {
        match &clause.kind {
            ClauseKind::Say(expr) => {
                let val = self.eval_expr(expr)?;
                if !self.interrupted() {
                    self.rt.say(val.to_text());
                }
                Ok(ExecSignal::Normal)
            }
            ClauseKind::Assignment { target, expr } => {
                let val = self.eval_expr(expr)?;
                if self.interrupted() {
                    return Ok(ExecSignal::Normal);
                }
                match target {
                    AssignTarget::Simple(name) => self.rt.env.set(name, val),
                    AssignTarget::Stem { stem, tail } => self.assign_compound(stem, tail, val),
                }
                Ok(ExecSignal::Normal)
            }
            ClauseKind::Command(expr) => {
                let val = self.eval_expr(expr)?;
                if self.interrupted() {
                    return Ok(ExecSignal::Normal);
                }
                let target = self.rt.env.address().to_string();
                self.dispatch_command(&target, &val.to_text())
            }
            ClauseKind::If {
                condition,
                then_clause,
                else_clause,
            } => self.exec_if(condition, then_clause, else_clause.as_deref()),
            ClauseKind::Do(block) => self.exec_do(block),
            ClauseKind::Select {
                when_clauses,
                otherwise,
            } => self.exec_select(when_clauses, otherwise.as_deref()),
            ClauseKind::Leave(name) => {
                self.check_loop_target("LEAVE", name.as_deref())?;
                Ok(ExecSignal::Leave(name.clone()))
            }
            ClauseKind::Iterate(name) => {
                self.check_loop_target("ITERATE", name.as_deref())?;
                Ok(ExecSignal::Iterate(name.clone()))
            }
            ClauseKind::Exit(expr) => Ok(ExecSignal::Exit(self.eval_optional(expr.as_ref())?)),
            ClauseKind::Return(expr) => Ok(ExecSignal::Return(self.eval_optional(expr.as_ref())?)),
            ClauseKind::Call { name, args } => self.exec_call(name, args),
            ClauseKind::Signal(action) => self.exec_signal(action),
            ClauseKind::Label(_) | ClauseKind::Nop => Ok(ExecSignal::Normal),
            ClauseKind::Drop(names) => {
                for name in names {
                    self.rt.env.drop(name.trim_end_matches('.'));
                }
                Ok(ExecSignal::Normal)
            }
            ClauseKind::Global(names) => {
                for name in names {
                    self.rt.env.declare_global(name.trim_end_matches('.'));
                }
                Ok(ExecSignal::Normal)
            }
            ClauseKind::Arg(template) => self.exec_parse(true, &ParseSource::Arg, template),
            ClauseKind::Parse {
                upper,
                source,
                template,
            } => self.exec_parse(*upper, source, template),
            ClauseKind::Interpret(expr) => self.exec_interpret(expr),
            ClauseKind::Address(action) => self.exec_address(action),
            ClauseKind::Numeric(setting) => self.exec_numeric(setting),
            ClauseKind::Require(expr) => self.exec_require(expr),
        }
    }

    fn eval_optional(&mut self, expr: Option<&Expr>) -> RexxResult<Option<Value>> {
        expr.map(|e| self.eval_expr(e)).transpose()
    }

    fn check_loop_target(&self, keyword: &str, name: Option<&str>) -> RexxResult<()> {
        let loops = &self.activation().loops;
        let open = match name {
            None => !loops.is_empty(),
            Some(name) => loops.iter().any(|l| l.name.as_deref() == Some(name)),
        };
        if open {
            return Ok(());
        }
        let detail = match name {
            Some(name) => format!("{keyword} {name}: no active loop with that control variable"),
            None => format!("{keyword} outside of a repetitive DO"),
        };
        Err(RexxDiagnostic::new(RexxError::InvalidLeaveIterate).with_detail(detail))
    }

    // ── ADDRESS dispatch ───────────────────────────────────────────

    fn exec_address(&mut self, action: &AddressAction) -> RexxResult<ExecSignal> {
        match action {
            AddressAction::SetEnvironment(name) => {
                if name.is_empty() {
                    self.rt.env.swap_address();
                } else {
                    self.rt.env.set_address(name);
                }
                Ok(ExecSignal::Normal)
            }
            AddressAction::Value(expr) => {
                let val = self.eval_expr(expr)?;
                if !self.interrupted() {
                    self.rt.env.set_address(val.to_text().trim());
                }
                Ok(ExecSignal::Normal)
            }
            AddressAction::Temporary {
                environment,
                command,
            } => {
                let val = self.eval_expr(command)?;
                if self.interrupted() {
                    return Ok(ExecSignal::Normal);
                }
                self.dispatch_command(environment, &val.to_text())
            }
        }
    }

    /// Send a command string to `target` after `{name}` substitution.
    fn dispatch_command(&mut self, target: &str, text: &str) -> RexxResult<ExecSignal> {
        let env = &self.rt.env;
        let text = substitute_placeholders(text, |name| placeholder_value(env, name));
        let request = AddressRequest::command(text);
        let (_, signal) = self.dispatch(target, &request)?;
        Ok(signal)
    }

    /// Run one request through the registry, write `RC`/`RESULT` and raise
    /// ERROR or FAILURE when trapped.
    fn dispatch(
        &mut self,
        target: &str,
        request: &AddressRequest,
    ) -> RexxResult<(DispatchOutcome, ExecSignal)> {
        let target = target.to_uppercase();
        let rt = &mut *self.rt;
        let ctx = DispatchContext {
            target: &target,
            config: &rt.config,
            cancel: &rt.cancel,
            progress: rt.observer.as_ref(),
        };
        let outcome = match rt.registry.dispatch(request, &ctx) {
            Ok(reply) => DispatchOutcome::from_reply(reply),
            Err(err) if rt.config.fail_fast => {
                tracing::error!(address = %target, error = %err, "dispatch failed under fail-fast");
                return Err(RexxDiagnostic::new(RexxError::SystemFailure)
                    .with_detail(format!("ADDRESS {target}: {err}")));
            }
            Err(err) => {
                tracing::warn!(address = %target, rc = err.rc(), error = %err, "dispatch failed");
                DispatchOutcome::from_error(&err)
            }
        };

        self.rt.env.set(RC, Value::from(outcome.rc));
        self.rt.env.set(RESULT, outcome.result.clone());

        let description = match request {
            AddressRequest::Command { text, .. } => text.clone(),
            AddressRequest::Method { name, .. } => name.clone(),
        };
        let condition = if outcome.rc < 0 && self.traps.contains_key(&Condition::Failure) {
            Some(Condition::Failure)
        } else if outcome.rc != 0 {
            Some(Condition::Error)
        } else {
            None
        };
        let signal = condition
            .and_then(|c| self.take_trap(c, description))
            .map_or(ExecSignal::Normal, ExecSignal::Signal);
        Ok((outcome, signal))
    }

    // ── REQUIRE ────────────────────────────────────────────────────

    fn exec_require(&mut self, expr: &Expr) -> RexxResult<ExecSignal> {
        let val = self.eval_expr(expr)?;
        if self.interrupted() {
            return Ok(ExecSignal::Normal);
        }
        let name = val.to_text().trim().to_string();
        if self.rt.is_loaded(&name) {
            tracing::debug!(library = %name, "REQUIRE already satisfied");
            return Ok(ExecSignal::Normal);
        }
        let search = SearchPath::new(self.activation().script.dir(), &self.rt.config.library_path);
        let libraries = require::load(&name, &self.rt.cache, &self.rt.natives, &search)?;
        for library in libraries {
            self.rt.install_library(library);
        }
        Ok(ExecSignal::Normal)
    }

    // ── INTERPRET ──────────────────────────────────────────────────

    fn exec_interpret(&mut self, expr: &Expr) -> RexxResult<ExecSignal> {
        let val = self.eval_expr(expr)?;
        if self.interrupted() {
            return Ok(ExecSignal::Normal);
        }
        let source = val.to_text();
        if source.trim().is_empty() {
            return Ok(ExecSignal::Normal);
        }

        let max = self.rt.config.max_interpret_depth;
        if self.interpret_depth >= max {
            return Err(RexxDiagnostic::new(RexxError::ResourceExhausted)
                .with_detail(format!("INTERPRET nested deeper than {max} levels")));
        }
        self.check_nesting("INTERPRET")?;

        let program = parse(&source)?;
        let labels = label_index(&program.clauses);

        self.interpret_depth += 1;
        tracing::trace!(depth = self.interpret_depth, "INTERPRET");
        let result = self.exec_interpreted(&program.clauses, &labels);
        self.interpret_depth -= 1;
        result
    }

    /// Run interpreted clauses, restarting locally for labels they define.
    fn exec_interpreted(
        &mut self,
        clauses: &[Clause],
        labels: &HashMap<String, usize>,
    ) -> RexxResult<ExecSignal> {
        let base = self.activation().loops.len();
        let mut start = 0;
        loop {
            match self.exec_clauses(&clauses[start..])? {
                ExecSignal::Signal(label) => match labels.get(&label) {
                    Some(&idx) => {
                        self.activation_mut().loops.truncate(base);
                        start = idx + 1;
                    }
                    None => return Ok(ExecSignal::Signal(label)),
                },
                other => return Ok(other),
            }
        }
    }

    // ── CALL and function resolution ───────────────────────────────

    fn exec_call(&mut self, name: &str, arg_exprs: &[Expr]) -> RexxResult<ExecSignal> {
        let args = self.eval_args(arg_exprs)?;
        if self.interrupted() {
            return Ok(ExecSignal::Normal);
        }
        match self.invoke(name, args)? {
            CallOutcome::Returned(Some(val)) => {
                self.rt.env.set(RESULT, val);
                Ok(ExecSignal::Normal)
            }
            CallOutcome::Returned(None) => {
                self.rt.env.drop(RESULT);
                Ok(ExecSignal::Normal)
            }
            CallOutcome::Exited(val) => Ok(ExecSignal::Exit(val)),
            CallOutcome::Signalled(label) => Ok(ExecSignal::Signal(label)),
        }
    }

    fn eval_args(&mut self, exprs: &[Expr]) -> RexxResult<Vec<Value>> {
        let mut values = Vec::with_capacity(exprs.len());
        for expr in exprs {
            values.push(self.eval_expr(expr)?);
            if self.interrupted() {
                break;
            }
        }
        Ok(values)
    }

    /// Function-call form: the routine must return data.
    fn call_function(&mut self, name: &str, args: Vec<Value>) -> RexxResult<Value> {
        match self.invoke(name, args)? {
            CallOutcome::Returned(Some(val)) => Ok(val),
            CallOutcome::Returned(None) => Err(RexxDiagnostic::new(RexxError::NoReturnData)
                .with_detail(format!("function '{name}' did not return data"))),
            CallOutcome::Exited(val) => {
                self.pending_exit = PendingExit::WithValue(val);
                Ok(Value::empty())
            }
            CallOutcome::Signalled(label) => {
                self.pending_signal = Some(label);
                Ok(Value::empty())
            }
        }
    }

    /// Resolution order: label in the current script, library exports,
    /// built-ins, then a method dispatch when a non-default ADDRESS target
    /// is active.
    fn invoke(&mut self, name: &str, args: Vec<Value>) -> RexxResult<CallOutcome> {
        let script = Arc::clone(&self.activation().script);
        if let Some(&idx) = script.labels.get(name) {
            return self.call_routine(name, &script, idx, args);
        }

        if let Some(export) = self.rt.functions.get(name).cloned() {
            return match export.code {
                LibraryCode::Native(library) => library
                    .call(&export.name, &args)
                    .map(|val| CallOutcome::Returned(Some(val)))
                    .map_err(|e| {
                        RexxDiagnostic::new(RexxError::IncorrectCall)
                            .with_detail(format!("{name} ({}): {e}", export.library))
                    }),
                LibraryCode::Source(library) => {
                    let Some(&idx) = library.script.labels.get(name) else {
                        return Err(RexxDiagnostic::new(RexxError::RoutineNotFound)
                            .with_detail(format!("{name} is not defined in {}", library.path.display())));
                    };
                    self.call_routine(name, &library.script, idx, args)
                }
            };
        }

        let intrinsic = match name {
            "ARG" => Some(self.bif_arg(&args)),
            "CHECKPOINT" => Some(self.bif_checkpoint(&args)),
            _ => builtins::call_builtin(
                name,
                &args,
                &self.rt.settings,
                &self.rt.env,
                self.rt.config.max_string_length,
            ),
        };
        if let Some(result) = intrinsic {
            return result.map(|val| CallOutcome::Returned(Some(val)));
        }

        let target = self.rt.env.address().to_string();
        if !target.eq_ignore_ascii_case(&self.rt.config.default_address) {
            let request = AddressRequest::method(name, args);
            let (outcome, signal) = self.dispatch(&target, &request)?;
            return Ok(match signal {
                ExecSignal::Signal(label) => CallOutcome::Signalled(label),
                _ => CallOutcome::Returned(Some(outcome.result)),
            });
        }

        Err(RexxDiagnostic::new(RexxError::RoutineNotFound)
            .with_detail(format!("routine '{name}' not found")))
    }

    /// Run the routine at `label` of `script` in a fresh frame.
    fn call_routine(
        &mut self,
        name: &str,
        script: &Arc<Script>,
        label: usize,
        args: Vec<Value>,
    ) -> RexxResult<CallOutcome> {
        let max = self.rt.config.max_call_depth;
        if self.call_stack.len() >= max {
            return Err(RexxDiagnostic::new(RexxError::ResourceExhausted)
                .with_detail(format!("call depth exceeded {max} calling {name}")));
        }
        self.check_nesting(name)?;

        self.call_stack.push(Activation::new(name, Arc::clone(script), args));
        self.rt.env.push_frame();
        let result = self.exec_script(script, label + 1);
        self.rt.env.pop_frame();
        self.call_stack.pop();

        Ok(match result? {
            ExecSignal::Return(val) => CallOutcome::Returned(val),
            ExecSignal::Normal | ExecSignal::Leave(_) | ExecSignal::Iterate(_) => {
                CallOutcome::Returned(None)
            }
            ExecSignal::Exit(val) => CallOutcome::Exited(val),
            ExecSignal::Signal(label) => CallOutcome::Signalled(label),
        })
    }

    /// `ARG()` → argument count; `ARG(n)` → nth argument or `''`;
    /// `ARG(n, 'E'|'O')` → whether it exists or was omitted.
    fn bif_arg(&self, args: &[Value]) -> RexxResult<Value> {
        let routine_args = &self.activation().args;
        let Some(index) = args.first() else {
            return Ok(Value::from(routine_args.len()));
        };
        let n = to_integer(index)?;
        let slot = usize::try_from(n)
            .ok()
            .filter(|&n| n >= 1)
            .map(|n| routine_args.get(n - 1))
            .ok_or_else(|| {
                RexxDiagnostic::new(RexxError::IncorrectCall)
                    .with_detail(format!("ARG: argument number must be positive; got {n}"))
            })?;
        match args.get(1).map(|v| v.to_text().to_uppercase()) {
            None => Ok(slot.cloned().unwrap_or_else(Value::empty)),
            Some(option) if option.starts_with('E') => Ok(Value::from(slot.is_some())),
            Some(option) if option.starts_with('O') => Ok(Value::from(slot.is_none())),
            Some(option) => Err(RexxDiagnostic::new(RexxError::IncorrectCall)
                .with_detail(format!("ARG: option must be E or O; got '{option}'"))),
        }
    }

    /// `CHECKPOINT(tag [, params])` → `CONTINUE` or `CANCEL`.
    fn bif_checkpoint(&self, args: &[Value]) -> RexxResult<Value> {
        let Some(tag) = args.first() else {
            return Err(RexxDiagnostic::new(RexxError::IncorrectCall)
                .with_detail("CHECKPOINT requires a tag"));
        };
        let checkpoint = Checkpoint {
            tag: tag.to_text(),
            params: args.get(1).cloned().unwrap_or_default(),
        };
        let ack = self
            .rt
            .observer
            .as_ref()
            .map_or(Ack::Continue, |observer| observer.checkpoint(&checkpoint));
        tracing::info!(tag = %checkpoint.tag, ack = %ack, "checkpoint");
        if ack == Ack::Cancel {
            self.rt.cancel.cancel();
        }
        Ok(Value::from(ack.as_str()))
    }

    /// Execute a SIGNAL instruction.
    fn exec_signal(&mut self, action: &SignalAction) -> RexxResult<ExecSignal> {
        match action {
            SignalAction::Label(label) => Ok(ExecSignal::Signal(label.clone())),
            SignalAction::Value(expr) => {
                let val = self.eval_expr(expr)?;
                if self.interrupted() {
                    return Ok(ExecSignal::Normal);
                }
                Ok(ExecSignal::Signal(val.to_text().trim().to_uppercase()))
            }
            SignalAction::On { condition, name } => {
                let label = name.clone().unwrap_or_else(|| condition.name().to_string());
                self.traps.insert(*condition, label);
                Ok(ExecSignal::Normal)
            }
            SignalAction::Off(condition) => {
                self.traps.remove(condition);
                Ok(ExecSignal::Normal)
            }
        }
    }

    // ── PARSE template engine ──────────────────────────────────────

    fn exec_parse(
        &mut self,
        upper: bool,
        source: &ParseSource,
        template: &ParseTemplate,
    ) -> RexxResult<ExecSignal> {
        let sub_templates = split_template_at_commas(template);

        if let ParseSource::Arg = source {
            let args = self.activation().args.clone();
            for (i, sub_t) in sub_templates.iter().enumerate() {
                let raw = args.get(i).map(Value::to_text).unwrap_or_default();
                let text = if upper { raw.to_uppercase() } else { raw };
                self.apply_template(&text, sub_t)?;
            }
            return Ok(ExecSignal::Normal);
        }

        let raw = match source {
            ParseSource::Var(name) => self.symbol_value(name).to_text(),
            ParseSource::Value(expr) => {
                let val = self.eval_expr(expr)?;
                if self.interrupted() {
                    return Ok(ExecSignal::Normal);
                }
                val.to_text()
            }
            ParseSource::Arg => String::new(),
        };
        let text = if upper { raw.to_uppercase() } else { raw };
        for (i, sub_t) in sub_templates.iter().enumerate() {
            let s = if i == 0 { text.as_str() } else { "" };
            self.apply_template(s, sub_t)?;
        }
        Ok(ExecSignal::Normal)
    }

    /// Apply a single PARSE template to a source string.
    fn apply_template(&mut self, source: &str, template: &ParseTemplate) -> RexxResult<()> {
        let elements = &template.elements;
        let len = elements.len();
        let mut cursor: usize = 0;
        let mut i: usize = 0;

        while i < len {
            let mut targets: Vec<&TemplateElement> = Vec::new();
            while i < len {
                match &elements[i] {
                    e @ (TemplateElement::Variable(_) | TemplateElement::Dot) => {
                        targets.push(e);
                        i += 1;
                    }
                    _ => break,
                }
            }

            if i >= len {
                let section = source.get(cursor..).unwrap_or("");
                self.assign_section(section, &targets);
                break;
            }

            match &elements[i] {
                TemplateElement::Literal(pat) => {
                    cursor = self.match_pattern(source, cursor, pat, &targets);
                }
                TemplateElement::AbsolutePos(expr) => {
                    let pos_val = self.eval_expr(expr)?;
                    let pos = to_position_value(&pos_val)?;
                    let char_pos = usize::try_from(pos - 1).unwrap_or(0);
                    let target = char_pos_to_byte_offset(source, char_pos);
                    self.assign_section(source.get(cursor..target).unwrap_or(""), &targets);
                    cursor = target;
                }
                TemplateElement::RelativePos(offset) => {
                    let distance = offset.unsigned_abs() as usize;
                    let target = if *offset >= 0 {
                        advance_chars(source, cursor, distance)
                    } else {
                        retreat_chars(source, cursor, distance)
                    };
                    self.assign_section(source.get(cursor..target).unwrap_or(""), &targets);
                    cursor = target;
                }
                TemplateElement::VariablePattern(name) => {
                    let pat = self.rt.env.get(name).to_text();
                    cursor = self.match_pattern(source, cursor, &pat, &targets);
                }
                _ => {}
            }
            i += 1;
        }
        Ok(())
    }

    /// Assign a section to targets with word-parsing rules; the last target
    /// takes the remainder.
    fn assign_section(&mut self, section: &str, targets: &[&TemplateElement]) {
        match targets {
            [] => {}
            [only] => self.assign_target(only, section),
            _ => {
                let mut remaining = section;
                for (j, target) in targets.iter().enumerate() {
                    let trimmed = remaining.trim_start_matches([' ', '\t']);
                    if j == targets.len() - 1 {
                        self.assign_target(target, trimmed);
                    } else if let Some(blank_pos) = trimmed.find([' ', '\t']) {
                        self.assign_target(target, &trimmed[..blank_pos]);
                        remaining = &trimmed[blank_pos..];
                    } else {
                        self.assign_target(target, trimmed);
                        remaining = "";
                    }
                }
            }
        }
    }

    /// Search for `pat` from `cursor`, assigning what precedes it. An empty
    /// or missing pattern consumes the rest. Returns the new cursor.
    fn match_pattern(
        &mut self,
        source: &str,
        cursor: usize,
        pat: &str,
        targets: &[&TemplateElement],
    ) -> usize {
        let rest = source.get(cursor..).unwrap_or("");
        if !pat.is_empty()
            && let Some(found) = rest.find(pat)
        {
            self.assign_section(&rest[..found], targets);
            cursor + found + pat.len()
        } else {
            self.assign_section(rest, targets);
            source.len()
        }
    }

    fn assign_target(&mut self, target: &TemplateElement, value: &str) {
        if let TemplateElement::Variable(name) = target {
            self.assign_symbol(name, Value::from(value));
        }
    }

    // ── NUMERIC ────────────────────────────────────────────────────

    fn exec_numeric(&mut self, setting: &NumericSetting) -> RexxResult<ExecSignal> {
        match setting {
            NumericSetting::Digits(expr) => {
                let digits = match expr {
                    Some(e) => {
                        let val = self.eval_expr(e)?;
                        if self.interrupted() {
                            return Ok(ExecSignal::Normal);
                        }
                        u32::try_from(to_integer(&val)?)
                            .ok()
                            .filter(|&n| n >= 1)
                            .ok_or_else(|| {
                                RexxDiagnostic::new(RexxError::InvalidWholeNumber)
                                    .with_detail(format!("NUMERIC DIGITS {val} is out of range"))
                            })?
                    }
                    None => 9,
                };
                if digits <= self.rt.settings.fuzz {
                    return Err(RexxDiagnostic::new(RexxError::InvalidWholeNumber)
                        .with_detail("NUMERIC DIGITS must exceed NUMERIC FUZZ"));
                }
                self.rt.settings.digits = digits;
            }
            NumericSetting::Form(form_setting) => {
                let form = match form_setting {
                    NumericFormSetting::Scientific => NumericForm::Scientific,
                    NumericFormSetting::Engineering => NumericForm::Engineering,
                    NumericFormSetting::Value(expr) => {
                        let val = self.eval_expr(expr)?;
                        if self.interrupted() {
                            return Ok(ExecSignal::Normal);
                        }
                        let s = val.to_text().trim().to_uppercase();
                        match s.as_str() {
                            "SCIENTIFIC" => NumericForm::Scientific,
                            "ENGINEERING" => NumericForm::Engineering,
                            _ => {
                                return Err(RexxDiagnostic::new(RexxError::InvalidSubKeyword)
                                    .with_detail(format!(
                                        "NUMERIC FORM value must be SCIENTIFIC or ENGINEERING; got '{s}'"
                                    )));
                            }
                        }
                    }
                };
                self.rt.settings.form = form;
            }
            NumericSetting::Fuzz(expr) => {
                let fuzz = match expr {
                    Some(e) => {
                        let val = self.eval_expr(e)?;
                        if self.interrupted() {
                            return Ok(ExecSignal::Normal);
                        }
                        u32::try_from(to_integer(&val)?).map_err(|_| {
                            RexxDiagnostic::new(RexxError::InvalidWholeNumber)
                                .with_detail(format!("NUMERIC FUZZ {val} is out of range"))
                        })?
                    }
                    None => 0,
                };
                if fuzz >= self.rt.settings.digits {
                    return Err(RexxDiagnostic::new(RexxError::InvalidWholeNumber)
                        .with_detail("NUMERIC FUZZ must be less than NUMERIC DIGITS"));
                }
                self.rt.settings.fuzz = fuzz;
            }
        }
        Ok(ExecSignal::Normal)
    }

    // ── IF / DO / SELECT ───────────────────────────────────────────

    fn exec_if(
        &mut self,
        condition: &Expr,
        then_clause: &Clause,
        else_clause: Option<&Clause>,
    ) -> RexxResult<ExecSignal> {
        let cond_val = self.eval_expr(condition)?;
        if self.interrupted() {
            return Ok(ExecSignal::Normal);
        }
        if to_logical(&cond_val)? {
            self.exec_clause_outer(then_clause)
        } else if let Some(else_c) = else_clause {
            self.exec_clause_outer(else_c)
        } else {
            Ok(ExecSignal::Normal)
        }
    }

    fn exec_do(&mut self, block: &DoBlock) -> RexxResult<ExecSignal> {
        if matches!(block.kind, DoKind::Simple) {
            return self.exec_clauses(&block.body);
        }
        self.activation_mut().loops.push(LoopRecord {
            name: block.name.clone(),
            passes: 0,
            limit: None,
        });
        let result = self.exec_loop(block);
        // After a SIGNAL the restart point has already dropped every record.
        if !matches!(result, Ok(ExecSignal::Signal(_))) {
            self.activation_mut().loops.pop();
        }
        result
    }

    fn exec_loop(&mut self, block: &DoBlock) -> RexxResult<ExecSignal> {
        match &block.kind {
            DoKind::Simple => self.exec_clauses(&block.body),
            DoKind::Forever => self.exec_do_forever(block),
            DoKind::Count(expr) => self.exec_do_count(expr, block),
            DoKind::While(expr) => self.exec_do_while(expr, block),
            DoKind::Until(expr) => self.exec_do_until(expr, block),
            DoKind::Controlled(ctrl) => self.exec_do_controlled(ctrl, block),
            DoKind::Over { var, collection } => self.exec_do_over(var, collection, block),
        }
    }

    /// One pass of a loop body, resolving LEAVE/ITERATE aimed at this loop.
    fn run_body(&mut self, block: &DoBlock) -> RexxResult<Flow> {
        self.check_cancel()?;
        let record = self.current_loop();
        record.passes = record.passes.saturating_add(1);
        let targets_this = |name: Option<&str>| name.is_none_or(|n| block.name.as_deref() == Some(n));
        Ok(match self.exec_clauses(&block.body)? {
            ExecSignal::Normal => Flow::Next,
            ExecSignal::Leave(name) if targets_this(name.as_deref()) => Flow::Break,
            ExecSignal::Iterate(name) if targets_this(name.as_deref()) => Flow::Next,
            other => Flow::Out(other),
        })
    }

    fn current_loop(&mut self) -> &mut LoopRecord {
        self.activation_mut()
            .loops
            .last_mut()
            .expect("repetitive DO has no loop record")
    }

    fn loop_exhausted(&mut self) -> bool {
        self.current_loop().exhausted()
    }

    fn exec_do_forever(&mut self, block: &DoBlock) -> RexxResult<ExecSignal> {
        loop {
            match self.run_body(block)? {
                Flow::Next => {}
                Flow::Break => return Ok(ExecSignal::Normal),
                Flow::Out(signal) => return Ok(signal),
            }
        }
    }

    fn exec_do_count(&mut self, count_expr: &Expr, block: &DoBlock) -> RexxResult<ExecSignal> {
        let count_val = self.eval_expr(count_expr)?;
        if self.interrupted() {
            return Ok(ExecSignal::Normal);
        }
        self.current_loop().limit = Some(to_count(&count_val)?);
        while !self.loop_exhausted() {
            match self.run_body(block)? {
                Flow::Next => {}
                Flow::Break => break,
                Flow::Out(signal) => return Ok(signal),
            }
        }
        Ok(ExecSignal::Normal)
    }

    fn exec_do_while(&mut self, cond_expr: &Expr, block: &DoBlock) -> RexxResult<ExecSignal> {
        loop {
            let cond_val = self.eval_expr(cond_expr)?;
            if self.interrupted() || !to_logical(&cond_val)? {
                break;
            }
            match self.run_body(block)? {
                Flow::Next => {}
                Flow::Break => break,
                Flow::Out(signal) => return Ok(signal),
            }
        }
        Ok(ExecSignal::Normal)
    }

    fn exec_do_until(&mut self, cond_expr: &Expr, block: &DoBlock) -> RexxResult<ExecSignal> {
        loop {
            match self.run_body(block)? {
                Flow::Next => {}
                Flow::Break => break,
                Flow::Out(signal) => return Ok(signal),
            }
            let cond_val = self.eval_expr(cond_expr)?;
            if self.interrupted() || to_logical(&cond_val)? {
                break;
            }
        }
        Ok(ExecSignal::Normal)
    }

    fn exec_do_controlled(
        &mut self,
        ctrl: &ControlledLoop,
        block: &DoBlock,
    ) -> RexxResult<ExecSignal> {
        let start_val = self.eval_expr(&ctrl.start)?;
        let mut current = to_number(&start_val)?;

        let to_num = match &ctrl.to {
            Some(to_expr) => Some(to_number(&self.eval_expr(to_expr)?)?),
            None => None,
        };
        let by_num = match &ctrl.by {
            Some(by_expr) => to_number(&self.eval_expr(by_expr)?)?,
            None => BigDecimal::from(1),
        };
        if by_num.is_zero() {
            return Err(RexxDiagnostic::new(RexxError::InvalidWholeNumber)
                .with_detail("BY value in DO loop must not be zero"));
        }
        let for_count = match &ctrl.r#for {
            Some(for_expr) => Some(to_count(&self.eval_expr(for_expr)?)?),
            None => None,
        };
        if self.interrupted() {
            return Ok(ExecSignal::Normal);
        }

        self.current_loop().limit = for_count;
        let ascending = by_num > BigDecimal::zero();
        loop {
            if let Some(limit) = &to_num
                && (if ascending { current > *limit } else { current < *limit })
            {
                break;
            }
            if self.loop_exhausted() {
                break;
            }

            let control = Value::from_decimal(&current, &self.rt.settings);
            self.assign_symbol(&ctrl.var, control);

            if let Some(while_expr) = &ctrl.while_cond {
                let v = self.eval_expr(while_expr)?;
                if !to_logical(&v)? {
                    break;
                }
            }

            match self.run_body(block)? {
                Flow::Next => {}
                Flow::Break => return Ok(ExecSignal::Normal),
                Flow::Out(signal) => return Ok(signal),
            }

            // UNTIL ends the loop before the increment.
            if let Some(until_expr) = &ctrl.until_cond {
                let v = self.eval_expr(until_expr)?;
                if to_logical(&v)? {
                    break;
                }
            }

            current += &by_num;
        }

        let control = Value::from_decimal(&current, &self.rt.settings);
        self.assign_symbol(&ctrl.var, control);
        Ok(ExecSignal::Normal)
    }

    /// `DO var OVER collection`: array elements or object values, in order.
    fn exec_do_over(&mut self, var: &str, collection: &Expr, block: &DoBlock) -> RexxResult<ExecSignal> {
        let items = match self.eval_expr(collection)? {
            Value::Array(items) => items,
            Value::Object(map) => map.into_values().collect(),
            Value::Null => Vec::new(),
            Value::String(s) if s.is_empty() => Vec::new(),
            other => {
                return Err(RexxDiagnostic::new(RexxError::InvalidExpression)
                    .with_detail(format!("DO {var} OVER needs an array or object, got '{other}'")));
            }
        };
        if self.interrupted() {
            return Ok(ExecSignal::Normal);
        }
        for item in items {
            self.assign_symbol(var, item);
            match self.run_body(block)? {
                Flow::Next => {}
                Flow::Break => break,
                Flow::Out(signal) => return Ok(signal),
            }
        }
        Ok(ExecSignal::Normal)
    }

    fn exec_select(
        &mut self,
        when_clauses: &[(Expr, Vec<Clause>)],
        otherwise: Option<&[Clause]>,
    ) -> RexxResult<ExecSignal> {
        for (condition, body) in when_clauses {
            let val = self.eval_expr(condition)?;
            if self.interrupted() {
                return Ok(ExecSignal::Normal);
            }
            if to_logical(&val)? {
                return self.exec_clauses(body);
            }
        }
        if let Some(body) = otherwise {
            return self.exec_clauses(body);
        }
        Err(RexxDiagnostic::new(RexxError::ExpectedWhenOtherwise)
            .with_detail("no WHEN matched and no OTHERWISE in SELECT"))
    }

    // ── variables ──────────────────────────────────────────────────

    fn resolve_tail(&self, tail: &[TailElement]) -> String {
        tail.iter()
            .map(|elem| match elem {
                TailElement::Const(c) => c.clone(),
                TailElement::Var(v) => self.rt.env.get(v).to_text(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    fn assign_compound(&mut self, stem: &str, tail: &[TailElement], value: Value) {
        let resolved = self.resolve_tail(tail);
        if resolved.is_empty() {
            self.rt.env.set_stem_default(stem, value);
        } else {
            self.rt.env.set_compound(stem, &resolved, value);
        }
    }

    /// Assign to a name that may be compound (`X`, `X.`, `X.I`).
    fn assign_symbol(&mut self, name: &str, value: Value) {
        match name.split_once('.') {
            Some((stem, tail)) if !stem.is_empty() => {
                let tail = parse_tail_elements(tail);
                self.assign_compound(stem, &tail, value);
            }
            _ => self.rt.env.set(name, value),
        }
    }

    /// Read a name that may be compound.
    fn symbol_value(&self, name: &str) -> Value {
        match name.split_once('.') {
            Some((stem, "")) if !stem.is_empty() => self.rt.env.get(stem),
            Some((stem, tail)) if !stem.is_empty() => {
                let tail = self.resolve_tail(&parse_tail_elements(tail));
                self.rt.env.get_compound(stem, &tail)
            }
            _ => self.rt.env.get(name),
        }
    }

    // ── expressions ────────────────────────────────────────────────

    pub(crate) fn eval_expr(&mut self, expr: &Expr) -> RexxResult<Value> {
        match expr {
            Expr::StringLit(s) => Ok(Value::String(s.clone())),
            Expr::Number(n) => Ok(Value::String(n.clone())),
            Expr::Symbol(name) => {
                if !self.rt.env.is_set(name) {
                    self.raise_novalue(name.clone());
                }
                Ok(self.rt.env.get(name))
            }
            Expr::Compound { stem, tail } => {
                let resolved = self.resolve_tail(tail);
                if !self.rt.env.is_compound_set(stem, &resolved) {
                    self.raise_novalue(format!("{stem}.{resolved}"));
                }
                Ok(self.rt.env.get_compound(stem, &resolved))
            }
            Expr::Paren(inner) => self.eval_expr(inner),
            Expr::UnaryOp { op, operand } => {
                let val = self.eval_expr(operand)?;
                if self.interrupted() {
                    return Ok(val);
                }
                self.eval_unary(*op, &val)
            }
            Expr::BinOp { left, op, right } => {
                let lval = self.eval_expr(left)?;
                if self.interrupted() {
                    return Ok(lval);
                }
                let rval = self.eval_expr(right)?;
                if self.interrupted() {
                    return Ok(rval);
                }
                self.eval_binop(*op, &lval, &rval)
            }
            Expr::FunctionCall { name, args } => {
                let values = self.eval_args(args)?;
                if self.interrupted() {
                    return Ok(Value::empty());
                }
                self.call_function(name, values)
            }
            Expr::Pipe { .. } => self.eval_pipe(expr),
            Expr::ArrayLit(items) => {
                let values = self.eval_args(items)?;
                Ok(Value::Array(values))
            }
            Expr::ObjectLit(entries) => {
                let mut map = ObjectMap::with_capacity(entries.len());
                for (key, value_expr) in entries {
                    let value = self.eval_expr(value_expr)?;
                    if self.interrupted() {
                        break;
                    }
                    map.insert(key.clone(), value);
                }
                Ok(Value::Object(map))
            }
        }
    }

    /// NOVALUE fires once, after the current clause.
    fn raise_novalue(&mut self, name: String) {
        if let Some(label) = self.take_trap(Condition::NoValue, name) {
            self.pending_signal = Some(label);
        }
    }

    /// `head |> f |> g(x)` is `g(f(head), x)`.
    fn eval_pipe(&mut self, expr: &Expr) -> RexxResult<Value> {
        let (head, stages) = expr.pipe_chain();
        let mut value = self.eval_expr(head)?;
        for stage in stages {
            if self.interrupted() {
                break;
            }
            let (name, extra) = match stage {
                Expr::Symbol(name) => (name.as_str(), &[][..]),
                Expr::FunctionCall { name, args } => (name.as_str(), args.as_slice()),
                _ => {
                    return Err(RexxDiagnostic::new(RexxError::InvalidExpression)
                        .with_detail("a pipe stage must be a function name or call"));
                }
            };
            let mut args = Vec::with_capacity(extra.len() + 1);
            args.push(value);
            args.extend(self.eval_args(extra)?);
            if self.interrupted() {
                return Ok(Value::empty());
            }
            value = self.call_function(name, args)?;
        }
        Ok(value)
    }

    fn eval_unary(&self, op: UnaryOp, val: &Value) -> RexxResult<Value> {
        match op {
            UnaryOp::Plus => Ok(Value::from_decimal(&to_number(val)?, &self.rt.settings)),
            UnaryOp::Minus => Ok(Value::from_decimal(&-to_number(val)?, &self.rt.settings)),
            UnaryOp::Not => Ok(Value::Boolean(!to_logical(val)?)),
        }
    }

    fn eval_binop(&self, op: BinOp, left: &Value, right: &Value) -> RexxResult<Value> {
        use std::cmp::Ordering::{Equal, Greater, Less};

        match op {
            BinOp::Add => self.arithmetic(left, right, |a, b| Ok(a + b)),
            BinOp::Sub => self.arithmetic(left, right, |a, b| Ok(a - b)),
            BinOp::Mul => self.arithmetic(left, right, |a, b| Ok(a * b)),
            BinOp::Div => self.arithmetic(left, right, |a, b| Ok(a / nonzero(b)?)),
            // REXX integer division truncates toward zero
            BinOp::IntDiv => self.arithmetic(left, right, |a, b| Ok(trunc_div(&a, &nonzero(b)?))),
            BinOp::Remainder => self.arithmetic(left, right, |a, b| {
                let b = nonzero(b)?;
                let int_div = trunc_div(&a, &b);
                Ok(&a - &int_div * &b)
            }),
            BinOp::Power => self.arithmetic(left, right, power),

            BinOp::Concat => Ok(Value::String(format!("{left}{right}"))),
            BinOp::ConcatBlank => Ok(Value::String(format!("{left} {right}"))),

            BinOp::Eq => Ok(Value::Boolean(self.normal_compare(left, right) == Equal)),
            BinOp::NotEq => Ok(Value::Boolean(self.normal_compare(left, right) != Equal)),
            BinOp::Gt => Ok(Value::Boolean(self.normal_compare(left, right) == Greater)),
            BinOp::Lt => Ok(Value::Boolean(self.normal_compare(left, right) == Less)),
            BinOp::GtEq => Ok(Value::Boolean(self.normal_compare(left, right) != Less)),
            BinOp::LtEq => Ok(Value::Boolean(self.normal_compare(left, right) != Greater)),

            BinOp::StrictEq => Ok(Value::Boolean(left.to_text() == right.to_text())),
            BinOp::StrictNotEq => Ok(Value::Boolean(left.to_text() != right.to_text())),
            BinOp::StrictGt => Ok(Value::Boolean(left.to_text() > right.to_text())),
            BinOp::StrictLt => Ok(Value::Boolean(left.to_text() < right.to_text())),
            BinOp::StrictGtEq => Ok(Value::Boolean(left.to_text() >= right.to_text())),
            BinOp::StrictLtEq => Ok(Value::Boolean(left.to_text() <= right.to_text())),

            BinOp::And => Ok(Value::Boolean(to_logical(left)? & to_logical(right)?)),
            BinOp::Or => Ok(Value::Boolean(to_logical(left)? | to_logical(right)?)),
            BinOp::Xor => Ok(Value::Boolean(to_logical(left)? ^ to_logical(right)?)),
        }
    }

    fn arithmetic(
        &self,
        left: &Value,
        right: &Value,
        f: impl FnOnce(BigDecimal, BigDecimal) -> RexxResult<BigDecimal>,
    ) -> RexxResult<Value> {
        let result = f(to_number(left)?, to_number(right)?)?;
        Ok(Value::from_decimal(&result, &self.rt.settings))
    }

    /// Numeric when both sides are numbers (to DIGITS minus FUZZ
    /// significant digits), otherwise blank-padded string comparison.
    fn normal_compare(&self, left: &Value, right: &Value) -> std::cmp::Ordering {
        if let (Some(l), Some(r)) = (left.to_decimal(), right.to_decimal()) {
            let settings = &self.rt.settings;
            if settings.fuzz == 0 {
                return l.cmp(&r);
            }
            let precision = u64::from(settings.digits - settings.fuzz);
            return l.with_prec(precision).cmp(&r.with_prec(precision));
        }
        let (ltext, rtext) = (left.to_text(), right.to_text());
        let ls = ltext.trim_matches(' ');
        let rs = rtext.trim_matches(' ');
        let max_len = ls.len().max(rs.len());
        format!("{ls:<max_len$}").cmp(&format!("{rs:<max_len$}"))
    }
}

/// `{name}` lookup for command strings: set variables only, compound
/// names resolved like `stem.tail` in an expression.
fn placeholder_value(env: &Environment, name: &str) -> Option<String> {
    let name = name.to_uppercase();
    match name.split_once('.') {
        Some((stem, tail)) if !stem.is_empty() && !tail.is_empty() => {
            let tail = tail
                .split('.')
                .map(|part| env.lookup(part).map_or_else(|| part.to_string(), Value::to_text))
                .collect::<Vec<_>>()
                .join(".");
            env.is_compound_set(stem, &tail)
                .then(|| env.get_compound(stem, &tail).to_text())
        }
        _ => env.lookup(name.trim_end_matches('.')).map(Value::to_text),
    }
}

fn to_number(val: &Value) -> RexxResult<BigDecimal> {
    val.to_decimal().ok_or_else(|| {
        RexxDiagnostic::new(RexxError::BadArithmetic).with_detail(format!("'{val}' is not a number"))
    })
}

fn to_logical(val: &Value) -> RexxResult<bool> {
    val.to_logical().ok_or_else(|| {
        RexxDiagnostic::new(RexxError::InvalidLogicalValue)
            .with_detail(format!("'{val}' is not 0 or 1"))
    })
}

/// A whole number, for ARG(n) and NUMERIC settings.
fn to_integer(val: &Value) -> RexxResult<i64> {
    let d = to_number(val)?;
    if !d.is_integer() {
        return Err(RexxDiagnostic::new(RexxError::InvalidWholeNumber)
            .with_detail(format!("'{val}' is not a whole number")));
    }
    d.to_i64().ok_or_else(|| {
        RexxDiagnostic::new(RexxError::ArithmeticOverflow)
            .with_detail(format!("'{val}' is too large"))
    })
}

/// Loop counts and FOR values must be non-negative whole numbers.
fn to_count(val: &Value) -> RexxResult<u64> {
    let n = to_integer(val)?;
    u64::try_from(n).map_err(|_| {
        RexxDiagnostic::new(RexxError::InvalidWholeNumber)
            .with_detail(format!("loop count must not be negative (got {n})"))
    })
}

fn to_position_value(val: &Value) -> RexxResult<i64> {
    to_integer(val)
}

fn nonzero(d: BigDecimal) -> RexxResult<BigDecimal> {
    if d.is_zero() {
        return Err(RexxDiagnostic::new(RexxError::ArithmeticOverflow).with_detail("division by zero"));
    }
    Ok(d)
}

fn trunc_div(a: &BigDecimal, b: &BigDecimal) -> BigDecimal {
    (a / b).with_scale_round(0, bigdecimal::RoundingMode::Down)
}

fn power(base: BigDecimal, exp: BigDecimal) -> RexxResult<BigDecimal> {
    if !exp.is_integer() {
        return Err(RexxDiagnostic::new(RexxError::InvalidWholeNumber)
            .with_detail("exponent must be a whole number"));
    }
    let exp = exp
        .to_i64()
        .filter(|e| e.abs() <= 1_000_000)
        .ok_or_else(|| {
            RexxDiagnostic::new(RexxError::ArithmeticOverflow).with_detail("exponent exceeds limits")
        })?;
    if base.is_zero() && exp < 0 {
        return Err(RexxDiagnostic::new(RexxError::ArithmeticOverflow)
            .with_detail("zero raised to a negative power"));
    }
    Ok(pow_bigdecimal(&base, exp))
}

/// Exponentiation by squaring.
fn pow_bigdecimal(base: &BigDecimal, exp: i64) -> BigDecimal {
    if exp < 0 {
        return BigDecimal::from(1) / pow_bigdecimal(base, -exp);
    }
    let mut result = BigDecimal::from(1);
    let mut b = base.clone();
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result *= &b;
        }
        b = &b * &b;
        e >>= 1;
    }
    result
}

fn split_template_at_commas(template: &ParseTemplate) -> Vec<ParseTemplate> {
    let mut result = Vec::new();
    let mut current = Vec::new();
    for elem in &template.elements {
        if matches!(elem, TemplateElement::Comma) {
            result.push(ParseTemplate {
                elements: std::mem::take(&mut current),
            });
        } else {
            current.push(elem.clone());
        }
    }
    result.push(ParseTemplate { elements: current });
    result
}

fn char_pos_to_byte_offset(source: &str, char_pos: usize) -> usize {
    source
        .char_indices()
        .nth(char_pos)
        .map_or(source.len(), |(byte_offset, _)| byte_offset)
}

fn advance_chars(source: &str, byte_cursor: usize, n: usize) -> usize {
    let clamped = byte_cursor.min(source.len());
    source[clamped..]
        .char_indices()
        .nth(n)
        .map_or(source.len(), |(offset, _)| clamped + offset)
}

fn retreat_chars(source: &str, byte_cursor: usize, n: usize) -> usize {
    let clamped = byte_cursor.min(source.len());
    if n == 0 {
        return clamped;
    }
    source[..clamped]
        .char_indices()
        .map(|(i, _)| i)
        .rev()
        .nth(n - 1)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{FnHandler, HandlerError, HandlerReply};
    use crate::config::Config;

    fn interpreter() -> Interpreter {
        Interpreter::new(Config {
            capture_output: true,
            ..Config::default()
        })
    }

    fn run(src: &str) -> Vec<String> {
        interpreter().run_source(src).unwrap().output
    }

    fn run_err(src: &str) -> RexxDiagnostic {
        interpreter().run_source(src).unwrap_err()
    }

    fn eval_expr(src: &str) -> String {
        run(&format!("say {src}")).remove(0)
    }

    #[test]
    fn eval_arithmetic() {
        assert_eq!(eval_expr("2 + 3"), "5");
        assert_eq!(eval_expr("10 - 3"), "7");
        assert_eq!(eval_expr("2 + 3 * 4"), "14");
        assert_eq!(eval_expr("7 / 2"), "3.5");
        assert_eq!(eval_expr("7 % 2"), "3");
        assert_eq!(eval_expr("-7 // 2"), "-1");
        assert_eq!(eval_expr("2 ** 10"), "1024");
        assert_eq!(eval_expr("2 ** -1"), "0.5");
        assert_eq!(eval_expr("-(3)"), "-3");
    }

    #[test]
    fn eval_division_by_zero() {
        assert_eq!(run_err("say 1 / 0").error, RexxError::ArithmeticOverflow);
    }

    #[test]
    fn bad_number_is_invalid_number_condition() {
        let err = run_err("x = 'abc'\nsay x + 1");
        assert_eq!(err.error, RexxError::BadArithmetic);
        assert_eq!(err.error.condition_name(), "INVALID-NUMBER");
        assert_eq!(err.location.unwrap().line, 2);
    }

    #[test]
    fn eval_concatenation() {
        assert_eq!(eval_expr("'a' 'b'"), "a b");
        assert_eq!(eval_expr("'a' || 'b'"), "ab");
        assert_eq!(eval_expr("'n'1"), "n1");
    }

    #[test]
    fn eval_comparisons() {
        assert_eq!(eval_expr("'10' > '9'"), "1");
        assert_eq!(eval_expr("' abc ' = 'abc'"), "1");
        assert_eq!(eval_expr("'abc' == ' abc'"), "0");
        assert_eq!(eval_expr("1.0 = 1"), "1");
        assert_eq!(eval_expr("'apple' < 'banana'"), "1");
    }

    #[test]
    fn eval_logical() {
        assert_eq!(eval_expr("1 & 0"), "0");
        assert_eq!(eval_expr("1 | 0"), "1");
        assert_eq!(eval_expr("\\0"), "1");
        assert_eq!(run_err("say 2 & 1").error, RexxError::InvalidLogicalValue);
    }

    #[test]
    fn unset_variable_returns_name() {
        assert_eq!(eval_expr("novar"), "NOVAR");
    }

    #[test]
    fn numeric_digits_rounds_results() {
        let out = run("numeric digits 4\nsay 2 / 3\nnumeric digits\nsay 2 / 3");
        assert_eq!(out, ["0.6667", "0.666666667"]);
    }

    #[test]
    fn numeric_fuzz_loosens_comparison() {
        let out = run("numeric digits 5\nnumeric fuzz 1\nsay (12341 = 12344) (12341 == 12344)");
        assert_eq!(out, ["1 0"]);
    }

    #[test]
    fn pipe_applies_stages_left_to_right() {
        let src = "say '5' |> double |> double\nexit\ndouble: return arg(1) * 2";
        assert_eq!(run(src), ["20"]);
    }

    #[test]
    fn pipe_stage_arguments_follow_the_value() {
        assert_eq!(run("say 'hello' |> LEFT(3) |> UPPER"), ["HEL"]);
    }

    #[test]
    fn let_pipe_assignment() {
        assert_eq!(run("LET x = \"hello\" |> UPPER\nsay x"), ["HELLO"]);
    }

    #[test]
    fn array_and_object_literals() {
        let src = "list = [1, 'two', 3]\nsay list.0 list.2\nrec = {name: 'web', port: 80}\nsay rec.name rec.port\nsay json_stringify(rec)";
        assert_eq!(run(src), ["3 two", "web 80", r#"{"name":"web","port":"80"}"#]);
    }

    #[test]
    fn object_keys_keep_their_spelling() {
        let src = "rec = {userName: 'ada'}
rec.USERNAME = 'grace'
say rec.username json_stringify(rec)";
        assert_eq!(run(src), [r#"grace {"userName":"grace"}"#]);
    }

    #[test]
    fn compound_tails_substitute_variables() {
        let src = "i = 2\nstem.i = 'b'\nstem.1 = 'a'\nsay stem.1 stem.2 stem.3\nstem. = 0\nsay stem.9";
        assert_eq!(run(src), ["a b STEM.3", "0"]);
    }

    #[test]
    fn do_loop_variants() {
        let src = "\
do i = 1 to 3; say i; end
do 2; say 'x'; end
n = 0
do while n < 2; n = n + 1; end
say n
do until n = 5; n = n + 1; end
say n
do i = 10 to 1 by -4; say i; end
say i";
        assert_eq!(run(src), ["1", "2", "3", "x", "x", "2", "5", "10", "6", "2", "-2"]);
    }

    #[test]
    fn do_over_iterates_in_order() {
        let src = "list = ['a', 'b', 'c']\ndo item over list; say item; end\nempty = []\ndo item over empty; say 'never'; end\nrec = {x: 1, y: 2}\ndo v over rec; say v; end";
        assert_eq!(run(src), ["a", "b", "c", "1", "2"]);
    }

    #[test]
    fn do_over_scalar_is_an_error() {
        assert_eq!(run_err("do x over 'abc'; end").error, RexxError::InvalidExpression);
    }

    #[test]
    fn by_zero_is_error_26() {
        assert_eq!(run_err("do i = 1 to 3 by 0; end").error.number(), 26);
    }

    #[test]
    fn leave_and_iterate_by_name() {
        let src = "\
do i = 1 to 3
  do j = 1 to 3
    if j = 2 then iterate i
    if i = 3 then leave i
    say i j
  end
end";
        assert_eq!(run(src), ["1 1", "2 1"]);
    }

    #[test]
    fn leave_without_loop_is_error_28() {
        assert_eq!(run_err("leave").error.number(), 28);
        assert_eq!(run_err("do i = 1 to 2; leave k; end").error.number(), 28);
    }

    #[test]
    fn select_without_match_raises_nowhen() {
        let err = run_err("select\n when 1 = 2 then say 'no'\nend");
        assert_eq!(err.error.number(), 7);
        assert_eq!(err.error.condition_name(), "NOWHEN");
        let out = run("x = 2\nselect\n when x = 1 then say 'one'\n when x = 2 then say 'two'\n otherwise say 'many'\nend");
        assert_eq!(out, ["two"]);
    }

    #[test]
    fn call_frames_are_isolated() {
        let src = "LET x = 1\nCALL sub\nSAY x\nexit\nsub:\n  x = 2\n  return";
        assert_eq!(run(src), ["1"]);
    }

    #[test]
    fn call_sets_and_drops_result() {
        let src = "call f 4\nsay result\ncall g\nsay symbol('RESULT')\nexit\nf: return arg(1) + 1\ng: return";
        assert_eq!(run(src), ["5", "LIT"]);
    }

    #[test]
    fn global_names_cross_frames() {
        let src = "GLOBAL count\ncount = 0\ncall bump\ncall bump\nsay count\nexit\nbump: count = count + 1; return";
        assert_eq!(run(src), ["2"]);
    }

    #[test]
    fn function_without_return_value_is_error_44() {
        assert_eq!(run_err("say f()\nexit\nf: return").error.number(), 44);
    }

    #[test]
    fn unknown_routine_is_error_43() {
        assert_eq!(run_err("say nosuch(1)").error.number(), 43);
    }

    #[test]
    fn arg_function_and_parse_arg() {
        let src = "call show 'a b c', 'z'\nexit\nshow: parse arg first rest, other\nsay first '|' rest '|' other arg() arg(2) arg(3, 'E')\nreturn";
        assert_eq!(run(src), ["a | b c | z 2 z 0"]);
    }

    #[test]
    fn parse_templates() {
        let src = "\
parse value 'key=value;rest' with k '=' v ';' tail
say k v tail
s = 'abcdefgh'
parse var s 3 mid +2 . 7 last
say mid last
parse upper value 'one two three' with a . c
say a c";
        assert_eq!(run(src), ["key value rest", "cd gh", "ONE THREE"]);
    }

    #[test]
    fn signal_jumps_and_unwinds_loops() {
        let src = "do i = 1 to 5\n  if i = 2 then signal done\nend\ndone:\nsay 'at' i\ndo j = 1 to 2; end\nsay j";
        assert_eq!(run(src), ["at 2", "3"]);
    }

    #[test]
    fn signal_to_missing_label_is_error_16() {
        assert_eq!(run_err("signal nowhere").error.number(), 16);
    }

    #[test]
    fn syntax_trap_fires_once() {
        let src = "signal on syntax\nsay 1 + 'x'\nsay 'skipped'\nsyntax:\nsay 'trapped' rc\nsay 1 + 'y'";
        let mut rt = interpreter();
        let err = rt.run_source(src).unwrap_err();
        assert_eq!(err.error, RexxError::BadArithmetic);
        assert_eq!(rt.take_output(), ["trapped 41"]);
    }

    #[test]
    fn novalue_trap() {
        let src = "signal on novalue\nsay undefined\nexit\nnovalue:\nsay 'novalue' condition('D')";
        assert_eq!(run(src), ["novalue UNDEFINED"]);
    }

    #[test]
    fn interpret_runs_in_current_frame() {
        assert_eq!(run("x = 2\ninterpret 'y = x * 3'\nsay y"), ["6"]);
    }

    #[test]
    fn interpret_depth_is_resource_exhaustion() {
        let mut rt = Interpreter::new(Config {
            capture_output: true,
            max_interpret_depth: 10,
            ..Config::default()
        });
        let err = rt
            .run_source("code = 'interpret code'\ninterpret code")
            .unwrap_err();
        assert_eq!(err.error, RexxError::ResourceExhausted);
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    }

    #[test]
    fn call_depth_is_resource_exhaustion() {
        let mut rt = Interpreter::new(Config {
            capture_output: true,
            max_call_depth: 40,
            ..Config::default()
        });
        let err = rt.run_source("call down\nexit\ndown: call down; return").unwrap_err();
        assert_eq!(err.error, RexxError::ResourceExhausted);
    }

    #[test]
    fn recursion_within_limit_works() {
        let src = "say fact(10)\nexit\nfact:\n  if arg(1) <= 1 then return 1\n  return arg(1) * fact(arg(1) - 1)";
        assert_eq!(run(src), ["3628800"]);
    }

    #[test]
    fn exit_value_becomes_status() {
        let outcome = interpreter().run_source("say 'a'\nexit 7\nsay 'b'").unwrap();
        assert_eq!(outcome.exit_status, 7);
        assert_eq!(outcome.output, ["a"]);
    }

    #[test]
    fn exit_inside_function_ends_run() {
        let outcome = interpreter()
            .run_source("say f()\nsay 'not reached'\nexit\nf: exit 3")
            .unwrap();
        assert_eq!(outcome.exit_status, 3);
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn echo_dispatch_sets_rc_and_result() {
        let src = "address echo\n'deploy app=web replicas=3'\nsay rc result.operation result.params.replicas result.words.1";
        assert_eq!(run(src), ["0 deploy 3 deploy"]);
    }

    #[test]
    fn temporary_address_leaves_target_unchanged() {
        assert_eq!(run("address echo 'ping'\nsay rc result.operation address()"), ["0 ping SYSTEM"]);
        assert_eq!(run("address echo\naddress system\naddress\nsay address()"), ["ECHO"]);
    }

    #[test]
    fn placeholders_substitute_set_variables() {
        let src = "address echo\nname = 'web'\nrec.port = 80\n'deploy {name} port={rec.port} {missing}'\nsay result.output";
        assert_eq!(run(src), ["deploy web port=80 {missing}"]);
    }

    #[test]
    fn unknown_target_fails_softly_with_rc_minus_3() {
        let src = "address nowhere\n'anything'\nsay rc result.success\nsay result.error";
        assert_eq!(
            run(src),
            ["-3 0", "unknown ADDRESS target 'NOWHERE'"]
        );
    }

    #[test]
    fn fail_fast_makes_dispatch_errors_fatal() {
        let mut rt = Interpreter::new(Config {
            capture_output: true,
            fail_fast: true,
            ..Config::default()
        });
        let err = rt.run_source("address nowhere\n'anything'").unwrap_err();
        assert_eq!(err.error.number(), 48);
        assert_eq!(err.category(), ErrorCategory::Dispatch);
    }

    #[test]
    fn error_and_failure_traps() {
        let mut rt = interpreter();
        rt.register_address(
            "FLAKY",
            Box::new(FnHandler::new(|request: &AddressRequest, _: &DispatchContext<'_>| {
                match request.operation() {
                    "soft" => Ok(HandlerReply::failed("soft failure").with_rc(2)),
                    _ => Err(HandlerError::Io(std::io::Error::other("gone"))),
                }
            })),
        );
        let src = "address flaky\nsignal on error\n'soft'\nsay 'skipped'\nerror:\nsay 'error' rc condition('C')\nsignal on failure\n'hard'\nexit\nfailure:\nsay 'failure' rc";
        let out = rt.run_source(src).unwrap().output;
        assert_eq!(out, ["error 2 ERROR", "failure -1"]);
    }

    #[test]
    fn method_dispatch_to_active_target() {
        let src = "address echo\nr = status('web', 2)\nsay r.operation r.args.1 rc";
        assert_eq!(run(src), ["STATUS web 0"]);
    }

    #[test]
    fn method_dispatch_not_used_for_default_target() {
        assert_eq!(run_err("say status('web')").error.number(), 43);
    }

    #[test]
    fn checkpoint_without_director_continues() {
        assert_eq!(run("say checkpoint('phase', {n: 1})"), ["CONTINUE"]);
    }

    #[test]
    fn cancelled_instance_halts_before_next_clause() {
        let mut rt = interpreter();
        rt.cancel_flag().cancel();
        let err = rt.run_source("say 'never'").unwrap_err();
        assert_eq!(err.error, RexxError::Halt);
        assert_eq!(err.category(), ErrorCategory::Halt);
        assert!(rt.take_output().is_empty());
    }

    #[test]
    fn heredoc_is_one_literal() {
        let src = "text = <<END\nfirst |> line\n  second\nEND\nsay text";
        assert_eq!(run(src), ["first |> line\n  second"]);
    }
}
