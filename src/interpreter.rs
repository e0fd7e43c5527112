//! The embedding surface: one [`Interpreter`] is one isolated instance.
//!
//! An instance owns its variables, ADDRESS registry, function table and
//! cancellation flag. Only the [`LibraryCache`] may be shared, so a library
//! resolved once is reused by every instance built from the same cache.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::address::{AddressHandler, AddressRegistry, EchoHandler, SystemHandler};
use crate::checkpoint::{CancelFlag, ProgressObserver, WorkerHandler};
use crate::config::Config;
use crate::env::Environment;
use crate::error::{RexxDiagnostic, RexxError, RexxResult};
use crate::eval::{Evaluator, Script};
use crate::parser::parse;
use crate::require::{Library, LibraryCache, LibraryCode, LoadedLibrary};
use crate::value::{NumericSettings, Value};

/// Evaluator stack reserved per level of CALL or INTERPRET nesting.
const STACK_PER_LEVEL: usize = 256 * 1024;
/// Stack for the outermost program, the parser and deep expressions.
const BASE_STACK: usize = 16 * 1024 * 1024;
const MAX_STACK: usize = 1024 * 1024 * 1024;

/// CALL plus INTERPRET levels a run may reach, bounded by [`MAX_STACK`].
pub(crate) fn nesting_levels(config: &Config) -> usize {
    config
        .max_call_depth
        .saturating_add(config.max_interpret_depth)
        .min((MAX_STACK - BASE_STACK) / STACK_PER_LEVEL)
}

fn evaluator_stack_size(config: &Config) -> usize {
    nesting_levels(config) * STACK_PER_LEVEL + BASE_STACK
}

/// A function made callable by REQUIRE.
#[derive(Debug, Clone)]
pub(crate) struct Export {
    pub library: String,
    /// Name as the library declared it.
    pub name: String,
    pub code: LibraryCode,
}

/// What a completed run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Numeric EXIT value, 0 when the program ended without one.
    pub exit_status: i32,
    /// SAY lines, when output is captured.
    pub output: Vec<String>,
    /// The EXIT or RETURN value, if any.
    pub result: Option<Value>,
}

pub struct Interpreter {
    pub(crate) config: Config,
    pub(crate) env: Environment,
    pub(crate) settings: NumericSettings,
    pub(crate) registry: AddressRegistry,
    pub(crate) cache: LibraryCache,
    /// Host libraries REQUIRE may load, keyed by upper-cased name.
    pub(crate) natives: HashMap<String, Arc<dyn Library>>,
    pub(crate) functions: HashMap<String, Export>,
    loaded: HashSet<String>,
    pub(crate) observer: Option<Arc<dyn ProgressObserver>>,
    pub(crate) cancel: CancelFlag,
    output: Vec<String>,
    args: Vec<Value>,
}

impl Interpreter {
    /// A fresh instance with the built-in `SYSTEM`, `ECHO` and `WORKER`
    /// targets and `config.default_address` active.
    pub fn new(config: Config) -> Self {
        let mut registry = AddressRegistry::new();
        registry.register("SYSTEM", Box::new(SystemHandler::new(!config.capture_output)));
        registry.register("ECHO", Box::new(EchoHandler));
        registry.register("WORKER", Box::new(WorkerHandler));
        Self {
            env: Environment::new(&config.default_address),
            settings: NumericSettings::default(),
            registry,
            cache: LibraryCache::new(),
            natives: HashMap::new(),
            functions: HashMap::new(),
            loaded: HashSet::new(),
            observer: None,
            cancel: CancelFlag::new(),
            output: Vec::new(),
            args: Vec::new(),
            config,
        }
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share resolved libraries with other instances.
    #[must_use]
    pub fn with_library_cache(mut self, cache: LibraryCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn library_cache(&self) -> &LibraryCache {
        &self.cache
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn set_progress_observer(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observer = Some(observer);
    }

    /// Add or replace an ADDRESS target.
    pub fn register_address(&mut self, name: &str, handler: Box<dyn AddressHandler>) {
        self.registry.register(name, handler);
    }

    pub fn has_address(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Make a host library available to `REQUIRE`. Nothing is exported
    /// until a script requires it.
    pub fn register_library(&mut self, library: Arc<dyn Library>) {
        let name = library.detect().name.to_uppercase();
        tracing::debug!(library = %name, "host library available");
        self.natives.insert(name, library);
    }

    /// Set a variable in the main frame before a run.
    pub fn set_var(&mut self, name: &str, value: Value) {
        self.env.set(&name.to_uppercase(), value);
    }

    /// Read a variable after a run. Compound names are resolved without
    /// substitution, so `RESULT.COUNT` reads the `COUNT` field.
    pub fn get_var(&self, name: &str) -> Option<Value> {
        let name = name.to_uppercase();
        match name.split_once('.') {
            Some((stem, tail)) if !stem.is_empty() && !tail.is_empty() => self
                .env
                .is_compound_set(stem, tail)
                .then(|| self.env.get_compound(stem, tail)),
            _ => self.env.lookup(name.trim_end_matches('.')).cloned(),
        }
    }

    /// Arguments seen by `ARG()` and `PARSE ARG` in the main program.
    pub fn set_args(&mut self, args: Vec<Value>) {
        self.args = args;
    }

    /// Names of the libraries this instance has registered.
    pub fn loaded_libraries(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.loaded.iter().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Function names exported into this instance by REQUIRE.
    pub fn exported_functions(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn run_source(&mut self, source: &str) -> RexxResult<RunOutcome> {
        self.run_script(source, None)
    }

    /// Parse and run `source`. `path` anchors the REQUIRE search. Captured
    /// output stays available through [`Interpreter::take_output`] when the
    /// run fails.
    ///
    /// The run happens on a dedicated thread whose stack fits the configured
    /// CALL and INTERPRET limits, so reaching a limit is Error 5 on any
    /// caller thread.
    pub fn run_script(&mut self, source: &str, path: Option<PathBuf>) -> RexxResult<RunOutcome> {
        let stack_size = evaluator_stack_size(&self.config);
        std::thread::scope(|scope| {
            let spawned = std::thread::Builder::new()
                .name("rexx-eval".into())
                .stack_size(stack_size)
                .spawn_scoped(scope, || self.run_on_current_thread(source, path));
            match spawned {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic)),
                Err(e) => Err(RexxDiagnostic::new(RexxError::ResourceExhausted)
                    .with_detail(format!("cannot reserve {stack_size} bytes of stack: {e}"))),
            }
        })
    }

    fn run_on_current_thread(&mut self, source: &str, path: Option<PathBuf>) -> RexxResult<RunOutcome> {
        let program = parse(source)?;
        let script = Arc::new(Script::new(program, path));
        let args = self.args.clone();
        tracing::debug!(clauses = script.program.clauses.len(), "run started");
        let result = Evaluator::new(self).run(&script, args)?;
        let exit_status = result
            .as_ref()
            .and_then(|v| v.to_text().trim().parse::<i32>().ok())
            .unwrap_or(0);
        tracing::debug!(exit_status, "run finished");
        Ok(RunOutcome {
            exit_status,
            output: self.take_output(),
            result,
        })
    }

    /// Drain captured SAY output.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn say(&mut self, line: String) {
        if self.config.capture_output {
            self.output.push(line);
        } else {
            println!("{line}");
        }
    }

    pub(crate) fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains(&name.to_uppercase())
    }

    /// Register one resolved library: exports into the function table and,
    /// for host libraries, its ADDRESS target. A second registration of the
    /// same library is a no-op.
    pub(crate) fn install_library(&mut self, library: LoadedLibrary) {
        let LoadedLibrary { descriptor, code } = library;
        if !self.loaded.insert(descriptor.name.to_uppercase()) {
            return;
        }
        for export in &descriptor.exports {
            let key = export.to_uppercase();
            let entry = Export {
                library: descriptor.name.clone(),
                name: export.clone(),
                code: code.clone(),
            };
            if let Some(previous) = self.functions.insert(key.clone(), entry) {
                tracing::warn!(
                    function = %key,
                    previous = %previous.library,
                    library = %descriptor.name,
                    "function export replaced"
                );
            }
        }
        if let (LibraryCode::Native(native), Some(target)) = (&code, &descriptor.address_target) {
            match native.address_handler() {
                Some(handler) => self.registry.register(target, handler),
                None => tracing::warn!(
                    library = %descriptor.name,
                    address = %target,
                    "library declares an ADDRESS target but provides no handler"
                ),
            }
        }
        tracing::info!(
            library = %descriptor.name,
            exports = descriptor.exports.len(),
            "library registered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{
        AddressRequest, DispatchContext, FnHandler, HandlerError, HandlerReply,
    };
    use crate::require::LibraryDescriptor;

    fn captured() -> Interpreter {
        Interpreter::new(Config {
            capture_output: true,
            ..Config::default()
        })
    }

    /// Host library with two string functions and a `KV` target.
    struct Strings;

    impl Library for Strings {
        fn detect(&self) -> LibraryDescriptor {
            let mut descriptor =
                LibraryDescriptor::new("strings").with_exports(["shout", "joined"]);
            descriptor.address_target = Some("KV".into());
            descriptor
        }

        fn call(&self, function: &str, args: &[Value]) -> Result<Value, HandlerError> {
            match function {
                "shout" => Ok(Value::from(format!("{}!", args[0].to_text().to_uppercase()))),
                "joined" => Ok(Value::from(
                    args.iter().map(Value::to_text).collect::<Vec<_>>().join("-"),
                )),
                other => Err(HandlerError::UnsupportedMethod(other.to_string())),
            }
        }

        fn address_handler(&self) -> Option<Box<dyn AddressHandler>> {
            Some(Box::new(FnHandler::new(
                |request: &AddressRequest, _: &DispatchContext<'_>| {
                    Ok(HandlerReply::ok().with_field("count", Value::from(request.operation().len())))
                },
            )))
        }
    }

    #[test]
    fn require_registers_exports_and_address_target() {
        let mut rt = captured();
        rt.register_library(Arc::new(Strings));
        assert!(rt.exported_functions().is_empty());
        let out = rt
            .run_source("require 'strings'\nsay shout('hi') joined(1, 2)\naddress kv 'abc'\nsay rc result.count")
            .unwrap()
            .output;
        assert_eq!(out, ["HI! 1-2", "0 3"]);
        assert_eq!(rt.exported_functions(), ["JOINED", "SHOUT"]);
        assert!(rt.has_address("kv"));
    }

    #[test]
    fn require_twice_registers_once() {
        let mut rt = captured();
        rt.register_library(Arc::new(Strings));
        rt.run_source("require 'strings'\nrequire 'STRINGS'").unwrap();
        assert_eq!(rt.loaded_libraries(), ["STRINGS"]);
        assert_eq!(rt.library_cache().len(), 1);
    }

    #[test]
    fn unknown_library_is_a_resolution_error() {
        let err = captured().run_source("require 'nowhere_to_be_found'").unwrap_err();
        assert_eq!(err.error, RexxError::LibraryNotFound);
    }

    #[test]
    fn cache_is_shared_but_registrations_are_not() {
        let mut first = captured();
        first.register_library(Arc::new(Strings));
        first.run_source("require 'strings'").unwrap();

        let mut second = captured().with_library_cache(first.library_cache().clone());
        assert!(second.exported_functions().is_empty());
        second.run_source("require 'strings'\nsay shout('x')").unwrap();
        assert_eq!(second.exported_functions(), ["JOINED", "SHOUT"]);
    }

    #[test]
    fn variables_cross_the_embedding_boundary() {
        let mut rt = captured();
        rt.set_var("greeting", Value::from("hello"));
        rt.run_source("reply = greeting 'world'\nrec.count = 3").unwrap();
        assert_eq!(rt.get_var("reply"), Some(Value::from("hello world")));
        assert_eq!(rt.get_var("rec.count"), Some(Value::from("3")));
        assert_eq!(rt.get_var("missing"), None);
    }

    #[test]
    fn main_program_arguments() {
        let mut rt = captured();
        rt.set_args(vec![Value::from("alpha beta")]);
        let out = rt.run_source("parse arg first second\nsay second first arg()").unwrap().output;
        assert_eq!(out, ["beta alpha 1"]);
    }

    #[test]
    fn exit_result_is_returned() {
        let outcome = captured().run_source("exit 'done'").unwrap();
        assert_eq!(outcome.exit_status, 0);
        assert_eq!(outcome.result, Some(Value::from("done")));
    }

    #[test]
    fn parse_errors_surface_before_running() {
        let mut rt = captured();
        let err = rt.run_source("say 'before'\nsay 'unterminated").unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Parse);
        assert!(rt.take_output().is_empty());
    }
}
