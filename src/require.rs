//! REQUIRE: library descriptors, dependency resolution and the shared cache.
//!
//! [`resolve`] walks declared dependencies depth-first and returns the
//! libraries in registration order, dependencies first. It is pure over its
//! [`DescriptorSource`]; [`load`] wraps it with the places libraries come
//! from (the cache, host-registered natives, source files on the search
//! path) and only publishes to the [`LibraryCache`] once the whole batch has
//! resolved, so a failed REQUIRE leaves no trace.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::address::{AddressHandler, HandlerError};
use crate::error::{RexxDiagnostic, RexxError};
use crate::external::{SearchPath, SourceLibrary};
use crate::value::Value;

/// Library metadata: identity, what it needs and what it provides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Libraries to register first, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Function names merged into the caller's function table.
    #[serde(default)]
    pub exports: Vec<String>,
    /// ADDRESS target the library provides, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_target: Option<String>,
}

impl LibraryDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            dependencies: Vec::new(),
            exports: Vec::new(),
            address_target: None,
        }
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_exports<I, S>(mut self, exports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exports = exports.into_iter().map(Into::into).collect();
        self
    }

    fn key(&self) -> String {
        self.name.to_uppercase()
    }
}

/// A library implemented by the host.
pub trait Library: Send + Sync {
    fn detect(&self) -> LibraryDescriptor;

    /// Run one of the exported functions.
    fn call(&self, function: &str, args: &[Value]) -> Result<Value, HandlerError>;

    /// Handler for the descriptor's `address_target`.
    fn address_handler(&self) -> Option<Box<dyn AddressHandler>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("library '{0}' not found")]
    NotFound(String),
    #[error("dependency cycle {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("library '{name}' could not be loaded: {message}")]
    Invalid { name: String, message: String },
}

impl From<ResolveError> for RexxDiagnostic {
    fn from(err: ResolveError) -> Self {
        let error = match err {
            ResolveError::Cycle(_) => RexxError::LibraryCycle,
            ResolveError::NotFound(_) | ResolveError::Invalid { .. } => RexxError::LibraryNotFound,
        };
        RexxDiagnostic::new(error).with_detail(err.to_string())
    }
}

/// Where [`resolve`] gets a descriptor for a library name.
pub trait DescriptorSource {
    fn descriptor(&mut self, name: &str) -> Result<LibraryDescriptor, ResolveError>;
}

impl<F> DescriptorSource for F
where
    F: FnMut(&str) -> Result<LibraryDescriptor, ResolveError>,
{
    fn descriptor(&mut self, name: &str) -> Result<LibraryDescriptor, ResolveError> {
        self(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    Visiting,
    Done,
}

/// Resolve `module_ref` and its transitive dependencies into registration
/// order. Names compare case-insensitively. Reaching a library that is still
/// being visited is a cycle and fails the whole batch.
pub fn resolve(
    module_ref: &str,
    source: &mut impl DescriptorSource,
) -> Result<Vec<LibraryDescriptor>, ResolveError> {
    let mut states = HashMap::new();
    let mut path = Vec::new();
    let mut order = Vec::new();
    visit(module_ref, source, &mut states, &mut path, &mut order)?;
    Ok(order)
}

fn visit(
    name: &str,
    source: &mut impl DescriptorSource,
    states: &mut HashMap<String, Visit>,
    path: &mut Vec<String>,
    order: &mut Vec<LibraryDescriptor>,
) -> Result<(), ResolveError> {
    let key = name.to_uppercase();
    match states.get(&key).copied().unwrap_or(Visit::Unvisited) {
        Visit::Done => return Ok(()),
        Visit::Visiting => {
            let start = path
                .iter()
                .position(|p| p.eq_ignore_ascii_case(name))
                .unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_string());
            return Err(ResolveError::Cycle(cycle));
        }
        Visit::Unvisited => {}
    }
    states.insert(key.clone(), Visit::Visiting);
    path.push(name.to_string());
    let descriptor = source.descriptor(name)?;
    for dep in &descriptor.dependencies {
        visit(dep, source, states, path, order)?;
    }
    path.pop();
    states.insert(key, Visit::Done);
    order.push(descriptor);
    Ok(())
}

/// The code behind a loaded library.
#[derive(Clone)]
pub enum LibraryCode {
    Native(Arc<dyn Library>),
    Source(Arc<SourceLibrary>),
}

impl fmt::Debug for LibraryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => f.write_str("Native"),
            Self::Source(lib) => f.debug_tuple("Source").field(&lib.path).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedLibrary {
    pub descriptor: LibraryDescriptor,
    pub code: LibraryCode,
}

/// Resolved libraries, shareable between instances.
///
/// Entries are only ever added, and only if absent, so two instances
/// loading the same library concurrently end up with the same entry.
#[derive(Clone, Default)]
pub struct LibraryCache {
    entries: Arc<Mutex<HashMap<String, LoadedLibrary>>>,
}

impl LibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<LoadedLibrary> {
        self.entries.lock().get(&name.to_uppercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(&name.to_uppercase())
    }

    /// Insert `library` unless its name is taken; returns the cached entry.
    pub fn insert_if_absent(&self, library: LoadedLibrary) -> LoadedLibrary {
        self.entries
            .lock()
            .entry(library.descriptor.key())
            .or_insert(library)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for LibraryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        let mut names: Vec<_> = entries.keys().collect();
        names.sort_unstable();
        f.debug_struct("LibraryCache").field("libraries", &names).finish()
    }
}

struct Loader<'a> {
    cache: &'a LibraryCache,
    natives: &'a HashMap<String, Arc<dyn Library>>,
    search: &'a SearchPath,
    found: HashMap<String, LoadedLibrary>,
}

impl DescriptorSource for Loader<'_> {
    fn descriptor(&mut self, name: &str) -> Result<LibraryDescriptor, ResolveError> {
        let key = name.to_uppercase();
        let library = if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(library = %key, "library cache hit");
            cached
        } else if let Some(native) = self.natives.get(&key) {
            LoadedLibrary {
                descriptor: native.detect(),
                code: LibraryCode::Native(Arc::clone(native)),
            }
        } else {
            let source = SourceLibrary::find(name, self.search)?
                .ok_or_else(|| ResolveError::NotFound(name.to_string()))?;
            LoadedLibrary {
                descriptor: source.descriptor.clone(),
                code: LibraryCode::Source(Arc::new(source)),
            }
        };
        let descriptor = library.descriptor.clone();
        self.found.insert(key, library);
        Ok(descriptor)
    }
}

/// Resolve `module_ref` against the cache, `natives` and `search`, then
/// publish the batch to the cache. Returns the libraries dependency-first.
pub fn load(
    module_ref: &str,
    cache: &LibraryCache,
    natives: &HashMap<String, Arc<dyn Library>>,
    search: &SearchPath,
) -> Result<Vec<LoadedLibrary>, ResolveError> {
    let mut loader = Loader {
        cache,
        natives,
        search,
        found: HashMap::new(),
    };
    let order = resolve(module_ref, &mut loader)?;
    tracing::debug!(
        library = module_ref,
        order = ?order.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        "resolved REQUIRE"
    );
    Ok(order
        .iter()
        .filter_map(|descriptor| loader.found.remove(&descriptor.name.to_uppercase()))
        .map(|library| cache.insert_if_absent(library))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogue(
        entries: &[(&str, &[&str])],
    ) -> impl FnMut(&str) -> Result<LibraryDescriptor, ResolveError> {
        let map: HashMap<String, LibraryDescriptor> = entries
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_uppercase(),
                    LibraryDescriptor::new(*name).with_dependencies(deps.iter().copied()),
                )
            })
            .collect();
        move |name: &str| {
            map.get(&name.to_uppercase())
                .cloned()
                .ok_or_else(|| ResolveError::NotFound(name.to_string()))
        }
    }

    fn names(order: &[LibraryDescriptor]) -> Vec<&str> {
        order.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn dependencies_come_first() {
        let mut source = catalogue(&[
            ("app", &["http", "json"]),
            ("http", &["json"]),
            ("json", &[]),
        ]);
        let order = resolve("app", &mut source).unwrap();
        assert_eq!(names(&order), ["json", "http", "app"]);
    }

    #[test]
    fn diamond_is_visited_once() {
        let mut source = catalogue(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &["D"]), ("d", &[])]);
        let order = resolve("A", &mut source).unwrap();
        assert_eq!(names(&order), ["d", "b", "c", "a"]);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let mut source = catalogue(&[("a", &["b"]), ("b", &["a"])]);
        let err = resolve("a", &mut source).unwrap_err();
        assert_eq!(err, ResolveError::Cycle(vec!["a".into(), "b".into(), "a".into()]));
        assert_eq!(err.to_string(), "dependency cycle a -> b -> a");
    }

    #[test]
    fn missing_dependency_fails() {
        let mut source = catalogue(&[("a", &["ghost"])]);
        assert_eq!(
            resolve("a", &mut source).unwrap_err(),
            ResolveError::NotFound("ghost".into())
        );
    }

    #[test]
    fn errors_become_diagnostics() {
        let diag: RexxDiagnostic = ResolveError::Cycle(vec!["a".into(), "a".into()]).into();
        assert_eq!(diag.error, RexxError::LibraryCycle);
        let diag: RexxDiagnostic = ResolveError::NotFound("x".into()).into();
        assert_eq!(diag.error, RexxError::LibraryNotFound);
    }

    #[test]
    fn descriptor_serde_defaults() {
        let descriptor: LibraryDescriptor =
            serde_json::from_str(r#"{"name": "strings", "exports": ["PAD"]}"#).unwrap();
        assert_eq!(descriptor.exports, ["PAD"]);
        assert!(descriptor.dependencies.is_empty());
        assert_eq!(descriptor.address_target, None);
        let text = serde_json::to_string(&descriptor).unwrap();
        assert!(!text.contains("address_target"));
    }

    struct Math;

    impl Library for Math {
        fn detect(&self) -> LibraryDescriptor {
            LibraryDescriptor::new("math").with_exports(["SQUARE"])
        }

        fn call(&self, _function: &str, args: &[Value]) -> Result<Value, HandlerError> {
            let n = args.first().and_then(Value::to_decimal).unwrap_or_default();
            Ok(Value::Number(&n * &n))
        }
    }

    #[test]
    fn load_publishes_once_and_reuses_cache() {
        let cache = LibraryCache::new();
        let mut natives: HashMap<String, Arc<dyn Library>> = HashMap::new();
        natives.insert("MATH".into(), Arc::new(Math));
        let search = SearchPath::default();

        let first = load("math", &cache, &natives, &search).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(cache.len(), 1);

        natives.clear();
        let second = load("MATH", &cache, &natives, &search).unwrap();
        assert_eq!(second[0].descriptor.exports, ["SQUARE"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_load_leaves_cache_untouched() {
        let cache = LibraryCache::new();
        let natives = HashMap::new();
        let err = load("nowhere", &cache, &natives, &SearchPath::default()).unwrap_err();
        assert_eq!(err, ResolveError::NotFound("nowhere".into()));
        assert!(cache.is_empty());
    }
}
