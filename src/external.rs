//! REXX source libraries: `.rexx`/`.rex` files found on the search path.
//!
//! `REQUIRE "name"` with no host library of that name looks for a file in:
//! 1. the directory of the requiring script
//! 2. the configured library path (`REXXPATH` and `library_path`)
//! 3. the current working directory
//!
//! Candidate filenames for `name`: `name.rexx`, `name.rex`, then the same in
//! lower and upper case. A name that already carries one of those
//! extensions is tried as written.
//!
//! The descriptor comes from the file itself: its top-level `REQUIRE` clauses
//! with literal names are its dependencies and its labels are its exports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ast::{ClauseKind, Expr};
use crate::eval::Script;
use crate::parser::parse;
use crate::require::{LibraryDescriptor, ResolveError};

const EXTENSIONS: [&str; 2] = ["rexx", "rex"];

/// Ordered list of directories to search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new(source_dir: Option<&Path>, library_path: &[PathBuf]) -> Self {
        let mut dirs: Vec<PathBuf> = source_dir.map(Path::to_path_buf).into_iter().collect();
        dirs.extend(library_path.iter().filter(|dir| dir.is_dir()).cloned());
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        dirs.dedup();
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// First existing file for library `name`.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let candidates = candidates(name);
        self.dirs
            .iter()
            .flat_map(|dir| candidates.iter().map(move |file| dir.join(file)))
            .find(|path| path.is_file())
    }
}

fn candidates(name: &str) -> Vec<String> {
    let has_extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext));
    if has_extension {
        return vec![name.to_string()];
    }
    let mut out = Vec::new();
    for stem in [name.to_string(), name.to_lowercase(), name.to_uppercase()] {
        for ext in EXTENSIONS {
            let file = format!("{stem}.{ext}");
            if !out.contains(&file) {
                out.push(file);
            }
        }
    }
    out
}

/// A parsed library file.
#[derive(Debug)]
pub struct SourceLibrary {
    pub descriptor: LibraryDescriptor,
    pub path: PathBuf,
    pub script: Arc<Script>,
}

impl SourceLibrary {
    /// Search for `name` and load it. `Ok(None)` when no file matches.
    pub fn find(name: &str, search: &SearchPath) -> Result<Option<Self>, ResolveError> {
        let Some(path) = search.find(name) else {
            return Ok(None);
        };
        let source = std::fs::read_to_string(&path).map_err(|e| ResolveError::Invalid {
            name: name.to_string(),
            message: format!("cannot read '{}': {e}", path.display()),
        })?;
        let path = path.canonicalize().unwrap_or(path);
        tracing::debug!(library = name, path = %path.display(), "loading source library");
        Self::from_source(name, path, &source).map(Some)
    }

    pub fn from_source(name: &str, path: PathBuf, source: &str) -> Result<Self, ResolveError> {
        let program = parse(source).map_err(|diag| ResolveError::Invalid {
            name: name.to_string(),
            message: diag.to_string(),
        })?;

        let mut descriptor = LibraryDescriptor::new(name);
        for clause in &program.clauses {
            match &clause.kind {
                ClauseKind::Require(Expr::StringLit(dep)) => descriptor.dependencies.push(dep.clone()),
                ClauseKind::Label(label) if !descriptor.exports.contains(label) => {
                    descriptor.exports.push(label.clone());
                }
                _ => {}
            }
        }

        Ok(Self {
            descriptor,
            script: Arc::new(Script::new(program, Some(path.clone()))),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_names() {
        assert_eq!(
            candidates("Str"),
            ["Str.rexx", "Str.rex", "str.rexx", "str.rex", "STR.rexx", "STR.rex"]
        );
        assert_eq!(candidates("lib/util.rex"), ["lib/util.rex"]);
    }

    #[test]
    fn descriptor_from_requires_and_labels() {
        let source = "REQUIRE 'json'\nREQUIRE 'http'\nexit\npad: return arg(1)\ntrim:\n  return 1\n";
        let lib = SourceLibrary::from_source("strings", PathBuf::from("strings.rexx"), source).unwrap();
        assert_eq!(lib.descriptor.name, "strings");
        assert_eq!(lib.descriptor.dependencies, ["json", "http"]);
        assert_eq!(lib.descriptor.exports, ["PAD", "TRIM"]);
    }

    #[test]
    fn nested_requires_are_not_dependencies() {
        let source = "if 0 then REQUIRE 'maybe'\nf: return 1\n";
        let lib = SourceLibrary::from_source("x", PathBuf::from("x.rexx"), source).unwrap();
        assert!(lib.descriptor.dependencies.is_empty());
    }

    #[test]
    fn parse_errors_are_invalid_libraries() {
        let err = SourceLibrary::from_source("bad", PathBuf::from("bad.rexx"), "say 'open").unwrap_err();
        assert!(matches!(err, ResolveError::Invalid { name, .. } if name == "bad"));
    }

    #[test]
    fn search_prefers_source_dir() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join("util.rexx"), "a: return 1\n").unwrap();
        std::fs::write(second.path().join("util.rexx"), "b: return 2\n").unwrap();
        let search = SearchPath::new(Some(first.path()), &[second.path().to_path_buf()]);
        let lib = SourceLibrary::find("util", &search).unwrap().unwrap();
        assert_eq!(lib.descriptor.exports, ["A"]);
        assert!(SourceLibrary::find("absent", &search).unwrap().is_none());
    }
}
