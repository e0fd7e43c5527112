//! Variable store: one global frame plus a stack of call frames.
//!
//! Every CALL gets a fresh, empty frame: callers' locals are never inherited.
//! The global frame is the only state visible across frames. Names that live
//! there (`RC`, `RESULT`, and anything declared with `GLOBAL`) are read and
//! written in the global frame from every call level; any other name is
//! written to the current frame and read from it first, falling back to the
//! global frame.
//!
//! Names arrive canonical (upper-case); the lexer does that once.

use std::collections::{HashMap, HashSet};

use crate::value::{ObjectMap, Value};

/// Status variable rewritten after every dispatch.
pub const RC: &str = "RC";
/// Structured payload of the last dispatch or CALL.
pub const RESULT: &str = "RESULT";

#[derive(Debug, Clone)]
pub struct Environment {
    global: Frame,
    /// Call frames. The main program runs in the first one.
    frames: Vec<Frame>,
    global_names: HashSet<String>,
    address: AddressState,
    condition: Option<ConditionInfoData>,
}

/// A single variable frame.
#[derive(Debug, Clone, Default)]
struct Frame {
    vars: HashMap<String, Value>,
    /// `stem. = value` defaults, keyed by stem name.
    stem_defaults: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
struct AddressState {
    current: String,
    previous: String,
}

/// Information about the most recently trapped condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionInfoData {
    pub condition: String,
    pub description: String,
    pub instruction: String,
    pub status: String,
}

impl Environment {
    pub fn new(default_address: &str) -> Self {
        let mut global_names = HashSet::new();
        global_names.insert(RC.to_string());
        global_names.insert(RESULT.to_string());
        Self {
            global: Frame::default(),
            frames: vec![Frame::default()],
            global_names,
            address: AddressState {
                current: default_address.to_uppercase(),
                previous: default_address.to_uppercase(),
            },
            condition: None,
        }
    }

    /// Look a variable up without the REXX unset-name fallback.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        if self.global_names.contains(name) {
            return self.global.vars.get(name);
        }
        self.current().vars.get(name).or_else(|| self.global.vars.get(name))
    }

    /// Get a simple variable's value. In REXX, an unset variable
    /// returns its own name.
    pub fn get(&self, name: &str) -> Value {
        self.lookup(name)
            .cloned()
            .unwrap_or_else(|| Value::string(name))
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.owning_frame_mut(name).vars.insert(name.to_string(), value);
    }

    /// DROP a variable: restore it to its uninitialized state.
    pub fn drop(&mut self, name: &str) {
        let frame = self.owning_frame_mut(name);
        frame.vars.remove(name);
        frame.stem_defaults.remove(name);
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// `GLOBAL name`: from now on `name` lives in the global frame for
    /// every call level. A local value, if any, moves there.
    pub fn declare_global(&mut self, name: &str) {
        if self.global_names.insert(name.to_string())
            && let Some(local) = self.current_mut().vars.remove(name)
        {
            self.global.vars.entry(name.to_string()).or_insert(local);
        }
    }

    pub fn is_global(&self, name: &str) -> bool {
        self.global_names.contains(name)
    }

    /// Get a compound variable `stem.tail` with an already-resolved tail.
    /// Objects are searched by key, arrays by 1-based index (`stem.0` is
    /// the element count). Unset compounds fall back to the stem default,
    /// then to their own name.
    pub fn get_compound(&self, stem: &str, tail: &str) -> Value {
        self.lookup_compound(stem, tail).unwrap_or_else(|| {
            self.stem_default(stem)
                .cloned()
                .unwrap_or_else(|| Value::string(format!("{stem}.{tail}")))
        })
    }

    pub fn is_compound_set(&self, stem: &str, tail: &str) -> bool {
        self.lookup_compound(stem, tail).is_some()
    }

    fn lookup_compound(&self, stem: &str, tail: &str) -> Option<Value> {
        descend(self.lookup(stem)?, tail)
    }

    fn stem_default(&self, stem: &str) -> Option<&Value> {
        if self.global_names.contains(stem) {
            return self.global.stem_defaults.get(stem);
        }
        self.current()
            .stem_defaults
            .get(stem)
            .or_else(|| self.global.stem_defaults.get(stem))
    }

    /// Set a compound variable. Arrays accept in-range indexes and one-past
    /// the end (append); any other tail turns the array into an object keyed
    /// by position. Non-container values are replaced by a fresh object.
    pub fn set_compound(&mut self, stem: &str, tail: &str, value: Value) {
        let frame = self.owning_frame_mut(stem);
        let slot = frame
            .vars
            .entry(stem.to_string())
            .or_insert_with(|| Value::Object(ObjectMap::new()));

        if let Value::Array(items) = &mut *slot {
            match tail.trim().parse::<usize>() {
                Ok(index) if index >= 1 && index <= items.len() => {
                    items[index - 1] = value;
                    return;
                }
                Ok(index) if index == items.len() + 1 => {
                    items.push(value);
                    return;
                }
                _ => {
                    let map: ObjectMap = std::mem::take(items)
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| ((i + 1).to_string(), v))
                        .collect();
                    *slot = Value::Object(map);
                }
            }
        }

        if !matches!(*slot, Value::Object(_)) {
            *slot = Value::Object(ObjectMap::new());
        }
        if let Value::Object(map) = &mut *slot {
            let key = map
                .keys()
                .find(|k| k.eq_ignore_ascii_case(tail))
                .cloned()
                .unwrap_or_else(|| tail.to_string());
            map.insert(key, value);
        }
    }

    /// `stem. = value`: resets the stem and sets its default.
    pub fn set_stem_default(&mut self, stem: &str, value: Value) {
        let frame = self.owning_frame_mut(stem);
        frame
            .vars
            .insert(stem.to_string(), Value::Object(ObjectMap::new()));
        frame.stem_defaults.insert(stem.to_string(), value);
    }

    /// CALL: push a fresh, empty frame.
    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    /// RETURN: discard the current frame. The main program's frame is never popped.
    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    // ── ADDRESS environment ─────────────────────────────────────────

    pub fn address(&self) -> &str {
        &self.address.current
    }

    pub fn previous_address(&self) -> &str {
        &self.address.previous
    }

    /// `ADDRESS name`: the old target becomes the previous one.
    pub fn set_address(&mut self, name: &str) {
        let new = name.to_uppercase();
        self.address.previous = std::mem::replace(&mut self.address.current, new);
    }

    /// Bare `ADDRESS`: swap current and previous.
    pub fn swap_address(&mut self) {
        std::mem::swap(&mut self.address.current, &mut self.address.previous);
    }

    // ── condition information ───────────────────────────────────────

    pub fn set_condition_info(&mut self, info: ConditionInfoData) {
        self.condition = Some(info);
    }

    pub fn condition_info(&self) -> Option<&ConditionInfoData> {
        self.condition.as_ref()
    }

    fn current(&self) -> &Frame {
        self.frames.last().expect("environment has no frames")
    }

    fn current_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("environment has no frames")
    }

    fn owning_frame_mut(&mut self, name: &str) -> &mut Frame {
        if self.global_names.contains(name) {
            &mut self.global
        } else {
            self.current_mut()
        }
    }
}

/// Resolve `tail` inside a container. A whole tail that names an element
/// wins; otherwise each dotted part selects one level of nesting.
fn descend(value: &Value, tail: &str) -> Option<Value> {
    if let Some(found) = element(value, tail) {
        return Some(found);
    }
    let (head, rest) = tail.split_once('.')?;
    descend(&element(value, head)?, rest)
}

fn element(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(_) => value.field(key).cloned(),
        Value::Array(items) => {
            let index: usize = key.trim().parse().ok()?;
            if index == 0 {
                Some(Value::from(items.len()))
            } else {
                items.get(index - 1).cloned()
            }
        }
        _ => None,
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new("SYSTEM")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_returns_name() {
        let env = Environment::default();
        assert_eq!(env.get("FOO").to_text(), "FOO");
    }

    #[test]
    fn set_and_get() {
        let mut env = Environment::default();
        env.set("NAME", Value::string("Alice"));
        assert_eq!(env.get("NAME").to_text(), "Alice");
    }

    #[test]
    fn call_frame_is_fresh_and_isolated() {
        let mut env = Environment::default();
        env.set("X", Value::string("1"));
        env.push_frame();
        assert_eq!(env.get("X").to_text(), "X");
        env.set("X", Value::string("2"));
        assert_eq!(env.get("X").to_text(), "2");
        env.pop_frame();
        assert_eq!(env.get("X").to_text(), "1");
    }

    #[test]
    fn rc_and_result_are_shared_across_frames() {
        let mut env = Environment::default();
        env.push_frame();
        env.set(RC, Value::from(3i64));
        env.pop_frame();
        assert_eq!(env.get(RC).to_text(), "3");
    }

    #[test]
    fn declared_globals_cross_frames() {
        let mut env = Environment::default();
        env.set("COUNTER", Value::from(1i64));
        env.declare_global("COUNTER");
        env.push_frame();
        assert_eq!(env.get("COUNTER").to_text(), "1");
        env.set("COUNTER", Value::from(2i64));
        env.pop_frame();
        assert_eq!(env.get("COUNTER").to_text(), "2");
    }

    #[test]
    fn stem_variables() {
        let mut env = Environment::default();
        env.set_compound("ARR", "1", Value::string("first"));
        env.set_compound("ARR", "2", Value::string("second"));
        assert_eq!(env.get_compound("ARR", "1").to_text(), "first");
        assert_eq!(env.get_compound("ARR", "2").to_text(), "second");
        assert_eq!(env.get_compound("ARR", "3").to_text(), "ARR.3");
    }

    #[test]
    fn stem_default() {
        let mut env = Environment::default();
        env.set_stem_default("COUNT", Value::string("0"));
        assert_eq!(env.get_compound("COUNT", "ANYTHING").to_text(), "0");
        env.set_compound("COUNT", "SPECIAL", Value::string("99"));
        assert_eq!(env.get_compound("COUNT", "SPECIAL").to_text(), "99");
        assert_eq!(env.get_compound("COUNT", "OTHER").to_text(), "0");
    }

    #[test]
    fn arrays_index_from_one_and_report_length_at_zero() {
        let mut env = Environment::default();
        env.set(
            "LIST",
            Value::Array(vec![Value::string("a"), Value::string("b")]),
        );
        assert_eq!(env.get_compound("LIST", "1").to_text(), "a");
        assert_eq!(env.get_compound("LIST", "0").to_text(), "2");
        env.set_compound("LIST", "3", Value::string("c"));
        assert_eq!(env.get_compound("LIST", "0").to_text(), "3");
        env.set_compound("LIST", "NAME", Value::string("letters"));
        assert_eq!(env.get_compound("LIST", "2").to_text(), "b");
        assert_eq!(env.get_compound("LIST", "NAME").to_text(), "letters");
    }

    #[test]
    fn object_fields_match_case_insensitively() {
        let mut env = Environment::default();
        let mut map = ObjectMap::new();
        map.insert("count".into(), Value::from(3i64));
        env.set(RESULT, Value::Object(map));
        assert_eq!(env.get_compound(RESULT, "COUNT").to_text(), "3");
        env.set_compound(RESULT, "COUNT", Value::from(4i64));
        let Some(Value::Object(map)) = env.lookup(RESULT) else {
            panic!("RESULT should be an object");
        };
        assert_eq!(map.len(), 1);
        assert_eq!(map["count"].to_text(), "4");
    }

    #[test]
    fn dotted_tails_reach_nested_values() {
        let mut env = Environment::default();
        let json = serde_json::json!({"params": {"replicas": "3"}, "words": ["deploy", "app"]});
        env.set(RESULT, Value::from_json(json));
        assert_eq!(env.get_compound(RESULT, "PARAMS.REPLICAS").to_text(), "3");
        assert_eq!(env.get_compound(RESULT, "WORDS.2").to_text(), "app");
        assert_eq!(env.get_compound(RESULT, "WORDS.0").to_text(), "2");
        assert!(!env.is_compound_set(RESULT, "PARAMS.MISSING"));
    }

    #[test]
    fn stem_and_simple_name_share_a_slot() {
        let mut env = Environment::default();
        env.set("X", Value::string("a"));
        env.set_compound("X", "1", Value::string("b"));
        assert!(matches!(env.get("X"), Value::Object(_)));
        assert_eq!(env.get_compound("X", "1").to_text(), "b");
        env.set("X", Value::string("c"));
        assert!(!env.is_compound_set("X", "1"));
    }

    #[test]
    fn drop_variable() {
        let mut env = Environment::default();
        env.set("X", Value::string("42"));
        assert!(env.is_set("X"));
        env.drop("X");
        assert!(!env.is_set("X"));
        assert_eq!(env.get("X").to_text(), "X");
    }

    #[test]
    fn address_switch_and_swap() {
        let mut env = Environment::default();
        assert_eq!(env.address(), "SYSTEM");
        env.set_address("echo");
        assert_eq!(env.address(), "ECHO");
        assert_eq!(env.previous_address(), "SYSTEM");
        env.swap_address();
        assert_eq!(env.address(), "SYSTEM");
    }
}
