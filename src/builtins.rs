//! Built-in functions (BIFs).
//!
//! A deliberately small set: the classic string and word helpers, a few
//! numeric ones, and the functions that work on arrays, objects and JSON.
//! `ARG` and `CHECKPOINT` need activation or instance state and live in the
//! evaluator instead.

use crate::env::Environment;
use crate::error::{RexxDiagnostic, RexxError, RexxResult};
use crate::value::{NumericSettings, Value, format_plain};
use bigdecimal::BigDecimal;
use rand::Rng;

// ── Public dispatch ─────────────────────────────────────────────────

/// Try to call a built-in function by name.
///
/// Returns:
/// - `None`: not a BIF (caller should try next resolution step)
/// - `Some(Ok(val))`: BIF succeeded
/// - `Some(Err(..))`: BIF found but call was invalid
///
/// Results that would exceed `max_string_length` characters raise Error 5.
pub fn call_builtin(
    name: &str,
    args: &[Value],
    settings: &NumericSettings,
    env: &Environment,
    max_string_length: usize,
) -> Option<RexxResult<Value>> {
    let result = match name {
        // String functions
        "LENGTH" => bif_length(args),
        "SUBSTR" => bif_substr(args, max_string_length),
        "LEFT" => bif_left(args, max_string_length),
        "RIGHT" => bif_right(args, max_string_length),
        "POS" => bif_pos(args),
        "COPIES" => bif_copies(args, max_string_length),
        "REVERSE" => bif_reverse(args),
        "STRIP" => bif_strip(args),
        "UPPER" => bif_case(args, "UPPER", str::to_uppercase),
        "LOWER" => bif_case(args, "LOWER", str::to_lowercase),

        // Word functions
        "WORDS" => bif_words(args),
        "WORD" => bif_word(args),

        // Numeric functions
        "ABS" => bif_abs(args, settings),
        "MAX" => bif_extreme(args, settings, "MAX", std::cmp::Ordering::Greater),
        "MIN" => bif_extreme(args, settings, "MIN", std::cmp::Ordering::Less),
        "TRUNC" => bif_trunc(args),
        "RANDOM" => bif_random(args),

        // Structured data
        "ARRAY_LENGTH" => bif_array_length(args),
        "JSON_STRINGIFY" => bif_json_stringify(args),
        "JSON_PARSE" => bif_json_parse(args),

        // Informational
        "DATATYPE" => bif_datatype(args),
        "SYMBOL" => bif_symbol(args, env),
        "CONDITION" => bif_condition(args, env),
        "ADDRESS" => check_args("ADDRESS", args, 0, 0).map(|()| Value::from(env.address())),

        _ => return None,
    };
    Some(result)
}

// ── Argument validation helpers ─────────────────────────────────────

fn check_args(name: &str, args: &[Value], min: usize, max: usize) -> RexxResult<()> {
    if args.len() < min || args.len() > max {
        Err(
            RexxDiagnostic::new(RexxError::IncorrectCall).with_detail(format!(
                "{name} requires {min} to {max} arguments; got {}",
                args.len()
            )),
        )
    } else {
        Ok(())
    }
}

fn to_whole_number(name: &str, val: &Value) -> RexxResult<i64> {
    let text = val.to_text();
    text.trim().parse::<i64>().map_err(|_| {
        RexxDiagnostic::new(RexxError::IncorrectCall)
            .with_detail(format!("{name}: '{text}' is not a valid whole number"))
    })
}

fn to_nonneg_whole(name: &str, val: &Value) -> RexxResult<usize> {
    let n = to_whole_number(name, val)?;
    usize::try_from(n).map_err(|_| {
        RexxDiagnostic::new(RexxError::IncorrectCall)
            .with_detail(format!("{name}: value must not be negative; got {n}"))
    })
}

fn to_positive_whole(name: &str, val: &Value) -> RexxResult<usize> {
    let n = to_nonneg_whole(name, val)?;
    if n == 0 {
        return Err(RexxDiagnostic::new(RexxError::IncorrectCall)
            .with_detail(format!("{name}: value must be positive; got 0")));
    }
    Ok(n)
}

/// `count` repetitions of `unit` characters, or Error 5 past `limit`.
fn checked_length(name: &str, unit: usize, count: usize, limit: usize) -> RexxResult<usize> {
    match unit.checked_mul(count) {
        Some(total) if total <= limit => Ok(total),
        _ => Err(RexxDiagnostic::new(RexxError::ResourceExhausted)
            .with_detail(format!("{name}: result longer than {limit} characters"))),
    }
}

fn to_pad_char(name: &str, val: &Value) -> RexxResult<char> {
    let s = val.to_text();
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(RexxDiagnostic::new(RexxError::IncorrectCall)
            .with_detail(format!("{name}: pad must be exactly one character"))),
    }
}

fn to_number_val(name: &str, val: &Value) -> RexxResult<BigDecimal> {
    val.to_decimal().ok_or_else(|| {
        RexxDiagnostic::new(RexxError::BadArithmetic)
            .with_detail(format!("{name}: '{val}' is not a number"))
    })
}

/// Optional argument `i`, treating an empty string as omitted.
fn optional(args: &[Value], i: usize) -> Option<&Value> {
    args.get(i).filter(|v| !v.to_text().trim().is_empty())
}

fn rexx_words(s: &str) -> Vec<&str> {
    s.split([' ', '\t']).filter(|w| !w.is_empty()).collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Substring by character positions (0-based start, count).
fn substr_chars(s: &str, start: usize, count: usize) -> String {
    s.chars().skip(start).take(count).collect()
}

// ── String BIFs ─────────────────────────────────────────────────────

fn bif_length(args: &[Value]) -> RexxResult<Value> {
    check_args("LENGTH", args, 1, 1)?;
    Ok(Value::from(char_len(&args[0].to_text())))
}

fn bif_substr(args: &[Value], limit: usize) -> RexxResult<Value> {
    check_args("SUBSTR", args, 2, 4)?;
    let s = args[0].to_text();
    let start = to_positive_whole("SUBSTR", &args[1])?;
    let length = match args.get(2) {
        Some(v) => checked_length("SUBSTR", 1, to_nonneg_whole("SUBSTR", v)?, limit)?,
        None => char_len(&s).saturating_sub(start - 1),
    };
    let pad = match args.get(3) {
        Some(v) => to_pad_char("SUBSTR", v)?,
        None => ' ',
    };

    let mut result = substr_chars(&s, start - 1, length);
    let got = char_len(&result);
    result.extend(std::iter::repeat_n(pad, length.saturating_sub(got)));
    Ok(Value::from(result))
}

fn bif_left(args: &[Value], limit: usize) -> RexxResult<Value> {
    check_args("LEFT", args, 2, 3)?;
    let s = args[0].to_text();
    let length = checked_length("LEFT", 1, to_nonneg_whole("LEFT", &args[1])?, limit)?;
    let pad = match args.get(2) {
        Some(v) => to_pad_char("LEFT", v)?,
        None => ' ',
    };
    let mut result = substr_chars(&s, 0, length);
    let got = char_len(&result);
    result.extend(std::iter::repeat_n(pad, length.saturating_sub(got)));
    Ok(Value::from(result))
}

fn bif_right(args: &[Value], limit: usize) -> RexxResult<Value> {
    check_args("RIGHT", args, 2, 3)?;
    let s = args[0].to_text();
    let length = checked_length("RIGHT", 1, to_nonneg_whole("RIGHT", &args[1])?, limit)?;
    let pad = match args.get(2) {
        Some(v) => to_pad_char("RIGHT", v)?,
        None => ' ',
    };
    let slen = char_len(&s);
    if length <= slen {
        return Ok(Value::from(substr_chars(&s, slen - length, length)));
    }
    let mut result: String = std::iter::repeat_n(pad, length - slen).collect();
    result.push_str(&s);
    Ok(Value::from(result))
}

fn bif_pos(args: &[Value]) -> RexxResult<Value> {
    check_args("POS", args, 2, 3)?;
    let needle = args[0].to_text();
    let haystack = args[1].to_text();
    let start = match args.get(2) {
        Some(v) => to_positive_whole("POS", v)?,
        None => 1,
    };
    if needle.is_empty() {
        return Ok(Value::from(0i64));
    }
    let byte_start = haystack
        .char_indices()
        .nth(start - 1)
        .map_or(haystack.len(), |(i, _)| i);
    let found = haystack[byte_start..]
        .find(&needle)
        .map_or(0, |byte_pos| haystack[..byte_start + byte_pos].chars().count() + 1);
    Ok(Value::from(found))
}

fn bif_copies(args: &[Value], limit: usize) -> RexxResult<Value> {
    check_args("COPIES", args, 2, 2)?;
    let text = args[0].to_text();
    let n = to_nonneg_whole("COPIES", &args[1])?;
    checked_length("COPIES", char_len(&text), n, limit)?;
    Ok(Value::from(text.repeat(n)))
}

fn bif_reverse(args: &[Value]) -> RexxResult<Value> {
    check_args("REVERSE", args, 1, 1)?;
    Ok(Value::from(args[0].to_text().chars().rev().collect::<String>()))
}

fn bif_strip(args: &[Value]) -> RexxResult<Value> {
    check_args("STRIP", args, 1, 3)?;
    let s = args[0].to_text();
    let option = optional(args, 1).map_or_else(|| "B".to_string(), |v| v.to_text().to_uppercase());
    let ch = match args.get(2) {
        Some(v) => to_pad_char("STRIP", v)?,
        None => ' ',
    };

    let result = match option.as_str() {
        "B" | "BOTH" => s.trim_matches(ch),
        "L" | "LEADING" => s.trim_start_matches(ch),
        "T" | "TRAILING" => s.trim_end_matches(ch),
        _ => {
            return Err(RexxDiagnostic::new(RexxError::IncorrectCall)
                .with_detail(format!("STRIP: option must be B, L, or T; got '{option}'")));
        }
    };
    Ok(Value::from(result))
}

fn bif_case(args: &[Value], name: &str, convert: fn(&str) -> String) -> RexxResult<Value> {
    check_args(name, args, 1, 1)?;
    Ok(Value::from(convert(&args[0].to_text())))
}

// ── Word BIFs ───────────────────────────────────────────────────────

fn bif_words(args: &[Value]) -> RexxResult<Value> {
    check_args("WORDS", args, 1, 1)?;
    Ok(Value::from(rexx_words(&args[0].to_text()).len()))
}

fn bif_word(args: &[Value]) -> RexxResult<Value> {
    check_args("WORD", args, 2, 2)?;
    let n = to_positive_whole("WORD", &args[1])?;
    let text = args[0].to_text();
    let words = rexx_words(&text);
    Ok(Value::from(words.get(n - 1).copied().unwrap_or("")))
}

// ── Numeric BIFs ────────────────────────────────────────────────────

fn bif_abs(args: &[Value], settings: &NumericSettings) -> RexxResult<Value> {
    check_args("ABS", args, 1, 1)?;
    let d = to_number_val("ABS", &args[0])?;
    Ok(Value::from_decimal(&d.abs(), settings))
}

/// MAX and MIN: the argument that compares `wanted` against all others.
fn bif_extreme(
    args: &[Value],
    settings: &NumericSettings,
    name: &str,
    wanted: std::cmp::Ordering,
) -> RexxResult<Value> {
    let Some((first, rest)) = args.split_first() else {
        return Err(RexxDiagnostic::new(RexxError::IncorrectCall)
            .with_detail(format!("{name} requires at least 1 argument")));
    };
    let mut best = to_number_val(name, first)?;
    for arg in rest {
        let d = to_number_val(name, arg)?;
        if d.cmp(&best) == wanted {
            best = d;
        }
    }
    Ok(Value::from_decimal(&best, settings))
}

fn bif_trunc(args: &[Value]) -> RexxResult<Value> {
    check_args("TRUNC", args, 1, 2)?;
    let d = to_number_val("TRUNC", &args[0])?;
    let places = match args.get(1) {
        Some(v) => to_nonneg_whole("TRUNC", v)?,
        None => 0,
    };
    let scale = i64::try_from(places).map_err(|_| {
        RexxDiagnostic::new(RexxError::IncorrectCall).with_detail("TRUNC: too many decimal places")
    })?;
    let truncated = d.with_scale_round(scale, bigdecimal::RoundingMode::Down);
    let mut text = format_plain(&truncated);
    if places > 0 {
        let decimals = match text.find('.') {
            Some(dot) => text.len() - dot - 1,
            None => {
                text.push('.');
                0
            }
        };
        text.extend(std::iter::repeat_n('0', places.saturating_sub(decimals)));
    }
    Ok(Value::from(text))
}

fn bif_random(args: &[Value]) -> RexxResult<Value> {
    check_args("RANDOM", args, 0, 2)?;
    let (min, max) = match (optional(args, 0), optional(args, 1)) {
        (Some(max), None) if args.len() == 1 => (0, to_nonneg_whole("RANDOM", max)?),
        (min, max) => (
            min.map(|v| to_nonneg_whole("RANDOM", v)).transpose()?.unwrap_or(0),
            max.map(|v| to_nonneg_whole("RANDOM", v)).transpose()?.unwrap_or(999),
        ),
    };
    if min > max {
        return Err(RexxDiagnostic::new(RexxError::IncorrectCall)
            .with_detail(format!("RANDOM: min ({min}) must not exceed max ({max})")));
    }
    let val = rand::thread_rng().gen_range(min..=max);
    Ok(Value::from(val))
}

// ── Structured data ─────────────────────────────────────────────────

fn bif_array_length(args: &[Value]) -> RexxResult<Value> {
    check_args("ARRAY_LENGTH", args, 1, 1)?;
    match &args[0] {
        Value::Array(items) => Ok(Value::from(items.len())),
        Value::Object(map) => Ok(Value::from(map.len())),
        Value::Null => Ok(Value::from(0i64)),
        other => Err(RexxDiagnostic::new(RexxError::IncorrectCall)
            .with_detail(format!("ARRAY_LENGTH: '{other}' is not an array"))),
    }
}

fn bif_json_stringify(args: &[Value]) -> RexxResult<Value> {
    check_args("JSON_STRINGIFY", args, 1, 1)?;
    Ok(Value::from(args[0].to_json().to_string()))
}

fn bif_json_parse(args: &[Value]) -> RexxResult<Value> {
    check_args("JSON_PARSE", args, 1, 1)?;
    let text = args[0].to_text();
    serde_json::from_str::<serde_json::Value>(&text)
        .map(Value::from_json)
        .map_err(|e| {
            RexxDiagnostic::new(RexxError::IncorrectCall)
                .with_detail(format!("JSON_PARSE: {e}"))
        })
}

// ── Informational BIFs ──────────────────────────────────────────────

fn bif_datatype(args: &[Value]) -> RexxResult<Value> {
    check_args("DATATYPE", args, 1, 2)?;
    let value = &args[0];
    let s = value.to_text();

    let Some(kind) = args.get(1) else {
        let name = match value {
            Value::Array(_) => "ARRAY",
            Value::Object(_) => "OBJECT",
            _ if value.is_number() => "NUM",
            _ => "CHAR",
        };
        return Ok(Value::from(name));
    };

    let type_char = kind.to_text().to_uppercase();
    let result = match type_char.as_str() {
        "A" | "ALPHANUMERIC" => !s.is_empty() && s.chars().all(char::is_alphanumeric),
        "L" | "LOWERCASE" => !s.is_empty() && s.chars().all(char::is_lowercase),
        "M" | "MIXED" => !s.is_empty() && s.chars().all(char::is_alphabetic),
        "N" | "NUMBER" => value.is_number(),
        "S" | "SYMBOL" => is_symbol(&s),
        "U" | "UPPERCASE" => !s.is_empty() && s.chars().all(char::is_uppercase),
        "W" | "WHOLENUMBER" => value.to_decimal().is_some_and(|d| d.is_integer()),
        _ => {
            return Err(RexxDiagnostic::new(RexxError::IncorrectCall)
                .with_detail(format!("DATATYPE: unknown type '{type_char}'")));
        }
    };
    Ok(Value::from(result))
}

fn is_symbol(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '!' | '?'))
}

/// `SYMBOL(name)`: `VAR` when set, `LIT` for a valid but unset symbol,
/// `BAD` otherwise.
fn bif_symbol(args: &[Value], env: &Environment) -> RexxResult<Value> {
    check_args("SYMBOL", args, 1, 1)?;
    let name = args[0].to_text().trim().to_uppercase();
    if !is_symbol(&name) {
        return Ok(Value::from("BAD"));
    }
    let set = match name.split_once('.') {
        Some((stem, "")) => env.is_set(stem),
        Some((stem, tail)) => {
            let tail = tail
                .split('.')
                .map(|part| match env.lookup(part) {
                    Some(value) if !part.is_empty() => value.to_text(),
                    _ => part.to_string(),
                })
                .collect::<Vec<_>>()
                .join(".");
            env.is_compound_set(stem, &tail)
        }
        None => env.is_set(&name),
    };
    Ok(Value::from(if set { "VAR" } else { "LIT" }))
}

/// `CONDITION([option])`: details of the last trapped condition, or `''`
/// when nothing has been trapped.
fn bif_condition(args: &[Value], env: &Environment) -> RexxResult<Value> {
    check_args("CONDITION", args, 0, 1)?;
    let option = optional(args, 0).map_or_else(|| "I".to_string(), |v| v.to_text().trim().to_uppercase());
    let Some(info) = env.condition_info() else {
        return Ok(Value::empty());
    };
    let text = match option.chars().next() {
        Some('C') => &info.condition,
        Some('D') => &info.description,
        Some('I') => &info.instruction,
        Some('S') => &info.status,
        _ => {
            return Err(RexxDiagnostic::new(RexxError::IncorrectCall)
                .with_detail(format!("CONDITION option must be C, D, I or S; got '{option}'")));
        }
    };
    Ok(Value::from(text.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1 << 20;

    fn call(name: &str, args: &[Value]) -> Value {
        call_builtin(name, args, &NumericSettings::default(), &Environment::default(), LIMIT)
            .expect("builtin exists")
            .unwrap()
    }

    fn s(text: &str) -> Value {
        Value::from(text)
    }

    #[test]
    fn test_length() {
        assert_eq!(call("LENGTH", &[s("hello")]).to_text(), "5");
    }

    #[test]
    fn test_substr() {
        assert_eq!(call("SUBSTR", &[s("hello world"), s("7")]).to_text(), "world");
        assert_eq!(call("SUBSTR", &[s("abc"), s("2"), s("4"), s(".")]).to_text(), "bc..");
    }

    #[test]
    fn test_left_right_pad() {
        assert_eq!(call("LEFT", &[s("ab"), s("4")]).to_text(), "ab  ");
        assert_eq!(call("RIGHT", &[s("7"), s("3"), s("0")]).to_text(), "007");
        assert_eq!(call("RIGHT", &[s("hello"), s("3")]).to_text(), "llo");
    }

    #[test]
    fn test_pos() {
        assert_eq!(call("POS", &[s("lo"), s("hello lo")]).to_text(), "4");
        assert_eq!(call("POS", &[s("lo"), s("hello lo"), s("5")]).to_text(), "7");
        assert_eq!(call("POS", &[s("z"), s("hello")]).to_text(), "0");
    }

    #[test]
    fn test_words() {
        assert_eq!(call("WORDS", &[s("one two three")]).to_text(), "3");
        assert_eq!(call("WORD", &[s("one two three"), s("2")]).to_text(), "two");
        assert_eq!(call("WORD", &[s("one"), s("5")]).to_text(), "");
    }

    #[test]
    fn test_strip_and_case() {
        assert_eq!(call("STRIP", &[s("  x  ")]).to_text(), "x");
        assert_eq!(call("STRIP", &[s("--x--"), s("T"), s("-")]).to_text(), "--x");
        assert_eq!(call("UPPER", &[s("hello")]).to_text(), "HELLO");
        assert_eq!(call("LOWER", &[s("HeLLo")]).to_text(), "hello");
    }

    #[test]
    fn test_abs() {
        assert_eq!(call("ABS", &[s("-42")]).to_text(), "42");
    }

    #[test]
    fn test_max_min() {
        assert_eq!(call("MAX", &[s("3"), s("10"), s("-2")]).to_text(), "10");
        assert_eq!(call("MIN", &[s("3"), s("10"), s("-2")]).to_text(), "-2");
    }

    #[test]
    fn test_trunc() {
        assert_eq!(call("TRUNC", &[s("12.789")]).to_text(), "12");
        assert_eq!(call("TRUNC", &[s("12.789"), s("2")]).to_text(), "12.78");
        assert_eq!(call("TRUNC", &[s("3"), s("2")]).to_text(), "3.00");
    }

    #[test]
    fn test_random_in_range() {
        for _ in 0..20 {
            let n: i64 = call("RANDOM", &[s("5"), s("7")]).to_text().parse().unwrap();
            assert!((5..=7).contains(&n));
        }
    }

    #[test]
    fn test_array_length() {
        let list = Value::Array(vec![s("a"), s("b")]);
        assert_eq!(call("ARRAY_LENGTH", &[list]).to_text(), "2");
        assert_eq!(call("ARRAY_LENGTH", &[Value::Null]).to_text(), "0");
    }

    #[test]
    fn test_json_functions() {
        let parsed = call("JSON_PARSE", &[s(r#"{"count":3,"tags":["x"]}"#)]);
        assert_eq!(parsed.field("count").unwrap().to_text(), "3");
        assert_eq!(
            call("JSON_STRINGIFY", &[parsed]).to_text(),
            r#"{"count":3,"tags":["x"]}"#
        );
        let err = call_builtin(
            "JSON_PARSE",
            &[s("{oops")],
            &NumericSettings::default(),
            &Environment::default(),
            LIMIT,
        )
        .unwrap()
        .unwrap_err();
        assert_eq!(err.error, RexxError::IncorrectCall);
    }

    #[test]
    fn test_datatype() {
        assert_eq!(call("DATATYPE", &[s("12")]).to_text(), "NUM");
        assert_eq!(call("DATATYPE", &[s("abc")]).to_text(), "CHAR");
        assert_eq!(call("DATATYPE", &[Value::Array(vec![])]).to_text(), "ARRAY");
        assert_eq!(call("DATATYPE", &[s("12.5"), s("W")]).to_text(), "0");
        assert_eq!(call("DATATYPE", &[s("ABC"), s("U")]).to_text(), "1");
    }

    #[test]
    fn test_symbol() {
        let mut env = Environment::default();
        env.set("X", s("1"));
        env.set_compound("LIST", "1", s("a"));
        let symbol = |name: &str| {
            call_builtin("SYMBOL", &[s(name)], &NumericSettings::default(), &env, LIMIT)
                .unwrap()
                .unwrap()
                .to_text()
        };
        assert_eq!(symbol("x"), "VAR");
        assert_eq!(symbol("y"), "LIT");
        assert_eq!(symbol("list.1"), "VAR");
        assert_eq!(symbol("list.x"), "VAR");
        assert_eq!(symbol("a b"), "BAD");
    }

    #[test]
    fn test_condition_and_address() {
        let mut env = Environment::new("echo");
        let condition = |env: &Environment, args: &[Value]| {
            call_builtin("CONDITION", args, &NumericSettings::default(), env, LIMIT)
                .unwrap()
                .unwrap()
                .to_text()
        };
        assert_eq!(condition(&env, &[]), "");
        env.set_condition_info(crate::env::ConditionInfoData {
            condition: "ERROR".into(),
            description: "deploy web".into(),
            instruction: "SIGNAL".into(),
            status: "ON".into(),
        });
        assert_eq!(condition(&env, &[]), "SIGNAL");
        assert_eq!(condition(&env, &[s("c")]), "ERROR");
        assert_eq!(condition(&env, &[s("D")]), "deploy web");
        let address = call_builtin("ADDRESS", &[], &NumericSettings::default(), &env, LIMIT);
        assert_eq!(address.unwrap().unwrap().to_text(), "ECHO");
    }

    #[test]
    fn oversized_results_are_resource_exhaustion() {
        let fails = |name: &str, args: &[Value]| {
            call_builtin(name, args, &NumericSettings::default(), &Environment::default(), LIMIT)
                .unwrap()
                .unwrap_err()
                .error
        };
        let huge = s("9223372036854775807");
        assert_eq!(fails("COPIES", &[s("ab"), huge.clone()]), RexxError::ResourceExhausted);
        assert_eq!(fails("COPIES", &[s("ab"), s("600000")]), RexxError::ResourceExhausted);
        assert_eq!(fails("LEFT", &[s("ab"), huge.clone()]), RexxError::ResourceExhausted);
        assert_eq!(fails("RIGHT", &[s("ab"), huge.clone()]), RexxError::ResourceExhausted);
        assert_eq!(fails("SUBSTR", &[s("ab"), s("1"), huge]), RexxError::ResourceExhausted);
        assert_eq!(call("COPIES", &[s("ab"), s("3")]).to_text(), "ababab");
        assert_eq!(call("COPIES", &[s(""), s("9223372036854775807")]).to_text(), "");
    }

    #[test]
    fn wrong_argument_count_is_error_40() {
        let err = call_builtin(
            "LENGTH",
            &[],
            &NumericSettings::default(),
            &Environment::default(),
            LIMIT,
        )
        .unwrap()
        .unwrap_err();
        assert_eq!(err.error.number(), 40);
    }

    #[test]
    fn unknown_name_is_not_a_builtin() {
        assert!(
            call_builtin("NOPE", &[], &NumericSettings::default(), &Environment::default(), LIMIT)
                .is_none()
        );
    }
}
