//! Script values: strings that may be numbers, plus structured data.
//!
//! Classic REXX has only strings. This dialect keeps that model for scalars
//! (a `String` is numeric whenever its text matches the number grammar, and
//! coercion happens lazily at the point of use) and adds booleans, 1-based
//! arrays and insertion-ordered objects. Objects double as stems: `stem.tail`
//! looks `tail` up in the object bound to `stem`.
//!
//! Arithmetic follows REXX's decimal model (NUMERIC DIGITS / FORM).

use bigdecimal::num_bigint::Sign;
use bigdecimal::{BigDecimal, Zero};
use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;

/// Ordered key → value mapping used for objects and stems.
pub type ObjectMap = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    String(String),
    Number(BigDecimal),
    Boolean(bool),
    Array(Vec<Value>),
    Object(ObjectMap),
    #[default]
    Null,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn empty() -> Self {
        Self::String(String::new())
    }

    /// Borrow the text of a `String` value without formatting anything.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical string form, as used by concatenation, SAY and comparisons.
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Attempt to interpret this value as a REXX number.
    /// Strings qualify only if they match the numeric literal grammar;
    /// booleans count as 1 and 0.
    pub fn to_decimal(&self) -> Option<BigDecimal> {
        match self {
            Self::Number(d) => Some(d.clone()),
            Self::String(s) => parse_number(s),
            Self::Boolean(b) => Some(BigDecimal::from(i32::from(*b))),
            Self::Array(_) | Self::Object(_) | Self::Null => None,
        }
    }

    /// Check if this value is a valid REXX number.
    pub fn is_number(&self) -> bool {
        self.to_decimal().is_some()
    }

    /// Logical value: only booleans and the strings/numbers `0` and `1` qualify.
    pub fn to_logical(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            Self::Number(d) => {
                if d.is_zero() {
                    Some(false)
                } else if *d == BigDecimal::from(1) {
                    Some(true)
                } else {
                    None
                }
            }
            Self::String(s) => match s.trim() {
                "0" => Some(false),
                "1" => Some(true),
                _ => None,
            },
            Self::Array(_) | Self::Object(_) | Self::Null => None,
        }
    }

    /// Build a numeric result, rounded to the current NUMERIC DIGITS.
    /// Results too wide for plain notation become exponential strings.
    pub fn from_decimal(d: &BigDecimal, settings: &NumericSettings) -> Self {
        let rounded = d.with_prec(u64::from(settings.digits)).normalized();
        if needs_exponent(&rounded, settings.digits) {
            Self::String(format_exponential(&rounded, settings.form))
        } else {
            Self::Number(rounded)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert to JSON for handler payloads and JSON_STRINGIFY.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Number(d) => {
                let text = format_plain(d);
                serde_json::from_str::<serde_json::Number>(&text)
                    .map_or(serde_json::Value::String(text), serde_json::Value::Number)
            }
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Null => serde_json::Value::Null,
        }
    }

    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => BigDecimal::from_str(&n.to_string())
                .map_or_else(|_| Self::String(n.to_string()), Self::Number),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Field lookup on an object: exact key first, then case-insensitive,
    /// since script tails are upper-cased but handler fields usually are not.
    pub fn field(&self, key: &str) -> Option<&Value> {
        let Self::Object(map) = self else {
            return None;
        };
        map.get(key).or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(d) => f.write_str(&format_plain(d)),
            Self::Boolean(b) => f.write_str(if *b { "1" } else { "0" }),
            Self::Array(_) | Self::Object(_) => write!(f, "{}", self.to_json()),
            Self::Null => Ok(()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(BigDecimal::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number(BigDecimal::from(n as u64))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<ObjectMap> for Value {
    fn from(map: ObjectMap) -> Self {
        Self::Object(map)
    }
}

/// NUMERIC FORM controls exponential notation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericForm {
    /// Exponent is a multiple of 1 (default).
    #[default]
    Scientific,
    /// Exponent is a multiple of 3.
    Engineering,
}

/// Numeric settings for the current execution context.
#[derive(Debug, Clone)]
pub struct NumericSettings {
    /// Number of significant digits (default 9).
    pub digits: u32,
    /// Exponential notation form.
    pub form: NumericForm,
    /// Digits of "fuzziness" for comparisons (default 0).
    pub fuzz: u32,
}

impl Default for NumericSettings {
    fn default() -> Self {
        Self {
            digits: 9,
            form: NumericForm::Scientific,
            fuzz: 0,
        }
    }
}

/// Check `s` against the number grammar:
/// `[blanks][sign][blanks](digits[.[digits]]|.digits)[E[sign]digits][blanks]`.
pub fn is_numeric_literal(s: &str) -> bool {
    let body = s.trim_matches([' ', '\t']);
    let body = body
        .strip_prefix(['+', '-'])
        .map_or(body, |rest| rest.trim_start_matches([' ', '\t']));
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(i) => (&body[..i], Some(&body[i + 1..])),
        None => (body, None),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (mantissa, None),
    };
    let all_digits = |t: &str| t.chars().all(|c| c.is_ascii_digit());
    if !all_digits(int_part) || !frac_part.is_none_or(all_digits) {
        return false;
    }
    if int_part.is_empty() && frac_part.is_none_or(str::is_empty) {
        return false;
    }
    match exponent {
        None => true,
        Some(exp) => {
            let digits = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !digits.is_empty() && all_digits(digits)
        }
    }
}

fn parse_number(s: &str) -> Option<BigDecimal> {
    if !is_numeric_literal(s) {
        return None;
    }
    let compact: String = s.chars().filter(|c| !matches!(c, ' ' | '\t')).collect();
    let (sign, unsigned) = match compact.strip_prefix(['+', '-']) {
        Some(rest) => (if compact.starts_with('-') { "-" } else { "" }, rest),
        None => ("", compact.as_str()),
    };
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(i) => (&unsigned[..i], &unsigned[i..]),
        None => (unsigned, ""),
    };
    // "5." and ".5" are valid REXX numbers; spell them out fully for the parser.
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let frac_part = if frac_part.is_empty() { "0" } else { frac_part };
    BigDecimal::from_str(&format!("{sign}{int_part}.{frac_part}{exponent}")).ok()
}

/// Digits of |d| and its decimal exponent (value = digits × 10^-scale).
fn digits_and_scale(d: &BigDecimal) -> (String, i64) {
    let (int, scale) = d.as_bigint_and_exponent();
    (int.magnitude().to_string(), scale)
}

fn needs_exponent(d: &BigDecimal, digits: u32) -> bool {
    if d.is_zero() {
        return false;
    }
    let (mag, scale) = digits_and_scale(d);
    #[allow(clippy::cast_possible_wrap)]
    let int_digits = mag.len() as i64 - scale;
    int_digits > i64::from(digits) || -int_digits >= 2 * i64::from(digits)
}

/// Plain (non-exponential) decimal text with no trailing fractional zeros.
pub fn format_plain(d: &BigDecimal) -> String {
    if d.is_zero() {
        return "0".to_string();
    }
    let normalized = d.normalized();
    let (mag, scale) = digits_and_scale(&normalized);
    let negative = normalized.sign() == Sign::Minus;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let body = if scale <= 0 {
        format!("{mag}{}", "0".repeat((-scale) as usize))
    } else if scale as usize >= mag.len() {
        format!("0.{}{mag}", "0".repeat(scale as usize - mag.len()))
    } else {
        let split = mag.len() - scale as usize;
        format!("{}.{}", &mag[..split], &mag[split..])
    };
    if negative { format!("-{body}") } else { body }
}

fn format_exponential(d: &BigDecimal, form: NumericForm) -> String {
    let (mag, scale) = digits_and_scale(d);
    let negative = d.sign() == Sign::Minus;
    #[allow(clippy::cast_possible_wrap)]
    let mut exponent = mag.len() as i64 - scale - 1;
    let mut lead = 1usize;
    if form == NumericForm::Engineering {
        let shift = exponent.rem_euclid(3);
        exponent -= shift;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        {
            lead += shift as usize;
        }
    }
    let mut digits = mag;
    while digits.len() < lead {
        digits.push('0');
    }
    let (head, tail) = digits.split_at(lead);
    let tail = tail.trim_end_matches('0');
    let mantissa = if tail.is_empty() {
        head.to_string()
    } else {
        format!("{head}.{tail}")
    };
    let sign = if negative { "-" } else { "" };
    let exp_sign = if exponent < 0 { '-' } else { '+' };
    format!("{sign}{mantissa}E{exp_sign}{}", exponent.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_value() {
        let v = Value::string("hello");
        assert_eq!(v.to_text(), "hello");
        assert!(!v.is_number());
    }

    #[test]
    fn numeric_string_coerces_lazily() {
        let v = Value::string("  3.14  ");
        assert!(v.is_number());
        assert_eq!(v.to_text(), "  3.14  ");
        assert_eq!(v.to_decimal().unwrap(), BigDecimal::from_str("3.14").unwrap());
    }

    #[test]
    fn number_grammar() {
        for ok in ["42", "-7", "+ 3", ".5", "5.", "1E3", "2.5e-4", " 12 "] {
            assert!(is_numeric_literal(ok), "{ok} should be numeric");
        }
        for bad in ["", ".", "abc", "1e", "1.2.3", "--1", "0x10", "1 2", "e5"] {
            assert!(!is_numeric_literal(bad), "{bad} should not be numeric");
        }
    }

    #[test]
    fn from_decimal_rounds_to_digits() {
        let settings = NumericSettings::default();
        let third = BigDecimal::from(1) / BigDecimal::from(3);
        assert_eq!(Value::from_decimal(&third, &settings).to_text(), "0.333333333");
        let big = BigDecimal::from_str("12345678901").unwrap();
        assert_eq!(Value::from_decimal(&big, &settings).to_text(), "1.23456789E+10");
    }

    #[test]
    fn engineering_form() {
        let settings = NumericSettings {
            form: NumericForm::Engineering,
            ..NumericSettings::default()
        };
        let big = BigDecimal::from_str("12345678901").unwrap();
        assert_eq!(Value::from_decimal(&big, &settings).to_text(), "12.3456789E+9");
    }

    #[test]
    fn plain_formatting_strips_trailing_zeros() {
        assert_eq!(format_plain(&BigDecimal::from_str("2.50").unwrap()), "2.5");
        assert_eq!(format_plain(&BigDecimal::from_str("100").unwrap()), "100");
        assert_eq!(format_plain(&BigDecimal::from_str("-0.0300").unwrap()), "-0.03");
    }

    #[test]
    fn booleans_render_as_rexx_logicals() {
        assert_eq!(Value::Boolean(true).to_text(), "1");
        assert_eq!(Value::string("0").to_logical(), Some(false));
        assert_eq!(Value::string("yes").to_logical(), None);
    }

    #[test]
    fn structured_values_render_as_json() {
        let v = Value::Array(vec![Value::from(1i64), Value::string("a")]);
        assert_eq!(v.to_text(), r#"[1,"a"]"#);
        assert_eq!(Value::Null.to_text(), "");
    }

    #[test]
    fn json_round_trip_preserves_order() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"zeta":1,"alpha":{"count":3},"list":[true,null]}"#).unwrap();
        let v = Value::from_json(json.clone());
        let Value::Object(map) = &v else {
            panic!("expected object");
        };
        assert_eq!(map.keys().collect::<Vec<_>>(), ["zeta", "alpha", "list"]);
        assert_eq!(v.to_json(), json);
    }

    #[test]
    fn field_lookup_is_case_insensitive_fallback() {
        let mut map = ObjectMap::new();
        map.insert("count".into(), Value::from(3i64));
        let v = Value::Object(map);
        assert_eq!(v.field("COUNT"), Some(&Value::from(3i64)));
        assert_eq!(v.field("missing"), None);
    }

    #[test]
    fn default_numeric_settings() {
        let settings = NumericSettings::default();
        assert_eq!(settings.digits, 9);
        assert_eq!(settings.fuzz, 0);
        assert_eq!(settings.form, NumericForm::Scientific);
    }
}
