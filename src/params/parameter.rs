//! A single tunable value with the metadata a calibrator needs

use std::fmt;

use serde::Serialize;

/// The value held by a [`Parameter`]. The kind is fixed at declaration time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Text(_) => "text",
        }
    }

    /// Numeric view used for range checks; `None` for bool and text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Coerce `self` to the kind of `declared`. Integers widen to floats;
    /// nothing else converts.
    pub(crate) fn coerce_like(self, declared: &ParamValue) -> Option<ParamValue> {
        match (declared, self) {
            (ParamValue::Bool(_), v @ ParamValue::Bool(_)) => Some(v),
            (ParamValue::Int(_), v @ ParamValue::Int(_)) => Some(v),
            (ParamValue::Float(_), v @ ParamValue::Float(_)) => Some(v),
            (ParamValue::Float(_), ParamValue::Int(v)) => Some(ParamValue::Float(v as f64)),
            (ParamValue::Text(_), v @ ParamValue::Text(_)) => Some(v),
            _ => None,
        }
    }

    /// Parse persisted text as a value of the same kind as `self`.
    pub(crate) fn parse_like(&self, raw: &str) -> Option<ParamValue> {
        match self {
            ParamValue::Bool(_) => parse_bool(raw).map(ParamValue::Bool),
            ParamValue::Int(_) => raw.trim().parse().ok().map(ParamValue::Int),
            ParamValue::Float(_) => raw.trim().parse().ok().map(ParamValue::Float),
            ParamValue::Text(_) => Some(ParamValue::Text(raw.to_string())),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" | "True" => Some(true),
        "false" | "False" => Some(false),
        _ => None,
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            // Debug keeps the trailing ".0" so the kind survives a round trip
            ParamValue::Float(v) => write!(f, "{:?}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// A tunable setting of one backend.
///
/// When a bound is present `min <= value <= max` holds after every mutation;
/// rejected mutations leave the previous value in place. `fixed` forbids
/// calibrators (but not explicit configuration) from touching the value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    value: ParamValue,
    min: Option<f64>,
    max: Option<f64>,
    delta: f64,
    tolerance: f64,
    fixed: bool,
    enumerated: bool,
}

impl Parameter {
    pub const DEFAULT_DELTA: f64 = 10.0;
    pub const DEFAULT_TOLERANCE: f64 = 1.0;

    pub fn new(value: impl Into<ParamValue>) -> Self {
        Self {
            value: value.into(),
            min: None,
            max: None,
            delta: Self::DEFAULT_DELTA,
            tolerance: Self::DEFAULT_TOLERANCE,
            fixed: true,
            enumerated: false,
        }
    }

    pub fn bounded(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        debug_assert!(self.check(&self.value).is_ok(), "default outside of declared range");
        self
    }

    pub fn at_least(mut self, min: f64) -> Self {
        self.min = Some(min);
        debug_assert!(self.check(&self.value).is_ok(), "default outside of declared range");
        self
    }

    pub fn delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn enumerated(mut self) -> Self {
        self.enumerated = true;
        self
    }

    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn delta_value(&self) -> f64 {
        self.delta
    }

    pub fn tolerance_value(&self) -> f64 {
        self.tolerance
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn is_enumerated(&self) -> bool {
        self.enumerated
    }

    pub(crate) fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    /// Check a candidate value against kind and range, returning the value
    /// coerced to the declared kind.
    pub fn check(&self, candidate: &ParamValue) -> Result<ParamValue, String> {
        let coerced = candidate.clone().coerce_like(&self.value).ok_or_else(|| {
            format!("expected a {} value, got {}", self.value.kind(), candidate.kind())
        })?;
        if let Some(number) = coerced.as_f64() {
            if number.is_nan() {
                return Err("value is not a number".to_string());
            }
            if let Some(min) = self.min {
                if number < min {
                    return Err(format!("below minimum {}", self.render_bound(Some(min))));
                }
            }
            if let Some(max) = self.max {
                if number > max {
                    return Err(format!("above maximum {}", self.render_bound(Some(max))));
                }
            }
        }
        Ok(coerced)
    }

    /// Replace the value if it passes [`Parameter::check`].
    pub fn set_value(&mut self, candidate: impl Into<ParamValue>) -> Result<(), String> {
        let checked = self.check(&candidate.into())?;
        self.value = checked;
        Ok(())
    }

    fn render_bound(&self, bound: Option<f64>) -> String {
        match (bound, &self.value) {
            (None, _) => "None".to_string(),
            (Some(b), ParamValue::Int(_)) if b.fract() == 0.0 => format!("{}", b as i64),
            (Some(b), _) => format!("{:?}", b),
        }
    }

    /// Parse the persisted `<value='..' min='..' ...>` form using `declared`
    /// for the value kind and the `enumerated` flag.
    pub fn parse(raw: &str, declared: &Parameter) -> Result<Parameter, String> {
        let body = raw
            .trim()
            .strip_prefix("<value='")
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(|| "expected <value='...' ...> form".to_string())?;

        // Text values may contain quotes, so anchor on the last "' min='"
        let split = body
            .rfind("' min='")
            .ok_or_else(|| "missing min attribute".to_string())?;
        let raw_value = &body[..split];
        let attributes = &body[split + 2..];

        let value = declared
            .value
            .parse_like(raw_value)
            .ok_or_else(|| format!("'{}' is not a valid {} value", raw_value, declared.value.kind()))?;

        let mut parsed = Parameter {
            value: value.clone(),
            min: None,
            max: None,
            delta: Self::DEFAULT_DELTA,
            tolerance: Self::DEFAULT_TOLERANCE,
            fixed: true,
            enumerated: declared.enumerated,
        };

        for attribute in attributes.split_whitespace() {
            let (key, quoted) = attribute
                .split_once('=')
                .ok_or_else(|| format!("malformed attribute '{}'", attribute))?;
            let text = quoted
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(|| format!("unquoted attribute '{}'", attribute))?;
            match key {
                "min" => parsed.min = parse_bound(text)?,
                "max" => parsed.max = parse_bound(text)?,
                "delta" => parsed.delta = parse_number(key, text)?,
                "tolerance" => parsed.tolerance = parse_number(key, text)?,
                "fixed" => {
                    parsed.fixed =
                        parse_bool(text).ok_or_else(|| format!("fixed must be a bool, got '{}'", text))?
                }
                "enumerated" => {
                    parsed.enumerated = parse_bool(text)
                        .ok_or_else(|| format!("enumerated must be a bool, got '{}'", text))?
                }
                other => return Err(format!("unknown attribute '{}'", other)),
            }
        }

        parsed.check(&value)?;
        Ok(parsed)
    }
}

fn parse_bound(text: &str) -> Result<Option<f64>, String> {
    if text == "None" {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|_| format!("'{}' is not a valid bound", text))
}

fn parse_number(key: &str, text: &str) -> Result<f64, String> {
    text.parse()
        .map_err(|_| format!("{} must be a number, got '{}'", key, text))
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<value='{}' min='{}' max='{}' delta='{:?}' tolerance='{:?}' fixed='{}'>",
            self.value,
            self.render_bound(self.min),
            self.render_bound(self.max),
            self.delta,
            self.tolerance,
            self.fixed
        )
    }
}
