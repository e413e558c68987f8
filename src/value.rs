/// Runtime values and coercions.
///
/// `Value` is the universal runtime type: five by-value primitives plus a
/// heap object reference. Coercions follow the language rules: to-string is
/// tag-dispatched for objects (arrays join with ",", errors render
/// "Name: message", dates use the host date format, regexes their /source/
/// form) and cycles met during array/error stringification contribute an
/// empty substring. The four-way comparison backs the relational operators,
/// equality, and switch-case matching.

use crate::heap::{FuncData, Heap, ObjData, ObjRef};
use chrono::{TimeZone, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Obj(ObjRef),
}

impl Value {
    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }
}

/// Comparison result: ordered, equal, or incomparable (NaN involved, or two
/// distinct objects whose string forms collide).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Less,
    Equal,
    Greater,
    Incomparable,
}

// ---------------------------------------------------------------------------
// Boolean and number coercion
// ---------------------------------------------------------------------------

pub fn to_boolean(v: &Value) -> bool {
    match v {
        Value::Undefined | Value::Null => false,
        Value::Bool(b) => *b,
        Value::Num(n) => *n != 0.0 && !n.is_nan(),
        Value::Str(s) => !s.is_empty(),
        Value::Obj(_) => true,
    }
}

pub fn to_number(heap: &Heap, v: &Value) -> f64 {
    match v {
        Value::Undefined => f64::NAN,
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Num(n) => *n,
        Value::Str(s) => str_to_number(s),
        Value::Obj(_) => str_to_number(&to_string(heap, v)),
    }
}

/// Lexical string-to-number conversion: optional sign, decimal or hex
/// forms, "Infinity", surrounding whitespace ignored, empty string is 0.
pub fn str_to_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    let (sign, rest) = match t.strip_prefix('-') {
        Some(r) => (-1.0, r),
        None => (1.0, t.strip_prefix('+').unwrap_or(t)),
    };
    if rest == "Infinity" {
        return sign * f64::INFINITY;
    }
    if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return match u64::from_str_radix(hex, 16) {
                Ok(n) => sign * n as f64,
                Err(_) => f64::NAN,
            };
        }
        return f64::NAN;
    }
    // Reject everything Rust's float parser accepts but the language does
    // not ("inf", "NaN", underscores).
    if !rest
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return f64::NAN;
    }
    rest.parse::<f64>().map(|n| sign * n).unwrap_or(f64::NAN)
}

pub fn to_int32(heap: &Heap, v: &Value) -> i32 {
    let n = to_number(heap, v);
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64 as u64 & 0xFFFF_FFFF) as u32 as i32
}

pub fn to_uint32(heap: &Heap, v: &Value) -> u32 {
    to_int32(heap, v) as u32
}

// ---------------------------------------------------------------------------
// String coercion
// ---------------------------------------------------------------------------

/// Canonical decimal form of a number: integers without a decimal point,
/// "Infinity"/"NaN" spelled out, exponent form past 1e21.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == f64::INFINITY {
        return "Infinity".to_string();
    }
    if n == f64::NEG_INFINITY {
        return "-Infinity".to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.abs() >= 1e21 {
        let s = format!("{:e}", n);
        // Rust prints "1e21"; the language prints "1e+21".
        return if s.contains("e-") { s } else { s.replacen('e', "e+", 1) };
    }
    format!("{}", n)
}

pub fn to_string(heap: &Heap, v: &Value) -> String {
    let mut seen = Vec::new();
    to_string_seeded(heap, v, &mut seen)
}

/// String coercion with an explicit cycle guard. A reference already on the
/// `seen` stack stringifies as the empty string.
pub fn to_string_seeded(heap: &Heap, v: &Value, seen: &mut Vec<ObjRef>) -> String {
    match v {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Num(n) => number_to_string(*n),
        Value::Str(s) => s.clone(),
        Value::Obj(r) => {
            if seen.contains(r) {
                return String::new();
            }
            seen.push(*r);
            let out = obj_to_string(heap, *r, seen);
            seen.pop();
            out
        }
    }
}

fn obj_to_string(heap: &Heap, r: ObjRef, seen: &mut Vec<ObjRef>) -> String {
    match &heap.obj(r).data {
        ObjData::Array { .. } => array_join(heap, r, ",", seen),
        ObjData::Error { .. } => {
            let name = match heap.get_prop_chain(r, "name") {
                Some(v) if v != Value::Undefined => to_string_seeded(heap, &v, seen),
                _ => "Error".to_string(),
            };
            let message = match heap.get_prop_chain(r, "message") {
                Some(v) if v != Value::Undefined => to_string_seeded(heap, &v, seen),
                _ => String::new(),
            };
            if message.is_empty() {
                name
            } else {
                format!("{}: {}", name, message)
            }
        }
        ObjData::Date { ms } => date_to_string(*ms),
        ObjData::Regex { source, flags } => format!("/{}/{}", source, flags),
        ObjData::Func(_) | ObjData::Plain => "[object]".to_string(),
    }
}

/// Join an array's elements. Undefined and null elements contribute empty
/// strings, as do references already being stringified further up.
pub fn array_join(heap: &Heap, r: ObjRef, sep: &str, seen: &mut Vec<ObjRef>) -> String {
    let length = match heap.obj(r).data {
        ObjData::Array { length } => length,
        _ => 0,
    };
    let mut parts = Vec::with_capacity(length as usize);
    for i in 0..length {
        let elem = heap
            .get_prop_chain(r, &i.to_string())
            .unwrap_or(Value::Undefined);
        let s = match elem {
            Value::Undefined | Value::Null => String::new(),
            other => to_string_seeded(heap, &other, seen),
        };
        parts.push(s);
    }
    parts.join(sep)
}

pub fn date_to_string(ms: f64) -> String {
    if !ms.is_finite() {
        return "Invalid Date".to_string();
    }
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(dt) => dt.format("%a %b %d %Y %H:%M:%S GMT+0000 (UTC)").to_string(),
        None => "Invalid Date".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Comparison and equality
// ---------------------------------------------------------------------------

/// Three-way-or-incomparable comparison. NaN on either side is
/// incomparable. Two primitives compare numerically when both are numbers,
/// otherwise lexicographically on their string forms. With an object
/// involved, string forms are compared — except that two *distinct* objects
/// whose string forms happen to match stay incomparable; identity is the
/// only way two objects are equal.
pub fn compare(heap: &Heap, a: &Value, b: &Value) -> Cmp {
    if matches!(a, Value::Num(n) if n.is_nan()) || matches!(b, Value::Num(n) if n.is_nan()) {
        return Cmp::Incomparable;
    }
    if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
        if x == y {
            return Cmp::Equal;
        }
    }
    if let (Value::Num(x), Value::Num(y)) = (a, b) {
        return match x.partial_cmp(y) {
            Some(std::cmp::Ordering::Less) => Cmp::Less,
            Some(std::cmp::Ordering::Greater) => Cmp::Greater,
            _ => Cmp::Equal,
        };
    }
    let sa = to_string(heap, a);
    let sb = to_string(heap, b);
    match sa.cmp(&sb) {
        std::cmp::Ordering::Less => Cmp::Less,
        std::cmp::Ordering::Greater => Cmp::Greater,
        std::cmp::Ordering::Equal => {
            if a.is_obj() && b.is_obj() {
                // Distinct references with colliding string forms.
                Cmp::Incomparable
            } else {
                Cmp::Equal
            }
        }
    }
}

/// Loose equality: comparison says equal. Value-based for primitives,
/// reference-based for objects.
pub fn loose_eq(heap: &Heap, a: &Value, b: &Value) -> bool {
    compare(heap, a, b) == Cmp::Equal
}

/// Strict equality: same type, same value; reference identity for objects.
pub fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => x == y,
        _ => false,
    }
}

/// The typeof tag. Functions report "function"; null reports "object".
pub fn type_of(heap: &Heap, v: &Value) -> &'static str {
    match v {
        Value::Undefined => "undefined",
        Value::Null => "object",
        Value::Bool(_) => "boolean",
        Value::Num(_) => "number",
        Value::Str(_) => "string",
        Value::Obj(r) => match heap.obj(*r).data {
            ObjData::Func(_) => "function",
            _ => "object",
        },
    }
}

/// True for interpreted, native, async-native and eval-marker functions.
pub fn is_callable(heap: &Heap, v: &Value) -> bool {
    matches!(
        v,
        Value::Obj(r) if matches!(heap.obj(*r).data, ObjData::Func(_))
    )
}

pub fn func_data<'a>(heap: &'a Heap, v: &Value) -> Option<&'a FuncData> {
    match v {
        Value::Obj(r) => match &heap.obj(*r).data {
            ObjData::Func(f) => Some(f),
            _ => None,
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn truthiness() {
        assert!(!to_boolean(&Value::Undefined));
        assert!(!to_boolean(&Value::Null));
        assert!(!to_boolean(&Value::Num(0.0)));
        assert!(!to_boolean(&Value::Num(f64::NAN)));
        assert!(!to_boolean(&Value::Str(String::new())));
        assert!(!to_boolean(&Value::Bool(false)));
        assert!(to_boolean(&Value::Num(-1.0)));
        assert!(to_boolean(&Value::Str(" ".into())));
    }

    #[test]
    fn string_to_number_lexical_rules() {
        assert_eq!(str_to_number("  42  "), 42.0);
        assert_eq!(str_to_number(""), 0.0);
        assert_eq!(str_to_number("0x10"), 16.0);
        assert_eq!(str_to_number("-Infinity"), f64::NEG_INFINITY);
        assert!(str_to_number("12px").is_nan());
        assert!(str_to_number("inf").is_nan());
        assert!(str_to_number("NaN").is_nan());
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-0.5), "-0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(1e21), "1e+21");
    }

    #[test]
    fn nan_is_incomparable() {
        let heap = Heap::new();
        assert_eq!(
            compare(&heap, &Value::Num(f64::NAN), &Value::Num(1.0)),
            Cmp::Incomparable
        );
        assert!(!loose_eq(&heap, &Value::Num(f64::NAN), &Value::Num(f64::NAN)));
    }

    #[test]
    fn primitive_comparison() {
        let heap = Heap::new();
        assert_eq!(compare(&heap, &Value::Num(1.0), &Value::Num(2.0)), Cmp::Less);
        assert_eq!(
            compare(&heap, &Value::Str("a".into()), &Value::Str("b".into())),
            Cmp::Less
        );
        // Mixed primitives compare on their string forms.
        assert_eq!(
            compare(&heap, &Value::Num(1.0), &Value::Str("1".into())),
            Cmp::Equal
        );
    }

    #[test]
    fn distinct_objects_with_equal_string_forms_stay_unequal() {
        let mut heap = Heap::new();
        let a = heap.new_array();
        let b = heap.new_array();
        // Both stringify to "" — still incomparable, == and === both false.
        assert_eq!(
            compare(&heap, &Value::Obj(a), &Value::Obj(b)),
            Cmp::Incomparable
        );
        assert!(!loose_eq(&heap, &Value::Obj(a), &Value::Obj(b)));
        assert!(!strict_eq(&Value::Obj(a), &Value::Obj(b)));
        assert!(loose_eq(&heap, &Value::Obj(a), &Value::Obj(a)));
    }

    #[test]
    fn int32_wrapping() {
        let heap = Heap::new();
        assert_eq!(to_int32(&heap, &Value::Num(f64::NAN)), 0);
        assert_eq!(to_int32(&heap, &Value::Num(4294967296.0)), 0);
        assert_eq!(to_int32(&heap, &Value::Num(-1.0)), -1);
        assert_eq!(to_uint32(&heap, &Value::Num(-1.0)), 4294967295);
    }
}
