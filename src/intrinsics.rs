/// Builtin library: global constructors, prototype methods, and host
/// natives, installed by a fixed initialization routine.
///
/// Every native function is listed once in the NATIVES table; its position
/// there is its stable tag. Snapshots store tags, and because installation
/// order is fixed, the same tag resolves to the same host implementation
/// across runs. New natives may only be appended.
///
/// Sections:
///   registry            — tag table and lookup
///   installation        — prototype objects, constructors, globals
///   free functions      — isNaN, parseInt, URI/escape family
///   Object / Function   — statics, apply/call, toString
///   Array               — push/pop/shift/unshift/splice/slice/concat/...
///   String              — charAt/substring/indexOf/match/replace/split/...
///   Number / Boolean    — toString/toFixed/valueOf
///   Date                — chrono-backed getters, setTime, toISOString
///   RegExp              — regex-crate-backed test/exec
///   Math / JSON         — numeric functions, serde_json bridge
///   sys                 — log, checkpoint, shutdown, hash, parse

use crate::ast::{Ast, Lit, Node, NodeId, NodeRef};
use crate::errors::FatalError;
use crate::heap::{
    ErrorKind, FuncData, LangError, ObjData, ObjRef, Prop, PropFlags, Protos,
};
use crate::interp::Runtime;
use crate::parser::Parser;
use crate::value::{self, Value};
use chrono::{Datelike, SecondsFormat, TimeZone, Timelike, Utc};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use sha3::Sha3_256;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum NativeError {
    Lang(LangError),
    Fatal(FatalError),
}

impl From<LangError> for NativeError {
    fn from(e: LangError) -> NativeError {
        NativeError::Lang(e)
    }
}

pub type NativeResult = Result<Value, NativeError>;
pub type NativeFn = fn(&mut Runtime, &Value, &[Value]) -> NativeResult;
/// Async natives initiate host work and later deliver their value through
/// `Runtime::complete_async`; the stepper is paused in between.
pub type AsyncNativeFn = fn(&mut Runtime, &Value, &[Value]);

#[derive(Clone, Copy)]
pub enum NativeImpl {
    Sync(NativeFn),
    Async(AsyncNativeFn),
}

pub struct NativeEntry {
    pub name: &'static str,
    pub arity: u32,
    pub imp: NativeImpl,
}

pub struct NativeRegistry {
    entries: Vec<NativeEntry>,
    by_name: HashMap<&'static str, u32>,
}

impl NativeRegistry {
    pub fn empty() -> NativeRegistry {
        NativeRegistry { entries: Vec::new(), by_name: HashMap::new() }
    }

    /// Register a native; the returned tag is its index and never changes.
    /// Re-registering a name returns the existing tag.
    pub fn register(&mut self, name: &'static str, arity: u32, imp: NativeImpl) -> u32 {
        if let Some(tag) = self.by_name.get(name) {
            return *tag;
        }
        let tag = self.entries.len() as u32;
        self.entries.push(NativeEntry { name, arity, imp });
        self.by_name.insert(name, tag);
        tag
    }

    pub fn tag_by_name(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, tag: u32) -> &'static str {
        self.entries.get(tag as usize).map(|e| e.name).unwrap_or("")
    }

    pub fn arity_of(&self, tag: u32) -> u32 {
        self.entries.get(tag as usize).map(|e| e.arity).unwrap_or(0)
    }

    pub fn impl_of(&self, tag: u32) -> NativeImpl {
        self.entries
            .get(tag as usize)
            .map(|e| e.imp)
            .unwrap_or(NativeImpl::Sync(missing_native))
    }

    pub fn is_async(&self, tag: u32) -> bool {
        matches!(self.impl_of(tag), NativeImpl::Async(_))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn missing_native(_rt: &mut Runtime, _this: &Value, _args: &[Value]) -> NativeResult {
    Err(LangError::type_error("native function is not available").into())
}

/// The full tag table in registration order. Appending here is the only
/// way the table may change.
pub fn build_registry() -> NativeRegistry {
    let mut reg = NativeRegistry::empty();
    for (name, arity, imp) in NATIVES {
        reg.register(*name, *arity, *imp);
    }
    reg
}

static NATIVES: &[(&str, u32, NativeImpl)] = &[
    // ── Free functions ─────────────────────────────────────────────────────
    ("isNaN", 1, NativeImpl::Sync(global_is_nan)),
    ("isFinite", 1, NativeImpl::Sync(global_is_finite)),
    ("parseInt", 2, NativeImpl::Sync(global_parse_int)),
    ("parseFloat", 1, NativeImpl::Sync(global_parse_float)),
    ("escape", 1, NativeImpl::Sync(global_escape)),
    ("unescape", 1, NativeImpl::Sync(global_unescape)),
    ("encodeURI", 1, NativeImpl::Sync(global_encode_uri)),
    ("encodeURIComponent", 1, NativeImpl::Sync(global_encode_uri_component)),
    ("decodeURI", 1, NativeImpl::Sync(global_decode_uri)),
    ("decodeURIComponent", 1, NativeImpl::Sync(global_decode_uri_component)),
    // ── Constructors ───────────────────────────────────────────────────────
    ("Object", 1, NativeImpl::Sync(ctor_object)),
    ("Function", 1, NativeImpl::Sync(ctor_function)),
    ("Array", 1, NativeImpl::Sync(ctor_array)),
    ("String", 1, NativeImpl::Sync(ctor_string)),
    ("Number", 1, NativeImpl::Sync(ctor_number)),
    ("Boolean", 1, NativeImpl::Sync(ctor_boolean)),
    ("Date", 7, NativeImpl::Sync(ctor_date)),
    ("RegExp", 2, NativeImpl::Sync(ctor_regexp)),
    ("Error", 1, NativeImpl::Sync(ctor_error)),
    ("EvalError", 1, NativeImpl::Sync(ctor_eval_error)),
    ("RangeError", 1, NativeImpl::Sync(ctor_range_error)),
    ("ReferenceError", 1, NativeImpl::Sync(ctor_reference_error)),
    ("SyntaxError", 1, NativeImpl::Sync(ctor_syntax_error)),
    ("TypeError", 1, NativeImpl::Sync(ctor_type_error)),
    ("URIError", 1, NativeImpl::Sync(ctor_uri_error)),
    // ── Object ─────────────────────────────────────────────────────────────
    ("Object.getPrototypeOf", 1, NativeImpl::Sync(object_get_prototype_of)),
    ("Object.create", 2, NativeImpl::Sync(object_create)),
    ("Object.defineProperty", 3, NativeImpl::Sync(object_define_property)),
    ("Object.getOwnPropertyNames", 1, NativeImpl::Sync(object_get_own_property_names)),
    ("Object.keys", 1, NativeImpl::Sync(object_keys)),
    ("Object.preventExtensions", 1, NativeImpl::Sync(object_prevent_extensions)),
    ("Object.isExtensible", 1, NativeImpl::Sync(object_is_extensible)),
    ("Object.prototype.toString", 0, NativeImpl::Sync(object_proto_to_string)),
    ("Object.prototype.valueOf", 0, NativeImpl::Sync(object_proto_value_of)),
    ("Object.prototype.hasOwnProperty", 1, NativeImpl::Sync(object_proto_has_own_property)),
    // ── Function ───────────────────────────────────────────────────────────
    ("Function.prototype.apply", 2, NativeImpl::Sync(function_proto_apply)),
    ("Function.prototype.call", 1, NativeImpl::Sync(function_proto_call)),
    ("Function.prototype.toString", 0, NativeImpl::Sync(function_proto_to_string)),
    // ── Array ──────────────────────────────────────────────────────────────
    ("Array.isArray", 1, NativeImpl::Sync(array_is_array)),
    ("Array.prototype.push", 1, NativeImpl::Sync(array_proto_push)),
    ("Array.prototype.pop", 0, NativeImpl::Sync(array_proto_pop)),
    ("Array.prototype.shift", 0, NativeImpl::Sync(array_proto_shift)),
    ("Array.prototype.unshift", 1, NativeImpl::Sync(array_proto_unshift)),
    ("Array.prototype.splice", 2, NativeImpl::Sync(array_proto_splice)),
    ("Array.prototype.slice", 2, NativeImpl::Sync(array_proto_slice)),
    ("Array.prototype.concat", 1, NativeImpl::Sync(array_proto_concat)),
    ("Array.prototype.indexOf", 1, NativeImpl::Sync(array_proto_index_of)),
    ("Array.prototype.lastIndexOf", 1, NativeImpl::Sync(array_proto_last_index_of)),
    ("Array.prototype.reverse", 0, NativeImpl::Sync(array_proto_reverse)),
    ("Array.prototype.join", 1, NativeImpl::Sync(array_proto_join)),
    ("Array.prototype.toString", 0, NativeImpl::Sync(array_proto_to_string)),
    // ── String ─────────────────────────────────────────────────────────────
    ("String.fromCharCode", 1, NativeImpl::Sync(string_from_char_code)),
    ("String.prototype.charAt", 1, NativeImpl::Sync(string_proto_char_at)),
    ("String.prototype.charCodeAt", 1, NativeImpl::Sync(string_proto_char_code_at)),
    ("String.prototype.substring", 2, NativeImpl::Sync(string_proto_substring)),
    ("String.prototype.slice", 2, NativeImpl::Sync(string_proto_slice)),
    ("String.prototype.indexOf", 1, NativeImpl::Sync(string_proto_index_of)),
    ("String.prototype.lastIndexOf", 1, NativeImpl::Sync(string_proto_last_index_of)),
    ("String.prototype.search", 1, NativeImpl::Sync(string_proto_search)),
    ("String.prototype.match", 1, NativeImpl::Sync(string_proto_match)),
    ("String.prototype.replace", 2, NativeImpl::Sync(string_proto_replace)),
    ("String.prototype.split", 2, NativeImpl::Sync(string_proto_split)),
    ("String.prototype.concat", 1, NativeImpl::Sync(string_proto_concat)),
    ("String.prototype.toLowerCase", 0, NativeImpl::Sync(string_proto_to_lower_case)),
    ("String.prototype.toUpperCase", 0, NativeImpl::Sync(string_proto_to_upper_case)),
    ("String.prototype.trim", 0, NativeImpl::Sync(string_proto_trim)),
    ("String.prototype.trimStart", 0, NativeImpl::Sync(string_proto_trim_start)),
    ("String.prototype.trimEnd", 0, NativeImpl::Sync(string_proto_trim_end)),
    ("String.prototype.toString", 0, NativeImpl::Sync(string_proto_to_string)),
    ("String.prototype.valueOf", 0, NativeImpl::Sync(string_proto_to_string)),
    // ── Number / Boolean ───────────────────────────────────────────────────
    ("Number.prototype.toString", 1, NativeImpl::Sync(number_proto_to_string)),
    ("Number.prototype.toFixed", 1, NativeImpl::Sync(number_proto_to_fixed)),
    ("Number.prototype.valueOf", 0, NativeImpl::Sync(number_proto_value_of)),
    ("Boolean.prototype.toString", 0, NativeImpl::Sync(boolean_proto_to_string)),
    ("Boolean.prototype.valueOf", 0, NativeImpl::Sync(boolean_proto_value_of)),
    // ── Date ───────────────────────────────────────────────────────────────
    ("Date.now", 0, NativeImpl::Sync(date_now)),
    ("Date.parse", 1, NativeImpl::Sync(date_parse)),
    ("Date.prototype.getTime", 0, NativeImpl::Sync(date_proto_get_time)),
    ("Date.prototype.valueOf", 0, NativeImpl::Sync(date_proto_get_time)),
    ("Date.prototype.getFullYear", 0, NativeImpl::Sync(date_proto_get_full_year)),
    ("Date.prototype.getMonth", 0, NativeImpl::Sync(date_proto_get_month)),
    ("Date.prototype.getDate", 0, NativeImpl::Sync(date_proto_get_date)),
    ("Date.prototype.getDay", 0, NativeImpl::Sync(date_proto_get_day)),
    ("Date.prototype.getHours", 0, NativeImpl::Sync(date_proto_get_hours)),
    ("Date.prototype.getMinutes", 0, NativeImpl::Sync(date_proto_get_minutes)),
    ("Date.prototype.getSeconds", 0, NativeImpl::Sync(date_proto_get_seconds)),
    ("Date.prototype.getMilliseconds", 0, NativeImpl::Sync(date_proto_get_milliseconds)),
    ("Date.prototype.setTime", 1, NativeImpl::Sync(date_proto_set_time)),
    ("Date.prototype.toISOString", 0, NativeImpl::Sync(date_proto_to_iso_string)),
    ("Date.prototype.toString", 0, NativeImpl::Sync(date_proto_to_string)),
    // ── RegExp ─────────────────────────────────────────────────────────────
    ("RegExp.prototype.test", 1, NativeImpl::Sync(regexp_proto_test)),
    ("RegExp.prototype.exec", 1, NativeImpl::Sync(regexp_proto_exec)),
    ("RegExp.prototype.toString", 0, NativeImpl::Sync(regexp_proto_to_string)),
    // ── Error ──────────────────────────────────────────────────────────────
    ("Error.prototype.toString", 0, NativeImpl::Sync(error_proto_to_string)),
    // ── Math ───────────────────────────────────────────────────────────────
    ("Math.abs", 1, NativeImpl::Sync(math_abs)),
    ("Math.acos", 1, NativeImpl::Sync(math_acos)),
    ("Math.asin", 1, NativeImpl::Sync(math_asin)),
    ("Math.atan", 1, NativeImpl::Sync(math_atan)),
    ("Math.atan2", 2, NativeImpl::Sync(math_atan2)),
    ("Math.ceil", 1, NativeImpl::Sync(math_ceil)),
    ("Math.cos", 1, NativeImpl::Sync(math_cos)),
    ("Math.exp", 1, NativeImpl::Sync(math_exp)),
    ("Math.floor", 1, NativeImpl::Sync(math_floor)),
    ("Math.log", 1, NativeImpl::Sync(math_log)),
    ("Math.max", 2, NativeImpl::Sync(math_max)),
    ("Math.min", 2, NativeImpl::Sync(math_min)),
    ("Math.pow", 2, NativeImpl::Sync(math_pow)),
    ("Math.random", 0, NativeImpl::Sync(math_random)),
    ("Math.round", 1, NativeImpl::Sync(math_round)),
    ("Math.sin", 1, NativeImpl::Sync(math_sin)),
    ("Math.sqrt", 1, NativeImpl::Sync(math_sqrt)),
    ("Math.tan", 1, NativeImpl::Sync(math_tan)),
    // ── JSON ───────────────────────────────────────────────────────────────
    ("JSON.parse", 2, NativeImpl::Sync(json_parse)),
    ("JSON.stringify", 3, NativeImpl::Sync(json_stringify)),
    // ── sys ────────────────────────────────────────────────────────────────
    ("sys.log", 1, NativeImpl::Sync(sys_log)),
    ("sys.checkpoint", 0, NativeImpl::Sync(sys_checkpoint)),
    ("sys.shutdown", 1, NativeImpl::Sync(sys_shutdown)),
    ("sys.hash", 2, NativeImpl::Sync(sys_hash)),
    ("sys.parse", 1, NativeImpl::Sync(sys_parse)),
    ("sys.parseExpressionAt", 2, NativeImpl::Sync(sys_parse_expression_at)),
];

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

fn native_obj(rt: &mut Runtime, name: &'static str) -> ObjRef {
    let tag = rt.natives.tag_by_name(name).expect("native in table");
    let arity = rt.natives.arity_of(tag);
    rt.heap.new_native_func(tag, arity)
}

fn set_prop_raw(rt: &mut Runtime, owner: ObjRef, key: &str, value: Value, flags: PropFlags) {
    rt.heap.obj_mut(owner).props.insert(key.to_string(), Prop { value, flags });
}

fn install_method(rt: &mut Runtime, owner: ObjRef, key: &str, native: &'static str) {
    let f = native_obj(rt, native);
    set_prop_raw(rt, owner, key, Value::Obj(f), PropFlags::builtin());
}

fn declare_builtin(rt: &mut Runtime, name: &str, value: Value) {
    rt.heap.declare(rt.global, name, value, true);
}

/// Populate the global scope. Runs once at boot; snapshot restores skip it
/// because the installed graph is part of the snapshot.
pub fn install(rt: &mut Runtime) {
    // Prototype objects first; everything hangs off them.
    let object_proto = rt.heap.new_object_with_proto(None);
    let mut protos = Protos::default();
    protos.object = Some(object_proto);
    let function_proto = rt.heap.new_object_with_proto(Some(object_proto));
    protos.function = Some(function_proto);
    for slot in [
        &mut protos.array,
        &mut protos.string,
        &mut protos.number,
        &mut protos.boolean,
        &mut protos.date,
        &mut protos.regexp,
        &mut protos.error,
    ] {
        *slot = Some(rt.heap.new_object_with_proto(Some(object_proto)));
    }
    let error_proto = protos.error.expect("just created");
    for slot in [
        &mut protos.eval_error,
        &mut protos.range_error,
        &mut protos.reference_error,
        &mut protos.syntax_error,
        &mut protos.type_error,
        &mut protos.uri_error,
    ] {
        *slot = Some(rt.heap.new_object_with_proto(Some(error_proto)));
    }
    rt.heap.protos = protos;

    // Free functions.
    for name in [
        "isNaN",
        "isFinite",
        "parseInt",
        "parseFloat",
        "escape",
        "unescape",
        "encodeURI",
        "encodeURIComponent",
        "decodeURI",
        "decodeURIComponent",
    ] {
        let f = native_obj(rt, lookup_static_name(name));
        declare_builtin(rt, name, Value::Obj(f));
    }

    // Constructors, wired to their prototype objects.
    let pairs: [(&str, ObjRef); 15] = [
        ("Object", object_proto),
        ("Function", function_proto),
        ("Array", rt.heap.protos.array.expect("installed")),
        ("String", rt.heap.protos.string.expect("installed")),
        ("Number", rt.heap.protos.number.expect("installed")),
        ("Boolean", rt.heap.protos.boolean.expect("installed")),
        ("Date", rt.heap.protos.date.expect("installed")),
        ("RegExp", rt.heap.protos.regexp.expect("installed")),
        ("Error", rt.heap.protos.error.expect("installed")),
        ("EvalError", rt.heap.protos.eval_error.expect("installed")),
        ("RangeError", rt.heap.protos.range_error.expect("installed")),
        ("ReferenceError", rt.heap.protos.reference_error.expect("installed")),
        ("SyntaxError", rt.heap.protos.syntax_error.expect("installed")),
        ("TypeError", rt.heap.protos.type_error.expect("installed")),
        ("URIError", rt.heap.protos.uri_error.expect("installed")),
    ];
    for (name, proto) in pairs {
        let ctor = native_obj(rt, lookup_static_name(name));
        set_prop_raw(rt, ctor, "prototype", Value::Obj(proto), PropFlags::frozen());
        set_prop_raw(rt, proto, "constructor", Value::Obj(ctor), PropFlags::builtin());
        declare_builtin(rt, name, Value::Obj(ctor));
    }

    // Object statics and prototype.
    let object_ctor = global_obj(rt, "Object");
    install_method(rt, object_ctor, "getPrototypeOf", "Object.getPrototypeOf");
    install_method(rt, object_ctor, "create", "Object.create");
    install_method(rt, object_ctor, "defineProperty", "Object.defineProperty");
    install_method(rt, object_ctor, "getOwnPropertyNames", "Object.getOwnPropertyNames");
    install_method(rt, object_ctor, "keys", "Object.keys");
    install_method(rt, object_ctor, "preventExtensions", "Object.preventExtensions");
    install_method(rt, object_ctor, "isExtensible", "Object.isExtensible");
    install_method(rt, object_proto, "toString", "Object.prototype.toString");
    install_method(rt, object_proto, "valueOf", "Object.prototype.valueOf");
    install_method(rt, object_proto, "hasOwnProperty", "Object.prototype.hasOwnProperty");

    // Function prototype.
    install_method(rt, function_proto, "apply", "Function.prototype.apply");
    install_method(rt, function_proto, "call", "Function.prototype.call");
    install_method(rt, function_proto, "toString", "Function.prototype.toString");

    // Array.
    let array_ctor = global_obj(rt, "Array");
    let array_proto = rt.heap.protos.array.expect("installed");
    install_method(rt, array_ctor, "isArray", "Array.isArray");
    for m in [
        "push", "pop", "shift", "unshift", "splice", "slice", "concat", "indexOf",
        "lastIndexOf", "reverse", "join", "toString",
    ] {
        install_method(rt, array_proto, m, lookup_proto_name("Array", m));
    }

    // String.
    let string_ctor = global_obj(rt, "String");
    let string_proto = rt.heap.protos.string.expect("installed");
    install_method(rt, string_ctor, "fromCharCode", "String.fromCharCode");
    for m in [
        "charAt", "charCodeAt", "substring", "slice", "indexOf", "lastIndexOf", "search",
        "match", "replace", "split", "concat", "toLowerCase", "toUpperCase", "trim",
        "trimStart", "trimEnd", "toString", "valueOf",
    ] {
        install_method(rt, string_proto, m, lookup_proto_name("String", m));
    }

    // Number.
    let number_ctor = global_obj(rt, "Number");
    let number_proto = rt.heap.protos.number.expect("installed");
    for m in ["toString", "toFixed", "valueOf"] {
        install_method(rt, number_proto, m, lookup_proto_name("Number", m));
    }
    set_prop_raw(rt, number_ctor, "MAX_VALUE", Value::Num(f64::MAX), PropFlags::frozen());
    set_prop_raw(rt, number_ctor, "MIN_VALUE", Value::Num(f64::MIN_POSITIVE), PropFlags::frozen());
    set_prop_raw(rt, number_ctor, "NaN", Value::Num(f64::NAN), PropFlags::frozen());
    set_prop_raw(
        rt,
        number_ctor,
        "POSITIVE_INFINITY",
        Value::Num(f64::INFINITY),
        PropFlags::frozen(),
    );
    set_prop_raw(
        rt,
        number_ctor,
        "NEGATIVE_INFINITY",
        Value::Num(f64::NEG_INFINITY),
        PropFlags::frozen(),
    );

    // Boolean.
    let boolean_proto = rt.heap.protos.boolean.expect("installed");
    install_method(rt, boolean_proto, "toString", "Boolean.prototype.toString");
    install_method(rt, boolean_proto, "valueOf", "Boolean.prototype.valueOf");

    // Date.
    let date_ctor = global_obj(rt, "Date");
    let date_proto = rt.heap.protos.date.expect("installed");
    install_method(rt, date_ctor, "now", "Date.now");
    install_method(rt, date_ctor, "parse", "Date.parse");
    for m in [
        "getTime", "valueOf", "getFullYear", "getMonth", "getDate", "getDay", "getHours",
        "getMinutes", "getSeconds", "getMilliseconds", "setTime", "toISOString", "toString",
    ] {
        install_method(rt, date_proto, m, lookup_proto_name("Date", m));
    }

    // RegExp.
    let regexp_proto = rt.heap.protos.regexp.expect("installed");
    for m in ["test", "exec", "toString"] {
        install_method(rt, regexp_proto, m, lookup_proto_name("RegExp", m));
    }

    // Error prototypes: name on each, message and toString on the root.
    let error_proto = rt.heap.protos.error.expect("installed");
    set_prop_raw(rt, error_proto, "message", Value::Str(String::new()), PropFlags::builtin());
    install_method(rt, error_proto, "toString", "Error.prototype.toString");
    for kind in [
        ErrorKind::Error,
        ErrorKind::Eval,
        ErrorKind::Range,
        ErrorKind::Reference,
        ErrorKind::Syntax,
        ErrorKind::Type,
        ErrorKind::Uri,
    ] {
        let proto = rt.heap.protos.error_proto(kind).expect("installed");
        set_prop_raw(rt, proto, "name", Value::Str(kind.name().to_string()), PropFlags::builtin());
    }

    // Math.
    let math = rt.heap.new_plain();
    for m in [
        "abs", "acos", "asin", "atan", "atan2", "ceil", "cos", "exp", "floor", "log", "max",
        "min", "pow", "random", "round", "sin", "sqrt", "tan",
    ] {
        install_method(rt, math, m, lookup_proto_name("Math", m));
    }
    for (name, v) in [
        ("PI", std::f64::consts::PI),
        ("E", std::f64::consts::E),
        ("LN2", std::f64::consts::LN_2),
        ("LN10", std::f64::consts::LN_10),
        ("LOG2E", std::f64::consts::LOG2_E),
        ("LOG10E", std::f64::consts::LOG10_E),
        ("SQRT2", std::f64::consts::SQRT_2),
        ("SQRT1_2", std::f64::consts::FRAC_1_SQRT_2),
    ] {
        set_prop_raw(rt, math, name, Value::Num(v), PropFlags::frozen());
    }
    declare_builtin(rt, "Math", Value::Obj(math));

    // JSON.
    let json = rt.heap.new_plain();
    install_method(rt, json, "parse", "JSON.parse");
    install_method(rt, json, "stringify", "JSON.stringify");
    declare_builtin(rt, "JSON", Value::Obj(json));

    // The host utility namespace.
    let sys = rt.heap.new_plain();
    install_method(rt, sys, "log", "sys.log");
    install_method(rt, sys, "checkpoint", "sys.checkpoint");
    install_method(rt, sys, "shutdown", "sys.shutdown");
    install_method(rt, sys, "hash", "sys.hash");
    install_method(rt, sys, "parse", "sys.parse");
    install_method(rt, sys, "parseExpressionAt", "sys.parseExpressionAt");
    declare_builtin(rt, "sys", Value::Obj(sys));

    // The eval marker and the value singletons.
    let function_proto = rt.heap.protos.function.expect("installed");
    let eval_obj = rt.heap.alloc(crate::heap::Object::new(
        Some(function_proto),
        ObjData::Func(FuncData::Eval),
    ));
    declare_builtin(rt, "eval", Value::Obj(eval_obj));
    declare_builtin(rt, "undefined", Value::Undefined);
    declare_builtin(rt, "NaN", Value::Num(f64::NAN));
    declare_builtin(rt, "Infinity", Value::Num(f64::INFINITY));
}

fn global_obj(rt: &Runtime, name: &str) -> ObjRef {
    match rt.heap.lookup(rt.global, name) {
        Some(Value::Obj(r)) => r,
        _ => panic!("builtin global '{}' missing during install", name),
    }
}

/// Map a bare global name to its table entry (they coincide).
fn lookup_static_name(name: &str) -> &'static str {
    NATIVES
        .iter()
        .map(|(n, _, _)| *n)
        .find(|n| *n == name)
        .expect("name in table")
}

fn lookup_proto_name(owner: &str, method: &str) -> &'static str {
    let dotted = format!("{}.prototype.{}", owner, method);
    let plain = format!("{}.{}", owner, method);
    NATIVES
        .iter()
        .map(|(n, _, _)| *n)
        .find(|n| *n == dotted || *n == plain)
        .expect("method in table")
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

fn to_str(rt: &Runtime, v: &Value) -> String {
    value::to_string(&rt.heap, v)
}

fn to_num(rt: &Runtime, v: &Value) -> f64 {
    value::to_number(&rt.heap, v)
}

fn this_array(rt: &Runtime, this: &Value) -> Result<ObjRef, NativeError> {
    match this {
        Value::Obj(r) if matches!(rt.heap.obj(*r).data, ObjData::Array { .. }) => Ok(*r),
        _ => Err(LangError::type_error("method requires an array receiver").into()),
    }
}

fn this_regex(rt: &Runtime, this: &Value) -> Result<(ObjRef, String, String), NativeError> {
    match this {
        Value::Obj(r) => match &rt.heap.obj(*r).data {
            ObjData::Regex { source, flags } => Ok((*r, source.clone(), flags.clone())),
            _ => Err(LangError::type_error("method requires a regexp receiver").into()),
        },
        _ => Err(LangError::type_error("method requires a regexp receiver").into()),
    }
}

fn this_date_ms(rt: &Runtime, this: &Value) -> Result<f64, NativeError> {
    match this {
        Value::Obj(r) => match rt.heap.obj(*r).data {
            ObjData::Date { ms } => Ok(ms),
            _ => Err(LangError::type_error("method requires a date receiver").into()),
        },
        _ => Err(LangError::type_error("method requires a date receiver").into()),
    }
}

fn array_len(rt: &Runtime, r: ObjRef) -> u32 {
    match rt.heap.obj(r).data {
        ObjData::Array { length } => length,
        _ => 0,
    }
}

fn read_elems(rt: &Runtime, r: ObjRef) -> Vec<Value> {
    let len = array_len(rt, r);
    (0..len)
        .map(|i| {
            rt.heap
                .get_prop_chain(r, &i.to_string())
                .unwrap_or(Value::Undefined)
        })
        .collect()
}

fn write_elems(rt: &mut Runtime, r: ObjRef, items: &[Value]) -> Result<(), NativeError> {
    rt.heap
        .set_prop(&Value::Obj(r), "length", Value::Num(0.0))
        .map_err(NativeError::Lang)?;
    for (i, v) in items.iter().enumerate() {
        rt.heap
            .set_prop(&Value::Obj(r), &i.to_string(), v.clone())
            .map_err(NativeError::Lang)?;
    }
    Ok(())
}

fn make_array(rt: &mut Runtime, items: Vec<Value>) -> Value {
    let r = rt.heap.new_array();
    for (i, v) in items.into_iter().enumerate() {
        let _ = rt.heap.set_prop(&Value::Obj(r), &i.to_string(), v);
    }
    Value::Obj(r)
}

/// Normalize a relative index against a length, the way slice and friends
/// do: negatives count from the end, the result is clamped to [0, len].
fn rel_index(n: f64, len: usize) -> usize {
    if n.is_nan() {
        return 0;
    }
    if n < 0.0 {
        let i = len as f64 + n;
        if i < 0.0 {
            0
        } else {
            i as usize
        }
    } else if n > len as f64 {
        len
    } else {
        n as usize
    }
}

pub fn compile_regex(source: &str, flags: &str) -> Result<regex::Regex, LangError> {
    regex::RegexBuilder::new(source)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .build()
        .map_err(|e| LangError::syntax_error(format!("Invalid regular expression: {}", e)))
}

fn byte_to_char_index(s: &str, byte: usize) -> usize {
    s[..byte].chars().count()
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

fn global_is_nan(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    Ok(Value::Bool(to_num(rt, &arg(args, 0)).is_nan()))
}

fn global_is_finite(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    Ok(Value::Bool(to_num(rt, &arg(args, 0)).is_finite()))
}

fn global_parse_int(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    let mut t = s.trim();
    let mut sign = 1.0;
    if let Some(rest) = t.strip_prefix('-') {
        sign = -1.0;
        t = rest;
    } else if let Some(rest) = t.strip_prefix('+') {
        t = rest;
    }
    let radix_arg = to_num(rt, &arg(args, 1));
    let mut radix = if radix_arg.is_nan() || radix_arg == 0.0 { 0 } else { radix_arg as i64 };
    if radix != 0 && !(2..=36).contains(&radix) {
        return Ok(Value::Num(f64::NAN));
    }
    if (radix == 0 || radix == 16)
        && (t.starts_with("0x") || t.starts_with("0X"))
    {
        radix = 16;
        t = &t[2..];
    }
    if radix == 0 {
        radix = 10;
    }
    let digits: String = t
        .chars()
        .take_while(|c| c.to_digit(36).map_or(false, |d| (d as i64) < radix))
        .collect();
    if digits.is_empty() {
        return Ok(Value::Num(f64::NAN));
    }
    let mut n = 0.0f64;
    for ch in digits.chars() {
        n = n * radix as f64 + ch.to_digit(36).expect("checked above") as f64;
    }
    Ok(Value::Num(sign * n))
}

fn global_parse_float(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    let t = s.trim_start();
    // Longest valid float prefix.
    let bytes = t.as_bytes();
    let mut i = 0;
    let mut seen_digit = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    if t[i..].starts_with("Infinity") {
        let v = if bytes.first() == Some(&b'-') { f64::NEG_INFINITY } else { f64::INFINITY };
        return Ok(Value::Num(v));
    }
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        seen_digit = true;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            seen_digit = true;
        }
    }
    if seen_digit && i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    if !seen_digit {
        return Ok(Value::Num(f64::NAN));
    }
    Ok(Value::Num(t[..i].parse::<f64>().unwrap_or(f64::NAN)))
}

fn escape_set(s: &str, keep: fn(char) -> bool) -> String {
    let mut out = String::new();
    for ch in s.chars() {
        if keep(ch) {
            out.push(ch);
        } else {
            let mut buf = [0u8; 4];
            for b in ch.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        }
    }
    out
}

fn global_escape(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    let mut out = String::new();
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() || "@*_+-./".contains(ch) {
            out.push(ch);
        } else if (ch as u32) < 256 {
            out.push_str(&format!("%{:02X}", ch as u32));
        } else {
            out.push_str(&format!("%u{:04X}", ch as u32));
        }
    }
    Ok(Value::Str(out))
}

fn global_unescape(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '%' && i + 5 < chars.len() && chars[i + 1] == 'u' {
            let hex: String = chars[i + 2..i + 6].iter().collect();
            if let Ok(code) = u32::from_str_radix(&hex, 16) {
                out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                i += 6;
                continue;
            }
        }
        if chars[i] == '%' && i + 2 < chars.len() {
            let hex: String = chars[i + 1..i + 3].iter().collect();
            if let Ok(code) = u32::from_str_radix(&hex, 16) {
                out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                i += 3;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    Ok(Value::Str(out))
}

fn global_encode_uri(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    Ok(Value::Str(escape_set(&s, |c| {
        c.is_ascii_alphanumeric() || "-_.!~*'();/?:@&=+$,#".contains(c)
    })))
}

fn global_encode_uri_component(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    Ok(Value::Str(escape_set(&s, |c| {
        c.is_ascii_alphanumeric() || "-_.!~*'()".contains(c)
    })))
}

fn percent_decode(s: &str) -> Result<String, LangError> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return Err(LangError::uri_error("URI malformed"));
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .map_err(|_| LangError::uri_error("URI malformed"))?;
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| LangError::uri_error("URI malformed"))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| LangError::uri_error("URI malformed"))
}

fn global_decode_uri(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    Ok(Value::Str(percent_decode(&s)?))
}

fn global_decode_uri_component(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    Ok(Value::Str(percent_decode(&s)?))
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

fn ctor_object(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    match arg(args, 0) {
        Value::Obj(r) => Ok(Value::Obj(r)),
        _ => Ok(Value::Obj(rt.heap.new_plain())),
    }
}

fn ctor_function(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    // Function(p1, ..., pN, body): parse a synthetic function expression.
    let (params, body) = match args.split_last() {
        None => (String::new(), String::new()),
        Some((body, params)) => {
            let names: Vec<String> = params.iter().map(|p| to_str(rt, p)).collect();
            (names.join(", "), to_str(rt, body))
        }
    };
    let src = format!("(function anonymous({}) {{\n{}\n}});", params, body);
    let ast = Parser::parse_program(&src).map_err(|source| {
        NativeError::Fatal(FatalError::Parse { origin: "Function constructor".to_string(), source })
    })?;
    let func_id = find_function_expression(&ast).ok_or_else(|| {
        NativeError::Fatal(FatalError::Corrupt("synthetic function body lost"))
    })?;
    let arity = match ast.node(func_id) {
        Node::FunctionExpression { params, .. } => params.len() as u32,
        _ => 0,
    };
    let prog = rt.register_program(ast);
    let global = rt.global;
    let func = rt.heap.new_interp_func(NodeRef::new(prog, func_id), global, arity);
    Ok(Value::Obj(func))
}

fn find_function_expression(ast: &Ast) -> Option<NodeId> {
    ast.nodes
        .iter()
        .position(|n| matches!(n, Node::FunctionExpression { .. }))
        .map(|i| NodeId(i as u32))
}

fn ctor_array(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    if args.len() == 1 {
        if let Value::Num(n) = args[0] {
            if n < 0.0 || n.fract() != 0.0 || n > u32::MAX as f64 {
                return Err(LangError::range_error("Invalid array length").into());
            }
            let r = rt.heap.new_array();
            if let ObjData::Array { length } = &mut rt.heap.obj_mut(r).data {
                *length = n as u32;
            }
            return Ok(Value::Obj(r));
        }
    }
    Ok(make_array(rt, args.to_vec()))
}

fn ctor_string(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    if args.is_empty() {
        return Ok(Value::Str(String::new()));
    }
    Ok(Value::Str(to_str(rt, &args[0])))
}

fn ctor_number(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    if args.is_empty() {
        return Ok(Value::Num(0.0));
    }
    Ok(Value::Num(to_num(rt, &args[0])))
}

fn ctor_boolean(_rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    Ok(Value::Bool(value::to_boolean(&arg(args, 0))))
}

fn ctor_date(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let ms = match args.len() {
        0 => Utc::now().timestamp_millis() as f64,
        1 => match &args[0] {
            Value::Str(s) => parse_date_string(s),
            other => to_num(rt, other),
        },
        _ => {
            let year = to_num(rt, &arg(args, 0));
            let month = to_num(rt, &arg(args, 1));
            let day = if args.len() > 2 { to_num(rt, &arg(args, 2)) } else { 1.0 };
            let hour = if args.len() > 3 { to_num(rt, &arg(args, 3)) } else { 0.0 };
            let min = if args.len() > 4 { to_num(rt, &arg(args, 4)) } else { 0.0 };
            let sec = if args.len() > 5 { to_num(rt, &arg(args, 5)) } else { 0.0 };
            let msec = if args.len() > 6 { to_num(rt, &arg(args, 6)) } else { 0.0 };
            match Utc
                .with_ymd_and_hms(year as i32, month as u32 + 1, day as u32, hour as u32,
                    min as u32, sec as u32)
                .single()
            {
                Some(dt) => dt.timestamp_millis() as f64 + msec,
                None => f64::NAN,
            }
        }
    };
    // Called without `new` there is no fresh receiver: hand back the
    // current time as a string, the way the language does.
    if !this.is_obj() {
        return Ok(Value::Str(value::date_to_string(
            Utc::now().timestamp_millis() as f64,
        )));
    }
    Ok(Value::Obj(rt.heap.new_date(ms)))
}

fn parse_date_string(s: &str) -> f64 {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s.trim()) {
        return dt.timestamp_millis() as f64;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(s.trim()) {
        return dt.timestamp_millis() as f64;
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Utc.from_utc_datetime(&dt).timestamp_millis() as f64;
        }
    }
    f64::NAN
}

fn ctor_regexp(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let source = match arg(args, 0) {
        Value::Undefined => String::new(),
        Value::Obj(r) => match &rt.heap.obj(r).data {
            ObjData::Regex { source, .. } => source.clone(),
            _ => to_str(rt, &arg(args, 0)),
        },
        other => to_str(rt, &other),
    };
    let flags = match arg(args, 1) {
        Value::Undefined => String::new(),
        other => to_str(rt, &other),
    };
    compile_regex(&source, &flags)?;
    Ok(Value::Obj(rt.heap.new_regex(&source, &flags)))
}

fn make_error_ctor(rt: &mut Runtime, kind: ErrorKind, args: &[Value]) -> NativeResult {
    let r = match arg(args, 0) {
        Value::Undefined => rt.heap.new_error(kind, ""),
        msg => {
            let text = to_str(rt, &msg);
            rt.heap.new_error(kind, &text)
        }
    };
    Ok(Value::Obj(r))
}

fn ctor_error(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    make_error_ctor(rt, ErrorKind::Error, args)
}

fn ctor_eval_error(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    make_error_ctor(rt, ErrorKind::Eval, args)
}

fn ctor_range_error(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    make_error_ctor(rt, ErrorKind::Range, args)
}

fn ctor_reference_error(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    make_error_ctor(rt, ErrorKind::Reference, args)
}

fn ctor_syntax_error(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    make_error_ctor(rt, ErrorKind::Syntax, args)
}

fn ctor_type_error(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    make_error_ctor(rt, ErrorKind::Type, args)
}

fn ctor_uri_error(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    make_error_ctor(rt, ErrorKind::Uri, args)
}

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

fn need_obj(v: &Value) -> Result<ObjRef, NativeError> {
    v.as_obj()
        .ok_or_else(|| LangError::type_error("argument is not an object").into())
}

fn object_get_prototype_of(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let r = need_obj(&arg(args, 0))?;
    Ok(match rt.heap.obj(r).proto {
        Some(p) => Value::Obj(p),
        None => Value::Null,
    })
}

fn object_create(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let proto = match arg(args, 0) {
        Value::Null => None,
        Value::Obj(r) => Some(r),
        _ => return Err(LangError::type_error("prototype must be an object or null").into()),
    };
    let obj = rt.heap.new_object_with_proto(proto);
    if let Value::Obj(props) = arg(args, 1) {
        let keys = rt.heap.own_enumerable_keys(&Value::Obj(props));
        for key in keys {
            let desc = rt
                .heap
                .get_prop_chain(props, &key)
                .unwrap_or(Value::Undefined);
            define_from_descriptor(rt, obj, &key, &desc)?;
        }
    }
    Ok(Value::Obj(obj))
}

fn define_from_descriptor(
    rt: &mut Runtime,
    obj: ObjRef,
    key: &str,
    desc: &Value,
) -> Result<(), NativeError> {
    let d = need_obj(desc)
        .map_err(|_| NativeError::from(LangError::type_error("property descriptor must be an object")))?;
    let existing = rt.heap.obj(obj).props.get(key).map(|p| p.flags);
    // Absent attributes keep their current setting, or default to the
    // locked-down state for brand new properties.
    let mut flags = existing.unwrap_or(PropFlags::frozen());
    let read = |rt: &Runtime, name: &str| rt.heap.get_prop_chain(d, name);
    if let Some(w) = read(rt, "writable") {
        flags.set(PropFlags::NONWRITABLE, !value::to_boolean(&w));
    }
    if let Some(e) = read(rt, "enumerable") {
        flags.set(PropFlags::NONENUMERABLE, !value::to_boolean(&e));
    }
    if let Some(c) = read(rt, "configurable") {
        flags.set(PropFlags::NONCONFIGURABLE, !value::to_boolean(&c));
    }
    let val = read(rt, "value");
    rt.heap
        .define_prop(obj, key, val, flags)
        .map_err(NativeError::Lang)
}

fn object_define_property(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let obj = need_obj(&arg(args, 0))?;
    let key = to_str(rt, &arg(args, 1));
    define_from_descriptor(rt, obj, &key, &arg(args, 2))?;
    Ok(Value::Obj(obj))
}

fn object_get_own_property_names(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let r = need_obj(&arg(args, 0))?;
    let names: Vec<Value> = rt
        .heap
        .own_property_names(r)
        .into_iter()
        .map(Value::Str)
        .collect();
    Ok(make_array(rt, names))
}

fn object_keys(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let r = need_obj(&arg(args, 0))?;
    let names: Vec<Value> = rt
        .heap
        .own_enumerable_keys(&Value::Obj(r))
        .into_iter()
        .map(Value::Str)
        .collect();
    Ok(make_array(rt, names))
}

fn object_prevent_extensions(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let r = need_obj(&arg(args, 0))?;
    rt.heap.obj_mut(r).extensible = false;
    Ok(Value::Obj(r))
}

fn object_is_extensible(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let r = need_obj(&arg(args, 0))?;
    Ok(Value::Bool(rt.heap.obj(r).extensible))
}

fn object_proto_to_string(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(to_str(rt, this)))
}

fn object_proto_value_of(_rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(this.clone())
}

fn object_proto_has_own_property(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let key = to_str(rt, &arg(args, 0));
    match this {
        Value::Obj(r) => Ok(Value::Bool(rt.heap.has_own(*r, &key))),
        Value::Str(s) => {
            let own = key == "length"
                || crate::heap::index_of(&key)
                    .map_or(false, |i| (i as usize) < s.chars().count());
            Ok(Value::Bool(own))
        }
        _ => Ok(Value::Bool(false)),
    }
}

// ---------------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------------

// apply and call are rewritten inside the stepper's call dispatch; these
// bodies are only reachable through exotic indirections and simply refuse.
fn function_proto_apply(_rt: &mut Runtime, _this: &Value, _args: &[Value]) -> NativeResult {
    Err(LangError::type_error("apply must be invoked on a function").into())
}

fn function_proto_call(_rt: &mut Runtime, _this: &Value, _args: &[Value]) -> NativeResult {
    Err(LangError::type_error("call must be invoked on a function").into())
}

fn function_proto_to_string(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    match value::func_data(&rt.heap, this) {
        Some(FuncData::Interp { node, .. }) => {
            let ast = &rt.programs[node.prog as usize];
            let text = match ast.node(node.id) {
                Node::FunctionDeclaration { span, .. } | Node::FunctionExpression { span, .. } => {
                    ast.source.get(span.start..span.end).unwrap_or("").to_string()
                }
                _ => String::new(),
            };
            Ok(Value::Str(text))
        }
        Some(_) => Ok(Value::Str("function () { [native code] }".to_string())),
        None => Err(LangError::type_error("receiver is not a function").into()),
    }
}

// ---------------------------------------------------------------------------
// Array
// ---------------------------------------------------------------------------

fn array_is_array(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let is = matches!(
        arg(args, 0),
        Value::Obj(r) if matches!(rt.heap.obj(r).data, ObjData::Array { .. })
    );
    Ok(Value::Bool(is))
}

fn array_proto_push(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let mut len = array_len(rt, r);
    for v in args {
        rt.heap
            .set_prop(&Value::Obj(r), &len.to_string(), v.clone())
            .map_err(NativeError::Lang)?;
        len += 1;
    }
    Ok(Value::Num(len as f64))
}

fn array_proto_pop(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let len = array_len(rt, r);
    if len == 0 {
        return Ok(Value::Undefined);
    }
    let last = rt
        .heap
        .get_prop_chain(r, &(len - 1).to_string())
        .unwrap_or(Value::Undefined);
    rt.heap
        .set_prop(&Value::Obj(r), "length", Value::Num((len - 1) as f64))
        .map_err(NativeError::Lang)?;
    Ok(last)
}

fn array_proto_shift(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let mut items = read_elems(rt, r);
    if items.is_empty() {
        return Ok(Value::Undefined);
    }
    let first = items.remove(0);
    write_elems(rt, r, &items)?;
    Ok(first)
}

fn array_proto_unshift(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let mut items = read_elems(rt, r);
    for (i, v) in args.iter().enumerate() {
        items.insert(i, v.clone());
    }
    write_elems(rt, r, &items)?;
    Ok(Value::Num(items.len() as f64))
}

fn array_proto_splice(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let mut items = read_elems(rt, r);
    let len = items.len();
    let start = rel_index(to_num(rt, &arg(args, 0)), len);
    let delete_count = if args.len() > 1 {
        let n = to_num(rt, &arg(args, 1));
        if n.is_nan() || n < 0.0 {
            0
        } else {
            (n as usize).min(len - start)
        }
    } else {
        len - start
    };
    let removed: Vec<Value> = items.splice(start..start + delete_count, args.iter().skip(2).cloned()).collect();
    write_elems(rt, r, &items)?;
    Ok(make_array(rt, removed))
}

fn array_proto_slice(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let items = read_elems(rt, r);
    let len = items.len();
    let start = rel_index(to_num(rt, &arg(args, 0)), len);
    let end = match arg(args, 1) {
        Value::Undefined => len,
        other => rel_index(to_num(rt, &other), len),
    };
    let out = if start < end { items[start..end].to_vec() } else { Vec::new() };
    Ok(make_array(rt, out))
}

fn array_proto_concat(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let mut items = read_elems(rt, r);
    for a in args {
        match a {
            Value::Obj(o) if matches!(rt.heap.obj(*o).data, ObjData::Array { .. }) => {
                items.extend(read_elems(rt, *o));
            }
            other => items.push(other.clone()),
        }
    }
    Ok(make_array(rt, items))
}

fn array_proto_index_of(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let items = read_elems(rt, r);
    let needle = arg(args, 0);
    let from = if args.len() > 1 { rel_index(to_num(rt, &arg(args, 1)), items.len()) } else { 0 };
    for (i, v) in items.iter().enumerate().skip(from) {
        if value::strict_eq(v, &needle) {
            return Ok(Value::Num(i as f64));
        }
    }
    Ok(Value::Num(-1.0))
}

fn array_proto_last_index_of(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let items = read_elems(rt, r);
    let needle = arg(args, 0);
    for (i, v) in items.iter().enumerate().rev() {
        if value::strict_eq(v, &needle) {
            return Ok(Value::Num(i as f64));
        }
    }
    Ok(Value::Num(-1.0))
}

fn array_proto_reverse(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let mut items = read_elems(rt, r);
    items.reverse();
    write_elems(rt, r, &items)?;
    Ok(Value::Obj(r))
}

fn array_proto_join(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = this_array(rt, this)?;
    let sep = match arg(args, 0) {
        Value::Undefined => ",".to_string(),
        other => to_str(rt, &other),
    };
    let mut seen = vec![r];
    Ok(Value::Str(value::array_join(&rt.heap, r, &sep, &mut seen)))
}

fn array_proto_to_string(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    array_proto_join(rt, this, &[])
}

// ---------------------------------------------------------------------------
// String
// ---------------------------------------------------------------------------

fn this_string(rt: &Runtime, this: &Value) -> String {
    value::to_string(&rt.heap, this)
}

fn string_from_char_code(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let mut out = String::new();
    for a in args {
        let code = to_num(rt, a);
        if code.is_finite() && code >= 0.0 {
            out.push(char::from_u32(code as u32).unwrap_or('\u{FFFD}'));
        }
    }
    Ok(Value::Str(out))
}

fn string_proto_char_at(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let i = to_num(rt, &arg(args, 0));
    let idx = if i.is_nan() { 0.0 } else { i };
    if idx < 0.0 {
        return Ok(Value::Str(String::new()));
    }
    Ok(Value::Str(
        s.chars()
            .nth(idx as usize)
            .map(|c| c.to_string())
            .unwrap_or_default(),
    ))
}

fn string_proto_char_code_at(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let i = to_num(rt, &arg(args, 0));
    let idx = if i.is_nan() { 0.0 } else { i };
    if idx < 0.0 {
        return Ok(Value::Num(f64::NAN));
    }
    Ok(match s.chars().nth(idx as usize) {
        Some(c) => Value::Num(c as u32 as f64),
        None => Value::Num(f64::NAN),
    })
}

fn string_proto_substring(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let a = rel_clamp(to_num(rt, &arg(args, 0)), len);
    let b = match arg(args, 1) {
        Value::Undefined => len,
        other => rel_clamp(to_num(rt, &other), len),
    };
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    Ok(Value::Str(chars[lo..hi].iter().collect()))
}

/// substring-style clamp: NaN and negatives go to 0, overshoot to len.
fn rel_clamp(n: f64, len: usize) -> usize {
    if n.is_nan() || n < 0.0 {
        0
    } else if n > len as f64 {
        len
    } else {
        n as usize
    }
}

fn string_proto_slice(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let start = rel_index(to_num(rt, &arg(args, 0)), len);
    let end = match arg(args, 1) {
        Value::Undefined => len,
        other => rel_index(to_num(rt, &other), len),
    };
    let out: String = if start < end { chars[start..end].iter().collect() } else { String::new() };
    Ok(Value::Str(out))
}

fn string_proto_index_of(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let needle = to_str(rt, &arg(args, 0));
    let from = to_num(rt, &arg(args, 1));
    let from = if from.is_nan() || from < 0.0 { 0 } else { from as usize };
    let chars: Vec<char> = s.chars().collect();
    let hay: String = chars.iter().skip(from).collect();
    Ok(match hay.find(&needle) {
        Some(byte) => Value::Num((from + byte_to_char_index(&hay, byte)) as f64),
        None => Value::Num(-1.0),
    })
}

fn string_proto_last_index_of(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let needle = to_str(rt, &arg(args, 0));
    Ok(match s.rfind(&needle) {
        Some(byte) => Value::Num(byte_to_char_index(&s, byte) as f64),
        None => Value::Num(-1.0),
    })
}

/// The pattern argument of search/match/replace/split: a regex object is
/// used as-is, anything else is stringified into an escaped literal match.
fn pattern_of(rt: &Runtime, v: &Value) -> Result<(regex::Regex, bool), LangError> {
    match v {
        Value::Obj(r) => {
            if let ObjData::Regex { source, flags } = &rt.heap.obj(*r).data {
                return Ok((compile_regex(source, flags)?, flags.contains('g')));
            }
            let text = value::to_string(&rt.heap, v);
            Ok((compile_regex(&regex::escape(&text), "")?, false))
        }
        other => {
            let text = value::to_string(&rt.heap, other);
            Ok((compile_regex(&regex::escape(&text), "")?, false))
        }
    }
}

fn string_proto_search(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let (re, _) = pattern_of(rt, &arg(args, 0))?;
    Ok(match re.find(&s) {
        Some(m) => Value::Num(byte_to_char_index(&s, m.start()) as f64),
        None => Value::Num(-1.0),
    })
}

fn match_to_array(rt: &mut Runtime, s: &str, caps: &regex::Captures) -> Value {
    let mut items = Vec::new();
    for i in 0..caps.len() {
        items.push(match caps.get(i) {
            Some(m) => Value::Str(m.as_str().to_string()),
            None => Value::Undefined,
        });
    }
    let arr = make_array(rt, items);
    if let Some(m) = caps.get(0) {
        let idx = byte_to_char_index(s, m.start());
        let _ = rt.heap.set_prop(&arr, "index", Value::Num(idx as f64));
        let _ = rt.heap.set_prop(&arr, "input", Value::Str(s.to_string()));
    }
    arr
}

fn string_proto_match(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let (re, global) = pattern_of(rt, &arg(args, 0))?;
    if global {
        let all: Vec<Value> = re
            .find_iter(&s)
            .map(|m| Value::Str(m.as_str().to_string()))
            .collect();
        if all.is_empty() {
            return Ok(Value::Null);
        }
        return Ok(make_array(rt, all));
    }
    match re.captures(&s) {
        Some(caps) => Ok(match_to_array(rt, &s, &caps)),
        None => Ok(Value::Null),
    }
}

fn expand_replacement(caps: &regex::Captures, template: &str) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() {
            match chars[i + 1] {
                '$' => {
                    out.push('$');
                    i += 2;
                    continue;
                }
                '&' => {
                    out.push_str(caps.get(0).map(|m| m.as_str()).unwrap_or(""));
                    i += 2;
                    continue;
                }
                d if d.is_ascii_digit() => {
                    let n = d.to_digit(10).expect("digit") as usize;
                    if n > 0 && n < caps.len() {
                        out.push_str(caps.get(n).map(|m| m.as_str()).unwrap_or(""));
                        i += 2;
                        continue;
                    }
                }
                _ => {}
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn string_proto_replace(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let (re, global) = pattern_of(rt, &arg(args, 0))?;
    let template = to_str(rt, &arg(args, 1));
    let replaced = if global {
        re.replace_all(&s, |caps: &regex::Captures| expand_replacement(caps, &template))
            .into_owned()
    } else {
        re.replace(&s, |caps: &regex::Captures| expand_replacement(caps, &template))
            .into_owned()
    };
    Ok(Value::Str(replaced))
}

fn string_proto_split(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let s = this_string(rt, this);
    let sep = arg(args, 0);
    let limit = match arg(args, 1) {
        Value::Undefined => usize::MAX,
        other => to_num(rt, &other) as usize,
    };
    if matches!(sep, Value::Undefined) {
        return Ok(make_array(rt, vec![Value::Str(s)]));
    }
    let parts: Vec<Value> = match &sep {
        Value::Str(sep_str) if sep_str.is_empty() => {
            s.chars().map(|c| Value::Str(c.to_string())).collect()
        }
        Value::Str(sep_str) => s.split(sep_str.as_str()).map(|p| Value::Str(p.to_string())).collect(),
        other => {
            let (re, _) = pattern_of(rt, other)?;
            re.split(&s).map(|p| Value::Str(p.to_string())).collect()
        }
    };
    let parts = parts.into_iter().take(limit).collect();
    Ok(make_array(rt, parts))
}

fn string_proto_concat(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let mut s = this_string(rt, this);
    for a in args {
        s.push_str(&to_str(rt, a));
    }
    Ok(Value::Str(s))
}

fn string_proto_to_lower_case(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(this_string(rt, this).to_lowercase()))
}

fn string_proto_to_upper_case(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(this_string(rt, this).to_uppercase()))
}

fn string_proto_trim(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(this_string(rt, this).trim().to_string()))
}

fn string_proto_trim_start(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(this_string(rt, this).trim_start().to_string()))
}

fn string_proto_trim_end(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(this_string(rt, this).trim_end().to_string()))
}

fn string_proto_to_string(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(this_string(rt, this)))
}

// ---------------------------------------------------------------------------
// Number / Boolean
// ---------------------------------------------------------------------------

fn number_proto_to_string(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let n = to_num(rt, this);
    let radix = match arg(args, 0) {
        Value::Undefined => 10,
        other => to_num(rt, &other) as u32,
    };
    if radix == 10 {
        return Ok(Value::Str(value::number_to_string(n)));
    }
    if !(2..=36).contains(&radix) {
        return Err(LangError::range_error("toString() radix must be between 2 and 36").into());
    }
    Ok(Value::Str(number_to_radix(n, radix)))
}

fn number_to_radix(n: f64, radix: u32) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if !n.is_finite() {
        return if n > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    let neg = n < 0.0;
    let mut int = n.abs().trunc() as u64;
    let mut frac = n.abs().fract();
    let digits = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut whole = Vec::new();
    if int == 0 {
        whole.push(b'0');
    }
    while int > 0 {
        whole.push(digits[(int % radix as u64) as usize]);
        int /= radix as u64;
    }
    whole.reverse();
    let mut out = String::from_utf8(whole).expect("ascii digits");
    if frac > 0.0 {
        out.push('.');
        for _ in 0..20 {
            frac *= radix as f64;
            let d = frac.trunc() as usize;
            out.push(digits[d] as char);
            frac -= frac.trunc();
            if frac == 0.0 {
                break;
            }
        }
    }
    if neg {
        format!("-{}", out)
    } else {
        out
    }
}

fn number_proto_to_fixed(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let n = to_num(rt, this);
    let d = to_num(rt, &arg(args, 0));
    let d = if d.is_nan() { 0.0 } else { d };
    if !(0.0..=100.0).contains(&d) {
        return Err(LangError::range_error("toFixed() digits argument must be between 0 and 100").into());
    }
    Ok(Value::Str(format!("{:.*}", d as usize, n)))
}

fn number_proto_value_of(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Num(to_num(rt, this)))
}

fn boolean_proto_to_string(_rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(value::to_boolean(this).to_string()))
}

fn boolean_proto_value_of(_rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Bool(value::to_boolean(this)))
}

// ---------------------------------------------------------------------------
// Date
// ---------------------------------------------------------------------------

fn date_now(_rt: &mut Runtime, _this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Num(Utc::now().timestamp_millis() as f64))
}

fn date_parse(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let s = to_str(rt, &arg(args, 0));
    Ok(Value::Num(parse_date_string(&s)))
}

fn date_field(
    rt: &Runtime,
    this: &Value,
    f: fn(chrono::DateTime<Utc>) -> f64,
) -> Result<Value, NativeError> {
    let ms = this_date_ms(rt, this)?;
    if !ms.is_finite() {
        return Ok(Value::Num(f64::NAN));
    }
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(dt) => Ok(Value::Num(f(dt))),
        None => Ok(Value::Num(f64::NAN)),
    }
}

fn date_proto_get_time(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Num(this_date_ms(rt, this)?))
}

fn date_proto_get_full_year(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    date_field(rt, this, |dt| dt.year() as f64)
}

fn date_proto_get_month(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    date_field(rt, this, |dt| dt.month0() as f64)
}

fn date_proto_get_date(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    date_field(rt, this, |dt| dt.day() as f64)
}

fn date_proto_get_day(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    date_field(rt, this, |dt| dt.weekday().num_days_from_sunday() as f64)
}

fn date_proto_get_hours(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    date_field(rt, this, |dt| dt.hour() as f64)
}

fn date_proto_get_minutes(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    date_field(rt, this, |dt| dt.minute() as f64)
}

fn date_proto_get_seconds(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    date_field(rt, this, |dt| dt.second() as f64)
}

fn date_proto_get_milliseconds(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    date_field(rt, this, |dt| dt.timestamp_subsec_millis() as f64)
}

fn date_proto_set_time(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let r = match this {
        Value::Obj(r) if matches!(rt.heap.obj(*r).data, ObjData::Date { .. }) => *r,
        _ => return Err(LangError::type_error("method requires a date receiver").into()),
    };
    let new_ms = to_num(rt, &arg(args, 0));
    if let ObjData::Date { ms } = &mut rt.heap.obj_mut(r).data {
        *ms = new_ms;
    }
    Ok(Value::Num(new_ms))
}

fn date_proto_to_iso_string(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    let ms = this_date_ms(rt, this)?;
    if !ms.is_finite() {
        return Err(LangError::range_error("Invalid time value").into());
    }
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(dt) => Ok(Value::Str(dt.to_rfc3339_opts(SecondsFormat::Millis, true))),
        None => Err(LangError::range_error("Invalid time value").into()),
    }
}

fn date_proto_to_string(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    let ms = this_date_ms(rt, this)?;
    Ok(Value::Str(value::date_to_string(ms)))
}

// ---------------------------------------------------------------------------
// RegExp
// ---------------------------------------------------------------------------

fn regexp_proto_test(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let (_, source, flags) = this_regex(rt, this)?;
    let re = compile_regex(&source, &flags)?;
    let s = to_str(rt, &arg(args, 0));
    Ok(Value::Bool(re.is_match(&s)))
}

fn regexp_proto_exec(rt: &mut Runtime, this: &Value, args: &[Value]) -> NativeResult {
    let (r, source, flags) = this_regex(rt, this)?;
    let re = compile_regex(&source, &flags)?;
    let s = to_str(rt, &arg(args, 0));
    let global = flags.contains('g');
    let last_index = if global {
        let v = rt
            .heap
            .get_prop_chain(r, "lastIndex")
            .unwrap_or(Value::Num(0.0));
        to_num(rt, &v).max(0.0) as usize
    } else {
        0
    };
    let start_byte = s
        .char_indices()
        .nth(last_index)
        .map(|(b, _)| b)
        .unwrap_or(s.len());
    if last_index > s.chars().count() {
        if global {
            let _ = rt.heap.set_prop(&Value::Obj(r), "lastIndex", Value::Num(0.0));
        }
        return Ok(Value::Null);
    }
    match re.captures_at(&s, start_byte) {
        Some(caps) => {
            if global {
                let end = caps.get(0).map(|m| m.end()).unwrap_or(start_byte);
                let end_chars = byte_to_char_index(&s, end);
                let _ = rt
                    .heap
                    .set_prop(&Value::Obj(r), "lastIndex", Value::Num(end_chars as f64));
            }
            Ok(match_to_array(rt, &s, &caps))
        }
        None => {
            if global {
                let _ = rt.heap.set_prop(&Value::Obj(r), "lastIndex", Value::Num(0.0));
            }
            Ok(Value::Null)
        }
    }
}

fn regexp_proto_to_string(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    let (_, source, flags) = this_regex(rt, this)?;
    Ok(Value::Str(format!("/{}/{}", source, flags)))
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

fn error_proto_to_string(rt: &mut Runtime, this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Str(to_str(rt, this)))
}

// ---------------------------------------------------------------------------
// Math
// ---------------------------------------------------------------------------

macro_rules! math_unary {
    ($name:ident, $f:expr) => {
        fn $name(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
            let n = to_num(rt, &arg(args, 0));
            let f: fn(f64) -> f64 = $f;
            Ok(Value::Num(f(n)))
        }
    };
}

math_unary!(math_abs, f64::abs);
math_unary!(math_acos, f64::acos);
math_unary!(math_asin, f64::asin);
math_unary!(math_atan, f64::atan);
math_unary!(math_ceil, f64::ceil);
math_unary!(math_cos, f64::cos);
math_unary!(math_exp, f64::exp);
math_unary!(math_floor, f64::floor);
math_unary!(math_log, f64::ln);
math_unary!(math_sin, f64::sin);
math_unary!(math_sqrt, f64::sqrt);
math_unary!(math_tan, f64::tan);

fn math_atan2(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let y = to_num(rt, &arg(args, 0));
    let x = to_num(rt, &arg(args, 1));
    Ok(Value::Num(y.atan2(x)))
}

fn math_pow(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let base = to_num(rt, &arg(args, 0));
    let exp = to_num(rt, &arg(args, 1));
    Ok(Value::Num(base.powf(exp)))
}

fn math_max(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let mut best = f64::NEG_INFINITY;
    for a in args {
        let n = to_num(rt, a);
        if n.is_nan() {
            return Ok(Value::Num(f64::NAN));
        }
        if n > best {
            best = n;
        }
    }
    Ok(Value::Num(best))
}

fn math_min(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let mut best = f64::INFINITY;
    for a in args {
        let n = to_num(rt, a);
        if n.is_nan() {
            return Ok(Value::Num(f64::NAN));
        }
        if n < best {
            best = n;
        }
    }
    Ok(Value::Num(best))
}

fn math_random(_rt: &mut Runtime, _this: &Value, _args: &[Value]) -> NativeResult {
    Ok(Value::Num(rand::random::<f64>()))
}

fn math_round(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let n = to_num(rt, &arg(args, 0));
    // Half-way cases round toward +Infinity.
    Ok(Value::Num((n + 0.5).floor()))
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

fn json_parse(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let text = to_str(rt, &arg(args, 0));
    let parsed: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| LangError::syntax_error(format!("JSON.parse: {}", e)))?;
    Ok(json_to_value(rt, &parsed))
}

fn json_to_value(rt: &mut Runtime, j: &serde_json::Value) -> Value {
    match j {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            let vals: Vec<Value> = items.iter().map(|i| json_to_value(rt, i)).collect();
            make_array(rt, vals)
        }
        serde_json::Value::Object(map) => {
            let obj = rt.heap.new_plain();
            for (k, v) in map {
                let val = json_to_value(rt, v);
                let _ = rt.heap.set_prop(&Value::Obj(obj), k, val);
            }
            Value::Obj(obj)
        }
    }
}

fn json_stringify(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let indent = match arg(args, 2) {
        Value::Num(n) if n >= 1.0 => " ".repeat((n.min(10.0)) as usize),
        Value::Str(s) => s.chars().take(10).collect(),
        _ => String::new(),
    };
    let mut seen = Vec::new();
    let json = value_to_json(rt, &arg(args, 0), &mut seen)?;
    let json = match json {
        Some(j) => j,
        None => return Ok(Value::Undefined),
    };
    let text = if indent.is_empty() {
        serde_json::to_string(&json)
    } else {
        let mut out = Vec::new();
        let fmt = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut ser = serde_json::Serializer::with_formatter(&mut out, fmt);
        serde::Serialize::serialize(&json, &mut ser)
            .map(|_| String::from_utf8(out).expect("serde_json emits UTF-8"))
    };
    match text {
        Ok(t) => Ok(Value::Str(t)),
        Err(e) => Err(LangError::type_error(format!("JSON.stringify: {}", e)).into()),
    }
}

/// None means the value is omitted entirely (functions, undefined).
fn value_to_json(
    rt: &Runtime,
    v: &Value,
    seen: &mut Vec<ObjRef>,
) -> Result<Option<serde_json::Value>, NativeError> {
    Ok(match v {
        Value::Undefined => None,
        Value::Null => Some(serde_json::Value::Null),
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Value::Num(n) => Some(
            serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        ),
        Value::Str(s) => Some(serde_json::Value::String(s.clone())),
        Value::Obj(r) => {
            if seen.contains(r) {
                return Err(LangError::type_error("Converting circular structure to JSON").into());
            }
            seen.push(*r);
            let out = match &rt.heap.obj(*r).data {
                ObjData::Func(_) => None,
                ObjData::Array { length } => {
                    let mut items = Vec::new();
                    for i in 0..*length {
                        let elem = rt
                            .heap
                            .get_prop_chain(*r, &i.to_string())
                            .unwrap_or(Value::Undefined);
                        items.push(
                            value_to_json(rt, &elem, seen)?.unwrap_or(serde_json::Value::Null),
                        );
                    }
                    Some(serde_json::Value::Array(items))
                }
                ObjData::Date { ms } => {
                    // Dates serialize as their ISO form.
                    let text = match Utc.timestamp_millis_opt(*ms as i64).single() {
                        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
                        None => "null".to_string(),
                    };
                    Some(serde_json::Value::String(text))
                }
                _ => {
                    let mut map = serde_json::Map::new();
                    let keys = rt.heap.own_enumerable_keys(v);
                    for key in keys {
                        let prop = rt
                            .heap
                            .get_prop_chain(*r, &key)
                            .unwrap_or(Value::Undefined);
                        if let Some(j) = value_to_json(rt, &prop, seen)? {
                            map.insert(key, j);
                        }
                    }
                    Some(serde_json::Value::Object(map))
                }
            };
            seen.pop();
            out
        }
    })
}

// ---------------------------------------------------------------------------
// sys
// ---------------------------------------------------------------------------

fn sys_log(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let parts: Vec<String> = args.iter().map(|a| to_str(rt, a)).collect();
    log::info!(target: "cityvm::user", "{}", parts.join(" "));
    Ok(Value::Undefined)
}

fn sys_checkpoint(rt: &mut Runtime, _this: &Value, _args: &[Value]) -> NativeResult {
    rt.checkpoint_requested = true;
    rt.pause();
    Ok(Value::Undefined)
}

fn sys_shutdown(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let code = to_num(rt, &arg(args, 0));
    let code = if code.is_finite() { code as i32 } else { 0 };
    rt.shutdown_requested = Some(code);
    rt.pause();
    Ok(Value::Undefined)
}

fn sys_hash(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let alg = to_str(rt, &arg(args, 0));
    let data = to_str(rt, &arg(args, 1));
    let digest = match alg.as_str() {
        "sha256" => hex::encode(Sha256::digest(data.as_bytes())),
        "sha512" => hex::encode(Sha512::digest(data.as_bytes())),
        "sha3-256" => hex::encode(Sha3_256::digest(data.as_bytes())),
        "ripemd160" => hex::encode(Ripemd160::digest(data.as_bytes())),
        other => {
            return Err(LangError::range_error(format!("unknown hash algorithm '{}'", other)).into())
        }
    };
    Ok(Value::Str(digest))
}

fn sys_parse(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let src = to_str(rt, &arg(args, 0));
    let ast = Parser::parse_program(&src)
        .map_err(|e| LangError::syntax_error(format!("parse: {}", e)))?;
    let root = ast.root;
    Ok(ast_to_value(rt, &ast, root))
}

fn sys_parse_expression_at(rt: &mut Runtime, _this: &Value, args: &[Value]) -> NativeResult {
    let src = to_str(rt, &arg(args, 0));
    let offset = to_num(rt, &arg(args, 1));
    let offset = if offset.is_finite() && offset >= 0.0 { offset as usize } else { 0 };
    let (ast, end) = Parser::parse_expression_at(&src, offset)
        .map_err(|e| LangError::syntax_error(format!("parseExpressionAt: {}", e)))?;
    let root = ast.root;
    let node = ast_to_value(rt, &ast, root);
    if let Value::Obj(r) = node {
        let _ = rt.heap.set_prop(&Value::Obj(r), "end", Value::Num(end as f64));
    }
    Ok(node)
}

/// Reify a syntax tree as language values: one plain object per node with
/// a `type` field, child nodes nested, child lists as arrays.
fn ast_to_value(rt: &mut Runtime, ast: &Ast, id: NodeId) -> Value {
    let node = ast.node(id).clone();
    let obj = rt.heap.new_plain();
    let this = Value::Obj(obj);
    let _ = rt
        .heap
        .set_prop(&this, "type", Value::Str(node.kind().to_string()));
    let set = |rt: &mut Runtime, key: &str, v: Value| {
        let _ = rt.heap.set_prop(&this, key, v);
    };
    let child = |rt: &mut Runtime, id: NodeId| ast_to_value(rt, ast, id);
    let child_opt = |rt: &mut Runtime, id: Option<NodeId>| match id {
        Some(id) => ast_to_value(rt, ast, id),
        None => Value::Null,
    };
    let child_list = |rt: &mut Runtime, ids: &[NodeId]| {
        let items: Vec<Value> = ids.iter().map(|i| ast_to_value(rt, ast, *i)).collect();
        make_array(rt, items)
    };
    match node {
        Node::Program { body } | Node::BlockStatement { body } => {
            let v = child_list(rt, &body);
            set(rt, "body", v);
        }
        Node::ExpressionStatement { expression } => {
            let v = child(rt, expression);
            set(rt, "expression", v);
        }
        Node::VariableDeclaration { declarations } => {
            let v = child_list(rt, &declarations);
            set(rt, "declarations", v);
        }
        Node::VariableDeclarator { name, init } => {
            set(rt, "id", Value::Str(name));
            let v = child_opt(rt, init);
            set(rt, "init", v);
        }
        Node::FunctionDeclaration { name, params, body, span } => {
            set(rt, "id", Value::Str(name));
            let ps = make_array(rt, params.into_iter().map(Value::Str).collect());
            set(rt, "params", ps);
            let b = child(rt, body);
            set(rt, "body", b);
            set(rt, "start", Value::Num(span.start as f64));
            set(rt, "end", Value::Num(span.end as f64));
        }
        Node::FunctionExpression { name, params, body, span } => {
            set(
                rt,
                "id",
                name.map(Value::Str).unwrap_or(Value::Null),
            );
            let ps = make_array(rt, params.into_iter().map(Value::Str).collect());
            set(rt, "params", ps);
            let b = child(rt, body);
            set(rt, "body", b);
            set(rt, "start", Value::Num(span.start as f64));
            set(rt, "end", Value::Num(span.end as f64));
        }
        Node::ReturnStatement { argument } => {
            let v = child_opt(rt, argument);
            set(rt, "argument", v);
        }
        Node::IfStatement { test, consequent, alternate } => {
            let t = child(rt, test);
            set(rt, "test", t);
            let c = child(rt, consequent);
            set(rt, "consequent", c);
            let a = child_opt(rt, alternate);
            set(rt, "alternate", a);
        }
        Node::WhileStatement { test, body } | Node::DoWhileStatement { test, body } => {
            let t = child(rt, test);
            set(rt, "test", t);
            let b = child(rt, body);
            set(rt, "body", b);
        }
        Node::ForStatement { init, test, update, body } => {
            let i = child_opt(rt, init);
            set(rt, "init", i);
            let t = child_opt(rt, test);
            set(rt, "test", t);
            let u = child_opt(rt, update);
            set(rt, "update", u);
            let b = child(rt, body);
            set(rt, "body", b);
        }
        Node::ForInStatement { left, right, body } => {
            let l = child(rt, left);
            set(rt, "left", l);
            let r = child(rt, right);
            set(rt, "right", r);
            let b = child(rt, body);
            set(rt, "body", b);
        }
        Node::BreakStatement { label } | Node::ContinueStatement { label } => {
            set(rt, "label", label.map(Value::Str).unwrap_or(Value::Null));
        }
        Node::LabeledStatement { label, body } => {
            set(rt, "label", Value::Str(label));
            let b = child(rt, body);
            set(rt, "body", b);
        }
        Node::SwitchStatement { discriminant, cases } => {
            let d = child(rt, discriminant);
            set(rt, "discriminant", d);
            let c = child_list(rt, &cases);
            set(rt, "cases", c);
        }
        Node::SwitchCase { test, consequent } => {
            let t = child_opt(rt, test);
            set(rt, "test", t);
            let c = child_list(rt, &consequent);
            set(rt, "consequent", c);
        }
        Node::ThrowStatement { argument } => {
            let a = child(rt, argument);
            set(rt, "argument", a);
        }
        Node::TryStatement { block, handler, finalizer } => {
            let b = child(rt, block);
            set(rt, "block", b);
            let h = child_opt(rt, handler);
            set(rt, "handler", h);
            let f = child_opt(rt, finalizer);
            set(rt, "finalizer", f);
        }
        Node::CatchClause { param, body } => {
            set(rt, "param", Value::Str(param));
            let b = child(rt, body);
            set(rt, "body", b);
        }
        Node::EmptyStatement | Node::DebuggerStatement | Node::ThisExpression => {}
        Node::WithStatement { object, body } => {
            let o = child(rt, object);
            set(rt, "object", o);
            let b = child(rt, body);
            set(rt, "body", b);
        }
        Node::Literal { value } => {
            let v = match value {
                Lit::Null => Value::Null,
                Lit::Bool(b) => Value::Bool(b),
                Lit::Num(n) => Value::Num(n),
                Lit::Str(s) => Value::Str(s),
                Lit::Regex { source, flags } => {
                    set(rt, "regex", Value::Bool(true));
                    set(rt, "flags", Value::Str(flags));
                    Value::Str(source)
                }
            };
            set(rt, "value", v);
        }
        Node::Identifier { name } => {
            set(rt, "name", Value::Str(name));
        }
        Node::ArrayExpression { elements } => {
            let items: Vec<Value> = elements
                .iter()
                .map(|e| match e {
                    Some(id) => ast_to_value(rt, ast, *id),
                    None => Value::Null,
                })
                .collect();
            let v = make_array(rt, items);
            set(rt, "elements", v);
        }
        Node::ObjectExpression { properties } => {
            let mut props = Vec::new();
            for (key, val) in properties {
                let entry = rt.heap.new_plain();
                let _ = rt
                    .heap
                    .set_prop(&Value::Obj(entry), "key", Value::Str(key));
                let v = ast_to_value(rt, ast, val);
                let _ = rt.heap.set_prop(&Value::Obj(entry), "value", v);
                props.push(Value::Obj(entry));
            }
            let v = make_array(rt, props);
            set(rt, "properties", v);
        }
        Node::UnaryExpression { op, argument } => {
            set(rt, "operator", Value::Str(format!("{:?}", op)));
            let a = child(rt, argument);
            set(rt, "argument", a);
        }
        Node::UpdateExpression { op, prefix, argument } => {
            set(rt, "operator", Value::Str(format!("{:?}", op)));
            set(rt, "prefix", Value::Bool(prefix));
            let a = child(rt, argument);
            set(rt, "argument", a);
        }
        Node::BinaryExpression { op, left, right } => {
            set(rt, "operator", Value::Str(format!("{:?}", op)));
            let l = child(rt, left);
            set(rt, "left", l);
            let r = child(rt, right);
            set(rt, "right", r);
        }
        Node::LogicalExpression { op, left, right } => {
            set(rt, "operator", Value::Str(format!("{:?}", op)));
            let l = child(rt, left);
            set(rt, "left", l);
            let r = child(rt, right);
            set(rt, "right", r);
        }
        Node::AssignmentExpression { op, left, right } => {
            set(rt, "operator", Value::Str(format!("{:?}", op)));
            let l = child(rt, left);
            set(rt, "left", l);
            let r = child(rt, right);
            set(rt, "right", r);
        }
        Node::ConditionalExpression { test, consequent, alternate } => {
            let t = child(rt, test);
            set(rt, "test", t);
            let c = child(rt, consequent);
            set(rt, "consequent", c);
            let a = child(rt, alternate);
            set(rt, "alternate", a);
        }
        Node::CallExpression { callee, arguments } | Node::NewExpression { callee, arguments } => {
            let c = child(rt, callee);
            set(rt, "callee", c);
            let a = child_list(rt, &arguments);
            set(rt, "arguments", a);
        }
        Node::MemberExpression { object, property, computed } => {
            let o = child(rt, object);
            set(rt, "object", o);
            let p = child(rt, property);
            set(rt, "property", p);
            set(rt, "computed", Value::Bool(computed));
        }
        Node::SequenceExpression { expressions } => {
            let e = child_list(rt, &expressions);
            set(rt, "expressions", e);
        }
    }
    this
}
