/// Heap storage: objects, property maps, prototype links, lexical scopes.
///
/// Everything is arena-allocated and addressed by dense index (`ObjRef`,
/// `ScopeRef`); inter-object references are indices, which is what makes the
/// snapshot a flat list of records. Nothing is ever freed — unreachable
/// slots are compacted away when a snapshot is reloaded.
///
/// Property attributes use a positive bitmask (non-writable, non-enumerable,
/// non-configurable). Flags only exist for keys present in the map.

use crate::ast::NodeRef;
use crate::value::{self, Value};
use bitflags::bitflags;
use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeRef(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropFlags: u8 {
        const NONWRITABLE = 1;
        const NONENUMERABLE = 2;
        const NONCONFIGURABLE = 4;
    }
}

impl PropFlags {
    /// The usual attributes for builtin prototype methods.
    pub fn builtin() -> PropFlags {
        PropFlags::NONENUMERABLE
    }

    /// Fully locked: constants like Math.PI.
    pub fn frozen() -> PropFlags {
        PropFlags::NONWRITABLE | PropFlags::NONENUMERABLE | PropFlags::NONCONFIGURABLE
    }
}

#[derive(Debug, Clone)]
pub struct Prop {
    pub value: Value,
    pub flags: PropFlags,
}

/// Language-level error descriptor. Turned into a heap error object and
/// thrown through the interpreter's unwind path; this is the error channel
/// for property operations and native functions.
#[derive(Debug, Clone)]
pub struct LangError {
    pub kind: ErrorKind,
    pub message: String,
}

impl LangError {
    pub fn type_error(message: impl Into<String>) -> LangError {
        LangError { kind: ErrorKind::Type, message: message.into() }
    }

    pub fn range_error(message: impl Into<String>) -> LangError {
        LangError { kind: ErrorKind::Range, message: message.into() }
    }

    pub fn reference_error(message: impl Into<String>) -> LangError {
        LangError { kind: ErrorKind::Reference, message: message.into() }
    }

    pub fn syntax_error(message: impl Into<String>) -> LangError {
        LangError { kind: ErrorKind::Syntax, message: message.into() }
    }

    pub fn uri_error(message: impl Into<String>) -> LangError {
        LangError { kind: ErrorKind::Uri, message: message.into() }
    }

    pub fn plain(message: impl Into<String>) -> LangError {
        LangError { kind: ErrorKind::Error, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    Eval,
    Range,
    Reference,
    Syntax,
    Type,
    Uri,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::Eval => "EvalError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Uri => "URIError",
        }
    }

    pub fn from_name(name: &str) -> Option<ErrorKind> {
        Some(match name {
            "Error" => ErrorKind::Error,
            "EvalError" => ErrorKind::Eval,
            "RangeError" => ErrorKind::Range,
            "ReferenceError" => ErrorKind::Reference,
            "SyntaxError" => ErrorKind::Syntax,
            "TypeError" => ErrorKind::Type,
            "URIError" => ErrorKind::Uri,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// Internal slots, selected by the object's type tag.
#[derive(Debug, Clone)]
pub enum ObjData {
    Plain,
    Array { length: u32 },
    Func(FuncData),
    Regex { source: String, flags: String },
    Date { ms: f64 },
    Error { kind: ErrorKind },
}

#[derive(Debug, Clone)]
pub enum FuncData {
    /// A closure: function node plus the scope it was created in.
    Interp { node: NodeRef, scope: ScopeRef },
    /// Host-implemented, identified by a stable registry tag.
    Native { tag: u32 },
    /// Host-implemented, callback style: pauses the stepper until completed.
    AsyncNative { tag: u32 },
    /// The eval marker; call dispatch special-cases it.
    Eval,
}

#[derive(Debug, Clone)]
pub struct Object {
    pub proto: Option<ObjRef>,
    pub props: IndexMap<String, Prop>,
    pub extensible: bool,
    pub data: ObjData,
}

impl Object {
    pub fn new(proto: Option<ObjRef>, data: ObjData) -> Object {
        Object { proto, props: IndexMap::new(), extensible: true, data }
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Binding {
    pub value: Value,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeRef>,
    pub vars: IndexMap<String, Binding>,
}

impl Scope {
    pub fn new(parent: Option<ScopeRef>) -> Scope {
        Scope { parent, vars: IndexMap::new() }
    }
}

// ---------------------------------------------------------------------------
// Prototype registry
// ---------------------------------------------------------------------------

/// The built-in prototype objects, filled in by intrinsics installation (or
/// by the snapshot loader). Primitive method lookup goes through these.
#[derive(Debug, Clone, Copy, Default)]
pub struct Protos {
    pub object: Option<ObjRef>,
    pub function: Option<ObjRef>,
    pub array: Option<ObjRef>,
    pub string: Option<ObjRef>,
    pub number: Option<ObjRef>,
    pub boolean: Option<ObjRef>,
    pub date: Option<ObjRef>,
    pub regexp: Option<ObjRef>,
    pub error: Option<ObjRef>,
    pub eval_error: Option<ObjRef>,
    pub range_error: Option<ObjRef>,
    pub reference_error: Option<ObjRef>,
    pub syntax_error: Option<ObjRef>,
    pub type_error: Option<ObjRef>,
    pub uri_error: Option<ObjRef>,
}

impl Protos {
    pub fn error_proto(&self, kind: ErrorKind) -> Option<ObjRef> {
        match kind {
            ErrorKind::Error => self.error,
            ErrorKind::Eval => self.eval_error,
            ErrorKind::Range => self.range_error,
            ErrorKind::Reference => self.reference_error,
            ErrorKind::Syntax => self.syntax_error,
            ErrorKind::Type => self.type_error,
            ErrorKind::Uri => self.uri_error,
        }
    }
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

pub struct Heap {
    objects: Vec<Object>,
    scopes: Vec<Scope>,
    pub protos: Protos,
}

impl Heap {
    pub fn new() -> Heap {
        Heap { objects: Vec::new(), scopes: Vec::new(), protos: Protos::default() }
    }

    // ── Allocation ─────────────────────────────────────────────────────────

    pub fn alloc(&mut self, obj: Object) -> ObjRef {
        self.objects.push(obj);
        ObjRef(self.objects.len() as u32 - 1)
    }

    pub fn alloc_scope(&mut self, scope: Scope) -> ScopeRef {
        self.scopes.push(scope);
        ScopeRef(self.scopes.len() as u32 - 1)
    }

    pub fn obj(&self, r: ObjRef) -> &Object {
        &self.objects[r.0 as usize]
    }

    pub fn obj_mut(&mut self, r: ObjRef) -> &mut Object {
        &mut self.objects[r.0 as usize]
    }

    pub fn scope(&self, r: ScopeRef) -> &Scope {
        &self.scopes[r.0 as usize]
    }

    pub fn scope_mut(&mut self, r: ScopeRef) -> &mut Scope {
        &mut self.scopes[r.0 as usize]
    }

    pub fn new_plain(&mut self) -> ObjRef {
        self.alloc(Object::new(self.protos.object, ObjData::Plain))
    }

    pub fn new_object_with_proto(&mut self, proto: Option<ObjRef>) -> ObjRef {
        self.alloc(Object::new(proto, ObjData::Plain))
    }

    pub fn new_array(&mut self) -> ObjRef {
        self.alloc(Object::new(self.protos.array, ObjData::Array { length: 0 }))
    }

    pub fn new_date(&mut self, ms: f64) -> ObjRef {
        self.alloc(Object::new(self.protos.date, ObjData::Date { ms }))
    }

    pub fn new_error(&mut self, kind: ErrorKind, message: &str) -> ObjRef {
        let proto = self.protos.error_proto(kind);
        let r = self.alloc(Object::new(proto, ObjData::Error { kind }));
        self.obj_mut(r).props.insert(
            "message".to_string(),
            Prop { value: Value::Str(message.to_string()), flags: PropFlags::builtin() },
        );
        r
    }

    pub fn new_error_from(&mut self, err: &LangError) -> ObjRef {
        self.new_error(err.kind, &err.message)
    }

    /// An interpreted function: closure over `scope`, with the usual
    /// `prototype` object carrying a `constructor` back-reference.
    pub fn new_interp_func(&mut self, node: NodeRef, scope: ScopeRef, arity: u32) -> ObjRef {
        let func = self.alloc(Object::new(
            self.protos.function,
            ObjData::Func(FuncData::Interp { node, scope }),
        ));
        let proto = self.new_plain();
        self.obj_mut(proto).props.insert(
            "constructor".to_string(),
            Prop { value: Value::Obj(func), flags: PropFlags::builtin() },
        );
        self.obj_mut(func).props.insert(
            "prototype".to_string(),
            Prop { value: Value::Obj(proto), flags: PropFlags::builtin() },
        );
        self.obj_mut(func).props.insert(
            "length".to_string(),
            Prop { value: Value::Num(arity as f64), flags: PropFlags::frozen() },
        );
        func
    }

    pub fn new_native_func(&mut self, tag: u32, arity: u32) -> ObjRef {
        let func = self.alloc(Object::new(
            self.protos.function,
            ObjData::Func(FuncData::Native { tag }),
        ));
        self.obj_mut(func).props.insert(
            "length".to_string(),
            Prop { value: Value::Num(arity as f64), flags: PropFlags::frozen() },
        );
        func
    }

    pub fn new_async_native_func(&mut self, tag: u32, arity: u32) -> ObjRef {
        let func = self.alloc(Object::new(
            self.protos.function,
            ObjData::Func(FuncData::AsyncNative { tag }),
        ));
        self.obj_mut(func).props.insert(
            "length".to_string(),
            Prop { value: Value::Num(arity as f64), flags: PropFlags::frozen() },
        );
        func
    }

    pub fn new_regex(&mut self, source: &str, flags: &str) -> ObjRef {
        let r = self.alloc(Object::new(
            self.protos.regexp,
            ObjData::Regex { source: source.to_string(), flags: flags.to_string() },
        ));
        let o = self.obj_mut(r);
        o.props.insert(
            "source".to_string(),
            Prop { value: Value::Str(source.to_string()), flags: PropFlags::frozen() },
        );
        for (name, ch) in [("global", 'g'), ("ignoreCase", 'i'), ("multiline", 'm')] {
            o.props.insert(
                name.to_string(),
                Prop { value: Value::Bool(flags.contains(ch)), flags: PropFlags::frozen() },
            );
        }
        o.props.insert(
            "lastIndex".to_string(),
            Prop { value: Value::Num(0.0), flags: PropFlags::NONENUMERABLE },
        );
        r
    }

    // ── Property access ────────────────────────────────────────────────────

    /// Walk the prototype chain starting at an object. Array length and
    /// string indices are computed along the way. `None` means absent.
    pub fn get_prop_chain(&self, start: ObjRef, name: &str) -> Option<Value> {
        let mut cursor = Some(start);
        while let Some(r) = cursor {
            if let Some(v) = self.own_get(r, name) {
                return Some(v);
            }
            cursor = self.obj(r).proto;
        }
        None
    }

    fn own_get(&self, r: ObjRef, name: &str) -> Option<Value> {
        let o = self.obj(r);
        if name == "length" {
            if let ObjData::Array { length } = o.data {
                return Some(Value::Num(length as f64));
            }
        }
        o.props.get(name).map(|p| p.value.clone())
    }

    pub fn has_own(&self, r: ObjRef, name: &str) -> bool {
        if name == "length" && matches!(self.obj(r).data, ObjData::Array { .. }) {
            return true;
        }
        self.obj(r).props.contains_key(name)
    }

    /// `get(o, name)`: undefined when absent, TypeError on null/undefined
    /// bases. String length and character indices are computed; other
    /// primitives defer to their type's prototype.
    pub fn get_prop(&self, base: &Value, name: &str) -> Result<Value, LangError> {
        match base {
            Value::Undefined | Value::Null => Err(LangError::type_error(format!(
                "Cannot read property '{}' of {}",
                name,
                if matches!(base, Value::Null) { "null" } else { "undefined" }
            ))),
            Value::Str(s) => {
                if name == "length" {
                    return Ok(Value::Num(s.chars().count() as f64));
                }
                if let Some(i) = index_of(name) {
                    return Ok(s
                        .chars()
                        .nth(i as usize)
                        .map(|c| Value::Str(c.to_string()))
                        .unwrap_or(Value::Undefined));
                }
                Ok(self
                    .protos
                    .string
                    .and_then(|p| self.get_prop_chain(p, name))
                    .unwrap_or(Value::Undefined))
            }
            Value::Num(_) => Ok(self
                .protos
                .number
                .and_then(|p| self.get_prop_chain(p, name))
                .unwrap_or(Value::Undefined)),
            Value::Bool(_) => Ok(self
                .protos
                .boolean
                .and_then(|p| self.get_prop_chain(p, name))
                .unwrap_or(Value::Undefined)),
            Value::Obj(r) => Ok(self.get_prop_chain(*r, name).unwrap_or(Value::Undefined)),
        }
    }

    /// `has(o, name)`: prototype-chain membership. Fails on primitives —
    /// the `in` operator needs an object.
    pub fn has_prop(&self, base: &Value, name: &str) -> Result<bool, LangError> {
        match base {
            Value::Obj(r) => {
                let mut cursor = Some(*r);
                while let Some(o) = cursor {
                    if self.has_own(o, name) {
                        return Ok(true);
                    }
                    cursor = self.obj(o).proto;
                }
                Ok(false)
            }
            _ => Err(LangError::type_error(
                "Cannot use 'in' operator on a non-object",
            )),
        }
    }

    /// `set(o, name, value)`: respects non-writable and preventExtensions,
    /// maintains the array length invariant, rejects writes to string
    /// length/indices; other primitive bases are silently ignored.
    pub fn set_prop(&mut self, base: &Value, name: &str, value: Value) -> Result<(), LangError> {
        match base {
            Value::Undefined | Value::Null => Err(LangError::type_error(format!(
                "Cannot set property '{}' of {}",
                name,
                if matches!(base, Value::Null) { "null" } else { "undefined" }
            ))),
            Value::Str(_) => {
                if name == "length" || index_of(name).is_some() {
                    Err(LangError::type_error(format!(
                        "Cannot assign to read only property '{}' of string",
                        name
                    )))
                } else {
                    Ok(())
                }
            }
            Value::Num(_) | Value::Bool(_) => Ok(()),
            Value::Obj(r) => self.set_on_object(*r, name, value),
        }
    }

    fn set_on_object(&mut self, r: ObjRef, name: &str, value: Value) -> Result<(), LangError> {
        // The synthetic array length property drives element deletion.
        if name == "length" {
            if let ObjData::Array { length } = self.obj(r).data {
                let n = value::to_number(&*self, &value);
                if n < 0.0 || n.fract() != 0.0 || !n.is_finite() || n > u32::MAX as f64 {
                    return Err(LangError::range_error("Invalid array length"));
                }
                let new_len = n as u32;
                if new_len < length {
                    let doomed: Vec<String> = self
                        .obj(r)
                        .props
                        .keys()
                        .filter(|k| index_of(k).map_or(false, |i| i >= new_len))
                        .cloned()
                        .collect();
                    let o = self.obj_mut(r);
                    for k in &doomed {
                        o.props.shift_remove(k);
                    }
                }
                if let ObjData::Array { length } = &mut self.obj_mut(r).data {
                    *length = new_len;
                }
                return Ok(());
            }
        }

        if let Some(prop) = self.obj(r).props.get(name) {
            if prop.flags.contains(PropFlags::NONWRITABLE) {
                return Err(LangError::type_error(format!(
                    "Cannot assign to read only property '{}' of object",
                    name
                )));
            }
            self.obj_mut(r).props.get_mut(name).expect("checked above").value = value;
        } else {
            if !self.obj(r).extensible {
                return Err(LangError::type_error(format!(
                    "Cannot add property {}, object is not extensible",
                    name
                )));
            }
            self.obj_mut(r)
                .props
                .insert(name.to_string(), Prop { value, flags: PropFlags::empty() });
        }

        // A new numeric index may extend the array.
        if let Some(i) = index_of(name) {
            if let ObjData::Array { length } = &mut self.obj_mut(r).data {
                if i >= *length {
                    *length = i + 1;
                }
            }
        }
        Ok(())
    }

    /// The descriptor path (Object.defineProperty). Changing attribute
    /// flags of a non-configurable property is a TypeError.
    pub fn define_prop(
        &mut self,
        r: ObjRef,
        name: &str,
        value: Option<Value>,
        flags: PropFlags,
    ) -> Result<(), LangError> {
        if name == "length" && matches!(self.obj(r).data, ObjData::Array { .. }) {
            return Err(LangError::type_error("Cannot redefine property: length"));
        }
        if let Some(existing) = self.obj(r).props.get(name) {
            if existing.flags.contains(PropFlags::NONCONFIGURABLE) && existing.flags != flags {
                return Err(LangError::type_error(format!(
                    "Cannot redefine property: {}",
                    name
                )));
            }
            let prop = self.obj_mut(r).props.get_mut(name).expect("checked above");
            prop.flags = flags;
            if let Some(v) = value {
                prop.value = v;
            }
        } else {
            if !self.obj(r).extensible {
                return Err(LangError::type_error(format!(
                    "Cannot define property {}, object is not extensible",
                    name
                )));
            }
            self.obj_mut(r).props.insert(
                name.to_string(),
                Prop { value: value.unwrap_or(Value::Undefined), flags },
            );
            if let Some(i) = index_of(name) {
                if let ObjData::Array { length } = &mut self.obj_mut(r).data {
                    if i >= *length {
                        *length = i + 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// `delete(o, name)`: refuses non-writable properties, array length,
    /// and all primitive bases.
    pub fn delete_prop(&mut self, base: &Value, name: &str) -> Result<bool, LangError> {
        match base {
            Value::Undefined | Value::Null => Err(LangError::type_error(format!(
                "Cannot delete property '{}' of {}",
                name,
                if matches!(base, Value::Null) { "null" } else { "undefined" }
            ))),
            Value::Obj(r) => {
                let r = *r;
                if name == "length" && matches!(self.obj(r).data, ObjData::Array { .. }) {
                    return Ok(false);
                }
                match self.obj(r).props.get(name) {
                    Some(prop) if prop.flags.contains(PropFlags::NONWRITABLE) => Ok(false),
                    Some(_) => {
                        self.obj_mut(r).props.shift_remove(name);
                        Ok(true)
                    }
                    None => Ok(true),
                }
            }
            _ => Ok(false),
        }
    }

    // ── Enumeration ────────────────────────────────────────────────────────

    /// Own enumerable keys, in insertion order. Strings enumerate their
    /// character indices; other primitives have none of their own.
    pub fn own_enumerable_keys(&self, v: &Value) -> Vec<String> {
        match v {
            Value::Str(s) => (0..s.chars().count()).map(|i| i.to_string()).collect(),
            Value::Obj(r) => self
                .obj(*r)
                .props
                .iter()
                .filter(|(_, p)| !p.flags.contains(PropFlags::NONENUMERABLE))
                .map(|(k, _)| k.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Own property names including non-enumerables (and the synthetic
    /// array length).
    pub fn own_property_names(&self, r: ObjRef) -> Vec<String> {
        let mut names: Vec<String> = self.obj(r).props.keys().cloned().collect();
        if matches!(self.obj(r).data, ObjData::Array { .. }) {
            names.push("length".to_string());
        }
        names
    }

    /// The prototype the for-in walk moves to after exhausting a level.
    pub fn proto_of(&self, v: &Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) => self.obj(*r).proto,
            Value::Str(_) => self.protos.string,
            Value::Num(_) => self.protos.number,
            Value::Bool(_) => self.protos.boolean,
            Value::Undefined | Value::Null => None,
        }
    }

    // ── Scope operations ───────────────────────────────────────────────────

    pub fn lookup(&self, scope: ScopeRef, name: &str) -> Option<Value> {
        let mut cursor = Some(scope);
        while let Some(s) = cursor {
            if let Some(b) = self.scope(s).vars.get(name) {
                return Some(b.value.clone());
            }
            cursor = self.scope(s).parent;
        }
        None
    }

    /// Assign to the nearest binding. `Ok(false)` means no binding exists
    /// anywhere on the chain; the caller decides what that means.
    pub fn assign(&mut self, scope: ScopeRef, name: &str, value: Value) -> Result<bool, LangError> {
        let mut cursor = Some(scope);
        while let Some(s) = cursor {
            if let Some(b) = self.scope(s).vars.get(name) {
                if b.read_only {
                    return Err(LangError::type_error(format!(
                        "Assignment to constant variable '{}'",
                        name
                    )));
                }
                self.scope_mut(s).vars.get_mut(name).expect("checked above").value = value;
                return Ok(true);
            }
            cursor = self.scope(s).parent;
        }
        Ok(false)
    }

    /// Declare in exactly this scope, overwriting any previous binding.
    pub fn declare(&mut self, scope: ScopeRef, name: &str, value: Value, read_only: bool) {
        self.scope_mut(scope)
            .vars
            .insert(name.to_string(), Binding { value, read_only });
    }

    pub fn has_binding_here(&self, scope: ScopeRef, name: &str) -> bool {
        self.scope(scope).vars.contains_key(name)
    }

    /// `delete` applied to an identifier. Builtins are declared read-only
    /// and therefore refuse; a missing binding deletes vacuously.
    pub fn delete_binding(&mut self, scope: ScopeRef, name: &str) -> bool {
        let mut cursor = Some(scope);
        while let Some(s) = cursor {
            if let Some(b) = self.scope(s).vars.get(name) {
                if b.read_only {
                    return false;
                }
                self.scope_mut(s).vars.shift_remove(name);
                return true;
            }
            cursor = self.scope(s).parent;
        }
        true
    }

    // ── Snapshot support ───────────────────────────────────────────────────

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}

/// Parse a string as an array index: the canonical decimal form of a u32.
/// "01" or "1.5" are plain keys, not indices.
pub fn index_of(name: &str) -> Option<u32> {
    if name == "0" {
        return Some(0);
    }
    if name.is_empty() || name.starts_with('0') || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u32>().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_length_tracks_max_index() {
        let mut heap = Heap::new();
        let a = heap.new_array();
        heap.set_prop(&Value::Obj(a), "0", Value::Num(1.0)).unwrap();
        heap.set_prop(&Value::Obj(a), "5", Value::Num(2.0)).unwrap();
        assert_eq!(heap.get_prop(&Value::Obj(a), "length").unwrap(), Value::Num(6.0));
    }

    #[test]
    fn shrinking_length_deletes_elements() {
        let mut heap = Heap::new();
        let a = heap.new_array();
        for i in 0..4 {
            heap.set_prop(&Value::Obj(a), &i.to_string(), Value::Num(i as f64))
                .unwrap();
        }
        heap.set_prop(&Value::Obj(a), "length", Value::Num(2.0)).unwrap();
        assert_eq!(heap.get_prop(&Value::Obj(a), "length").unwrap(), Value::Num(2.0));
        assert_eq!(heap.get_prop(&Value::Obj(a), "1").unwrap(), Value::Num(1.0));
        assert_eq!(heap.get_prop(&Value::Obj(a), "2").unwrap(), Value::Undefined);
        assert_eq!(heap.get_prop(&Value::Obj(a), "3").unwrap(), Value::Undefined);
    }

    #[test]
    fn invalid_array_length_is_a_range_error() {
        let mut heap = Heap::new();
        let a = heap.new_array();
        let err = heap
            .set_prop(&Value::Obj(a), "length", Value::Num(-1.0))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Range);
    }

    #[test]
    fn get_on_undefined_is_a_type_error() {
        let heap = Heap::new();
        let err = heap.get_prop(&Value::Undefined, "x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn string_indices_are_computed() {
        let mut heap = Heap::new();
        let s = Value::Str("héllo".into());
        assert_eq!(heap.get_prop(&s, "length").unwrap(), Value::Num(5.0));
        assert_eq!(heap.get_prop(&s, "1").unwrap(), Value::Str("é".into()));
        assert_eq!(heap.get_prop(&s, "9").unwrap(), Value::Undefined);
        assert!(heap.set_prop(&s, "0", Value::Str("x".into())).is_err());
        assert!(heap.set_prop(&s, "length", Value::Num(0.0)).is_err());
    }

    #[test]
    fn non_writable_refuses_set_and_delete() {
        let mut heap = Heap::new();
        let o = heap.new_plain();
        heap.define_prop(o, "k", Some(Value::Num(1.0)), PropFlags::NONWRITABLE)
            .unwrap();
        assert!(heap.set_prop(&Value::Obj(o), "k", Value::Num(2.0)).is_err());
        assert_eq!(heap.delete_prop(&Value::Obj(o), "k").unwrap(), false);
        assert_eq!(heap.get_prop(&Value::Obj(o), "k").unwrap(), Value::Num(1.0));
    }

    #[test]
    fn prevent_extensions_blocks_new_keys() {
        let mut heap = Heap::new();
        let o = heap.new_plain();
        heap.set_prop(&Value::Obj(o), "a", Value::Num(1.0)).unwrap();
        heap.obj_mut(o).extensible = false;
        assert!(heap.set_prop(&Value::Obj(o), "b", Value::Num(2.0)).is_err());
        // Existing keys stay writable.
        heap.set_prop(&Value::Obj(o), "a", Value::Num(3.0)).unwrap();
    }

    #[test]
    fn non_configurable_flag_changes_are_rejected() {
        let mut heap = Heap::new();
        let o = heap.new_plain();
        heap.define_prop(o, "k", Some(Value::Num(1.0)), PropFlags::NONCONFIGURABLE)
            .unwrap();
        assert!(heap
            .define_prop(o, "k", None, PropFlags::NONCONFIGURABLE | PropFlags::NONENUMERABLE)
            .is_err());
        // Re-defining with identical flags is fine.
        assert!(heap
            .define_prop(o, "k", Some(Value::Num(2.0)), PropFlags::NONCONFIGURABLE)
            .is_ok());
    }

    #[test]
    fn scope_chain_lookup_and_assign() {
        let mut heap = Heap::new();
        let global = heap.alloc_scope(Scope::new(None));
        let inner = heap.alloc_scope(Scope::new(Some(global)));
        heap.declare(global, "x", Value::Num(1.0), false);
        assert_eq!(heap.lookup(inner, "x"), Some(Value::Num(1.0)));
        assert!(heap.assign(inner, "x", Value::Num(2.0)).unwrap());
        assert_eq!(heap.lookup(global, "x"), Some(Value::Num(2.0)));
        assert_eq!(heap.lookup(inner, "y"), None);
    }

    #[test]
    fn read_only_bindings_refuse_assignment_and_delete() {
        let mut heap = Heap::new();
        let global = heap.alloc_scope(Scope::new(None));
        heap.declare(global, "undefined", Value::Undefined, true);
        assert!(heap.assign(global, "undefined", Value::Num(1.0)).is_err());
        assert!(!heap.delete_binding(global, "undefined"));
        heap.declare(global, "mine", Value::Num(1.0), false);
        assert!(heap.delete_binding(global, "mine"));
        assert_eq!(heap.lookup(global, "mine"), None);
    }

    #[test]
    fn array_index_keys() {
        assert_eq!(index_of("0"), Some(0));
        assert_eq!(index_of("10"), Some(10));
        assert_eq!(index_of("01"), None);
        assert_eq!(index_of("1.5"), None);
        assert_eq!(index_of("-1"), None);
        assert_eq!(index_of("x"), None);
    }
}
