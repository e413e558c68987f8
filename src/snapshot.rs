/// Whole-state serialization.
///
/// A snapshot is a JSON list with one record per line: a header, then one
/// record per reachable scope, object, and stack frame. Heap entities are
/// discovered by walking reachability from the global scope, the builtin
/// prototype registry, and every stack frame (including the values tucked
/// inside per-frame transient state), and each entity is emitted exactly
/// once under a dense per-kind index. References inside records are those
/// indices, so cycles cost nothing and unreachable arena slots compact
/// away on restore.
///
/// Code is not serialized structurally: the header carries the source text
/// of every parsed program, and node references are (program, node id)
/// pairs. The parser assigns node ids deterministically, so re-parsing on
/// restore reproduces them exactly.
///
/// Checkpoint protocol: write `<name>.city.partial`, then rename over the
/// final name. A failed write deletes the partial; no partial file is ever
/// visible as a valid snapshot.

use crate::ast::{NodeId, NodeRef};
use crate::errors::SnapshotError;
use crate::heap::{
    Binding, ErrorKind, FuncData, Heap, ObjData, ObjRef, Object, Prop, PropFlags, Protos, Scope,
    ScopeRef,
};
use crate::interp::{
    AssignState, CallPhase, CallState, DoPhase, ForInPhase, ForInState, ForPhase, Frame,
    FrameState, Runtime, SwitchPhase, SwitchState, Target, TryPhase, TryState, Unwind,
};
use crate::parser::Parser;
use crate::value::Value;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

struct Collector {
    obj_ids: HashMap<ObjRef, u32>,
    obj_order: Vec<ObjRef>,
    scope_ids: HashMap<ScopeRef, u32>,
    scope_order: Vec<ScopeRef>,
    queue: VecDeque<Entity>,
}

#[derive(Clone, Copy)]
enum Entity {
    Obj(ObjRef),
    Scope(ScopeRef),
}

impl Collector {
    fn new() -> Collector {
        Collector {
            obj_ids: HashMap::new(),
            obj_order: Vec::new(),
            scope_ids: HashMap::new(),
            scope_order: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    fn see_obj(&mut self, r: ObjRef) {
        if !self.obj_ids.contains_key(&r) {
            self.obj_ids.insert(r, self.obj_order.len() as u32);
            self.obj_order.push(r);
            self.queue.push_back(Entity::Obj(r));
        }
    }

    fn see_scope(&mut self, s: ScopeRef) {
        if !self.scope_ids.contains_key(&s) {
            self.scope_ids.insert(s, self.scope_order.len() as u32);
            self.scope_order.push(s);
            self.queue.push_back(Entity::Scope(s));
        }
    }

    fn see_value(&mut self, v: &Value) {
        if let Value::Obj(r) = v {
            self.see_obj(*r);
        }
    }

    fn see_target(&mut self, t: &Target) {
        if let Target::Property(base, _) = t {
            self.see_value(base);
        }
    }

    fn see_unwind(&mut self, u: &Unwind) {
        match u {
            Unwind::Return(v) | Unwind::Throw(v) => self.see_value(v),
            Unwind::Break { .. } | Unwind::Continue { .. } => {}
        }
    }

    fn see_state(&mut self, st: &FrameState) {
        match st {
            FrameState::Binary { left, .. } => self.see_value(left),
            FrameState::Assign(st) => {
                if let Some(t) = &st.target {
                    self.see_target(t);
                }
                self.see_value(&st.left_value);
            }
            FrameState::Member { obj, .. } => self.see_value(obj),
            FrameState::Call(st) => {
                self.see_value(&st.func);
                self.see_value(&st.this_val);
                for a in &st.args {
                    self.see_value(a);
                }
            }
            FrameState::ForIn(st) => {
                self.see_value(&st.subject);
            }
            FrameState::Switch(st) => self.see_value(&st.disc),
            FrameState::Try(st) => {
                if let Some(v) = &st.thrown {
                    self.see_value(v);
                }
                if let Some(u) = &st.pending {
                    self.see_unwind(u);
                }
            }
            FrameState::ArrayLit { obj, .. } => {
                if let Some(r) = obj {
                    self.see_obj(*r);
                }
            }
            FrameState::ObjectLit { obj, .. } => {
                if let Some(r) = obj {
                    self.see_obj(*r);
                }
            }
            _ => {}
        }
    }

    fn run(&mut self, rt: &Runtime) {
        // Roots: global scope, builtin prototypes, the whole stack.
        self.see_scope(rt.global);
        for p in protos_list(&rt.heap.protos).into_iter().flatten() {
            self.see_obj(p);
        }
        for frame in &rt.stack {
            self.see_scope(frame.scope);
            self.see_value(&frame.this_val);
            self.see_value(&frame.value);
            if let Some(t) = &frame.target {
                self.see_target(t);
            }
            self.see_state(&frame.state);
        }
        while let Some(e) = self.queue.pop_front() {
            match e {
                Entity::Obj(r) => {
                    let o = rt.heap.obj(r);
                    if let Some(p) = o.proto {
                        self.see_obj(p);
                    }
                    for prop in o.props.values() {
                        self.see_value(&prop.value);
                    }
                    if let ObjData::Func(FuncData::Interp { scope, .. }) = &o.data {
                        self.see_scope(*scope);
                    }
                }
                Entity::Scope(s) => {
                    let sc = rt.heap.scope(s);
                    if let Some(p) = sc.parent {
                        self.see_scope(p);
                    }
                    for b in sc.vars.values() {
                        self.see_value(&b.value);
                    }
                }
            }
        }
    }
}

fn protos_list(p: &Protos) -> [Option<ObjRef>; 15] {
    [
        p.object,
        p.function,
        p.array,
        p.string,
        p.number,
        p.boolean,
        p.date,
        p.regexp,
        p.error,
        p.eval_error,
        p.range_error,
        p.reference_error,
        p.syntax_error,
        p.type_error,
        p.uri_error,
    ]
}

const PROTO_NAMES: [&str; 15] = [
    "object",
    "function",
    "array",
    "string",
    "number",
    "boolean",
    "date",
    "regexp",
    "error",
    "eval_error",
    "range_error",
    "reference_error",
    "syntax_error",
    "type_error",
    "uri_error",
];

/// Serialize the entire runtime state to snapshot text. The stepper must
/// be paused (or simply not running); serialization never mutates.
pub fn serialize(rt: &Runtime) -> String {
    let mut c = Collector::new();
    c.run(rt);

    let mut records: Vec<Json> = Vec::new();

    let protos: serde_json::Map<String, Json> = PROTO_NAMES
        .iter()
        .zip(protos_list(&rt.heap.protos))
        .map(|(name, p)| {
            (
                name.to_string(),
                match p {
                    Some(r) => json!(c.obj_ids[&r]),
                    None => Json::Null,
                },
            )
        })
        .collect();

    records.push(json!({
        "kind": "header",
        "version": FORMAT_VERSION,
        "natives": rt.natives.names(),
        "sources": rt.programs.iter().map(|p| p.source.clone()).collect::<Vec<_>>(),
        "global": c.scope_ids[&rt.global],
        "protos": protos,
        "stackLimit": rt.stack_limit,
    }));

    for s in &c.scope_order {
        records.push(enc_scope(rt.heap.scope(*s), &c));
    }
    for r in &c.obj_order {
        records.push(enc_object(rt.heap.obj(*r), &c));
    }
    for frame in &rt.stack {
        records.push(enc_frame(frame, &c));
    }

    // One record per line, a well-formed JSON list overall.
    let mut out = String::from("[\n");
    for (i, rec) in records.iter().enumerate() {
        out.push_str(&rec.to_string());
        if i + 1 < records.len() {
            out.push(',');
        }
        out.push('\n');
    }
    out.push(']');
    out.push('\n');
    out
}

fn enc_value(v: &Value, c: &Collector) -> Json {
    match v {
        Value::Undefined => json!({"undef": true}),
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Num(n) => enc_num(*n),
        Value::Str(s) => json!(s),
        Value::Obj(r) => json!({"obj": c.obj_ids[r]}),
    }
}

fn enc_num(n: f64) -> Json {
    if n.is_nan() {
        json!({"num": "NaN"})
    } else if n == f64::INFINITY {
        json!({"num": "inf"})
    } else if n == f64::NEG_INFINITY {
        json!({"num": "-inf"})
    } else {
        json!(n)
    }
}

fn enc_scope(s: &Scope, c: &Collector) -> Json {
    let vars: Vec<Json> = s
        .vars
        .iter()
        .map(|(name, b)| json!([name, enc_value(&b.value, c), b.read_only]))
        .collect();
    json!({
        "kind": "scope",
        "parent": s.parent.map(|p| c.scope_ids[&p]),
        "vars": vars,
    })
}

fn enc_object(o: &Object, c: &Collector) -> Json {
    let props: Vec<Json> = o
        .props
        .iter()
        .map(|(name, p)| json!([name, enc_value(&p.value, c), p.flags.bits()]))
        .collect();
    let mut rec = json!({
        "kind": "object",
        "proto": o.proto.map(|p| c.obj_ids[&p]),
        "extensible": o.extensible,
        "props": props,
    });
    let m = rec.as_object_mut().expect("record is an object");
    match &o.data {
        ObjData::Plain => {
            m.insert("tag".into(), json!("plain"));
        }
        ObjData::Array { length } => {
            m.insert("tag".into(), json!("array"));
            m.insert("length".into(), json!(length));
        }
        ObjData::Regex { source, flags } => {
            m.insert("tag".into(), json!("regex"));
            m.insert("source".into(), json!(source));
            m.insert("flags".into(), json!(flags));
        }
        ObjData::Date { ms } => {
            m.insert("tag".into(), json!("date"));
            m.insert("ms".into(), enc_num(*ms));
        }
        ObjData::Error { kind } => {
            m.insert("tag".into(), json!("error"));
            m.insert("err".into(), json!(kind.name()));
        }
        ObjData::Func(f) => {
            m.insert("tag".into(), json!("function"));
            let func = match f {
                FuncData::Interp { node, scope } => json!({
                    "type": "interp",
                    "prog": node.prog,
                    "node": node.id.0,
                    "scope": c.scope_ids[scope],
                }),
                FuncData::Native { tag } => json!({"type": "native", "tag": tag}),
                FuncData::AsyncNative { tag } => json!({"type": "async", "tag": tag}),
                FuncData::Eval => json!({"type": "eval"}),
            };
            m.insert("func".into(), func);
        }
    }
    rec
}

fn enc_target(t: &Target, c: &Collector) -> Json {
    match t {
        Target::Binding(name) => json!({"name": name}),
        Target::Property(base, key) => json!({"base": enc_value(base, c), "key": key}),
    }
}

fn enc_unwind(u: &Unwind, c: &Collector) -> Json {
    match u {
        Unwind::Break { label } => json!({"u": "break", "label": label}),
        Unwind::Continue { label } => json!({"u": "continue", "label": label}),
        Unwind::Return(v) => json!({"u": "return", "value": enc_value(v, c)}),
        Unwind::Throw(v) => json!({"u": "throw", "value": enc_value(v, c)}),
    }
}

fn enc_state(st: &FrameState, c: &Collector) -> Json {
    match st {
        FrameState::Program { body, index, done } => json!({
            "s": "program",
            "body": body.iter().map(|r| json!([r.prog, r.id.0])).collect::<Vec<_>>(),
            "index": index,
            "done": done,
        }),
        FrameState::Block { index } => json!({"s": "block", "index": index}),
        FrameState::ExprStmt { done } => json!({"s": "exprstmt", "done": done}),
        FrameState::VarDecl { index, pending } => {
            json!({"s": "vardecl", "index": index, "pending": pending})
        }
        FrameState::If { done_test, branched } => {
            json!({"s": "if", "doneTest": done_test, "branched": branched})
        }
        FrameState::While { checking } => json!({"s": "while", "checking": checking}),
        FrameState::DoWhile { phase } => json!({"s": "dowhile", "phase": match phase {
            DoPhase::Body => "body",
            DoPhase::Test => "test",
            DoPhase::Check => "check",
        }}),
        FrameState::For { phase } => json!({"s": "for", "phase": match phase {
            ForPhase::Init => "init",
            ForPhase::Test => "test",
            ForPhase::Check => "check",
            ForPhase::Update => "update",
        }}),
        FrameState::ForIn(st) => json!({
            "s": "forin",
            "phase": match st.phase {
                ForInPhase::Right => "right",
                ForInPhase::GotRight => "gotright",
                ForInPhase::Iter => "iter",
                ForInPhase::Target => "target",
            },
            "subject": enc_value(&st.subject, c),
            "keys": st.keys,
            "index": st.index,
            "visited": st.visited,
            "pendingKey": st.pending_key,
        }),
        FrameState::Switch(st) => json!({
            "s": "switch",
            "phase": match st.phase {
                SwitchPhase::Disc => "disc",
                SwitchPhase::Test => "test",
                SwitchPhase::Exec => "exec",
            },
            "disc": enc_value(&st.disc, c),
            "gotDisc": st.got_disc,
            "caseIdx": st.case_idx,
            "stmtIdx": st.stmt_idx,
            "testPending": st.test_pending,
            "defaultIdx": st.default_idx,
        }),
        FrameState::Try(st) => {
            let mut rec = json!({
                "s": "try",
                "phase": match st.phase {
                    TryPhase::Start => "start",
                    TryPhase::Block => "block",
                    TryPhase::Handler => "handler",
                    TryPhase::Finalizer => "finalizer",
                },
            });
            let m = rec.as_object_mut().expect("record is an object");
            if let Some(v) = &st.thrown {
                m.insert("thrown".into(), enc_value(v, c));
            }
            if let Some(u) = &st.pending {
                m.insert("pending".into(), enc_unwind(u, c));
            }
            rec
        }
        FrameState::ThrowStmt { done } => json!({"s": "throw", "done": done}),
        FrameState::ReturnStmt { done } => json!({"s": "return", "done": done}),
        FrameState::Binary { done_left, done_right, left } => json!({
            "s": "binary",
            "doneLeft": done_left,
            "doneRight": done_right,
            "left": enc_value(left, c),
        }),
        FrameState::Logical { done_left, done_right } => {
            json!({"s": "logical", "doneLeft": done_left, "doneRight": done_right})
        }
        FrameState::Unary { done } => json!({"s": "unary", "done": done}),
        FrameState::Update { done_target } => json!({"s": "update", "doneTarget": done_target}),
        FrameState::Assign(st) => {
            let mut rec = json!({
                "s": "assign",
                "doneLeft": st.done_left,
                "doneRight": st.done_right,
                "leftValue": enc_value(&st.left_value, c),
            });
            if let Some(t) = &st.target {
                rec.as_object_mut()
                    .expect("record is an object")
                    .insert("target".into(), enc_target(t, c));
            }
            rec
        }
        FrameState::Conditional { done_test, branched } => {
            json!({"s": "conditional", "doneTest": done_test, "branched": branched})
        }
        FrameState::Sequence { index } => json!({"s": "sequence", "index": index}),
        FrameState::Member { done_obj, obj, done_prop } => json!({
            "s": "member",
            "doneObj": done_obj,
            "obj": enc_value(obj, c),
            "doneProp": done_prop,
        }),
        FrameState::Call(st) => json!({
            "s": "call",
            "phase": match st.phase {
                CallPhase::Callee => "callee",
                CallPhase::Func => "func",
                CallPhase::Args => "args",
                CallPhase::Finish => "finish",
            },
            "func": enc_value(&st.func, c),
            "this": enc_value(&st.this_val, c),
            "args": st.args.iter().map(|a| enc_value(a, c)).collect::<Vec<_>>(),
            "argCount": st.arg_count,
            "constructing": st.constructing,
            "executing": st.executing,
            "waiting": st.waiting,
        }),
        FrameState::ArrayLit { obj, index, pending } => json!({
            "s": "arraylit",
            "obj": obj.map(|r| c.obj_ids[&r]),
            "index": index,
            "pending": pending,
        }),
        FrameState::ObjectLit { obj, index, pending } => json!({
            "s": "objectlit",
            "obj": obj.map(|r| c.obj_ids[&r]),
            "index": index,
            "pending": pending,
        }),
        FrameState::Atom => json!({"s": "atom"}),
    }
}

fn enc_frame(f: &Frame, c: &Collector) -> Json {
    let mut rec = json!({
        "kind": "frame",
        "prog": f.node.prog,
        "node": f.node.id.0,
        "scope": c.scope_ids[&f.scope],
        "this": enc_value(&f.this_val, c),
        "components": f.components,
        "labels": f.labels,
        "value": enc_value(&f.value, c),
        "state": enc_state(&f.state, c),
    });
    if let Some(t) = &f.target {
        rec.as_object_mut()
            .expect("record is an object")
            .insert("target".into(), enc_target(t, c));
    }
    rec
}

// ---------------------------------------------------------------------------
// Deserialization
// ---------------------------------------------------------------------------

struct Dec {
    index: usize,
}

impl Dec {
    fn bad(&self, message: impl Into<String>) -> SnapshotError {
        SnapshotError::BadRecord { index: self.index, message: message.into() }
    }

    fn field<'a>(&self, rec: &'a Json, key: &str) -> Result<&'a Json, SnapshotError> {
        rec.get(key).ok_or_else(|| self.bad(format!("missing field '{}'", key)))
    }

    fn str_field(&self, rec: &Json, key: &str) -> Result<String, SnapshotError> {
        self.field(rec, key)?
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| self.bad(format!("field '{}' is not a string", key)))
    }

    fn u32_field(&self, rec: &Json, key: &str) -> Result<u32, SnapshotError> {
        self.field(rec, key)?
            .as_u64()
            .map(|n| n as u32)
            .ok_or_else(|| self.bad(format!("field '{}' is not an index", key)))
    }

    fn usize_field(&self, rec: &Json, key: &str) -> Result<usize, SnapshotError> {
        self.field(rec, key)?
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| self.bad(format!("field '{}' is not an index", key)))
    }

    fn bool_field(&self, rec: &Json, key: &str) -> Result<bool, SnapshotError> {
        self.field(rec, key)?
            .as_bool()
            .ok_or_else(|| self.bad(format!("field '{}' is not a boolean", key)))
    }

    fn opt_u32(&self, rec: &Json, key: &str) -> Result<Option<u32>, SnapshotError> {
        match rec.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as u32))
                .ok_or_else(|| self.bad(format!("field '{}' is not an index", key))),
        }
    }

    fn opt_str(&self, rec: &Json, key: &str) -> Result<Option<String>, SnapshotError> {
        match rec.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| self.bad(format!("field '{}' is not a string", key))),
        }
    }

    fn value(&self, j: &Json) -> Result<Value, SnapshotError> {
        Ok(match j {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Num(n.as_f64().ok_or_else(|| self.bad("bad number"))?),
            Json::String(s) => Value::Str(s.clone()),
            Json::Object(m) => {
                if m.contains_key("undef") {
                    Value::Undefined
                } else if let Some(tag) = m.get("num").and_then(|v| v.as_str()) {
                    Value::Num(match tag {
                        "NaN" => f64::NAN,
                        "inf" => f64::INFINITY,
                        "-inf" => f64::NEG_INFINITY,
                        _ => return Err(self.bad("unknown number tag")),
                    })
                } else if let Some(r) = m.get("obj").and_then(|v| v.as_u64()) {
                    Value::Obj(ObjRef(r as u32))
                } else {
                    return Err(self.bad("unknown value encoding"));
                }
            }
            Json::Array(_) => return Err(self.bad("unexpected array value")),
        })
    }

    fn value_field(&self, rec: &Json, key: &str) -> Result<Value, SnapshotError> {
        self.value(self.field(rec, key)?)
    }

    fn target(&self, j: &Json) -> Result<Target, SnapshotError> {
        if let Some(name) = j.get("name").and_then(|v| v.as_str()) {
            return Ok(Target::Binding(name.to_string()));
        }
        let base = self.value(self.field(j, "base")?)?;
        let key = self.str_field(j, "key")?;
        Ok(Target::Property(base, key))
    }

    fn unwind(&self, j: &Json) -> Result<Unwind, SnapshotError> {
        let kind = self.str_field(j, "u")?;
        Ok(match kind.as_str() {
            "break" => Unwind::Break { label: self.opt_str(j, "label")? },
            "continue" => Unwind::Continue { label: self.opt_str(j, "label")? },
            "return" => Unwind::Return(self.value_field(j, "value")?),
            "throw" => Unwind::Throw(self.value_field(j, "value")?),
            other => return Err(self.bad(format!("unknown unwind '{}'", other))),
        })
    }
}

/// Rebuild a runtime from snapshot text. The runtime should be freshly
/// created (`Runtime::new`), with any extra native functions the snapshot
/// needs already registered; globals must NOT have been installed, they
/// come from the snapshot.
pub fn restore(rt: &mut Runtime, text: &str) -> Result<(), SnapshotError> {
    let records: Vec<Json> = serde_json::from_str(text)?;
    if records.is_empty() {
        return Err(SnapshotError::BadRecord { index: 0, message: "empty snapshot".into() });
    }

    let dec = Dec { index: 0 };
    let header = &records[0];
    let version = dec.u32_field(header, "version")?;
    if version != FORMAT_VERSION {
        return Err(SnapshotError::BadVersion(version));
    }

    // The native tag table must match name-for-name; extra natives
    // registered beyond the snapshot's table are fine.
    let natives = dec
        .field(header, "natives")?
        .as_array()
        .ok_or_else(|| dec.bad("natives is not a list"))?;
    for (tag, name) in natives.iter().enumerate() {
        let name = name.as_str().ok_or_else(|| dec.bad("native name is not a string"))?;
        match rt.natives.tag_by_name(name) {
            Some(t) if t as usize == tag => {}
            _ => return Err(SnapshotError::UnknownNative { name: name.to_string() }),
        }
    }

    // Re-parse every program source; deterministic node ids make the
    // node references in the records line up.
    let sources = dec
        .field(header, "sources")?
        .as_array()
        .ok_or_else(|| dec.bad("sources is not a list"))?;
    let mut programs = Vec::with_capacity(sources.len());
    for (i, src) in sources.iter().enumerate() {
        let src = src.as_str().ok_or_else(|| dec.bad("source is not a string"))?;
        let ast = Parser::parse_program(src)
            .map_err(|source| SnapshotError::StaleSource { index: i, source })?;
        programs.push(std::rc::Rc::new(ast));
    }

    let mut heap = Heap::new();
    let mut stack = Vec::new();
    let mut scope_count = 0usize;
    let mut obj_count = 0usize;

    for (i, rec) in records.iter().enumerate().skip(1) {
        let dec = Dec { index: i };
        let kind = dec.str_field(rec, "kind")?;
        match kind.as_str() {
            "scope" => {
                let mut scope = Scope::new(dec.opt_u32(rec, "parent")?.map(ScopeRef));
                let vars = dec
                    .field(rec, "vars")?
                    .as_array()
                    .ok_or_else(|| dec.bad("vars is not a list"))?;
                for entry in vars {
                    let triple = entry.as_array().filter(|a| a.len() == 3).ok_or_else(|| {
                        dec.bad("scope binding is not a [name, value, readOnly] triple")
                    })?;
                    let name = triple[0]
                        .as_str()
                        .ok_or_else(|| dec.bad("binding name is not a string"))?;
                    let value = dec.value(&triple[1])?;
                    let read_only = triple[2]
                        .as_bool()
                        .ok_or_else(|| dec.bad("binding flag is not a boolean"))?;
                    scope.vars.insert(name.to_string(), Binding { value, read_only });
                }
                heap.alloc_scope(scope);
                scope_count += 1;
            }
            "object" => {
                let data = dec_obj_data(&dec, rec)?;
                let mut obj = Object::new(dec.opt_u32(rec, "proto")?.map(ObjRef), data);
                obj.extensible = dec.bool_field(rec, "extensible")?;
                let props = dec
                    .field(rec, "props")?
                    .as_array()
                    .ok_or_else(|| dec.bad("props is not a list"))?;
                for entry in props {
                    let triple = entry.as_array().filter(|a| a.len() == 3).ok_or_else(|| {
                        dec.bad("property is not a [name, value, flags] triple")
                    })?;
                    let name = triple[0]
                        .as_str()
                        .ok_or_else(|| dec.bad("property name is not a string"))?;
                    let value = dec.value(&triple[1])?;
                    let bits = triple[2]
                        .as_u64()
                        .ok_or_else(|| dec.bad("property flags are not an integer"))?;
                    let flags = PropFlags::from_bits(bits as u8)
                        .ok_or_else(|| dec.bad("unknown property flag bits"))?;
                    obj.props.insert(name.to_string(), Prop { value, flags });
                }
                heap.alloc(obj);
                obj_count += 1;
            }
            "frame" => {
                stack.push(dec_frame(&dec, rec, &programs)?);
            }
            other => {
                return Err(dec.bad(format!("unknown record kind '{}'", other)));
            }
        }
    }

    // Wire up the prototype registry from the header.
    let protos_rec = dec.field(header, "protos")?;
    let mut protos = Protos::default();
    for (name, slot) in PROTO_NAMES.iter().zip(protos_slots(&mut protos)) {
        *slot = dec.opt_u32(protos_rec, name)?.map(ObjRef);
    }
    heap.protos = protos;

    let global = ScopeRef(dec.u32_field(header, "global")?);

    // Bounds checks before installing anything.
    check_refs(&heap, &stack, scope_count, obj_count, &programs)?;

    rt.heap = heap;
    rt.programs = programs;
    rt.stack = stack;
    rt.global = global;
    rt.stack_limit = dec.usize_field(header, "stackLimit")?;
    rt.checkpoint_requested = false;
    rt.shutdown_requested = None;
    // A frame parked on an async native stays parked until the host
    // re-arms and completes it.
    rt.paused = rt.stack.iter().any(|f| {
        matches!(&f.state, FrameState::Call(st) if st.waiting)
    });
    Ok(())
}

fn protos_slots(p: &mut Protos) -> [&mut Option<ObjRef>; 15] {
    [
        &mut p.object,
        &mut p.function,
        &mut p.array,
        &mut p.string,
        &mut p.number,
        &mut p.boolean,
        &mut p.date,
        &mut p.regexp,
        &mut p.error,
        &mut p.eval_error,
        &mut p.range_error,
        &mut p.reference_error,
        &mut p.syntax_error,
        &mut p.type_error,
        &mut p.uri_error,
    ]
}

fn dec_obj_data(dec: &Dec, rec: &Json) -> Result<ObjData, SnapshotError> {
    let tag = dec.str_field(rec, "tag")?;
    Ok(match tag.as_str() {
        "plain" => ObjData::Plain,
        "array" => ObjData::Array { length: dec.u32_field(rec, "length")? },
        "regex" => ObjData::Regex {
            source: dec.str_field(rec, "source")?,
            flags: dec.str_field(rec, "flags")?,
        },
        "date" => {
            let ms = match dec.value_field(rec, "ms")? {
                Value::Num(n) => n,
                _ => return Err(dec.bad("date ms is not a number")),
            };
            ObjData::Date { ms }
        }
        "error" => {
            let name = dec.str_field(rec, "err")?;
            let kind = ErrorKind::from_name(&name)
                .ok_or_else(|| dec.bad(format!("unknown error kind '{}'", name)))?;
            ObjData::Error { kind }
        }
        "function" => {
            let func = dec.field(rec, "func")?;
            let ty = dec.str_field(func, "type")?;
            let data = match ty.as_str() {
                "interp" => FuncData::Interp {
                    node: NodeRef::new(
                        dec.u32_field(func, "prog")?,
                        NodeId(dec.u32_field(func, "node")?),
                    ),
                    scope: ScopeRef(dec.u32_field(func, "scope")?),
                },
                "native" => FuncData::Native { tag: dec.u32_field(func, "tag")? },
                "async" => FuncData::AsyncNative { tag: dec.u32_field(func, "tag")? },
                "eval" => FuncData::Eval,
                other => return Err(dec.bad(format!("unknown function type '{}'", other))),
            };
            ObjData::Func(data)
        }
        other => return Err(dec.bad(format!("unknown object tag '{}'", other))),
    })
}

fn dec_frame(
    dec: &Dec,
    rec: &Json,
    programs: &[std::rc::Rc<crate::ast::Ast>],
) -> Result<Frame, SnapshotError> {
    let prog = dec.u32_field(rec, "prog")?;
    let node = NodeId(dec.u32_field(rec, "node")?);
    if programs.get(prog as usize).map_or(true, |p| node.0 as usize >= p.nodes.len()) {
        return Err(dec.bad("frame node reference out of range"));
    }
    let target = match rec.get("target") {
        None | Some(Json::Null) => None,
        Some(t) => Some(dec.target(t)?),
    };
    let labels = dec
        .field(rec, "labels")?
        .as_array()
        .ok_or_else(|| dec.bad("labels is not a list"))?
        .iter()
        .map(|l| {
            l.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| dec.bad("label is not a string"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Frame {
        node: NodeRef::new(prog, node),
        scope: ScopeRef(dec.u32_field(rec, "scope")?),
        this_val: dec.value_field(rec, "this")?,
        components: dec.bool_field(rec, "components")?,
        labels,
        value: dec.value_field(rec, "value")?,
        target,
        state: dec_state(dec, dec.field(rec, "state")?)?,
    })
}

fn dec_state(dec: &Dec, st: &Json) -> Result<FrameState, SnapshotError> {
    let s = dec.str_field(st, "s")?;
    Ok(match s.as_str() {
        "program" => {
            let body = dec
                .field(st, "body")?
                .as_array()
                .ok_or_else(|| dec.bad("program body is not a list"))?
                .iter()
                .map(|pair| {
                    let pair = pair
                        .as_array()
                        .filter(|a| a.len() == 2)
                        .ok_or_else(|| dec.bad("body entry is not a [prog, node] pair"))?;
                    let prog = pair[0].as_u64().ok_or_else(|| dec.bad("bad prog index"))?;
                    let node = pair[1].as_u64().ok_or_else(|| dec.bad("bad node index"))?;
                    Ok(NodeRef::new(prog as u32, NodeId(node as u32)))
                })
                .collect::<Result<Vec<_>, SnapshotError>>()?;
            FrameState::Program {
                body,
                index: dec.usize_field(st, "index")?,
                done: dec.bool_field(st, "done")?,
            }
        }
        "block" => FrameState::Block { index: dec.usize_field(st, "index")? },
        "exprstmt" => FrameState::ExprStmt { done: dec.bool_field(st, "done")? },
        "vardecl" => FrameState::VarDecl {
            index: dec.usize_field(st, "index")?,
            pending: dec.opt_str(st, "pending")?,
        },
        "if" => FrameState::If {
            done_test: dec.bool_field(st, "doneTest")?,
            branched: dec.bool_field(st, "branched")?,
        },
        "while" => FrameState::While { checking: dec.bool_field(st, "checking")? },
        "dowhile" => FrameState::DoWhile {
            phase: match dec.str_field(st, "phase")?.as_str() {
                "body" => DoPhase::Body,
                "test" => DoPhase::Test,
                "check" => DoPhase::Check,
                other => return Err(dec.bad(format!("unknown do-while phase '{}'", other))),
            },
        },
        "for" => FrameState::For {
            phase: match dec.str_field(st, "phase")?.as_str() {
                "init" => ForPhase::Init,
                "test" => ForPhase::Test,
                "check" => ForPhase::Check,
                "update" => ForPhase::Update,
                other => return Err(dec.bad(format!("unknown for phase '{}'", other))),
            },
        },
        "forin" => FrameState::ForIn(Box::new(ForInState {
            phase: match dec.str_field(st, "phase")?.as_str() {
                "right" => ForInPhase::Right,
                "gotright" => ForInPhase::GotRight,
                "iter" => ForInPhase::Iter,
                "target" => ForInPhase::Target,
                other => return Err(dec.bad(format!("unknown for-in phase '{}'", other))),
            },
            subject: dec.value_field(st, "subject")?,
            keys: dec_string_list(dec, st, "keys")?,
            index: dec.usize_field(st, "index")?,
            visited: dec_string_list(dec, st, "visited")?,
            pending_key: dec.opt_str(st, "pendingKey")?,
        })),
        "switch" => FrameState::Switch(Box::new(SwitchState {
            phase: match dec.str_field(st, "phase")?.as_str() {
                "disc" => SwitchPhase::Disc,
                "test" => SwitchPhase::Test,
                "exec" => SwitchPhase::Exec,
                other => return Err(dec.bad(format!("unknown switch phase '{}'", other))),
            },
            disc: dec.value_field(st, "disc")?,
            got_disc: dec.bool_field(st, "gotDisc")?,
            case_idx: dec.usize_field(st, "caseIdx")?,
            stmt_idx: dec.usize_field(st, "stmtIdx")?,
            test_pending: dec.bool_field(st, "testPending")?,
            default_idx: dec.opt_u32(st, "defaultIdx")?.map(|n| n as usize),
        })),
        "try" => FrameState::Try(Box::new(TryState {
            phase: match dec.str_field(st, "phase")?.as_str() {
                "start" => TryPhase::Start,
                "block" => TryPhase::Block,
                "handler" => TryPhase::Handler,
                "finalizer" => TryPhase::Finalizer,
                other => return Err(dec.bad(format!("unknown try phase '{}'", other))),
            },
            thrown: match st.get("thrown") {
                None => None,
                Some(v) => Some(dec.value(v)?),
            },
            pending: match st.get("pending") {
                None => None,
                Some(u) => Some(dec.unwind(u)?),
            },
        })),
        "throw" => FrameState::ThrowStmt { done: dec.bool_field(st, "done")? },
        "return" => FrameState::ReturnStmt { done: dec.bool_field(st, "done")? },
        "binary" => FrameState::Binary {
            done_left: dec.bool_field(st, "doneLeft")?,
            done_right: dec.bool_field(st, "doneRight")?,
            left: dec.value_field(st, "left")?,
        },
        "logical" => FrameState::Logical {
            done_left: dec.bool_field(st, "doneLeft")?,
            done_right: dec.bool_field(st, "doneRight")?,
        },
        "unary" => FrameState::Unary { done: dec.bool_field(st, "done")? },
        "update" => FrameState::Update { done_target: dec.bool_field(st, "doneTarget")? },
        "assign" => FrameState::Assign(Box::new(AssignState {
            done_left: dec.bool_field(st, "doneLeft")?,
            done_right: dec.bool_field(st, "doneRight")?,
            target: match st.get("target") {
                None | Some(Json::Null) => None,
                Some(t) => Some(dec.target(t)?),
            },
            left_value: dec.value_field(st, "leftValue")?,
        })),
        "conditional" => FrameState::Conditional {
            done_test: dec.bool_field(st, "doneTest")?,
            branched: dec.bool_field(st, "branched")?,
        },
        "sequence" => FrameState::Sequence { index: dec.usize_field(st, "index")? },
        "member" => FrameState::Member {
            done_obj: dec.bool_field(st, "doneObj")?,
            obj: dec.value_field(st, "obj")?,
            done_prop: dec.bool_field(st, "doneProp")?,
        },
        "call" => FrameState::Call(Box::new(CallState {
            phase: match dec.str_field(st, "phase")?.as_str() {
                "callee" => CallPhase::Callee,
                "func" => CallPhase::Func,
                "args" => CallPhase::Args,
                "finish" => CallPhase::Finish,
                other => return Err(dec.bad(format!("unknown call phase '{}'", other))),
            },
            func: dec.value_field(st, "func")?,
            this_val: dec.value_field(st, "this")?,
            args: dec
                .field(st, "args")?
                .as_array()
                .ok_or_else(|| dec.bad("call args is not a list"))?
                .iter()
                .map(|a| dec.value(a))
                .collect::<Result<Vec<_>, _>>()?,
            arg_count: dec.usize_field(st, "argCount")?,
            constructing: dec.bool_field(st, "constructing")?,
            executing: dec.bool_field(st, "executing")?,
            waiting: dec.bool_field(st, "waiting")?,
        })),
        "arraylit" => FrameState::ArrayLit {
            obj: dec.opt_u32(st, "obj")?.map(ObjRef),
            index: dec.usize_field(st, "index")?,
            pending: dec.opt_u32(st, "pending")?,
        },
        "objectlit" => FrameState::ObjectLit {
            obj: dec.opt_u32(st, "obj")?.map(ObjRef),
            index: dec.usize_field(st, "index")?,
            pending: dec.opt_str(st, "pending")?,
        },
        "atom" => FrameState::Atom,
        other => return Err(dec.bad(format!("unknown frame state '{}'", other))),
    })
}

fn dec_string_list(dec: &Dec, rec: &Json, key: &str) -> Result<Vec<String>, SnapshotError> {
    dec.field(rec, key)?
        .as_array()
        .ok_or_else(|| dec.bad(format!("{} is not a list", key)))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| dec.bad(format!("{} entry is not a string", key)))
        })
        .collect()
}

/// Referential integrity: every index stored in the rebuilt graph must
/// land inside the rebuilt arenas. Scope/object cross references were
/// produced by the collector so only counts need checking.
fn check_refs(
    heap: &Heap,
    stack: &[Frame],
    scope_count: usize,
    obj_count: usize,
    programs: &[std::rc::Rc<crate::ast::Ast>],
) -> Result<(), SnapshotError> {
    let bad = |message: &str| SnapshotError::BadRecord { index: 0, message: message.to_string() };
    if heap.scope_count() != scope_count || heap.object_count() != obj_count {
        return Err(bad("record counts disagree with arena sizes"));
    }
    for frame in stack {
        if frame.scope.0 as usize >= scope_count {
            return Err(bad("frame scope out of range"));
        }
        if let FrameState::Program { body, .. } = &frame.state {
            for r in body {
                if programs
                    .get(r.prog as usize)
                    .map_or(true, |p| r.id.0 as usize >= p.nodes.len())
                {
                    return Err(bad("program body reference out of range"));
                }
            }
        }
    }
    if stack.is_empty() {
        return Err(bad("snapshot has no stack frames"));
    }
    if !matches!(stack[0].state, FrameState::Program { .. }) {
        return Err(bad("root frame is not a program"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Checkpoint files
// ---------------------------------------------------------------------------

/// ISO-8601 UTC with colons replaced by periods; lexicographic order is
/// chronological order.
pub fn snapshot_filename(now: DateTime<Utc>) -> String {
    let ts = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', ".");
    format!("{}.city", ts)
}

/// Serialize and write atomically: temp file suffixed `.partial`, then
/// rename. On failure the partial is removed and the error reported; the
/// caller resumes the stepper either way.
pub fn write_checkpoint(rt: &Runtime, dir: &Path) -> Result<PathBuf, SnapshotError> {
    let text = serialize(rt);
    let name = snapshot_filename(Utc::now());
    let final_path = dir.join(&name);
    let partial_path = dir.join(format!("{}.partial", name));
    if let Err(source) = fs::write(&partial_path, &text) {
        let _ = fs::remove_file(&partial_path);
        return Err(SnapshotError::Io { path: partial_path, source });
    }
    if let Err(source) = fs::rename(&partial_path, &final_path) {
        let _ = fs::remove_file(&partial_path);
        return Err(SnapshotError::Io { path: final_path, source });
    }
    Ok(final_path)
}

/// Load a snapshot file into a fresh runtime. Read failures at startup
/// are fatal to the supervisor.
pub fn load_file(rt: &mut Runtime, path: &Path) -> Result<(), SnapshotError> {
    let text = fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    restore(rt, &text)
}
