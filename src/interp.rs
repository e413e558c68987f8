/// The stepper: an explicit-stack tree-walking interpreter.
///
/// Execution state is a stack of `Frame`s; each frame pairs a syntax-tree
/// node with a per-kind `FrameState` variant holding the resumable partial
/// state (done flags, counters, accumulated values). `step()` advances by
/// one small unit: the top frame either pushes a child, updates its state,
/// or pops and writes its result into the frame below. Between any two
/// steps the entire computation is plain data, which is what makes
/// whole-state snapshots possible.
///
/// Dispatch style: the top frame is taken off the stack, its node is
/// cloned out of the (immutable) program arena, and the handler returns a
/// `Ctl` describing what to do with the frame. Unwinding for break /
/// continue / return / throw walks the stack from the top, driven by the
/// frame state variants rather than by node kinds.

use crate::ast::{AssignOp, Ast, BinOp, Lit, LogicalOp, Node, NodeId, NodeRef, UnaryOp, UpdateOp};
use crate::errors::FatalError;
use crate::heap::{FuncData, Heap, LangError, ObjData, ObjRef, Scope, ScopeRef};
use crate::intrinsics::{self, NativeError, NativeImpl, NativeRegistry};
use crate::parser::Parser;
use crate::value::{self, Cmp, Value};
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Reference tuples
// ---------------------------------------------------------------------------

/// Result of evaluating an expression in "components" mode: a place that
/// can be read, written, or deleted, rather than a value.
#[derive(Debug, Clone)]
pub enum Target {
    /// A bare name, resolved against the scope chain.
    Binding(String),
    /// `(object, key)` from a member expression.
    Property(Value, String),
}

/// In-flight non-local control transfer.
#[derive(Debug, Clone)]
pub enum Unwind {
    Break { label: Option<String> },
    Continue { label: Option<String> },
    Return(Value),
    Throw(Value),
}

// ---------------------------------------------------------------------------
// Frame state variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoPhase {
    Body,
    Test,
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForPhase {
    Init,
    Test,
    Check,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForInPhase {
    Right,
    GotRight,
    Iter,
    Target,
}

#[derive(Debug, Clone)]
pub struct ForInState {
    pub phase: ForInPhase,
    /// Current prototype-chain level being enumerated.
    pub subject: Value,
    pub keys: Vec<String>,
    pub index: usize,
    /// Names already yielded anywhere along the chain.
    pub visited: Vec<String>,
    pub pending_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPhase {
    Disc,
    Test,
    Exec,
}

#[derive(Debug, Clone)]
pub struct SwitchState {
    pub phase: SwitchPhase,
    pub disc: Value,
    pub got_disc: bool,
    pub case_idx: usize,
    pub stmt_idx: usize,
    pub test_pending: bool,
    pub default_idx: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPhase {
    Start,
    Block,
    Handler,
    Finalizer,
}

#[derive(Debug, Clone)]
pub struct TryState {
    pub phase: TryPhase,
    /// Set by unwind when a throw lands here while the block is running.
    pub thrown: Option<Value>,
    /// Completion to replay once the finalizer has run.
    pub pending: Option<Unwind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Callee,
    Func,
    Args,
    Finish,
}

#[derive(Debug, Clone)]
pub struct CallState {
    pub phase: CallPhase,
    pub func: Value,
    pub this_val: Value,
    pub args: Vec<Value>,
    pub arg_count: usize,
    pub constructing: bool,
    /// A function body (or eval program) is running under this frame;
    /// `return` unwinds stop here.
    pub executing: bool,
    /// Waiting on an async native's completion callback.
    pub waiting: bool,
}

#[derive(Debug, Clone)]
pub struct AssignState {
    pub done_left: bool,
    pub done_right: bool,
    pub target: Option<Target>,
    pub left_value: Value,
}

#[derive(Debug, Clone)]
pub enum FrameState {
    Program {
        /// Root frames accumulate statements across appended programs, so
        /// the body is a list of cross-program references.
        body: Vec<NodeRef>,
        index: usize,
        done: bool,
    },
    Block {
        index: usize,
    },
    ExprStmt {
        done: bool,
    },
    VarDecl {
        index: usize,
        pending: Option<String>,
    },
    If {
        done_test: bool,
        branched: bool,
    },
    While {
        checking: bool,
    },
    DoWhile {
        phase: DoPhase,
    },
    For {
        phase: ForPhase,
    },
    ForIn(Box<ForInState>),
    Switch(Box<SwitchState>),
    Try(Box<TryState>),
    ThrowStmt {
        done: bool,
    },
    ReturnStmt {
        done: bool,
    },
    Binary {
        done_left: bool,
        done_right: bool,
        left: Value,
    },
    Logical {
        done_left: bool,
        done_right: bool,
    },
    Unary {
        done: bool,
    },
    Update {
        done_target: bool,
    },
    Assign(Box<AssignState>),
    Conditional {
        done_test: bool,
        branched: bool,
    },
    Sequence {
        index: usize,
    },
    Member {
        done_obj: bool,
        obj: Value,
        done_prop: bool,
    },
    Call(Box<CallState>),
    ArrayLit {
        obj: Option<ObjRef>,
        index: usize,
        pending: Option<u32>,
    },
    ObjectLit {
        obj: Option<ObjRef>,
        index: usize,
        pending: Option<String>,
    },
    /// Single-shot nodes: literals, identifiers, this, function
    /// expressions, declarations, empty statements.
    Atom,
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Frame {
    pub node: NodeRef,
    pub scope: ScopeRef,
    pub this_val: Value,
    /// Evaluate to a reference tuple instead of a value.
    pub components: bool,
    /// Labels attached by enclosing labeled statements.
    pub labels: Vec<String>,
    /// Result slot written by completing children.
    pub value: Value,
    /// Reference slot written by children evaluated with `components`.
    pub target: Option<Target>,
    pub state: FrameState,
}

/// What the dispatched handler wants done with the (currently owned) frame.
enum Ctl {
    /// Push the frame back; it made progress in place.
    Keep,
    /// Push the frame back, then push a child on top.
    Push(Frame),
    /// Replace the frame with another (labeled statements).
    Replace(Frame),
    /// Discard the frame; optionally write a value into the parent.
    Pop(Option<Value>),
    /// Discard the frame; write a reference tuple into the parent.
    PopTarget(Target),
    /// The handler invoked `unwind`, which already rebuilt the stack.
    Unwound,
}

type StepResult = Result<Ctl, Signal>;

/// Error channel out of a handler: either a catchable language error that
/// becomes a thrown heap object, or a fatal host error.
enum Signal {
    Lang(LangError),
    Fatal(FatalError),
}

impl From<LangError> for Signal {
    fn from(e: LangError) -> Signal {
        Signal::Lang(e)
    }
}

impl From<FatalError> for Signal {
    fn from(e: FatalError) -> Signal {
        Signal::Fatal(e)
    }
}

/// Outcome of `run_slice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Root program finished; nothing left to step.
    Done,
    /// Pause flag observed (supervisor request, async native, checkpoint).
    Paused,
    /// Step budget exhausted, more work remains.
    More,
}

/// Queued async-native initiation, run right after its call frame settles
/// back onto the stack.
struct PendingAsync {
    func: crate::intrinsics::AsyncNativeFn,
    this_val: Value,
    args: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    pub heap: Heap,
    pub programs: Vec<Rc<Ast>>,
    pub stack: Vec<Frame>,
    pub natives: NativeRegistry,
    pub global: ScopeRef,
    pub paused: bool,
    /// Maximum stack depth in frames; exceeding it throws a catchable Error.
    pub stack_limit: usize,
    /// Set by the `sys.checkpoint` native; cleared by the supervisor.
    pub checkpoint_requested: bool,
    /// Set by the `sys.shutdown` native with the requested exit code.
    pub shutdown_requested: Option<i32>,
    pending_async: Option<PendingAsync>,
}

impl Runtime {
    /// An empty runtime: registry and global scope exist, but no globals
    /// are installed. The snapshot loader starts from here.
    pub fn new() -> Runtime {
        let mut heap = Heap::new();
        let global = heap.alloc_scope(Scope::new(None));
        let empty = Rc::new(Parser::parse_program("").expect("empty program parses"));
        let root_ref = NodeRef::new(0, empty.root);
        let root = Frame {
            node: root_ref,
            scope: global,
            this_val: Value::Undefined,
            components: false,
            labels: Vec::new(),
            value: Value::Undefined,
            target: None,
            state: FrameState::Program { body: Vec::new(), index: 0, done: false },
        };
        Runtime {
            heap,
            programs: vec![empty],
            stack: vec![root],
            natives: intrinsics::build_registry(),
            global,
            paused: false,
            stack_limit: 5_000,
            checkpoint_requested: false,
            shutdown_requested: None,
            pending_async: None,
        }
    }

    /// A fully booted runtime with the builtin library installed.
    pub fn boot() -> Runtime {
        let mut rt = Runtime::new();
        intrinsics::install(&mut rt);
        rt
    }

    // -----------------------------------------------------------------------
    // Public stepping contract
    // -----------------------------------------------------------------------

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// The root Program frame's completion value — the value of the last
    /// top-level expression statement.
    pub fn value(&self) -> Value {
        self.stack.first().map(|f| f.value.clone()).unwrap_or(Value::Undefined)
    }

    pub fn root_done(&self) -> bool {
        matches!(
            self.stack.first().map(|f| &f.state),
            Some(FrameState::Program { done: true, .. })
        )
    }

    /// Run until the root completes or the pause flag is observed.
    /// Returns true when paused.
    pub fn run(&mut self) -> Result<bool, FatalError> {
        loop {
            if self.paused {
                return Ok(true);
            }
            if !self.step()? {
                return Ok(false);
            }
        }
    }

    /// Run at most `max_steps` steps, observing the pause flag before each.
    pub fn run_slice(&mut self, max_steps: usize) -> Result<RunOutcome, FatalError> {
        for _ in 0..max_steps {
            if self.paused {
                return Ok(RunOutcome::Paused);
            }
            if !self.step()? {
                return Ok(RunOutcome::Done);
            }
        }
        Ok(if self.paused { RunOutcome::Paused } else { RunOutcome::More })
    }

    /// Append top-level statements to the root Program frame, re-opening it
    /// and re-running scope population. Parse failures propagate to the
    /// host; nothing is appended in that case.
    pub fn append_code(&mut self, src: &str) -> Result<(), FatalError> {
        let ast = Parser::parse_program(src).map_err(|source| FatalError::Parse {
            origin: "appendCode".to_string(),
            source,
        })?;
        let prog = self.register_program(ast);
        let refs = self.program_body(prog);
        let ast = self.programs[prog as usize].clone();
        self.populate_scope(&ast, ast.root, prog, self.global);
        match &mut self.stack[0].state {
            FrameState::Program { body, done, .. } => {
                body.extend(refs);
                *done = false;
            }
            _ => return Err(FatalError::Corrupt("root frame is not a program")),
        }
        Ok(())
    }

    /// Startup-time variant: parse a program fragment and push it as its
    /// own Program frame on top of the stack.
    pub fn create_thread_for_src(&mut self, origin: &str, src: &str) -> Result<(), FatalError> {
        let ast = Parser::parse_program(src).map_err(|source| FatalError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        let prog = self.register_program(ast);
        let refs = self.program_body(prog);
        let ast = self.programs[prog as usize].clone();
        self.populate_scope(&ast, ast.root, prog, self.global);
        let frame = Frame {
            node: NodeRef::new(prog, ast.root),
            scope: self.global,
            this_val: Value::Undefined,
            components: false,
            labels: Vec::new(),
            value: Value::Undefined,
            target: None,
            state: FrameState::Program { body: refs, index: 0, done: false },
        };
        self.stack.push(frame);
        Ok(())
    }

    /// Deliver the value of a completed async-native call: stores it on the
    /// waiting call frame and clears the pause flag.
    pub fn complete_async(&mut self, v: Value) {
        for frame in self.stack.iter_mut().rev() {
            if let FrameState::Call(st) = &mut frame.state {
                if st.waiting {
                    st.waiting = false;
                    frame.value = v;
                    self.paused = false;
                    return;
                }
            }
        }
        log::warn!("async completion delivered with no waiting call frame");
    }

    pub fn register_program(&mut self, ast: Ast) -> u32 {
        self.programs.push(Rc::new(ast));
        self.programs.len() as u32 - 1
    }

    fn program_body(&self, prog: u32) -> Vec<NodeRef> {
        let ast = &self.programs[prog as usize];
        match ast.node(ast.root) {
            Node::Program { body } => body.iter().map(|id| NodeRef::new(prog, *id)).collect(),
            _ => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Scope population
    // -----------------------------------------------------------------------

    /// Pre-execution pass over a program or function body: declare every
    /// `var` (as undefined, preserving an existing binding's value) and
    /// every function declaration (bound to a fresh closure), without
    /// descending into nested function bodies or expressions.
    pub fn populate_scope(&mut self, ast: &Ast, id: NodeId, prog: u32, scope: ScopeRef) {
        match ast.node(id) {
            Node::Program { body } | Node::BlockStatement { body } => {
                for stmt in body.clone() {
                    self.populate_scope(ast, stmt, prog, scope);
                }
            }
            Node::VariableDeclaration { declarations } => {
                for d in declarations.clone() {
                    if let Node::VariableDeclarator { name, .. } = ast.node(d) {
                        if !self.heap.has_binding_here(scope, name) {
                            self.heap.declare(scope, name, Value::Undefined, false);
                        }
                    }
                }
            }
            Node::FunctionDeclaration { name, params, .. } => {
                let arity = params.len() as u32;
                let name = name.clone();
                let func = self.heap.new_interp_func(NodeRef::new(prog, id), scope, arity);
                self.heap.declare(scope, &name, Value::Obj(func), false);
            }
            Node::IfStatement { consequent, alternate, .. } => {
                let (c, a) = (*consequent, *alternate);
                self.populate_scope(ast, c, prog, scope);
                if let Some(a) = a {
                    self.populate_scope(ast, a, prog, scope);
                }
            }
            Node::WhileStatement { body, .. } | Node::DoWhileStatement { body, .. } => {
                self.populate_scope(ast, *body, prog, scope);
            }
            Node::ForStatement { init, body, .. } => {
                let (init, body) = (*init, *body);
                if let Some(init) = init {
                    self.populate_scope(ast, init, prog, scope);
                }
                self.populate_scope(ast, body, prog, scope);
            }
            Node::ForInStatement { left, body, .. } => {
                let (left, body) = (*left, *body);
                self.populate_scope(ast, left, prog, scope);
                self.populate_scope(ast, body, prog, scope);
            }
            Node::LabeledStatement { body, .. } => {
                self.populate_scope(ast, *body, prog, scope);
            }
            Node::TryStatement { block, handler, finalizer } => {
                let (b, h, f) = (*block, *handler, *finalizer);
                self.populate_scope(ast, b, prog, scope);
                if let Some(h) = h {
                    if let Node::CatchClause { body, .. } = ast.node(h) {
                        self.populate_scope(ast, *body, prog, scope);
                    }
                }
                if let Some(f) = f {
                    self.populate_scope(ast, f, prog, scope);
                }
            }
            Node::SwitchStatement { cases, .. } => {
                for case in cases.clone() {
                    if let Node::SwitchCase { consequent, .. } = ast.node(case) {
                        for stmt in consequent.clone() {
                            self.populate_scope(ast, stmt, prog, scope);
                        }
                    }
                }
            }
            Node::WithStatement { body, .. } => {
                self.populate_scope(ast, *body, prog, scope);
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Step dispatch
    // -----------------------------------------------------------------------

    /// Advance by one unit. Returns false when the root Program frame is
    /// done (the root itself stays on the stack so code can be appended).
    pub fn step(&mut self) -> Result<bool, FatalError> {
        if self.stack.len() == 1 && self.root_done() {
            return Ok(false);
        }
        let mut frame = match self.stack.pop() {
            Some(f) => f,
            None => return Err(FatalError::Corrupt("empty execution stack")),
        };
        let node = self.node_clone(frame.node);
        let result = self.dispatch(&mut frame, node);
        match result {
            Ok(Ctl::Keep) => self.stack.push(frame),
            Ok(Ctl::Push(child)) => {
                self.stack.push(frame);
                self.stack.push(child);
            }
            Ok(Ctl::Replace(other)) => self.stack.push(other),
            Ok(Ctl::Pop(v)) => {
                if let Some(parent) = self.stack.last_mut() {
                    if let Some(v) = v {
                        parent.value = v;
                    }
                }
            }
            Ok(Ctl::PopTarget(t)) => {
                if let Some(parent) = self.stack.last_mut() {
                    parent.target = Some(t);
                }
            }
            Ok(Ctl::Unwound) => {}
            Err(Signal::Lang(e)) => {
                let obj = self.heap.new_error_from(&e);
                self.unwind(Unwind::Throw(Value::Obj(obj)))?;
            }
            Err(Signal::Fatal(e)) => {
                self.stack.push(frame);
                return Err(e);
            }
        }
        if let Some(pending) = self.pending_async.take() {
            (pending.func)(self, &pending.this_val, &pending.args);
        }
        Ok(true)
    }

    fn node_clone(&self, r: NodeRef) -> Node {
        self.programs[r.prog as usize].node(r.id).clone()
    }

    fn dispatch(&mut self, frame: &mut Frame, node: Node) -> StepResult {
        match node {
            Node::Program { .. } => self.step_program(frame),
            Node::BlockStatement { body } => self.step_block(frame, &body),
            Node::ExpressionStatement { expression } => self.step_expr_stmt(frame, expression),
            Node::VariableDeclaration { declarations } => self.step_var_decl(frame, &declarations),
            Node::VariableDeclarator { .. } => Err(FatalError::Corrupt("declarator stepped directly").into()),
            Node::FunctionDeclaration { .. } => Ok(Ctl::Pop(None)),
            Node::ReturnStatement { argument } => self.step_return(frame, argument),
            Node::IfStatement { test, consequent, alternate } => {
                self.step_if(frame, test, consequent, alternate)
            }
            Node::WhileStatement { test, body } => self.step_while(frame, test, body),
            Node::DoWhileStatement { body, test } => self.step_do_while(frame, body, test),
            Node::ForStatement { init, test, update, body } => {
                self.step_for(frame, init, test, update, body)
            }
            Node::ForInStatement { left, right, body } => self.step_for_in(frame, left, right, body),
            Node::BreakStatement { label } => {
                self.unwind(Unwind::Break { label })?;
                Ok(Ctl::Unwound)
            }
            Node::ContinueStatement { label } => {
                self.unwind(Unwind::Continue { label })?;
                Ok(Ctl::Unwound)
            }
            Node::LabeledStatement { label, body } => {
                let mut labels = frame.labels.clone();
                labels.push(label);
                let child = self.new_frame(frame.node.at(body), frame.scope, frame.this_val.clone(), false, labels);
                Ok(Ctl::Replace(child))
            }
            Node::SwitchStatement { discriminant, cases } => {
                self.step_switch(frame, discriminant, &cases)
            }
            Node::SwitchCase { .. } => Err(FatalError::Corrupt("switch case stepped directly").into()),
            Node::ThrowStatement { argument } => self.step_throw(frame, argument),
            Node::TryStatement { block, handler, finalizer } => {
                self.step_try(frame, block, handler, finalizer)
            }
            Node::CatchClause { .. } => Err(FatalError::Corrupt("catch clause stepped directly").into()),
            Node::EmptyStatement | Node::DebuggerStatement => Ok(Ctl::Pop(None)),
            Node::WithStatement { .. } => Err(FatalError::WithStatement.into()),
            Node::Literal { value } => self.step_literal(frame, value),
            Node::Identifier { name } => self.step_identifier(frame, &name),
            Node::ThisExpression => Ok(Ctl::Pop(Some(frame.this_val.clone()))),
            Node::ArrayExpression { elements } => self.step_array_lit(frame, &elements),
            Node::ObjectExpression { properties } => self.step_object_lit(frame, &properties),
            Node::FunctionExpression { params, .. } => {
                let func = self
                    .heap
                    .new_interp_func(frame.node, frame.scope, params.len() as u32);
                Ok(Ctl::Pop(Some(Value::Obj(func))))
            }
            Node::UnaryExpression { op, argument } => self.step_unary(frame, op, argument),
            Node::UpdateExpression { op, prefix, argument } => {
                self.step_update(frame, op, prefix, argument)
            }
            Node::BinaryExpression { op, left, right } => self.step_binary(frame, op, left, right),
            Node::LogicalExpression { op, left, right } => self.step_logical(frame, op, left, right),
            Node::AssignmentExpression { op, left, right } => self.step_assign(frame, op, left, right),
            Node::ConditionalExpression { test, consequent, alternate } => {
                self.step_conditional(frame, test, consequent, alternate)
            }
            Node::CallExpression { callee, arguments } => {
                self.step_call(frame, callee, &arguments, false)
            }
            Node::NewExpression { callee, arguments } => {
                self.step_call(frame, callee, &arguments, true)
            }
            Node::MemberExpression { object, property, computed } => {
                self.step_member(frame, object, property, computed)
            }
            Node::SequenceExpression { expressions } => self.step_sequence(frame, &expressions),
        }
    }

    fn new_frame(
        &self,
        node: NodeRef,
        scope: ScopeRef,
        this_val: Value,
        components: bool,
        labels: Vec<String>,
    ) -> Frame {
        Frame {
            node,
            scope,
            this_val,
            components,
            labels,
            value: Value::Undefined,
            target: None,
            state: self.initial_state(node),
        }
    }

    fn child(&self, frame: &Frame, id: NodeId) -> Frame {
        self.new_frame(frame.node.at(id), frame.scope, frame.this_val.clone(), false, Vec::new())
    }

    fn child_components(&self, frame: &Frame, id: NodeId) -> Frame {
        self.new_frame(frame.node.at(id), frame.scope, frame.this_val.clone(), true, Vec::new())
    }

    fn initial_state(&self, node: NodeRef) -> FrameState {
        match self.programs[node.prog as usize].node(node.id) {
            Node::Program { body } => FrameState::Program {
                body: body.iter().map(|id| node.at(*id)).collect(),
                index: 0,
                done: false,
            },
            Node::BlockStatement { .. } => FrameState::Block { index: 0 },
            Node::ExpressionStatement { .. } => FrameState::ExprStmt { done: false },
            Node::VariableDeclaration { .. } => FrameState::VarDecl { index: 0, pending: None },
            Node::IfStatement { .. } => FrameState::If { done_test: false, branched: false },
            Node::WhileStatement { .. } => FrameState::While { checking: false },
            Node::DoWhileStatement { .. } => FrameState::DoWhile { phase: DoPhase::Body },
            Node::ForStatement { .. } => FrameState::For { phase: ForPhase::Init },
            Node::ForInStatement { .. } => FrameState::ForIn(Box::new(ForInState {
                phase: ForInPhase::Right,
                subject: Value::Undefined,
                keys: Vec::new(),
                index: 0,
                visited: Vec::new(),
                pending_key: None,
            })),
            Node::SwitchStatement { .. } => FrameState::Switch(Box::new(SwitchState {
                phase: SwitchPhase::Disc,
                disc: Value::Undefined,
                got_disc: false,
                case_idx: 0,
                stmt_idx: 0,
                test_pending: false,
                default_idx: None,
            })),
            Node::TryStatement { .. } => FrameState::Try(Box::new(TryState {
                phase: TryPhase::Start,
                thrown: None,
                pending: None,
            })),
            Node::ThrowStatement { .. } => FrameState::ThrowStmt { done: false },
            Node::ReturnStatement { .. } => FrameState::ReturnStmt { done: false },
            Node::BinaryExpression { .. } => FrameState::Binary {
                done_left: false,
                done_right: false,
                left: Value::Undefined,
            },
            Node::LogicalExpression { .. } => {
                FrameState::Logical { done_left: false, done_right: false }
            }
            Node::UnaryExpression { .. } => FrameState::Unary { done: false },
            Node::UpdateExpression { .. } => FrameState::Update { done_target: false },
            Node::AssignmentExpression { .. } => FrameState::Assign(Box::new(AssignState {
                done_left: false,
                done_right: false,
                target: None,
                left_value: Value::Undefined,
            })),
            Node::ConditionalExpression { .. } => {
                FrameState::Conditional { done_test: false, branched: false }
            }
            Node::SequenceExpression { .. } => FrameState::Sequence { index: 0 },
            Node::MemberExpression { .. } => FrameState::Member {
                done_obj: false,
                obj: Value::Undefined,
                done_prop: false,
            },
            Node::CallExpression { .. } | Node::NewExpression { .. } => {
                FrameState::Call(Box::new(CallState {
                    phase: CallPhase::Callee,
                    func: Value::Undefined,
                    this_val: Value::Undefined,
                    args: Vec::new(),
                    arg_count: 0,
                    constructing: matches!(
                        self.programs[node.prog as usize].node(node.id),
                        Node::NewExpression { .. }
                    ),
                    executing: false,
                    waiting: false,
                }))
            }
            Node::ArrayExpression { .. } => {
                FrameState::ArrayLit { obj: None, index: 0, pending: None }
            }
            Node::ObjectExpression { .. } => {
                FrameState::ObjectLit { obj: None, index: 0, pending: None }
            }
            _ => FrameState::Atom,
        }
    }

    // -----------------------------------------------------------------------
    // Statement handlers
    // -----------------------------------------------------------------------

    fn step_program(&mut self, frame: &mut Frame) -> StepResult {
        let is_root = self.stack.is_empty();
        let (next, finished) = match &mut frame.state {
            FrameState::Program { body, index, .. } => {
                if *index < body.len() {
                    let r = body[*index];
                    *index += 1;
                    (Some(r), false)
                } else {
                    (None, true)
                }
            }
            _ => return Err(FatalError::Corrupt("program state mismatch").into()),
        };
        if let Some(r) = next {
            let child = self.new_frame(r, frame.scope, frame.this_val.clone(), false, Vec::new());
            return Ok(Ctl::Push(child));
        }
        debug_assert!(finished);
        if is_root {
            if let FrameState::Program { done, .. } = &mut frame.state {
                *done = true;
            }
            Ok(Ctl::Keep)
        } else {
            Ok(Ctl::Pop(Some(frame.value.clone())))
        }
    }

    fn step_block(&mut self, frame: &mut Frame, body: &[NodeId]) -> StepResult {
        let index = match &mut frame.state {
            FrameState::Block { index } => index,
            _ => return Err(FatalError::Corrupt("block state mismatch").into()),
        };
        if *index < body.len() {
            let id = body[*index];
            *index += 1;
            return Ok(Ctl::Push(self.child(frame, id)));
        }
        // Statements do not write the parent's value slot; a function body
        // that falls off the end leaves the call result undefined.
        Ok(Ctl::Pop(None))
    }

    fn step_expr_stmt(&mut self, frame: &mut Frame, expression: NodeId) -> StepResult {
        match &mut frame.state {
            FrameState::ExprStmt { done } if !*done => {
                *done = true;
                Ok(Ctl::Push(self.child(frame, expression)))
            }
            FrameState::ExprStmt { .. } => Ok(Ctl::Pop(Some(frame.value.clone()))),
            _ => Err(FatalError::Corrupt("expression statement state mismatch").into()),
        }
    }

    fn step_var_decl(&mut self, frame: &mut Frame, declarations: &[NodeId]) -> StepResult {
        loop {
            let finished = match &mut frame.state {
                FrameState::VarDecl { pending, .. } => pending.take(),
                _ => return Err(FatalError::Corrupt("var state mismatch").into()),
            };
            if let Some(name) = finished {
                let v = frame.value.clone();
                if !self.heap.assign(frame.scope, &name, v.clone())? {
                    self.heap.declare(frame.scope, &name, v, false);
                }
            }
            let index = match &frame.state {
                FrameState::VarDecl { index, .. } => *index,
                _ => unreachable!(),
            };
            if index >= declarations.len() {
                return Ok(Ctl::Pop(None));
            }
            let (name, init) = match self.node_clone(frame.node.at(declarations[index])) {
                Node::VariableDeclarator { name, init } => (name, init),
                _ => return Err(FatalError::Corrupt("expected declarator").into()),
            };
            if let FrameState::VarDecl { index, pending } = &mut frame.state {
                *index += 1;
                if init.is_some() {
                    *pending = Some(name);
                }
            }
            if let Some(init) = init {
                return Ok(Ctl::Push(self.child(frame, init)));
            }
        }
    }

    fn step_return(&mut self, frame: &mut Frame, argument: Option<NodeId>) -> StepResult {
        match &mut frame.state {
            FrameState::ReturnStmt { done } if !*done => {
                if let Some(arg) = argument {
                    *done = true;
                    return Ok(Ctl::Push(self.child(frame, arg)));
                }
                self.unwind(Unwind::Return(Value::Undefined))?;
                Ok(Ctl::Unwound)
            }
            FrameState::ReturnStmt { .. } => {
                let v = frame.value.clone();
                self.unwind(Unwind::Return(v))?;
                Ok(Ctl::Unwound)
            }
            _ => Err(FatalError::Corrupt("return state mismatch").into()),
        }
    }

    fn step_throw(&mut self, frame: &mut Frame, argument: NodeId) -> StepResult {
        match &mut frame.state {
            FrameState::ThrowStmt { done } if !*done => {
                *done = true;
                Ok(Ctl::Push(self.child(frame, argument)))
            }
            FrameState::ThrowStmt { .. } => {
                let v = frame.value.clone();
                self.unwind(Unwind::Throw(v))?;
                Ok(Ctl::Unwound)
            }
            _ => Err(FatalError::Corrupt("throw state mismatch").into()),
        }
    }

    fn step_if(
        &mut self,
        frame: &mut Frame,
        test: NodeId,
        consequent: NodeId,
        alternate: Option<NodeId>,
    ) -> StepResult {
        match &mut frame.state {
            FrameState::If { done_test, .. } if !*done_test => {
                *done_test = true;
                Ok(Ctl::Push(self.child(frame, test)))
            }
            FrameState::If { branched, .. } if !*branched => {
                *branched = true;
                if value::to_boolean(&frame.value) {
                    Ok(Ctl::Push(self.child(frame, consequent)))
                } else if let Some(alt) = alternate {
                    Ok(Ctl::Push(self.child(frame, alt)))
                } else {
                    Ok(Ctl::Pop(None))
                }
            }
            FrameState::If { .. } => Ok(Ctl::Pop(None)),
            _ => Err(FatalError::Corrupt("if state mismatch").into()),
        }
    }

    fn step_while(&mut self, frame: &mut Frame, test: NodeId, body: NodeId) -> StepResult {
        match &mut frame.state {
            FrameState::While { checking } if !*checking => {
                *checking = true;
                Ok(Ctl::Push(self.child(frame, test)))
            }
            FrameState::While { checking } => {
                if value::to_boolean(&frame.value) {
                    *checking = false;
                    Ok(Ctl::Push(self.child(frame, body)))
                } else {
                    Ok(Ctl::Pop(None))
                }
            }
            _ => Err(FatalError::Corrupt("while state mismatch").into()),
        }
    }

    fn step_do_while(&mut self, frame: &mut Frame, body: NodeId, test: NodeId) -> StepResult {
        let phase = match &mut frame.state {
            FrameState::DoWhile { phase } => phase,
            _ => return Err(FatalError::Corrupt("do-while state mismatch").into()),
        };
        match *phase {
            DoPhase::Body => {
                *phase = DoPhase::Test;
                Ok(Ctl::Push(self.child(frame, body)))
            }
            DoPhase::Test => {
                *phase = DoPhase::Check;
                Ok(Ctl::Push(self.child(frame, test)))
            }
            DoPhase::Check => {
                if value::to_boolean(&frame.value) {
                    *phase = DoPhase::Test;
                    Ok(Ctl::Push(self.child(frame, body)))
                } else {
                    Ok(Ctl::Pop(None))
                }
            }
        }
    }

    fn step_for(
        &mut self,
        frame: &mut Frame,
        init: Option<NodeId>,
        test: Option<NodeId>,
        update: Option<NodeId>,
        body: NodeId,
    ) -> StepResult {
        loop {
            let phase = match &mut frame.state {
                FrameState::For { phase } => phase,
                _ => return Err(FatalError::Corrupt("for state mismatch").into()),
            };
            match *phase {
                ForPhase::Init => {
                    *phase = ForPhase::Test;
                    if let Some(init) = init {
                        return Ok(Ctl::Push(self.child(frame, init)));
                    }
                }
                ForPhase::Test => {
                    if let Some(test) = test {
                        *phase = ForPhase::Check;
                        return Ok(Ctl::Push(self.child(frame, test)));
                    }
                    *phase = ForPhase::Update;
                    return Ok(Ctl::Push(self.child(frame, body)));
                }
                ForPhase::Check => {
                    if !value::to_boolean(&frame.value) {
                        return Ok(Ctl::Pop(None));
                    }
                    *phase = ForPhase::Update;
                    return Ok(Ctl::Push(self.child(frame, body)));
                }
                ForPhase::Update => {
                    *phase = ForPhase::Test;
                    if let Some(update) = update {
                        return Ok(Ctl::Push(self.child(frame, update)));
                    }
                }
            }
        }
    }

    fn step_for_in(
        &mut self,
        frame: &mut Frame,
        left: NodeId,
        right: NodeId,
        body: NodeId,
    ) -> StepResult {
        loop {
            let st = match &mut frame.state {
                FrameState::ForIn(st) => st,
                _ => return Err(FatalError::Corrupt("for-in state mismatch").into()),
            };
            match st.phase {
                ForInPhase::Right => {
                    st.phase = ForInPhase::GotRight;
                    return Ok(Ctl::Push(self.child(frame, right)));
                }
                ForInPhase::GotRight => {
                    let subject = frame.value.clone();
                    if matches!(subject, Value::Undefined | Value::Null) {
                        return Ok(Ctl::Pop(None));
                    }
                    st.keys = self.heap.own_enumerable_keys(&subject);
                    st.subject = subject;
                    st.index = 0;
                    st.phase = ForInPhase::Iter;
                }
                ForInPhase::Iter => {
                    if st.index >= st.keys.len() {
                        // Move one level up the prototype chain; the
                        // visited set persists across levels.
                        match self.heap.proto_of(&st.subject) {
                            None => return Ok(Ctl::Pop(None)),
                            Some(p) => {
                                st.subject = Value::Obj(p);
                                st.keys = self.heap.own_enumerable_keys(&st.subject);
                                st.index = 0;
                                continue;
                            }
                        }
                    }
                    let key = st.keys[st.index].clone();
                    st.index += 1;
                    if st.visited.iter().any(|k| k == &key) {
                        continue;
                    }
                    // Keys deleted mid-iteration are skipped.
                    let still_there = match &st.subject {
                        Value::Obj(r) => self.heap.has_own(*r, &key),
                        Value::Str(s) => {
                            crate::heap::index_of(&key)
                                .map_or(false, |i| (i as usize) < s.chars().count())
                        }
                        _ => false,
                    };
                    if !still_there {
                        continue;
                    }
                    st.visited.push(key.clone());
                    match self.for_in_binding(frame.node.prog, left) {
                        ForInLeft::Name(name) => {
                            let v = Value::Str(key);
                            if !self.heap.assign(frame.scope, &name, v.clone())? {
                                self.heap.declare(self.global, &name, v, false);
                            }
                            return Ok(Ctl::Push(self.child(frame, body)));
                        }
                        ForInLeft::Expr => {
                            st.pending_key = Some(key);
                            st.phase = ForInPhase::Target;
                            return Ok(Ctl::Push(self.child_components(frame, left)));
                        }
                    }
                }
                ForInPhase::Target => {
                    let key = st.pending_key.take().ok_or(FatalError::Corrupt("for-in key lost"))?;
                    st.phase = ForInPhase::Iter;
                    let target = frame.target.take().ok_or(FatalError::Corrupt("for-in target lost"))?;
                    self.write_target(frame.scope, &target, Value::Str(key))?;
                    return Ok(Ctl::Push(self.child(frame, body)));
                }
            }
        }
    }

    fn for_in_binding(&self, prog: u32, left: NodeId) -> ForInLeft {
        let ast = &self.programs[prog as usize];
        match ast.node(left) {
            Node::VariableDeclaration { declarations } => match ast.node(declarations[0]) {
                Node::VariableDeclarator { name, .. } => ForInLeft::Name(name.clone()),
                _ => ForInLeft::Expr,
            },
            Node::Identifier { name } => ForInLeft::Name(name.clone()),
            _ => ForInLeft::Expr,
        }
    }

    fn step_switch(
        &mut self,
        frame: &mut Frame,
        discriminant: NodeId,
        cases: &[NodeId],
    ) -> StepResult {
        loop {
            let st = match &mut frame.state {
                FrameState::Switch(st) => st,
                _ => return Err(FatalError::Corrupt("switch state mismatch").into()),
            };
            match st.phase {
                SwitchPhase::Disc => {
                    st.phase = SwitchPhase::Test;
                    return Ok(Ctl::Push(self.child(frame, discriminant)));
                }
                SwitchPhase::Test => {
                    if !st.got_disc {
                        st.got_disc = true;
                        st.disc = frame.value.clone();
                    }
                    if st.test_pending {
                        st.test_pending = false;
                        let matched = value::compare(&self.heap, &st.disc, &frame.value)
                            == Cmp::Equal;
                        if matched {
                            st.phase = SwitchPhase::Exec;
                            st.stmt_idx = 0;
                            continue;
                        }
                        st.case_idx += 1;
                        continue;
                    }
                    if st.case_idx >= cases.len() {
                        match st.default_idx {
                            Some(d) => {
                                st.case_idx = d;
                                st.stmt_idx = 0;
                                st.phase = SwitchPhase::Exec;
                                continue;
                            }
                            None => return Ok(Ctl::Pop(None)),
                        }
                    }
                    let case = cases[st.case_idx];
                    let test = match self.node_clone(frame.node.at(case)) {
                        Node::SwitchCase { test, .. } => test,
                        _ => return Err(FatalError::Corrupt("expected switch case").into()),
                    };
                    match test {
                        None => {
                            st.default_idx = Some(st.case_idx);
                            st.case_idx += 1;
                        }
                        Some(test) => {
                            st.test_pending = true;
                            return Ok(Ctl::Push(self.child(frame, test)));
                        }
                    }
                }
                SwitchPhase::Exec => {
                    if st.case_idx >= cases.len() {
                        return Ok(Ctl::Pop(None));
                    }
                    let case = cases[st.case_idx];
                    let consequent = match self.node_clone(frame.node.at(case)) {
                        Node::SwitchCase { consequent, .. } => consequent,
                        _ => return Err(FatalError::Corrupt("expected switch case").into()),
                    };
                    if st.stmt_idx < consequent.len() {
                        let stmt = consequent[st.stmt_idx];
                        st.stmt_idx += 1;
                        return Ok(Ctl::Push(self.child(frame, stmt)));
                    }
                    // Fall through into the next case's consequents.
                    st.case_idx += 1;
                    st.stmt_idx = 0;
                }
            }
        }
    }

    fn step_try(
        &mut self,
        frame: &mut Frame,
        block: NodeId,
        handler: Option<NodeId>,
        finalizer: Option<NodeId>,
    ) -> StepResult {
        let phase = match &frame.state {
            FrameState::Try(st) => st.phase,
            _ => return Err(FatalError::Corrupt("try state mismatch").into()),
        };
        match phase {
            TryPhase::Start => {
                if let FrameState::Try(st) = &mut frame.state {
                    st.phase = TryPhase::Block;
                }
                Ok(Ctl::Push(self.child(frame, block)))
            }
            TryPhase::Block => {
                let thrown = match &mut frame.state {
                    FrameState::Try(st) => st.thrown.take(),
                    _ => None,
                };
                if let Some(thrown) = thrown {
                    if let Some(h) = handler {
                        let (param, cbody) = match self.node_clone(frame.node.at(h)) {
                            Node::CatchClause { param, body } => (param, body),
                            _ => return Err(FatalError::Corrupt("expected catch clause").into()),
                        };
                        // One-binding scope for the catch parameter.
                        let catch_scope = self.heap.alloc_scope(Scope::new(Some(frame.scope)));
                        self.heap.declare(catch_scope, &param, thrown, false);
                        if let FrameState::Try(st) = &mut frame.state {
                            st.phase = TryPhase::Handler;
                        }
                        let child = self.new_frame(
                            frame.node.at(cbody),
                            catch_scope,
                            frame.this_val.clone(),
                            false,
                            Vec::new(),
                        );
                        return Ok(Ctl::Push(child));
                    }
                    if let FrameState::Try(st) = &mut frame.state {
                        st.pending = Some(Unwind::Throw(thrown));
                    }
                }
                self.try_finalize(frame, finalizer)
            }
            TryPhase::Handler => self.try_finalize(frame, finalizer),
            TryPhase::Finalizer => {
                let pending = match &mut frame.state {
                    FrameState::Try(st) => st.pending.take(),
                    _ => None,
                };
                self.finish_try(frame, pending)
            }
        }
    }

    /// Block or handler completed (or an unhandled throw is pending): run
    /// the finalizer if there is one, otherwise finish the statement.
    fn try_finalize(&mut self, frame: &mut Frame, finalizer: Option<NodeId>) -> StepResult {
        if let Some(f) = finalizer {
            if let FrameState::Try(st) = &mut frame.state {
                st.phase = TryPhase::Finalizer;
            }
            return Ok(Ctl::Push(self.child(frame, f)));
        }
        let pending = match &mut frame.state {
            FrameState::Try(st) => st.pending.take(),
            _ => None,
        };
        self.finish_try(frame, pending)
    }

    /// Pop the try frame and replay any pending completion. A pending
    /// break whose label is the try statement's own label ends here.
    fn finish_try(&mut self, frame: &mut Frame, pending: Option<Unwind>) -> StepResult {
        match pending {
            None => Ok(Ctl::Pop(None)),
            Some(Unwind::Break { label: Some(l) }) if frame.labels.contains(&l) => Ok(Ctl::Pop(None)),
            Some(u) => {
                self.unwind(u)?;
                Ok(Ctl::Unwound)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Expression handlers
    // -----------------------------------------------------------------------

    fn step_literal(&mut self, _frame: &mut Frame, lit: Lit) -> StepResult {
        let v = match lit {
            Lit::Null => Value::Null,
            Lit::Bool(b) => Value::Bool(b),
            Lit::Num(n) => Value::Num(n),
            Lit::Str(s) => Value::Str(s),
            Lit::Regex { source, flags } => {
                // Validate eagerly so a bad literal throws where it appears.
                intrinsics::compile_regex(&source, &flags).map_err(Signal::Lang)?;
                Value::Obj(self.heap.new_regex(&source, &flags))
            }
        };
        Ok(Ctl::Pop(Some(v)))
    }

    fn step_identifier(&mut self, frame: &mut Frame, name: &str) -> StepResult {
        if frame.components {
            return Ok(Ctl::PopTarget(Target::Binding(name.to_string())));
        }
        match self.heap.lookup(frame.scope, name) {
            Some(v) => Ok(Ctl::Pop(Some(v))),
            None => Err(LangError::reference_error(format!("{} is not defined", name)).into()),
        }
    }

    fn step_unary(&mut self, frame: &mut Frame, op: UnaryOp, argument: NodeId) -> StepResult {
        match &mut frame.state {
            FrameState::Unary { done } if !*done => {
                *done = true;
                // typeof and delete need the reference, not the value.
                let child = if matches!(op, UnaryOp::TypeOf | UnaryOp::Delete) {
                    self.child_components(frame, argument)
                } else {
                    self.child(frame, argument)
                };
                Ok(Ctl::Push(child))
            }
            FrameState::Unary { .. } => {
                let v = match op {
                    UnaryOp::TypeOf => {
                        let resolved = match frame.target.take() {
                            // Unresolvable names yield undefined instead of
                            // a ReferenceError, only under typeof.
                            Some(Target::Binding(name)) => self
                                .heap
                                .lookup(frame.scope, &name)
                                .unwrap_or(Value::Undefined),
                            Some(Target::Property(base, key)) => self.heap.get_prop(&base, &key)?,
                            None => frame.value.clone(),
                        };
                        Value::Str(value::type_of(&self.heap, &resolved).to_string())
                    }
                    UnaryOp::Delete => {
                        let deleted = match frame.target.take() {
                            Some(Target::Binding(name)) => {
                                self.heap.delete_binding(frame.scope, &name)
                            }
                            Some(Target::Property(base, key)) => {
                                self.heap.delete_prop(&base, &key)?
                            }
                            None => true,
                        };
                        Value::Bool(deleted)
                    }
                    UnaryOp::Minus => Value::Num(-value::to_number(&self.heap, &frame.value)),
                    UnaryOp::Plus => Value::Num(value::to_number(&self.heap, &frame.value)),
                    UnaryOp::Not => Value::Bool(!value::to_boolean(&frame.value)),
                    UnaryOp::BitNot => {
                        Value::Num(!value::to_int32(&self.heap, &frame.value) as f64)
                    }
                    UnaryOp::Void => Value::Undefined,
                };
                Ok(Ctl::Pop(Some(v)))
            }
            _ => Err(FatalError::Corrupt("unary state mismatch").into()),
        }
    }

    fn step_update(
        &mut self,
        frame: &mut Frame,
        op: UpdateOp,
        prefix: bool,
        argument: NodeId,
    ) -> StepResult {
        match &mut frame.state {
            FrameState::Update { done_target } if !*done_target => {
                *done_target = true;
                Ok(Ctl::Push(self.child_components(frame, argument)))
            }
            FrameState::Update { .. } => {
                let target = frame
                    .target
                    .take()
                    .ok_or(FatalError::Corrupt("update without target"))?;
                let old = self.read_target(frame.scope, &target)?;
                let old = value::to_number(&self.heap, &old);
                let new = match op {
                    UpdateOp::Inc => old + 1.0,
                    UpdateOp::Dec => old - 1.0,
                };
                self.write_target(frame.scope, &target, Value::Num(new))?;
                Ok(Ctl::Pop(Some(Value::Num(if prefix { new } else { old }))))
            }
            _ => Err(FatalError::Corrupt("update state mismatch").into()),
        }
    }

    fn step_binary(
        &mut self,
        frame: &mut Frame,
        op: BinOp,
        left: NodeId,
        right: NodeId,
    ) -> StepResult {
        match &mut frame.state {
            FrameState::Binary { done_left, .. } if !*done_left => {
                *done_left = true;
                Ok(Ctl::Push(self.child(frame, left)))
            }
            FrameState::Binary { done_right, left: left_slot, .. } if !*done_right => {
                *done_right = true;
                *left_slot = frame.value.clone();
                Ok(Ctl::Push(self.child(frame, right)))
            }
            FrameState::Binary { left: left_slot, .. } => {
                let l = left_slot.clone();
                let r = frame.value.clone();
                let v = self.binary_op(op, &l, &r)?;
                Ok(Ctl::Pop(Some(v)))
            }
            _ => Err(FatalError::Corrupt("binary state mismatch").into()),
        }
    }

    fn binary_op(&self, op: BinOp, l: &Value, r: &Value) -> Result<Value, LangError> {
        let heap = &self.heap;
        let v = match op {
            BinOp::Add => {
                // To-primitive both sides; string wins if either side is one.
                let lp = match l {
                    Value::Obj(_) => Value::Str(value::to_string(heap, l)),
                    other => other.clone(),
                };
                let rp = match r {
                    Value::Obj(_) => Value::Str(value::to_string(heap, r)),
                    other => other.clone(),
                };
                if matches!(lp, Value::Str(_)) || matches!(rp, Value::Str(_)) {
                    Value::Str(format!(
                        "{}{}",
                        value::to_string(heap, &lp),
                        value::to_string(heap, &rp)
                    ))
                } else {
                    Value::Num(value::to_number(heap, &lp) + value::to_number(heap, &rp))
                }
            }
            BinOp::Sub => Value::Num(value::to_number(heap, l) - value::to_number(heap, r)),
            BinOp::Mul => Value::Num(value::to_number(heap, l) * value::to_number(heap, r)),
            BinOp::Div => Value::Num(value::to_number(heap, l) / value::to_number(heap, r)),
            BinOp::Mod => Value::Num(value::to_number(heap, l) % value::to_number(heap, r)),
            BinOp::EqEq => Value::Bool(value::loose_eq(heap, l, r)),
            BinOp::NotEq => Value::Bool(!value::loose_eq(heap, l, r)),
            BinOp::StrictEq => Value::Bool(value::strict_eq(l, r)),
            BinOp::StrictNotEq => Value::Bool(!value::strict_eq(l, r)),
            BinOp::Lt => Value::Bool(value::compare(heap, l, r) == Cmp::Less),
            BinOp::LtEq => {
                let c = value::compare(heap, l, r);
                Value::Bool(c == Cmp::Less || c == Cmp::Equal)
            }
            BinOp::Gt => Value::Bool(value::compare(heap, l, r) == Cmp::Greater),
            BinOp::GtEq => {
                let c = value::compare(heap, l, r);
                Value::Bool(c == Cmp::Greater || c == Cmp::Equal)
            }
            BinOp::BitAnd => {
                Value::Num((value::to_int32(heap, l) & value::to_int32(heap, r)) as f64)
            }
            BinOp::BitOr => {
                Value::Num((value::to_int32(heap, l) | value::to_int32(heap, r)) as f64)
            }
            BinOp::BitXor => {
                Value::Num((value::to_int32(heap, l) ^ value::to_int32(heap, r)) as f64)
            }
            BinOp::Shl => Value::Num(
                ((value::to_int32(heap, l)) << (value::to_uint32(heap, r) & 31)) as f64,
            ),
            BinOp::Shr => Value::Num(
                ((value::to_int32(heap, l)) >> (value::to_uint32(heap, r) & 31)) as f64,
            ),
            BinOp::UShr => Value::Num(
                ((value::to_uint32(heap, l)) >> (value::to_uint32(heap, r) & 31)) as f64,
            ),
            BinOp::In => {
                let key = value::to_string(heap, l);
                Value::Bool(heap.has_prop(r, &key)?)
            }
            BinOp::Instanceof => {
                if !value::is_callable(heap, r) {
                    return Err(LangError::type_error(
                        "Right-hand side of 'instanceof' is not callable",
                    ));
                }
                let proto = heap.get_prop(r, "prototype")?;
                let proto = match proto {
                    Value::Obj(p) => p,
                    _ => {
                        return Err(LangError::type_error(
                            "Function has non-object prototype in 'instanceof'",
                        ))
                    }
                };
                let mut cursor = match l {
                    Value::Obj(o) => heap.obj(*o).proto,
                    _ => None,
                };
                let mut found = false;
                while let Some(p) = cursor {
                    if p == proto {
                        found = true;
                        break;
                    }
                    cursor = heap.obj(p).proto;
                }
                Value::Bool(found)
            }
        };
        Ok(v)
    }

    fn step_logical(
        &mut self,
        frame: &mut Frame,
        op: LogicalOp,
        left: NodeId,
        right: NodeId,
    ) -> StepResult {
        match &mut frame.state {
            FrameState::Logical { done_left, .. } if !*done_left => {
                *done_left = true;
                Ok(Ctl::Push(self.child(frame, left)))
            }
            FrameState::Logical { done_right, .. } if !*done_right => {
                let truthy = value::to_boolean(&frame.value);
                let short_circuit = match op {
                    LogicalOp::And => !truthy,
                    LogicalOp::Or => truthy,
                };
                if short_circuit {
                    return Ok(Ctl::Pop(Some(frame.value.clone())));
                }
                *done_right = true;
                Ok(Ctl::Push(self.child(frame, right)))
            }
            FrameState::Logical { .. } => Ok(Ctl::Pop(Some(frame.value.clone()))),
            _ => Err(FatalError::Corrupt("logical state mismatch").into()),
        }
    }

    fn step_assign(
        &mut self,
        frame: &mut Frame,
        op: AssignOp,
        left: NodeId,
        right: NodeId,
    ) -> StepResult {
        enum Next {
            PushLeft,
            PushRight,
            Finish,
        }
        let next = match &frame.state {
            FrameState::Assign(st) if !st.done_left => Next::PushLeft,
            FrameState::Assign(st) if !st.done_right => Next::PushRight,
            FrameState::Assign(_) => Next::Finish,
            _ => return Err(FatalError::Corrupt("assign state mismatch").into()),
        };
        match next {
            Next::PushLeft => {
                if let FrameState::Assign(st) = &mut frame.state {
                    st.done_left = true;
                }
                Ok(Ctl::Push(self.child_components(frame, left)))
            }
            Next::PushRight => {
                let target = frame
                    .target
                    .take()
                    .ok_or(FatalError::Corrupt("assignment without target"))?;
                let left_value = if op == AssignOp::Assign {
                    Value::Undefined
                } else {
                    self.read_target(frame.scope, &target)?
                };
                if let FrameState::Assign(st) = &mut frame.state {
                    st.done_right = true;
                    st.target = Some(target);
                    st.left_value = left_value;
                }
                Ok(Ctl::Push(self.child(frame, right)))
            }
            Next::Finish => {
                let (target, left_value) = match &mut frame.state {
                    FrameState::Assign(st) => (
                        st.target.take().ok_or(FatalError::Corrupt("assignment target lost"))?,
                        st.left_value.clone(),
                    ),
                    _ => unreachable!(),
                };
                let rhs = frame.value.clone();
                let result = match assign_bin_op(op) {
                    None => rhs,
                    Some(bin) => self.binary_op(bin, &left_value, &rhs)?,
                };
                self.write_target(frame.scope, &target, result.clone())?;
                Ok(Ctl::Pop(Some(result)))
            }
        }
    }

    fn step_conditional(
        &mut self,
        frame: &mut Frame,
        test: NodeId,
        consequent: NodeId,
        alternate: NodeId,
    ) -> StepResult {
        match &mut frame.state {
            FrameState::Conditional { done_test, .. } if !*done_test => {
                *done_test = true;
                Ok(Ctl::Push(self.child(frame, test)))
            }
            FrameState::Conditional { branched, .. } if !*branched => {
                *branched = true;
                let id = if value::to_boolean(&frame.value) { consequent } else { alternate };
                Ok(Ctl::Push(self.child(frame, id)))
            }
            FrameState::Conditional { .. } => Ok(Ctl::Pop(Some(frame.value.clone()))),
            _ => Err(FatalError::Corrupt("conditional state mismatch").into()),
        }
    }

    fn step_sequence(&mut self, frame: &mut Frame, expressions: &[NodeId]) -> StepResult {
        let index = match &mut frame.state {
            FrameState::Sequence { index } => index,
            _ => return Err(FatalError::Corrupt("sequence state mismatch").into()),
        };
        if *index < expressions.len() {
            let id = expressions[*index];
            *index += 1;
            return Ok(Ctl::Push(self.child(frame, id)));
        }
        Ok(Ctl::Pop(Some(frame.value.clone())))
    }

    fn step_member(
        &mut self,
        frame: &mut Frame,
        object: NodeId,
        property: NodeId,
        computed: bool,
    ) -> StepResult {
        enum Next {
            PushObj,
            AfterObj,
            Finish,
        }
        let next = match &frame.state {
            FrameState::Member { done_obj, .. } if !*done_obj => Next::PushObj,
            FrameState::Member { done_prop, .. } if !*done_prop => Next::AfterObj,
            FrameState::Member { .. } => Next::Finish,
            _ => return Err(FatalError::Corrupt("member state mismatch").into()),
        };
        match next {
            Next::PushObj => {
                if let FrameState::Member { done_obj, .. } = &mut frame.state {
                    *done_obj = true;
                }
                Ok(Ctl::Push(self.child(frame, object)))
            }
            Next::AfterObj => {
                let obj = frame.value.clone();
                if computed {
                    if let FrameState::Member { done_prop, obj: slot, .. } = &mut frame.state {
                        *done_prop = true;
                        *slot = obj;
                    }
                    return Ok(Ctl::Push(self.child(frame, property)));
                }
                let key = match self.node_clone(frame.node.at(property)) {
                    Node::Identifier { name } => name,
                    _ => return Err(FatalError::Corrupt("member property is not a name").into()),
                };
                self.finish_member(frame, obj, key)
            }
            Next::Finish => {
                let obj = match &frame.state {
                    FrameState::Member { obj, .. } => obj.clone(),
                    _ => unreachable!(),
                };
                let key = value::to_string(&self.heap, &frame.value);
                self.finish_member(frame, obj, key)
            }
        }
    }

    fn finish_member(&mut self, frame: &mut Frame, obj: Value, key: String) -> StepResult {
        if frame.components {
            return Ok(Ctl::PopTarget(Target::Property(obj, key)));
        }
        let v = self.heap.get_prop(&obj, &key)?;
        Ok(Ctl::Pop(Some(v)))
    }

    fn step_array_lit(&mut self, frame: &mut Frame, elements: &[Option<NodeId>]) -> StepResult {
        let obj = match &frame.state {
            FrameState::ArrayLit { obj: Some(r), .. } => *r,
            FrameState::ArrayLit { .. } => {
                let r = self.heap.new_array();
                if let FrameState::ArrayLit { obj, .. } = &mut frame.state {
                    *obj = Some(r);
                }
                r
            }
            _ => return Err(FatalError::Corrupt("array literal state mismatch").into()),
        };
        if let FrameState::ArrayLit { pending, .. } = &mut frame.state {
            if let Some(i) = pending.take() {
                let v = frame.value.clone();
                self.heap.set_prop(&Value::Obj(obj), &i.to_string(), v)?;
            }
        }
        loop {
            let index = match &mut frame.state {
                FrameState::ArrayLit { index, .. } => index,
                _ => unreachable!(),
            };
            if *index >= elements.len() {
                return Ok(Ctl::Pop(Some(Value::Obj(obj))));
            }
            let i = *index;
            *index += 1;
            match elements[i] {
                None => {
                    // Elision occupies an index but stores nothing.
                    if let ObjData::Array { length } = &mut self.heap.obj_mut(obj).data {
                        if *length < (i + 1) as u32 {
                            *length = (i + 1) as u32;
                        }
                    }
                }
                Some(e) => {
                    if let FrameState::ArrayLit { pending, .. } = &mut frame.state {
                        *pending = Some(i as u32);
                    }
                    return Ok(Ctl::Push(self.child(frame, e)));
                }
            }
        }
    }

    fn step_object_lit(
        &mut self,
        frame: &mut Frame,
        properties: &[(String, NodeId)],
    ) -> StepResult {
        let obj = match &frame.state {
            FrameState::ObjectLit { obj: Some(r), .. } => *r,
            FrameState::ObjectLit { .. } => {
                let r = self.heap.new_plain();
                if let FrameState::ObjectLit { obj, .. } = &mut frame.state {
                    *obj = Some(r);
                }
                r
            }
            _ => return Err(FatalError::Corrupt("object literal state mismatch").into()),
        };
        if let FrameState::ObjectLit { pending, .. } = &mut frame.state {
            if let Some(key) = pending.take() {
                let v = frame.value.clone();
                self.heap.set_prop(&Value::Obj(obj), &key, v)?;
            }
        }
        let index = match &mut frame.state {
            FrameState::ObjectLit { index, .. } => index,
            _ => unreachable!(),
        };
        if *index >= properties.len() {
            return Ok(Ctl::Pop(Some(Value::Obj(obj))));
        }
        let (key, val) = properties[*index].clone();
        *index += 1;
        if let FrameState::ObjectLit { pending, .. } = &mut frame.state {
            *pending = Some(key);
        }
        Ok(Ctl::Push(self.child(frame, val)))
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn step_call(
        &mut self,
        frame: &mut Frame,
        callee: NodeId,
        arguments: &[NodeId],
        _constructing: bool,
    ) -> StepResult {
        let phase = match &frame.state {
            FrameState::Call(st) => st.phase,
            _ => return Err(FatalError::Corrupt("call state mismatch").into()),
        };
        match phase {
            CallPhase::Callee => {
                if let FrameState::Call(st) = &mut frame.state {
                    st.phase = CallPhase::Func;
                }
                Ok(Ctl::Push(self.child_components(frame, callee)))
            }
            CallPhase::Func => {
                let (func, this_val) = match frame.target.take() {
                    Some(Target::Property(base, key)) => {
                        let f = self.heap.get_prop(&base, &key)?;
                        (f, base)
                    }
                    Some(Target::Binding(name)) => {
                        let f = self.heap.lookup(frame.scope, &name).ok_or_else(|| {
                            LangError::reference_error(format!("{} is not defined", name))
                        })?;
                        (f, Value::Undefined)
                    }
                    None => (frame.value.clone(), Value::Undefined),
                };
                if let FrameState::Call(st) = &mut frame.state {
                    st.func = func;
                    st.this_val = this_val;
                    st.phase = CallPhase::Args;
                }
                self.step_call_args(frame, arguments, true)
            }
            CallPhase::Args => self.step_call_args(frame, arguments, false),
            CallPhase::Finish => {
                let st = match &mut frame.state {
                    FrameState::Call(st) => st,
                    _ => unreachable!(),
                };
                if st.waiting {
                    // Still parked on an async native; nothing to do.
                    return Ok(Ctl::Keep);
                }
                let result = frame.value.clone();
                let result = if st.constructing && !result.is_obj() {
                    st.this_val.clone()
                } else {
                    result
                };
                Ok(Ctl::Pop(Some(result)))
            }
        }
    }

    fn step_call_args(
        &mut self,
        frame: &mut Frame,
        arguments: &[NodeId],
        first: bool,
    ) -> StepResult {
        let st = match &mut frame.state {
            FrameState::Call(st) => st,
            _ => return Err(FatalError::Corrupt("call state mismatch").into()),
        };
        if !first && st.arg_count > st.args.len() {
            st.args.push(frame.value.clone());
        }
        if st.arg_count < arguments.len() {
            let id = arguments[st.arg_count];
            st.arg_count += 1;
            return Ok(Ctl::Push(self.child(frame, id)));
        }
        self.dispatch_call(frame)
    }

    fn dispatch_call(&mut self, frame: &mut Frame) -> StepResult {
        let (mut func, mut this_val, mut args, constructing) = match &frame.state {
            FrameState::Call(st) => (
                st.func.clone(),
                st.this_val.clone(),
                st.args.clone(),
                st.constructing,
            ),
            _ => return Err(FatalError::Corrupt("call state mismatch").into()),
        };

        // Function.prototype.call / apply rewrite the invocation instead of
        // running native code of their own.
        loop {
            let tag = match value::func_data(&self.heap, &func) {
                Some(FuncData::Native { tag }) => Some(*tag),
                _ => None,
            };
            match tag.map(|t| self.natives.name_of(t)) {
                Some("Function.prototype.call") => {
                    let callee = this_val.clone();
                    this_val = args.first().cloned().unwrap_or(Value::Undefined);
                    args = args.iter().skip(1).cloned().collect();
                    func = callee;
                }
                Some("Function.prototype.apply") => {
                    let callee = this_val.clone();
                    this_val = args.first().cloned().unwrap_or(Value::Undefined);
                    let list = args.get(1).cloned().unwrap_or(Value::Undefined);
                    args = match list {
                        Value::Undefined | Value::Null => Vec::new(),
                        Value::Obj(r) if matches!(self.heap.obj(r).data, ObjData::Array { .. }) => {
                            let len = match self.heap.obj(r).data {
                                ObjData::Array { length } => length,
                                _ => 0,
                            };
                            (0..len)
                                .map(|i| {
                                    self.heap
                                        .get_prop_chain(r, &i.to_string())
                                        .unwrap_or(Value::Undefined)
                                })
                                .collect()
                        }
                        _ => {
                            return Err(LangError::type_error(
                                "Function.prototype.apply needs an array of arguments",
                            )
                            .into())
                        }
                    };
                    func = callee;
                }
                _ => break,
            }
        }

        let data = match value::func_data(&self.heap, &func) {
            Some(d) => d.clone(),
            None => {
                return Err(LangError::type_error(format!(
                    "{} is not a function",
                    value::to_string(&self.heap, &func)
                ))
                .into())
            }
        };

        if constructing {
            if matches!(data, FuncData::Eval) {
                return Err(LangError::type_error("eval is not a constructor").into());
            }
            // The new object's prototype comes from the function's
            // `prototype` property, falling back to Object.prototype.
            let proto = match self.heap.get_prop(&func, "prototype")? {
                Value::Obj(p) => Some(p),
                _ => self.heap.protos.object,
            };
            let obj = self.heap.new_object_with_proto(proto);
            this_val = Value::Obj(obj);
            if let FrameState::Call(st) = &mut frame.state {
                st.this_val = this_val.clone();
            }
        }

        match data {
            FuncData::Interp { node, scope } => {
                if self.stack.len() + 1 >= self.stack_limit {
                    return Err(LangError::plain("Maximum call stack size exceeded").into());
                }
                let (params, body) = match self.node_clone(node) {
                    Node::FunctionDeclaration { params, body, .. } => (params, body),
                    Node::FunctionExpression { params, body, .. } => (params, body),
                    _ => return Err(FatalError::Corrupt("function node is not a function").into()),
                };
                let call_scope = self.heap.alloc_scope(Scope::new(Some(scope)));
                for (i, p) in params.iter().enumerate() {
                    let v = args.get(i).cloned().unwrap_or(Value::Undefined);
                    self.heap.declare(call_scope, p, v, false);
                }
                let args_obj = self.heap.new_array();
                for (i, a) in args.iter().enumerate() {
                    self.heap
                        .set_prop(&Value::Obj(args_obj), &i.to_string(), a.clone())
                        .map_err(Signal::Lang)?;
                }
                self.heap.declare(call_scope, "arguments", Value::Obj(args_obj), true);
                let ast = self.programs[node.prog as usize].clone();
                self.populate_scope(&ast, body, node.prog, call_scope);
                if let FrameState::Call(st) = &mut frame.state {
                    st.phase = CallPhase::Finish;
                    st.executing = true;
                }
                frame.value = Value::Undefined;
                let child = self.new_frame(
                    node.at(body),
                    call_scope,
                    this_val,
                    false,
                    Vec::new(),
                );
                Ok(Ctl::Push(child))
            }
            FuncData::Native { tag } => {
                let imp = self.natives.impl_of(tag);
                match imp {
                    NativeImpl::Sync(f) => {
                        let result = f(self, &this_val, &args);
                        match result {
                            Ok(v) => {
                                let v = if constructing && !v.is_obj() { this_val } else { v };
                                Ok(Ctl::Pop(Some(v)))
                            }
                            Err(NativeError::Lang(e)) => Err(Signal::Lang(e)),
                            Err(NativeError::Fatal(e)) => Err(Signal::Fatal(e)),
                        }
                    }
                    NativeImpl::Async(_) => {
                        Err(FatalError::Corrupt("sync tag resolved to async native").into())
                    }
                }
            }
            FuncData::AsyncNative { tag } => {
                let f = match self.natives.impl_of(tag) {
                    NativeImpl::Async(f) => f,
                    NativeImpl::Sync(_) => {
                        return Err(FatalError::Corrupt("async tag resolved to sync native").into())
                    }
                };
                if let FrameState::Call(st) = &mut frame.state {
                    st.phase = CallPhase::Finish;
                    st.waiting = true;
                }
                self.paused = true;
                // Initiate only after the frame is back on the stack, so a
                // synchronous completion can find it.
                self.pending_async = Some(PendingAsync { func: f, this_val, args });
                Ok(Ctl::Keep)
            }
            FuncData::Eval => {
                let arg = args.first().cloned().unwrap_or(Value::Undefined);
                let src = match arg {
                    Value::Str(s) => s,
                    other => return Ok(Ctl::Pop(Some(other))),
                };
                let ast = Parser::parse_program(&src).map_err(|source| FatalError::Parse {
                    origin: "eval".to_string(),
                    source,
                })?;
                let prog = self.register_program(ast);
                let refs = self.program_body(prog);
                let rc = self.programs[prog as usize].clone();
                // Variables declared inside eval hoist into the caller's
                // scope.
                self.populate_scope(&rc, rc.root, prog, frame.scope);
                if let FrameState::Call(st) = &mut frame.state {
                    st.phase = CallPhase::Finish;
                    st.executing = true;
                }
                frame.value = Value::Undefined;
                let child = Frame {
                    node: NodeRef::new(prog, rc.root),
                    scope: frame.scope,
                    this_val: frame.this_val.clone(),
                    components: false,
                    labels: Vec::new(),
                    value: Value::Undefined,
                    target: None,
                    state: FrameState::Program { body: refs, index: 0, done: false },
                };
                Ok(Ctl::Push(child))
            }
        }
    }

    // -----------------------------------------------------------------------
    // References
    // -----------------------------------------------------------------------

    fn read_target(&self, scope: ScopeRef, target: &Target) -> Result<Value, LangError> {
        match target {
            Target::Binding(name) => self
                .heap
                .lookup(scope, name)
                .ok_or_else(|| LangError::reference_error(format!("{} is not defined", name))),
            Target::Property(base, key) => self.heap.get_prop(base, key),
        }
    }

    fn write_target(
        &mut self,
        scope: ScopeRef,
        target: &Target,
        value: Value,
    ) -> Result<(), LangError> {
        match target {
            Target::Binding(name) => {
                if !self.heap.assign(scope, name, value.clone())? {
                    // Assignment to an undeclared name creates a global.
                    self.heap.declare(self.global, name, value, false);
                }
                Ok(())
            }
            Target::Property(base, key) => self.heap.set_prop(base, key, value),
        }
    }

    // -----------------------------------------------------------------------
    // Unwinding
    // -----------------------------------------------------------------------

    /// Pop frames to deliver a non-local completion. Stops at try frames
    /// (so handlers and finalizers run), at call frames for `return`, and
    /// at loop/switch frames for `break`/`continue`. Crossing a call
    /// boundary with break or continue is an unrecoverable host error, as
    /// is any completion that reaches the root frame unhandled.
    pub fn unwind(&mut self, u: Unwind) -> Result<(), FatalError> {
        loop {
            if self.stack.len() <= 1 {
                return match u {
                    Unwind::Throw(v) => Err(FatalError::Uncaught {
                        what: value::to_string(&self.heap, &v),
                    }),
                    Unwind::Break { .. } => Err(FatalError::BadJump { kind: "break" }),
                    Unwind::Continue { .. } => Err(FatalError::BadJump { kind: "continue" }),
                    Unwind::Return(_) => Err(FatalError::BadJump { kind: "return" }),
                };
            }
            let frame = self.stack.last_mut().expect("stack checked non-empty");

            // Try frames intercept everything except completions of their
            // own finalizer, which replace whatever was pending.
            if let FrameState::Try(st) = &mut frame.state {
                match st.phase {
                    TryPhase::Block => {
                        match u {
                            Unwind::Throw(v) => st.thrown = Some(v),
                            other => st.pending = Some(other),
                        }
                        return Ok(());
                    }
                    TryPhase::Handler => {
                        st.pending = Some(u);
                        return Ok(());
                    }
                    TryPhase::Finalizer => {
                        // The finalizer's own completion wins; drop the
                        // pending one and keep unwinding.
                        st.pending = None;
                        self.stack.pop();
                        continue;
                    }
                    TryPhase::Start => {
                        self.stack.pop();
                        continue;
                    }
                }
            }

            if let FrameState::Call(st) = &mut frame.state {
                match &u {
                    Unwind::Return(v) if st.executing => {
                        frame.value = v.clone();
                        return Ok(());
                    }
                    Unwind::Throw(_) => {
                        self.stack.pop();
                        continue;
                    }
                    Unwind::Return(_) => {
                        self.stack.pop();
                        continue;
                    }
                    Unwind::Break { .. } => return Err(FatalError::BadJump { kind: "break" }),
                    Unwind::Continue { .. } => {
                        return Err(FatalError::BadJump { kind: "continue" })
                    }
                }
            }

            // Labeled statements: any frame carrying the label is a valid
            // break target.
            if let Unwind::Break { label: Some(l) } = &u {
                if frame.labels.contains(l) {
                    self.stack.pop();
                    return Ok(());
                }
            }

            let is_loop = matches!(
                frame.state,
                FrameState::While { .. }
                    | FrameState::DoWhile { .. }
                    | FrameState::For { .. }
                    | FrameState::ForIn(_)
            );
            let is_switch = matches!(frame.state, FrameState::Switch(_));

            match &u {
                Unwind::Break { label: None } if is_loop || is_switch => {
                    self.stack.pop();
                    return Ok(());
                }
                Unwind::Continue { label: None } if is_loop => {
                    // Loop state already points at the next test/update
                    // phase; resuming the frame continues the loop.
                    return Ok(());
                }
                Unwind::Continue { label: Some(l) } if is_loop && frame.labels.contains(l) => {
                    return Ok(());
                }
                _ => {
                    self.stack.pop();
                }
            }
        }
    }

    /// Throw a language error constructed from a descriptor (used by
    /// natives that run outside the dispatch loop).
    pub fn throw_lang(&mut self, e: LangError) -> Result<(), FatalError> {
        let obj = self.heap.new_error_from(&e);
        self.unwind(Unwind::Throw(Value::Obj(obj)))
    }
}

enum ForInLeft {
    Name(String),
    Expr,
}

fn assign_bin_op(op: AssignOp) -> Option<BinOp> {
    Some(match op {
        AssignOp::Assign => return None,
        AssignOp::Add => BinOp::Add,
        AssignOp::Sub => BinOp::Sub,
        AssignOp::Mul => BinOp::Mul,
        AssignOp::Div => BinOp::Div,
        AssignOp::Mod => BinOp::Mod,
        AssignOp::Shl => BinOp::Shl,
        AssignOp::Shr => BinOp::Shr,
        AssignOp::UShr => BinOp::UShr,
        AssignOp::BitAnd => BinOp::BitAnd,
        AssignOp::BitOr => BinOp::BitOr,
        AssignOp::BitXor => BinOp::BitXor,
    })
}
