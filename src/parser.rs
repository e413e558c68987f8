/// Recursive-descent parser for the ES5 dialect.
///
/// Builds the `ast::Ast` node arena. Node ids are assigned in the order
/// nodes are completed, which is a pure function of the source text — the
/// snapshot loader re-parses source strings and relies on getting identical
/// ids back.
///
/// Automatic semicolon insertion is the pragmatic subset: a statement may
/// end at `}`, at end of input, or before a token preceded by a line
/// terminator. The restricted productions (return/continue/break/throw and
/// postfix ++/--) respect line breaks.

use crate::ast::{AssignOp, Ast, BinOp, Lit, LogicalOp, Node, NodeId, UnaryOp, UpdateOp};
use crate::errors::{ParseError, Span};
use crate::lexer::{Lexer, Tok, TokKind};

pub struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    nodes: Vec<Node>,
}

impl Parser {
    /// Parse a complete program.
    pub fn parse_program(src: &str) -> Result<Ast, ParseError> {
        let toks = Lexer::tokenize(src)?;
        let mut p = Parser { toks, pos: 0, nodes: Vec::new() };
        let mut body = Vec::new();
        while !p.at(&TokKind::Eof) {
            body.push(p.parse_statement()?);
        }
        let root = p.push(Node::Program { body });
        Ok(Ast { source: src.to_string(), nodes: p.nodes, root })
    }

    /// Parse a single expression starting at `offset` into `src`. Returns
    /// the arena (rooted at the expression) and the source offset just past
    /// the expression. Backs the `sys.parseExpressionAt` native.
    pub fn parse_expression_at(src: &str, offset: usize) -> Result<(Ast, usize), ParseError> {
        if !src.is_char_boundary(offset) {
            return Err(ParseError::InvalidSyntax {
                message: format!("offset {} is not a character boundary", offset),
                span: Span::new(offset, offset),
            });
        }
        let toks = Lexer::tokenize(&src[offset..])?;
        let mut p = Parser { toks, pos: 0, nodes: Vec::new() };
        if p.at(&TokKind::Eof) {
            return Err(p.eof_error("expression"));
        }
        let root = p.parse_assignment(true)?;
        let end = offset + p.toks[p.pos.saturating_sub(1)].span.end;
        Ok((
            Ast { source: src.to_string(), nodes: p.nodes, root },
            end,
        ))
    }

    // -----------------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------------

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() as u32 - 1)
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn at(&self, kind: &TokKind) -> bool {
        &self.peek().kind == kind
    }

    fn bump(&mut self) -> Tok {
        let tok = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokKind, what: &str) -> Result<Tok, ParseError> {
        if self.at(&kind) {
            Ok(self.bump())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let tok = self.peek();
        if tok.kind == TokKind::Eof {
            self.eof_error(expected)
        } else {
            ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: describe(&tok.kind),
                span: tok.span,
            }
        }
    }

    fn eof_error(&self, context: &str) -> ParseError {
        let span = self.peek().span;
        ParseError::UnexpectedEof { context: context.to_string(), span }
    }

    fn ident(&mut self, what: &str) -> Result<String, ParseError> {
        match &self.peek().kind {
            TokKind::Ident(name) => {
                let name = name.clone();
                self.bump();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    /// Statement terminator with automatic semicolon insertion.
    fn semicolon(&mut self) -> Result<(), ParseError> {
        if self.eat(&TokKind::Semi) {
            return Ok(());
        }
        let tok = self.peek();
        if tok.kind == TokKind::RBrace || tok.kind == TokKind::Eof || tok.newline_before {
            return Ok(());
        }
        Err(self.unexpected("';'"))
    }

    /// True when the restricted productions must stop before the next token.
    fn asi_break(&self) -> bool {
        let tok = self.peek();
        tok.newline_before
            || matches!(tok.kind, TokKind::Semi | TokKind::RBrace | TokKind::Eof)
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<NodeId, ParseError> {
        match self.peek().kind.clone() {
            TokKind::LBrace => self.parse_block(),
            TokKind::Var => {
                let decl = self.parse_var_declaration(true)?;
                self.semicolon()?;
                Ok(decl)
            }
            TokKind::Semi => {
                self.bump();
                Ok(self.push(Node::EmptyStatement))
            }
            TokKind::Function => self.parse_function(true),
            TokKind::If => self.parse_if(),
            TokKind::While => self.parse_while(),
            TokKind::Do => self.parse_do_while(),
            TokKind::For => self.parse_for(),
            TokKind::Return => {
                self.bump();
                let argument = if self.asi_break() {
                    None
                } else {
                    Some(self.parse_expression(true)?)
                };
                self.semicolon()?;
                Ok(self.push(Node::ReturnStatement { argument }))
            }
            TokKind::Break => {
                self.bump();
                let label = self.jump_label();
                self.semicolon()?;
                Ok(self.push(Node::BreakStatement { label }))
            }
            TokKind::Continue => {
                self.bump();
                let label = self.jump_label();
                self.semicolon()?;
                Ok(self.push(Node::ContinueStatement { label }))
            }
            TokKind::Throw => {
                let tok = self.bump();
                if self.peek().newline_before {
                    return Err(ParseError::InvalidSyntax {
                        message: "newline not allowed after 'throw'".into(),
                        span: tok.span,
                    });
                }
                let argument = self.parse_expression(true)?;
                self.semicolon()?;
                Ok(self.push(Node::ThrowStatement { argument }))
            }
            TokKind::Try => self.parse_try(),
            TokKind::Switch => self.parse_switch(),
            TokKind::With => {
                self.bump();
                self.expect(TokKind::LParen, "'(' after 'with'")?;
                let object = self.parse_expression(true)?;
                self.expect(TokKind::RParen, "')'")?;
                let body = self.parse_statement()?;
                Ok(self.push(Node::WithStatement { object, body }))
            }
            TokKind::Debugger => {
                self.bump();
                self.semicolon()?;
                Ok(self.push(Node::DebuggerStatement))
            }
            TokKind::Ident(name) => {
                // Labeled statement: identifier directly followed by ':'.
                if self.toks[self.pos + 1].kind == TokKind::Colon {
                    self.bump();
                    self.bump();
                    let body = self.parse_statement()?;
                    return Ok(self.push(Node::LabeledStatement { label: name, body }));
                }
                self.parse_expression_statement()
            }
            _ => self.parse_expression_statement(),
        }
    }

    fn jump_label(&mut self) -> Option<String> {
        match &self.peek().kind {
            TokKind::Ident(name) if !self.peek().newline_before => {
                let name = name.clone();
                self.bump();
                Some(name)
            }
            _ => None,
        }
    }

    fn parse_expression_statement(&mut self) -> Result<NodeId, ParseError> {
        let expression = self.parse_expression(true)?;
        self.semicolon()?;
        Ok(self.push(Node::ExpressionStatement { expression }))
    }

    fn parse_block(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::LBrace, "'{'")?;
        let mut body = Vec::new();
        while !self.at(&TokKind::RBrace) {
            if self.at(&TokKind::Eof) {
                return Err(self.eof_error("block"));
            }
            body.push(self.parse_statement()?);
        }
        self.bump();
        Ok(self.push(Node::BlockStatement { body }))
    }

    fn parse_var_declaration(&mut self, allow_in: bool) -> Result<NodeId, ParseError> {
        self.expect(TokKind::Var, "'var'")?;
        let mut declarations = Vec::new();
        loop {
            let name = self.ident("variable name")?;
            let init = if self.eat(&TokKind::Assign) {
                Some(self.parse_assignment(allow_in)?)
            } else {
                None
            };
            declarations.push(self.push(Node::VariableDeclarator { name, init }));
            if !self.eat(&TokKind::Comma) {
                break;
            }
        }
        Ok(self.push(Node::VariableDeclaration { declarations }))
    }

    fn parse_function(&mut self, declaration: bool) -> Result<NodeId, ParseError> {
        let start = self.expect(TokKind::Function, "'function'")?.span;
        let name = if declaration {
            Some(self.ident("function name")?)
        } else {
            match &self.peek().kind {
                TokKind::Ident(n) => {
                    let n = n.clone();
                    self.bump();
                    Some(n)
                }
                _ => None,
            }
        };
        self.expect(TokKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.at(&TokKind::RParen) {
            loop {
                params.push(self.ident("parameter name")?);
                if !self.eat(&TokKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokKind::RParen, "')'")?;
        let body = self.parse_block()?;
        let end = self.toks[self.pos.saturating_sub(1)].span;
        let span = start.merge(end);
        if declaration {
            Ok(self.push(Node::FunctionDeclaration {
                name: name.expect("declaration has a name"),
                params,
                body,
                span,
            }))
        } else {
            Ok(self.push(Node::FunctionExpression { name, params, body, span }))
        }
    }

    fn parse_if(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::If, "'if'")?;
        self.expect(TokKind::LParen, "'(' after 'if'")?;
        let test = self.parse_expression(true)?;
        self.expect(TokKind::RParen, "')'")?;
        let consequent = self.parse_statement()?;
        let alternate = if self.eat(&TokKind::Else) {
            Some(self.parse_statement()?)
        } else {
            None
        };
        Ok(self.push(Node::IfStatement { test, consequent, alternate }))
    }

    fn parse_while(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::While, "'while'")?;
        self.expect(TokKind::LParen, "'(' after 'while'")?;
        let test = self.parse_expression(true)?;
        self.expect(TokKind::RParen, "')'")?;
        let body = self.parse_statement()?;
        Ok(self.push(Node::WhileStatement { test, body }))
    }

    fn parse_do_while(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::Do, "'do'")?;
        let body = self.parse_statement()?;
        self.expect(TokKind::While, "'while' after 'do' body")?;
        self.expect(TokKind::LParen, "'('")?;
        let test = self.parse_expression(true)?;
        self.expect(TokKind::RParen, "')'")?;
        self.eat(&TokKind::Semi);
        Ok(self.push(Node::DoWhileStatement { body, test }))
    }

    fn parse_for(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::For, "'for'")?;
        self.expect(TokKind::LParen, "'(' after 'for'")?;

        // No initializer.
        if self.eat(&TokKind::Semi) {
            return self.parse_for_tail(None);
        }

        if self.at(&TokKind::Var) {
            let decl = self.parse_var_declaration(false)?;
            if self.at(&TokKind::In) {
                let single = matches!(
                    &self.nodes[decl.0 as usize],
                    Node::VariableDeclaration { declarations } if declarations.len() == 1
                );
                if !single {
                    return Err(ParseError::InvalidSyntax {
                        message: "for-in needs a single loop variable".into(),
                        span: self.peek().span,
                    });
                }
                self.bump();
                return self.parse_for_in_tail(decl);
            }
            self.expect(TokKind::Semi, "';' in 'for'")?;
            return self.parse_for_tail(Some(decl));
        }

        let init = self.parse_expression(false)?;
        if self.at(&TokKind::In) {
            if !matches!(
                &self.nodes[init.0 as usize],
                Node::Identifier { .. } | Node::MemberExpression { .. }
            ) {
                return Err(ParseError::InvalidSyntax {
                    message: "invalid left-hand side in for-in".into(),
                    span: self.peek().span,
                });
            }
            self.bump();
            return self.parse_for_in_tail(init);
        }
        let init = self.push(Node::ExpressionStatement { expression: init });
        self.expect(TokKind::Semi, "';' in 'for'")?;
        self.parse_for_tail(Some(init))
    }

    fn parse_for_tail(&mut self, init: Option<NodeId>) -> Result<NodeId, ParseError> {
        let test = if self.at(&TokKind::Semi) {
            None
        } else {
            Some(self.parse_expression(true)?)
        };
        self.expect(TokKind::Semi, "';' in 'for'")?;
        let update = if self.at(&TokKind::RParen) {
            None
        } else {
            Some(self.parse_expression(true)?)
        };
        self.expect(TokKind::RParen, "')'")?;
        let body = self.parse_statement()?;
        Ok(self.push(Node::ForStatement { init, test, update, body }))
    }

    fn parse_for_in_tail(&mut self, left: NodeId) -> Result<NodeId, ParseError> {
        let right = self.parse_expression(true)?;
        self.expect(TokKind::RParen, "')'")?;
        let body = self.parse_statement()?;
        Ok(self.push(Node::ForInStatement { left, right, body }))
    }

    fn parse_try(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::Try, "'try'")?;
        let block = self.parse_block()?;
        let handler = if self.eat(&TokKind::Catch) {
            self.expect(TokKind::LParen, "'(' after 'catch'")?;
            let param = self.ident("catch parameter")?;
            self.expect(TokKind::RParen, "')'")?;
            let body = self.parse_block()?;
            Some(self.push(Node::CatchClause { param, body }))
        } else {
            None
        };
        let finalizer = if self.eat(&TokKind::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(ParseError::InvalidSyntax {
                message: "try needs a catch or finally".into(),
                span: self.peek().span,
            });
        }
        Ok(self.push(Node::TryStatement { block, handler, finalizer }))
    }

    fn parse_switch(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::Switch, "'switch'")?;
        self.expect(TokKind::LParen, "'(' after 'switch'")?;
        let discriminant = self.parse_expression(true)?;
        self.expect(TokKind::RParen, "')'")?;
        self.expect(TokKind::LBrace, "'{'")?;
        let mut cases = Vec::new();
        let mut seen_default = false;
        while !self.eat(&TokKind::RBrace) {
            let test = if self.eat(&TokKind::Case) {
                let t = self.parse_expression(true)?;
                Some(t)
            } else if self.at(&TokKind::Default) {
                if seen_default {
                    return Err(ParseError::InvalidSyntax {
                        message: "duplicate 'default' clause".into(),
                        span: self.peek().span,
                    });
                }
                seen_default = true;
                self.bump();
                None
            } else {
                return Err(self.unexpected("'case', 'default' or '}'"));
            };
            self.expect(TokKind::Colon, "':'")?;
            let mut consequent = Vec::new();
            while !matches!(
                self.peek().kind,
                TokKind::Case | TokKind::Default | TokKind::RBrace
            ) {
                if self.at(&TokKind::Eof) {
                    return Err(self.eof_error("switch body"));
                }
                consequent.push(self.parse_statement()?);
            }
            cases.push(self.push(Node::SwitchCase { test, consequent }));
        }
        Ok(self.push(Node::SwitchStatement { discriminant, cases }))
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn parse_expression(&mut self, allow_in: bool) -> Result<NodeId, ParseError> {
        let first = self.parse_assignment(allow_in)?;
        if !self.at(&TokKind::Comma) {
            return Ok(first);
        }
        let mut expressions = vec![first];
        while self.eat(&TokKind::Comma) {
            expressions.push(self.parse_assignment(allow_in)?);
        }
        Ok(self.push(Node::SequenceExpression { expressions }))
    }

    fn parse_assignment(&mut self, allow_in: bool) -> Result<NodeId, ParseError> {
        let left = self.parse_conditional(allow_in)?;
        let op = match assign_op(&self.peek().kind) {
            Some(op) => op,
            None => return Ok(left),
        };
        if !matches!(
            &self.nodes[left.0 as usize],
            Node::Identifier { .. } | Node::MemberExpression { .. }
        ) {
            return Err(ParseError::InvalidSyntax {
                message: "invalid assignment target".into(),
                span: self.peek().span,
            });
        }
        self.bump();
        let right = self.parse_assignment(allow_in)?;
        Ok(self.push(Node::AssignmentExpression { op, left, right }))
    }

    fn parse_conditional(&mut self, allow_in: bool) -> Result<NodeId, ParseError> {
        let test = self.parse_binary(0, allow_in)?;
        if !self.eat(&TokKind::Question) {
            return Ok(test);
        }
        let consequent = self.parse_assignment(true)?;
        self.expect(TokKind::Colon, "':' in conditional")?;
        let alternate = self.parse_assignment(allow_in)?;
        Ok(self.push(Node::ConditionalExpression { test, consequent, alternate }))
    }

    fn parse_binary(&mut self, min_prec: u8, allow_in: bool) -> Result<NodeId, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let (prec, kind) = match binary_prec(&self.peek().kind, allow_in) {
                Some(pair) => pair,
                None => return Ok(left),
            };
            if prec < min_prec {
                return Ok(left);
            }
            self.bump();
            let right = self.parse_binary(prec + 1, allow_in)?;
            left = match kind {
                BinKind::Bin(op) => self.push(Node::BinaryExpression { op, left, right }),
                BinKind::Logic(op) => self.push(Node::LogicalExpression { op, left, right }),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<NodeId, ParseError> {
        let op = match &self.peek().kind {
            TokKind::Minus => Some(UnaryOp::Minus),
            TokKind::Plus => Some(UnaryOp::Plus),
            TokKind::Not => Some(UnaryOp::Not),
            TokKind::BitNot => Some(UnaryOp::BitNot),
            TokKind::TypeOf => Some(UnaryOp::TypeOf),
            TokKind::Void => Some(UnaryOp::Void),
            TokKind::Delete => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let argument = self.parse_unary()?;
            return Ok(self.push(Node::UnaryExpression { op, argument }));
        }
        if matches!(self.peek().kind, TokKind::PlusPlus | TokKind::MinusMinus) {
            let op = if self.bump().kind == TokKind::PlusPlus {
                UpdateOp::Inc
            } else {
                UpdateOp::Dec
            };
            let argument = self.parse_unary()?;
            self.check_update_target(argument)?;
            return Ok(self.push(Node::UpdateExpression { op, prefix: true, argument }));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<NodeId, ParseError> {
        let argument = self.parse_lhs(true)?;
        // A line terminator before ++/-- terminates the expression instead.
        if !self.peek().newline_before
            && matches!(self.peek().kind, TokKind::PlusPlus | TokKind::MinusMinus)
        {
            let op = if self.bump().kind == TokKind::PlusPlus {
                UpdateOp::Inc
            } else {
                UpdateOp::Dec
            };
            self.check_update_target(argument)?;
            return Ok(self.push(Node::UpdateExpression { op, prefix: false, argument }));
        }
        Ok(argument)
    }

    fn check_update_target(&self, target: NodeId) -> Result<(), ParseError> {
        if matches!(
            &self.nodes[target.0 as usize],
            Node::Identifier { .. } | Node::MemberExpression { .. }
        ) {
            Ok(())
        } else {
            Err(ParseError::InvalidSyntax {
                message: "invalid increment/decrement target".into(),
                span: self.peek().span,
            })
        }
    }

    fn parse_lhs(&mut self, allow_call: bool) -> Result<NodeId, ParseError> {
        let mut expr = if self.at(&TokKind::New) {
            self.bump();
            let callee = self.parse_lhs(false)?;
            let arguments = if self.at(&TokKind::LParen) {
                self.parse_arguments()?
            } else {
                Vec::new()
            };
            self.push(Node::NewExpression { callee, arguments })
        } else {
            self.parse_primary()?
        };
        loop {
            match self.peek().kind {
                TokKind::Dot => {
                    self.bump();
                    let name = self.property_word()?;
                    let property = self.push(Node::Identifier { name });
                    expr = self.push(Node::MemberExpression {
                        object: expr,
                        property,
                        computed: false,
                    });
                }
                TokKind::LBracket => {
                    self.bump();
                    let property = self.parse_expression(true)?;
                    self.expect(TokKind::RBracket, "']'")?;
                    expr = self.push(Node::MemberExpression {
                        object: expr,
                        property,
                        computed: true,
                    });
                }
                TokKind::LParen if allow_call => {
                    let arguments = self.parse_arguments()?;
                    expr = self.push(Node::CallExpression { callee: expr, arguments });
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<NodeId>, ParseError> {
        self.expect(TokKind::LParen, "'('")?;
        let mut arguments = Vec::new();
        if !self.at(&TokKind::RParen) {
            loop {
                arguments.push(self.parse_assignment(true)?);
                if !self.eat(&TokKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokKind::RParen, "')'")?;
        Ok(arguments)
    }

    /// A property name after `.` — identifiers plus reserved words.
    fn property_word(&mut self) -> Result<String, ParseError> {
        if let Some(word) = keyword_text(&self.peek().kind) {
            self.bump();
            return Ok(word.to_string());
        }
        self.ident("property name")
    }

    fn parse_primary(&mut self) -> Result<NodeId, ParseError> {
        let tok = self.peek().clone();
        match tok.kind {
            TokKind::This => {
                self.bump();
                Ok(self.push(Node::ThisExpression))
            }
            TokKind::Null => {
                self.bump();
                Ok(self.push(Node::Literal { value: Lit::Null }))
            }
            TokKind::True => {
                self.bump();
                Ok(self.push(Node::Literal { value: Lit::Bool(true) }))
            }
            TokKind::False => {
                self.bump();
                Ok(self.push(Node::Literal { value: Lit::Bool(false) }))
            }
            TokKind::Number(n) => {
                self.bump();
                Ok(self.push(Node::Literal { value: Lit::Num(n) }))
            }
            TokKind::Str(s) => {
                self.bump();
                Ok(self.push(Node::Literal { value: Lit::Str(s) }))
            }
            TokKind::Regex { source, flags } => {
                self.bump();
                Ok(self.push(Node::Literal {
                    value: Lit::Regex { source, flags },
                }))
            }
            TokKind::Ident(name) => {
                self.bump();
                Ok(self.push(Node::Identifier { name }))
            }
            TokKind::LParen => {
                self.bump();
                let expr = self.parse_expression(true)?;
                self.expect(TokKind::RParen, "')'")?;
                Ok(expr)
            }
            TokKind::LBracket => self.parse_array_literal(),
            TokKind::LBrace => self.parse_object_literal(),
            TokKind::Function => self.parse_function(false),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_array_literal(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::LBracket, "'['")?;
        let mut elements = Vec::new();
        loop {
            if self.eat(&TokKind::RBracket) {
                break;
            }
            if self.eat(&TokKind::Comma) {
                elements.push(None); // elision
                continue;
            }
            elements.push(Some(self.parse_assignment(true)?));
            if !self.at(&TokKind::RBracket) {
                self.expect(TokKind::Comma, "',' or ']'")?;
            }
        }
        Ok(self.push(Node::ArrayExpression { elements }))
    }

    fn parse_object_literal(&mut self) -> Result<NodeId, ParseError> {
        self.expect(TokKind::LBrace, "'{'")?;
        let mut properties = Vec::new();
        while !self.eat(&TokKind::RBrace) {
            let key = match self.peek().kind.clone() {
                TokKind::Str(s) => {
                    self.bump();
                    s
                }
                TokKind::Number(n) => {
                    self.bump();
                    crate::value::number_to_string(n)
                }
                _ => self.property_word()?,
            };
            self.expect(TokKind::Colon, "':' in object literal")?;
            let value = self.parse_assignment(true)?;
            properties.push((key, value));
            if !self.at(&TokKind::RBrace) {
                self.expect(TokKind::Comma, "',' or '}'")?;
            }
        }
        Ok(self.push(Node::ObjectExpression { properties }))
    }
}

// ---------------------------------------------------------------------------
// Operator tables
// ---------------------------------------------------------------------------

enum BinKind {
    Bin(BinOp),
    Logic(LogicalOp),
}

fn binary_prec(kind: &TokKind, allow_in: bool) -> Option<(u8, BinKind)> {
    use BinKind::*;
    let pair = match kind {
        TokKind::OrOr => (1, Logic(LogicalOp::Or)),
        TokKind::AndAnd => (2, Logic(LogicalOp::And)),
        TokKind::BitOr => (3, Bin(BinOp::BitOr)),
        TokKind::BitXor => (4, Bin(BinOp::BitXor)),
        TokKind::BitAnd => (5, Bin(BinOp::BitAnd)),
        TokKind::EqEq => (6, Bin(BinOp::EqEq)),
        TokKind::NotEq => (6, Bin(BinOp::NotEq)),
        TokKind::StrictEq => (6, Bin(BinOp::StrictEq)),
        TokKind::StrictNotEq => (6, Bin(BinOp::StrictNotEq)),
        TokKind::Lt => (7, Bin(BinOp::Lt)),
        TokKind::LtEq => (7, Bin(BinOp::LtEq)),
        TokKind::Gt => (7, Bin(BinOp::Gt)),
        TokKind::GtEq => (7, Bin(BinOp::GtEq)),
        TokKind::InstanceOf => (7, Bin(BinOp::Instanceof)),
        TokKind::In if allow_in => (7, Bin(BinOp::In)),
        TokKind::Shl => (8, Bin(BinOp::Shl)),
        TokKind::Shr => (8, Bin(BinOp::Shr)),
        TokKind::UShr => (8, Bin(BinOp::UShr)),
        TokKind::Plus => (9, Bin(BinOp::Add)),
        TokKind::Minus => (9, Bin(BinOp::Sub)),
        TokKind::Star => (10, Bin(BinOp::Mul)),
        TokKind::Slash => (10, Bin(BinOp::Div)),
        TokKind::Percent => (10, Bin(BinOp::Mod)),
        _ => return None,
    };
    Some(pair)
}

fn assign_op(kind: &TokKind) -> Option<AssignOp> {
    let op = match kind {
        TokKind::Assign => AssignOp::Assign,
        TokKind::PlusAssign => AssignOp::Add,
        TokKind::MinusAssign => AssignOp::Sub,
        TokKind::StarAssign => AssignOp::Mul,
        TokKind::SlashAssign => AssignOp::Div,
        TokKind::PercentAssign => AssignOp::Mod,
        TokKind::ShlAssign => AssignOp::Shl,
        TokKind::ShrAssign => AssignOp::Shr,
        TokKind::UShrAssign => AssignOp::UShr,
        TokKind::AndAssign => AssignOp::BitAnd,
        TokKind::OrAssign => AssignOp::BitOr,
        TokKind::XorAssign => AssignOp::BitXor,
        _ => return None,
    };
    Some(op)
}

fn keyword_text(kind: &TokKind) -> Option<&'static str> {
    let word = match kind {
        TokKind::Var => "var",
        TokKind::Function => "function",
        TokKind::If => "if",
        TokKind::Else => "else",
        TokKind::While => "while",
        TokKind::Do => "do",
        TokKind::For => "for",
        TokKind::In => "in",
        TokKind::Return => "return",
        TokKind::Break => "break",
        TokKind::Continue => "continue",
        TokKind::New => "new",
        TokKind::Delete => "delete",
        TokKind::TypeOf => "typeof",
        TokKind::InstanceOf => "instanceof",
        TokKind::Void => "void",
        TokKind::This => "this",
        TokKind::Null => "null",
        TokKind::True => "true",
        TokKind::False => "false",
        TokKind::Throw => "throw",
        TokKind::Try => "try",
        TokKind::Catch => "catch",
        TokKind::Finally => "finally",
        TokKind::Switch => "switch",
        TokKind::Case => "case",
        TokKind::Default => "default",
        TokKind::With => "with",
        TokKind::Debugger => "debugger",
        _ => return None,
    };
    Some(word)
}

fn describe(kind: &TokKind) -> String {
    match kind {
        TokKind::Number(n) => format!("number {}", n),
        TokKind::Str(_) => "string literal".to_string(),
        TokKind::Regex { .. } => "regex literal".to_string(),
        TokKind::Ident(name) => format!("'{}'", name),
        TokKind::Eof => "end of input".to_string(),
        other => match keyword_text(other) {
            Some(word) => format!("'{}'", word),
            None => format!("{:?}", other),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Ast {
        Parser::parse_program(src).expect("parse should succeed")
    }

    fn root_body(ast: &Ast) -> Vec<NodeId> {
        match ast.node(ast.root) {
            Node::Program { body } => body.clone(),
            other => panic!("root is {:?}", other),
        }
    }

    #[test]
    fn parses_for_loop() {
        let ast = parse("var x = 0; for (var i = 0; i < 3; i++) x += i; x;");
        assert_eq!(root_body(&ast).len(), 3);
    }

    #[test]
    fn node_ids_are_deterministic() {
        let a = Parser::parse_program("f(1 + 2 * 3);").unwrap();
        let b = Parser::parse_program("f(1 + 2 * 3);").unwrap();
        assert_eq!(a.nodes.len(), b.nodes.len());
        for (x, y) in a.nodes.iter().zip(b.nodes.iter()) {
            assert_eq!(x.kind(), y.kind());
        }
    }

    #[test]
    fn precedence_and_associativity() {
        let ast = parse("a = 1 + 2 * 3;");
        // root -> ExpressionStatement -> AssignmentExpression(right = Add)
        let stmt = root_body(&ast)[0];
        let expr = match ast.node(stmt) {
            Node::ExpressionStatement { expression } => *expression,
            other => panic!("{:?}", other),
        };
        let right = match ast.node(expr) {
            Node::AssignmentExpression { op: AssignOp::Assign, right, .. } => *right,
            other => panic!("{:?}", other),
        };
        assert!(matches!(
            ast.node(right),
            Node::BinaryExpression { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn for_in_with_var() {
        let ast = parse("for (var k in o) { f(k); }");
        let stmt = root_body(&ast)[0];
        assert!(matches!(ast.node(stmt), Node::ForInStatement { .. }));
    }

    #[test]
    fn asi_allows_newline_termination() {
        let ast = parse("var a = 1\nvar b = 2\na + b");
        assert_eq!(root_body(&ast).len(), 3);
    }

    #[test]
    fn restricted_return_takes_no_argument_across_newline() {
        let ast = parse("function f() { return\n1; }");
        // body: ReturnStatement(None) then ExpressionStatement(1)
        let f = root_body(&ast)[0];
        let body = match ast.node(f) {
            Node::FunctionDeclaration { body, .. } => *body,
            other => panic!("{:?}", other),
        };
        let stmts = match ast.node(body) {
            Node::BlockStatement { body } => body.clone(),
            other => panic!("{:?}", other),
        };
        assert!(matches!(ast.node(stmts[0]), Node::ReturnStatement { argument: None }));
    }

    #[test]
    fn try_requires_catch_or_finally() {
        assert!(Parser::parse_program("try { f(); }").is_err());
    }

    #[test]
    fn labeled_break_targets() {
        let ast = parse("outer: for (;;) { break outer; }");
        assert!(matches!(
            ast.node(root_body(&ast)[0]),
            Node::LabeledStatement { .. }
        ));
    }

    #[test]
    fn parse_expression_at_reports_end_offset() {
        let src = "xx 1 + 2 yy";
        let (ast, end) = Parser::parse_expression_at(src, 3).unwrap();
        assert_eq!(end, 8);
        assert!(matches!(
            ast.node(ast.root),
            Node::BinaryExpression { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn object_and_array_literals() {
        let ast = parse("var o = { a: 1, 'b c': 2, 3: x }; var a = [1, , 2];");
        assert_eq!(root_body(&ast).len(), 2);
    }
}
