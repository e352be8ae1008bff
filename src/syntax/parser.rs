use std::collections::{HashMap, HashSet};

use crate::diagnostic::Diagnostic;
use crate::error::GraphError;
use crate::ir::{DType, NodeId, Op, ReduceOp};
use crate::shape::{SInt, Variable};
use crate::span::{Span, Spanned};

use super::lexer::Token;
use super::{Fill, GraphFile, Init, Output};

#[derive(Clone, Debug)]
enum Binding {
    Tensor { node: NodeId, span: Span },
    Var { var: Variable, value: i64, span: Span },
    /// A statement that already reported an error.
    Failed { span: Span },
}

impl Binding {
    fn span(&self) -> Span {
        match self {
            Binding::Tensor { span, .. } | Binding::Var { span, .. } | Binding::Failed { span } => *span,
        }
    }
}

type PResult<T> = Result<T, Diagnostic>;

pub(super) struct Parser<'a> {
    tokens: Vec<Spanned<Token>>,
    pos: usize,
    source: &'a str,
    filename: &'a str,
    names: HashMap<String, Binding>,
    used: HashSet<String>,
    file: GraphFile,
    diagnostics: Vec<Diagnostic>,
    /// Set when the pending error only repeats an earlier one.
    silenced: bool,
}

impl<'a> Parser<'a> {
    pub(super) fn new(tokens: Vec<Spanned<Token>>, source: &'a str, filename: &'a str) -> Self {
        Self {
            tokens,
            pos: 0,
            source,
            filename,
            names: HashMap::new(),
            used: HashSet::new(),
            file: GraphFile::default(),
            diagnostics: Vec::new(),
            silenced: false,
        }
    }

    pub(super) fn parse_file(mut self) -> Result<GraphFile, Vec<Diagnostic>> {
        self.eat(&Token::Newline);
        while !self.at(&Token::Eof) {
            if let Err(diag) = self.parse_statement() {
                if !std::mem::take(&mut self.silenced) {
                    self.diagnostics.push(diag);
                }
                self.recover();
            }
        }
        if self.file.outputs.is_empty() && self.diagnostics.is_empty() {
            self.diagnostics.push(
                Diagnostic::error("graph has no outputs", self.current_span())
                    .with_help("add a line `out NAME`"),
            );
        }
        if !self.diagnostics.is_empty() {
            return Err(self.diagnostics);
        }

        let mut unused: Vec<(&String, Span)> = self
            .names
            .iter()
            .filter(|(name, _)| !self.used.contains(*name))
            .filter_map(|(name, b)| match b {
                Binding::Tensor { span, .. } => Some((name, *span)),
                Binding::Var { .. } | Binding::Failed { .. } => None,
            })
            .collect();
        unused.sort_by_key(|(_, span)| span.start);
        self.file.warnings = unused
            .into_iter()
            .map(|(name, span)| Diagnostic::warning(format!("'{}' is never used", name), span))
            .collect();
        Ok(self.file)
    }

    /// Skip to the start of the next line.
    fn recover(&mut self) {
        while !self.at(&Token::Eof) {
            if self.advance().node == Token::Newline {
                break;
            }
        }
    }

    fn parse_statement(&mut self) -> PResult<()> {
        let start = self.current_span();
        let name = self.expect_ident()?;
        if name.node == "out" && !self.at(&Token::Eq) {
            return self.parse_outputs();
        }
        self.expect(&Token::Eq)?;
        if let Some(prev) = self.names.get(&name.node) {
            let line = prev.span().line(self.source);
            return Err(Diagnostic::error(format!("'{}' is already defined", name.node), name.span)
                .with_note(format!("first defined on line {}", line)));
        }

        let binding = match self.parse_definition(&name.node, start) {
            Ok(binding) => binding,
            Err(diag) => {
                self.names.insert(name.node, Binding::Failed { span: name.span });
                return Err(diag);
            }
        };
        self.names.insert(name.node, binding);
        Ok(())
    }

    /// The right-hand side of `name = op ...`, labeled with its line.
    fn parse_definition(&mut self, name: &str, start: Span) -> PResult<Binding> {
        let op = self.expect_ident()?;
        let binding = self.parse_op(name, &op)?;
        self.end_of_statement()?;

        if let Binding::Tensor { node, .. } = binding {
            if !matches!(op.node.as_str(), "buffer" | "const") {
                let caller = format!("{}:{}", self.filename, start.line(self.source));
                self.file.graph.label(node, &op.node, &caller);
            }
        }
        Ok(binding)
    }

    /// Error for a reference to a statement that failed; it is not reported
    /// again.
    fn failed_reference(&mut self, span: Span) -> Diagnostic {
        self.silenced = true;
        Diagnostic::error("reference to a failed statement", span)
    }

    fn parse_outputs(&mut self) -> PResult<()> {
        loop {
            let name = self.expect_ident()?;
            let node = self.tensor_named(&name)?;
            self.file.outputs.push(Output { name: name.node, node });
            self.eat(&Token::Comma);
            if self.at(&Token::Newline) || self.at(&Token::Eof) {
                break;
            }
        }
        self.end_of_statement()
    }

    fn end_of_statement(&mut self) -> PResult<()> {
        if self.eat(&Token::Newline) || self.at(&Token::Eof) {
            return Ok(());
        }
        Err(self.unexpected("end of line"))
    }

    fn parse_op(&mut self, name: &str, op: &Spanned<String>) -> PResult<Binding> {
        let span = op.span;
        let g = |this: &Self, r: Result<NodeId, GraphError>| {
            r.map_err(|e| Diagnostic::error(e.to_string(), span.merge(this.prev_span())))
        };
        let node = match op.node.as_str() {
            "var" => {
                let min = self.expect_int()?;
                let max = self.expect_int()?;
                let value = self.expect_int()?;
                if min > max || value < min || value > max {
                    return Err(Diagnostic::error(
                        format!("{} = {} is outside [{}, {}]", name, value, min, max),
                        span.merge(self.prev_span()),
                    ));
                }
                let var = Variable::new(name, min, max);
                self.file.var_vals.insert(var.clone(), value);
                return Ok(Binding::Var {
                    var,
                    value,
                    span: op.span,
                });
            }
            "buffer" => {
                let device = self.expect_device()?;
                let dtype = self.expect_dtype()?;
                let size = self.expect_usize()?;
                let fill = if self.eat_ident("arange") {
                    Some(Fill::Arange)
                } else if self.eat_ident("fill") {
                    Some(Fill::Value(self.expect_value()?))
                } else {
                    None
                };
                let node = self.file.graph.buffer(&device, dtype, size);
                if let Some(fill) = fill {
                    self.file.inits.push(Init {
                        name: name.to_string(),
                        node,
                        fill,
                    });
                }
                node
            }
            "const" => {
                let device = self.expect_device()?;
                let dtype = self.expect_dtype()?;
                let value = self.expect_value()?;
                let shape = self.dims()?;
                self.file.graph.constant(&device, dtype, value, &shape)
            }
            "neg" | "exp2" | "log2" | "sqrt" | "recip" => {
                let x = self.tensor()?;
                let r = self.file.graph.unary(unary_op(&op.node), x);
                g(self, r)?
            }
            "add" | "mul" | "max" | "cmplt" => {
                let a = self.tensor()?;
                let b = self.tensor()?;
                let r = self.file.graph.binary(binary_op(&op.node), a, b);
                g(self, r)?
            }
            "where" => {
                let c = self.tensor()?;
                let a = self.tensor()?;
                let b = self.tensor()?;
                let r = self.file.graph.where_(c, a, b);
                g(self, r)?
            }
            "reshape" | "expand" => {
                let x = self.tensor()?;
                let shape = self.dims()?;
                let r = if op.node == "reshape" {
                    self.file.graph.reshape(x, &shape)
                } else {
                    self.file.graph.expand(x, &shape)
                };
                g(self, r)?
            }
            "permute" | "flip" | "sum" | "rmax" => {
                let x = self.tensor()?;
                let axes = self.axes()?;
                let r = match op.node.as_str() {
                    "permute" => self.file.graph.permute(x, &axes),
                    "flip" => self.file.graph.flip(x, &axes),
                    "sum" => self.file.graph.reduce(x, ReduceOp::Add, &axes),
                    _ => self.file.graph.reduce(x, ReduceOp::Max, &axes),
                };
                g(self, r)?
            }
            "pad" | "shrink" => {
                let x = self.tensor()?;
                let pairs = self.pairs()?;
                let r = if op.node == "pad" {
                    self.file.graph.pad(x, &pairs)
                } else {
                    self.file.graph.shrink(x, &pairs)
                };
                g(self, r)?
            }
            "contiguous" => {
                let x = self.tensor()?;
                self.file.graph.contiguous(x)
            }
            "detach" => {
                let x = self.tensor()?;
                self.file.graph.detach(x)
            }
            "fuse" => {
                let x = self.tensor()?;
                self.file.graph.fuse(x)
            }
            "copy" => {
                let x = self.tensor()?;
                let device = self.expect_device()?;
                self.file.graph.copy_to(x, &device)
            }
            "cast" => {
                let x = self.tensor()?;
                let dtype = self.expect_dtype()?;
                self.file.graph.cast(x, dtype)
            }
            "bitcast" => {
                let x = self.tensor()?;
                let dtype = self.expect_dtype()?;
                let r = self.file.graph.bitcast(x, dtype);
                g(self, r)?
            }
            other => {
                return Err(Diagnostic::error(format!("unknown op '{}'", other), span).with_help(
                    "ops: buffer const var neg exp2 log2 sqrt recip add mul max cmplt where \
                     reshape permute expand pad shrink flip sum rmax contiguous detach fuse \
                     copy cast bitcast",
                ))
            }
        };
        Ok(Binding::Tensor { node, span: op.span })
    }

    // ─── Operands ──────────────────────────────────────────────────

    fn tensor(&mut self) -> PResult<NodeId> {
        let name = self.expect_ident()?;
        self.tensor_named(&name)
    }

    fn tensor_named(&mut self, name: &Spanned<String>) -> PResult<NodeId> {
        match self.names.get(&name.node) {
            Some(Binding::Tensor { node, .. }) => {
                let node = *node;
                self.used.insert(name.node.clone());
                Ok(node)
            }
            Some(Binding::Var { .. }) => Err(Diagnostic::error(
                format!("'{}' is a variable, not a tensor", name.node),
                name.span,
            )),
            Some(Binding::Failed { .. }) => Err(self.failed_reference(name.span)),
            None => Err(Diagnostic::error(format!("undefined name '{}'", name.node), name.span)),
        }
    }

    /// `[d, ..]` where each `d` is an integer or a variable name.
    fn dims(&mut self) -> PResult<Vec<SInt>> {
        self.list(Self::dim)
    }

    fn dim(&mut self) -> PResult<SInt> {
        match self.peek().clone() {
            Token::Int(n) if n >= 0 => {
                self.advance();
                Ok(SInt::Const(n))
            }
            Token::Ident(name) => {
                let span = self.current_span();
                self.advance();
                match self.names.get(&name) {
                    Some(Binding::Var { var, value, .. }) => Ok(var.bind(*value)),
                    Some(Binding::Tensor { .. }) => Err(Diagnostic::error(
                        format!("'{}' is a tensor, not a variable", name),
                        span,
                    )),
                    Some(Binding::Failed { .. }) => Err(self.failed_reference(span)),
                    None => Err(Diagnostic::error(format!("undefined variable '{}'", name), span)),
                }
            }
            _ => Err(self.unexpected("a dimension")),
        }
    }

    fn axes(&mut self) -> PResult<Vec<usize>> {
        self.list(Self::expect_usize)
    }

    /// `[b:e, ..]`.
    fn pairs(&mut self) -> PResult<Vec<(SInt, SInt)>> {
        self.list(|p| {
            let begin = p.dim()?;
            p.expect(&Token::Colon)?;
            let end = p.dim()?;
            Ok((begin, end))
        })
    }

    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> PResult<T>) -> PResult<Vec<T>> {
        self.expect(&Token::LBracket)?;
        let mut out = Vec::new();
        while !self.eat(&Token::RBracket) {
            out.push(item(self)?);
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RBracket)?;
                break;
            }
        }
        Ok(out)
    }

    /// `NAME` or `NAME:INDEX`.
    fn expect_device(&mut self) -> PResult<String> {
        let name = self.expect_ident()?;
        if self.eat(&Token::Colon) {
            let index = self.expect_usize()?;
            return Ok(format!("{}:{}", name.node, index));
        }
        Ok(name.node)
    }

    fn expect_dtype(&mut self) -> PResult<DType> {
        let name = self.expect_ident()?;
        DType::from_name(&name.node).ok_or_else(|| {
            Diagnostic::error(format!("unknown dtype '{}'", name.node), name.span)
                .with_help("dtypes: bool i32 i64 f32 f64")
        })
    }

    fn expect_value(&mut self) -> PResult<f64> {
        let value = match self.peek() {
            Token::Int(n) => *n as f64,
            Token::Float(v) => *v,
            Token::Ident(s) if s == "inf" => f64::INFINITY,
            Token::Ident(s) if s == "nan" => f64::NAN,
            Token::Ident(s) if s == "true" => 1.0,
            Token::Ident(s) if s == "false" => 0.0,
            _ => return Err(self.unexpected("a number")),
        };
        self.advance();
        Ok(value)
    }

    fn expect_int(&mut self) -> PResult<i64> {
        if let Token::Int(n) = self.peek() {
            let n = *n;
            self.advance();
            return Ok(n);
        }
        Err(self.unexpected("an integer"))
    }

    fn expect_usize(&mut self) -> PResult<usize> {
        let span = self.current_span();
        let n = self.expect_int()?;
        usize::try_from(n).map_err(|_| {
            Diagnostic::error(format!("expected a non-negative integer, found {}", n), span)
        })
    }

    fn expect_ident(&mut self) -> PResult<Spanned<String>> {
        if let Token::Ident(name) = self.peek() {
            let name = Spanned::new(name.clone(), self.current_span());
            self.advance();
            return Ok(name);
        }
        Err(self.unexpected("a name"))
    }

    // ─── Token cursor ──────────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].node
    }

    fn current_span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn prev_span(&self) -> Span {
        if self.pos > 0 {
            self.tokens[self.pos - 1].span
        } else {
            self.current_span()
        }
    }

    fn advance(&mut self) -> &Spanned<Token> {
        let tok = &self.tokens[self.pos];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Token::Ident(s) if s == word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> PResult<Span> {
        if self.at(token) {
            let span = self.current_span();
            self.advance();
            return Ok(span);
        }
        Err(self.unexpected(&token.description()))
    }

    fn unexpected(&self, what: &str) -> Diagnostic {
        Diagnostic::error(
            format!("expected {}, found {}", what, self.peek().description()),
            self.current_span(),
        )
    }
}

fn unary_op(name: &str) -> Op {
    match name {
        "neg" => Op::Neg,
        "exp2" => Op::Exp2,
        "log2" => Op::Log2,
        "sqrt" => Op::Sqrt,
        _ => Op::Recip,
    }
}

fn binary_op(name: &str) -> Op {
    match name {
        "add" => Op::Add,
        "mul" => Op::Mul,
        "max" => Op::Max,
        _ => Op::CmpLt,
    }
}
