//! The `.tg` graph text format.
//!
//! One statement per line, `#` starts a comment:
//!
//! ```text
//! n = var 1 16 4
//! a = buffer HOST:0 f32 16 arange
//! b = const HOST:0 f32 2.0 [16]
//! c = mul a b
//! d = reshape c [4, 4]
//! e = sum d [1]
//! f = shrink a [0:n]
//! out e f
//! ```
//!
//! Every compute statement is labeled with its op and `file:line`, which
//! is the provenance schedule items report.

mod lexer;
mod parser;

use crate::diagnostic::Diagnostic;
use crate::ir::{Graph, NodeId};
use crate::shape::VarVals;

pub use lexer::{Lexer, Token};

/// Initial contents of a buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Fill {
    /// `0, 1, 2, ..`
    Arange,
    Value(f64),
}

impl Fill {
    pub fn values(self, size: usize) -> Vec<f64> {
        match self {
            Fill::Arange => (0..size).map(|i| i as f64).collect(),
            Fill::Value(v) => vec![v; size],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Init {
    pub name: String,
    /// The `Buffer` node.
    pub node: NodeId,
    pub fill: Fill,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Output {
    pub name: String,
    pub node: NodeId,
}

/// A parsed graph file.
#[derive(Clone, Debug, Default)]
pub struct GraphFile {
    pub graph: Graph,
    pub outputs: Vec<Output>,
    /// Buffers to fill before running, in file order.
    pub inits: Vec<Init>,
    /// Values of the declared variables.
    pub var_vals: VarVals,
    pub warnings: Vec<Diagnostic>,
}

impl GraphFile {
    /// A `Sink` over the outputs, in `out` order.
    pub fn sink(&mut self) -> NodeId {
        let srcs = self.outputs.iter().map(|o| o.node).collect();
        self.graph.sink(srcs)
    }
}

/// Parse a graph file. All errors of the file are reported together.
pub fn parse_graph(source: &str, filename: &str) -> Result<GraphFile, Vec<Diagnostic>> {
    let (tokens, lex_errors) = Lexer::new(source).tokenize();
    let parsed = parser::Parser::new(tokens, source, filename).parse_file();
    match parsed {
        Ok(file) if lex_errors.is_empty() => Ok(file),
        Ok(_) => Err(lex_errors),
        Err(mut errors) => {
            errors.extend(lex_errors);
            errors.sort_by_key(|d| d.span.start);
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests;
