//! A tensor compiler middle-end.
//!
//! A lazy tensor graph (`ir`) is rewritten into kernels (`kernelize`),
//! ordered (`schedule`), and lowered to programs that run on pluggable
//! devices (`engine`, `device`). The `syntax` module reads graphs from the
//! `.tg` text format the `tessera` binary works with.

pub mod config;
pub mod device;
pub mod diagnostic;
pub mod engine;
pub mod error;
pub mod ir;
pub mod kernelize;
pub mod rewrite;
pub mod schedule;
pub mod shape;
pub mod span;
pub mod syntax;

pub use config::Config;
pub use diagnostic::{render_diagnostics, Diagnostic};
pub use engine::{Engine, Stats};
pub use error::{EngineError, Error, ExecError, GraphError, LowerError, Result};
pub use ir::{Graph, NodeId};
pub use kernelize::{kernelize, kernelize_map, KernelizeOptions, Kernelized};
pub use schedule::{create_schedule, Schedule, ScheduleItem};
pub use syntax::{parse_graph, GraphFile};

/// Parse a graph file, rendering any diagnostics to stderr.
pub fn parse_source(source: &str, filename: &str) -> std::result::Result<GraphFile, Vec<Diagnostic>> {
    match parse_graph(source, filename) {
        Ok(file) => {
            render_diagnostics(&file.warnings, filename, source);
            Ok(file)
        }
        Err(errors) => {
            render_diagnostics(&errors, filename, source);
            Err(errors)
        }
    }
}
