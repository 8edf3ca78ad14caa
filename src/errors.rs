// src/errors.rs
//! Semantic-analysis core errors (E3xxx).
//!
//! Local unifications never produce these directly: they return progress
//! flags and embed Err-tagged type variables in place. The driver calls
//! `collect_errors` once the fixpoint drains to turn everything that
//! went wrong into renderable diagnostics.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::graph::{FrefState, Op};
use crate::Universe;

#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CoreError {
    #[error("incompatible types: {msg}")]
    #[diagnostic(code(E3001))]
    TypeMismatch {
        msg: String,
        #[label("cannot unify")]
        span: SourceSpan,
    },

    #[error("value may be nil where it is dereferenced")]
    #[diagnostic(code(E3002), help("test the value against 0 before using it"))]
    NilViolation {
        #[label("may be nil here")]
        span: SourceSpan,
    },

    #[error("unknown reference '{name}'")]
    #[diagnostic(code(E3003))]
    ForwardRef {
        name: String,
        #[label("never defined")]
        span: SourceSpan,
    },

    #[error("mismatched argument lengths")]
    #[diagnostic(code(E3004))]
    ArityMismatch {
        #[label("wrong number of arguments")]
        span: SourceSpan,
    },

    #[error("argument requires an explicit conversion")]
    #[diagnostic(code(E3005), help("insert a rounding or widening conversion"))]
    ArgConversion {
        #[label("no free conversion")]
        span: SourceSpan,
    },
}

fn span_of(u: &Universe, n: crate::graph::NodeId) -> SourceSpan {
    match u.nodes.span_of(n) {
        Some((off, len)) => (off, len).into(),
        None => (0, 0).into(),
    }
}

/// Aggregate everything that went wrong during the fixpoint: Err-tagged
/// type variables, nil violations, and forward refs that never resolved.
pub fn collect_errors(u: &Universe) -> Vec<CoreError> {
    let mut out = Vec::new();
    for msg in u.tvs.err_msgs() {
        if msg.contains("argument lengths") {
            out.push(CoreError::ArityMismatch { span: (0, 0).into() });
        } else {
            out.push(CoreError::TypeMismatch { msg, span: (0, 0).into() });
        }
    }
    for _ in u.tvs.nil_violations() {
        out.push(CoreError::NilViolation { span: (0, 0).into() });
    }
    for n in u.nodes.ids() {
        if let Op::ForwardRef { name, state } = &u.nodes.node(n).op {
            if *state != FrefState::Defined {
                out.push(CoreError::ForwardRef {
                    name: name.to_string(),
                    span: span_of(u, n),
                });
            }
        }
    }
    out
}
