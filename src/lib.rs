// src/lib.rs
pub mod bits;
pub mod cli;
pub mod commands;
pub mod errors;
pub mod graph;
pub mod opt;
pub mod tvar;
pub mod types;

pub use graph::{GraphBuilder, NodeId, Nodes};
pub use opt::{Driver, FixpointStats};
pub use types::{TypeId, TypeStore};

/// Everything one semantic-analysis run needs: the type intern store (which
/// owns the alias and fidx trees), the node graph and the type-variable
/// arena. Dropping the universe is the reset; there is no global state.
pub struct Universe {
    pub types: types::TypeStore,
    pub nodes: graph::Nodes,
    pub tvs: tvar::TvStore,
}

impl Universe {
    pub fn new() -> Self {
        Universe {
            types: types::TypeStore::new(),
            nodes: graph::Nodes::new(),
            tvs: tvar::TvStore::new(),
        }
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}
