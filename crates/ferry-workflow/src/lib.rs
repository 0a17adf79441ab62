//! Ferry Workflow
//!
//! Types describing what a run executes and what it produces:
//!
//! - [`Graph`] is the submitted node graph: node id → class type + inputs.
//!   It knows how many executable nodes it has (the progress denominator), how
//!   to randomize seeds, and how to fill external-input placeholders.
//! - [`NodeOutput`] parses the loosely-typed output payload a node reports on
//!   completion into a list of [`ArtifactRef`]s, one per file to upload.

mod artifact;
mod error;
mod graph;
mod node;
mod output;

pub use artifact::{ArtifactKind, ArtifactRef};
pub use error::GraphError;
pub use graph::{Graph, random_seed};
pub use node::GraphNode;
pub use output::NodeOutput;
