//! Graph builder.
//!
//! Turns dataset definitions plus the caller's identity seeds into a frozen,
//! acyclic [`Traversal`]. Building performs no I/O; rows are fetched later by
//! the task runner.
//!
//! ```rust,ignore
//! let traversal = Traversal::build(&datasets, &seeds)?;
//! for node in traversal.nodes() {
//!     println!("{} <- {:?}", node.address, node.upstream);
//! }
//! ```

pub mod dataset;
mod traversal;

pub use dataset::{CollectionConfig, DatasetConfig, EdgeDirection, FieldConfig, FieldReferenceConfig};
pub use traversal::{Edge, ErasureOrder, Traversal, TraversalNode};
