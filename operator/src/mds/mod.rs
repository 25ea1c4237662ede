//! Metadata server helpers shared with the MDS pod builder.
pub mod liveness;
