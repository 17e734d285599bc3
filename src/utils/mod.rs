pub mod bh_tree;
pub mod macros;
pub mod math;
pub mod rng;
pub mod sparse_ops;
