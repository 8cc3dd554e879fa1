pub mod data;
pub mod errors;

pub use data::*; // Samples, labels and graph nodes
pub use errors::*;
