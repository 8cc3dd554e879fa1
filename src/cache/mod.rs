//! Disk-backed memoisation of interaction tensors, graphs and value choices.

pub mod store;
pub mod tensor;

pub use store::{data_fingerprint, CacheKey, CacheStore};
pub use tensor::{write_tensor, MappedInteractionTensor};
