//! Adapters for the store and ledger boundaries.

pub mod in_memory;
