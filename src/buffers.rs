//! Lock-free building blocks for the lock-free reliability engine

pub mod bounded_queue;
pub mod slot_table;
