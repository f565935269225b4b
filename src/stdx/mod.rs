pub mod bitset;
pub mod pqueue;

pub use bitset::DynamicBitSet;
pub use pqueue::PriorityQueue;
