//! Network components: mixing blocks, the hierarchical encoder and decoder,
//! output heads, and the bridge between phase maps and burn tensors.

pub mod block;
pub mod bridge;
pub mod decoder;
pub mod encoder;
pub mod head;
pub mod network;
