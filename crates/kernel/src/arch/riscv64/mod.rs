//! rv64 single-hart support: boot stub, trap vector, context switch.

pub mod boot;
pub mod context;
pub mod trap;
