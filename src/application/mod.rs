//! Application layer - Generic services that use ports.

pub mod assembler;
pub mod cleanup;
pub mod dispatcher;
pub mod orchestrator;
pub mod prober;
pub mod worker;
