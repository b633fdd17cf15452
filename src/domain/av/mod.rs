//! Audio/Video domain modules.

pub mod encoding;
pub mod probe;
pub mod segments;
