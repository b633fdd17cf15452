//! Domain layer - Pure business logic.

// Segmentation, probe model and encoding presets
pub mod av;

// Job definitions and state machine
pub mod jobs;
