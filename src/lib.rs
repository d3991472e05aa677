pub mod banner;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod reference;
pub mod state;

// Re-export vision types for convenience
pub use invigil_vision::{Embedding, ModelPaths, Pipeline};

pub use engine::{FaceEngine, FrameSource, OrtFaceEngine};
pub use monitor::IdentityMonitor;
pub use reference::ReferenceSource;
pub use state::{MonitorPhase, MonitorSnapshot, VerificationResult};
