mod engine;

pub use engine::{EngineBackend, DEFAULT_ENGINE};
