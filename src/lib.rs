pub mod cli;
pub mod engine;
pub mod error;
pub mod records;
pub mod storage;
pub mod transport;

pub use engine::Engine;
pub use error::EngineError;
