//! Protocol-level vocabulary shared by the codec and the engine

pub mod v5;
pub mod version;

pub use version::ProtocolVersion;
