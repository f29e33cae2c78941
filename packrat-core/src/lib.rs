pub mod catalog;
pub mod chunker;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod path_safety;
pub mod progress;
pub mod store;
