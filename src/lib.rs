//! Local tool server: executes pointer, keyboard and navigation actions
//! against browser and desktop sessions on behalf of a remote decision-maker.

pub mod action;
pub mod api_server;
pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod dom;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod healing;
pub mod loop_detector;
pub mod screenshot;
pub mod session;

pub use engine::Engine;
pub use error::{EngineError, EngineResult, ValidationError};
