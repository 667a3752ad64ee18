//! Reference implementations of the two collaborators a splice compilation
//! talks to: a CPU engine builder ([`RefBackend`]) and the fallback node
//! interpreter ([`RefInterpreter`]).

pub mod builder;
pub mod engine;
pub mod interpreter;
pub mod kernels;
pub mod network;

pub use builder::{RefBackend, BACKEND_NAME};
pub use engine::RefEngine;
pub use interpreter::RefInterpreter;
pub use network::RefNetwork;

