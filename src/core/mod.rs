// Value types, collaborator seams, and error modeling shared by the engine.
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod resolver;
pub mod session;
pub mod uri;
