//! Core run compiler: script model, expansion, code generation, orchestration.

pub mod codegen;
pub mod compiler;
pub mod expander;
pub mod metadata;
pub mod orchestrator;
pub mod parser;
pub mod resolver;
pub mod template;
pub mod topology;
pub mod types;
