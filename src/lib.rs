pub mod audit;
pub mod chain;
pub mod config;
pub mod errors;
pub mod extract;
pub mod llm;
pub mod logging;
pub mod page;
pub mod sandbox;
pub mod server;
pub mod solver;
pub mod submit;
