//! Stargrade grading engine: rule registries, field graders, composite scoring
//! and the HTTP/WebSocket surface that serves them.

pub mod ai;
pub mod composite;
pub mod config;
pub mod context;
pub mod domain;
pub mod expr;
pub mod feedback;
pub mod grader;
pub mod logic;
pub mod normalize;
pub mod openai;
pub mod protocol;
pub mod routes;
pub mod rules;
pub mod seeds;
pub mod state;
pub mod telemetry;
pub mod util;
