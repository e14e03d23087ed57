//! Trestle is a unified, concurrent request-routing engine in front of
//! multiple LLM providers. Callers submit typed requests naming a primary
//! provider, a model, and an ordered fallback list; the engine selects a
//! credential, admits the job into a provider-isolated bounded queue, runs a
//! plugin pipeline around the adapter call, retries transient failures with
//! back-off, and returns a response, a delta stream, or a structured error.
//!
//! Provider adapters, configuration sources, plugins and MCP clients plug in
//! through the traits in [`providers`], [`account`], [`plugins`] and [`mcp`].

pub mod account;
pub mod error;
pub mod keys;
pub mod mcp;
pub mod plugins;
pub mod pool;
pub mod providers;
pub mod queue;
pub mod request;
pub mod response;

mod engine;
mod workers;

pub use engine::{Trestle, TrestleConfig};
pub use error::TrestleError;
pub use request::{Request, RequestInput, RequestKind};
pub use response::{Response, ResponseStream};
