//! LLM Emulator
//!
//! A stand-in for OpenAI-compatible LLM APIs. Tests post a script describing
//! what the "model" should say, then point their client at the emulator and
//! get deterministic completions, streams and provider-shaped errors back.
//!
//! # Features
//!
//! - **Sequential responses**: served in order, each at most once
//! - **Pattern responses**: regexes over the latest user message
//! - **Structural rules**: match on method, path, JSON body, JSON path
//! - **Call budgets**: limit how many times a rule can match
//! - **Streaming**: word-by-word server-sent events ending in `[DONE]`
//! - **Error simulation**: any status with an OpenAI-style error envelope
//! - **Per-token isolation**: every bearer token has its own script
//!
//! # Example Script
//!
//! ```json
//! {
//!   "reset": true,
//!   "responses": [
//!     "Default first response",
//!     {"match": "help", "response": "How can I help?"},
//!     {"match": "error", "error": "Something went wrong", "status": 500}
//!   ],
//!   "rules": [{
//!     "match": {"method": "GET", "path": "/v1/models"},
//!     "times": 1,
//!     "response": {"json": {"object": "list", "data": []}}
//!   }]
//! }
//! ```

pub mod budget;
pub mod config;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod openai;
pub mod policy;
pub mod request;
pub mod script;
pub mod sequencer;
pub mod server;
pub mod store;
pub mod stream;
pub mod synth;
pub mod template;

pub use config::EmulatorConfig;
pub use engine::{Emulator, Reply};
pub use error::{ApiError, ScriptError};
pub use script::ScriptDefinition;
pub use store::ScriptStore;
