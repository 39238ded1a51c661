//! Chat adapters
//!
//! One adapter per provider. `echo` and `scripted` run fully offline.

pub(crate) mod common;
pub mod echo;
pub mod openai;
pub mod scripted;

pub use echo::EchoAdapter;
pub use openai::OpenAIAdapter;
pub use scripted::{RecordedCall, ScriptStep, ScriptedAdapter};
