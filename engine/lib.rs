#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod error;
pub mod linalg;
pub mod session;
pub mod types;

#[path = "../factor/mod.rs"]
pub mod factor;

#[path = "../decompose/mod.rs"]
pub mod decompose;

#[path = "../assoc/mod.rs"]
pub mod assoc;

pub use config::EngineConfig;
pub use error::{EngineError, FitFailure};
pub use session::Session;
pub use types::{ExpressionMatrix, GeneSet, TechnicalNoise};
