//! qto-categorizer: configuration-driven jobs for a bank transaction categorizer.
//!
//! Every configurable family (readers, writers, models, metrics, splitters,
//! searchers, signers, savers, loaders, registers and jobs) is a serde enum
//! selected by its `KIND` tag. A [`settings::MainSettings`] document picks one
//! job, which reads and validates data, fits or loads a model, and talks to an
//! MLflow-compatible tracking store.
//!
//! Heavy numerics stay in small modules (`preprocessing`, `models`); storage
//! and tracking are under `io` and `tracking`.
pub mod error;
pub mod frame;
pub mod io;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod preprocessing;
pub mod schemas;
pub mod searchers;
pub mod settings;
pub mod signers;
pub mod splitters;
pub mod tracking;

pub use error::{Error, Result};
