//! cbt-core: the exam session engine.
//!
//! This crate defines the data model, the section timer, the response ledger,
//! the dual local/remote persistence protocol, scoring, and the session
//! controller that ties them together. Concrete stores live in `cbt-store`.

pub mod clock;
pub mod controller;
pub mod error;
pub mod fakes;
pub mod ledger;
pub mod model;
pub mod parser;
pub mod persistence;
pub mod scoring;
pub mod timer;
pub mod traits;

pub use controller::{ExamEvent, ExamState, SessionController, SubmitOutcome};
pub use error::{ExamError, StoreError};
