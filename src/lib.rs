pub mod backend;
pub mod codec;
pub mod config;
pub mod disk;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod request;
pub mod retry;
pub mod scale;
pub mod viewer;
pub mod worker;

pub use backend::{Backend, RawImage, Session};
pub use config::Configuration;
pub use fetch::{GeneratedImage, fetch};
pub use retry::{RetryController, RetryOutcome};
pub use worker::{IterationOutcome, IterationReport, Worker};
