//! Client core for submitting children's drawings for developmental insight.
//!
//! The [`session`] reducer owns the in-progress submission, [`media`] prepares
//! images for transport, [`submission`] drives the remote calls with bounded
//! retry, and [`disclosure`] projects a completed result layer by layer.

pub mod config;
pub mod disclosure;
pub mod error;
pub mod media;
pub mod services;
pub mod session;
pub mod submission;

pub use config::{load_settings, ClientSettings, RetryPolicy};
pub use disclosure::{disclose, DisclosedResult};
pub use error::{MediaError, NormalizationError, SubmissionError, TransitionError};
pub use media::{ImagePipeline, PipelineOptions};
pub use services::{
    AnalysisService, HttpAnalysisClient, HttpQuotaStatus, ImageSource, ImageSourceProvider,
    PathImageSource, QuotaStatus, UnmeteredQuota,
};
pub use session::{reduce, DisclosureLayer, SessionAction, Step, SubmissionSession};
pub use submission::{
    ControllerOptions, Feedback, RequestMetadata, SubmissionController, SubmissionEvent,
};
