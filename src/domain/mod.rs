pub(crate) mod errors;
pub(crate) mod models;
pub(crate) mod types;

pub(crate) use errors::PipelineError;
pub(crate) use models::{BatchResult, GradingResult, Rubric, Submission};
