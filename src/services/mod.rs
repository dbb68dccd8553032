pub(crate) mod ai_grading;
pub(crate) mod identity;
pub(crate) mod normalizer;
pub(crate) mod reports;
pub(crate) mod workspace;
