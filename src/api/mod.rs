pub(crate) mod errors;
pub(crate) mod grading;
pub(crate) mod guards;
pub(crate) mod handlers;
pub(crate) mod router;
pub(crate) mod validation;
