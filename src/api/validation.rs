use crate::api::errors::ApiError;
use crate::domain::types::ArtifactKind;
use crate::services::workspace::is_session_id;

pub(crate) fn validate_session_id(session_id: &str) -> Result<(), ApiError> {
    if is_session_id(session_id) {
        Ok(())
    } else {
        Err(ApiError::BadRequest("Invalid session id".to_string()))
    }
}

pub(crate) fn parse_artifact_kind(value: &str) -> Result<ArtifactKind, ApiError> {
    ArtifactKind::parse(value)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown report type '{value}', expected pdf or csv")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_must_be_simple_uuid() {
        assert!(validate_session_id("0123456789abcdef0123456789abcdef").is_ok());
        assert!(validate_session_id("0123456789ABCDEF0123456789ABCDEF").is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id("").is_err());
    }

    #[test]
    fn artifact_kind_rejects_unknown() {
        assert!(matches!(parse_artifact_kind("pdf"), Ok(ArtifactKind::Pdf)));
        assert!(parse_artifact_kind("docx").is_err());
    }
}
