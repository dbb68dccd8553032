use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use super::normalizer::Document;
use crate::domain::Submission;

const FALLBACK_IDENTIFIER: &str = "submission";
const GENERIC_STEMS: &[&str] = &["submission", "document", "scan", "untitled", "file"];
const MAX_TEXT_IDENTIFIER_CHARS: usize = 80;

/// Assigns a unique identifier to every document, preserving order.
pub(crate) fn assign_identifiers(documents: Vec<Document>) -> Vec<Submission> {
    let mut taken: HashSet<String> = HashSet::with_capacity(documents.len());

    documents
        .into_iter()
        .map(|document| {
            let base = identifier_from_filename(&document.source_filename)
                .or_else(|| identifier_from_pdf(&document.content))
                .unwrap_or_else(|| FALLBACK_IDENTIFIER.to_string());
            let student_identifier = disambiguate(base, &mut taken);

            Submission {
                student_identifier,
                source_filename: document.source_filename,
                raw_content: Arc::from(document.content),
            }
        })
        .collect()
}

/// Identifier derived from the file stem, or `None` when the stem is empty or generic.
pub(crate) fn identifier_from_filename(filename: &str) -> Option<String> {
    let stem = Path::new(filename).file_stem()?.to_string_lossy();
    let collapsed = separators().replace_all(&stem, " ").trim().to_string();

    if collapsed.is_empty() || is_generic(&collapsed) {
        None
    } else {
        Some(collapsed)
    }
}

/// First `Name:`-style line in the document text.
pub(crate) fn identifier_from_text(text: &str) -> Option<String> {
    let captures = name_line().captures(text)?;
    let value = captures.get(1)?.as_str();
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let identifier: String = normalized.chars().take(MAX_TEXT_IDENTIFIER_CHARS).collect();
    let identifier = identifier.trim().to_string();

    if identifier.is_empty() {
        None
    } else {
        Some(identifier)
    }
}

fn identifier_from_pdf(content: &[u8]) -> Option<String> {
    // The PDF text parser panics on some malformed inputs.
    let extracted = panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(content)));
    match extracted {
        Ok(Ok(text)) => identifier_from_text(&text),
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "PDF text extraction failed");
            None
        }
        Err(_) => {
            tracing::warn!("PDF text extraction panicked, using fallback identifier");
            None
        }
    }
}

fn disambiguate(base: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.to_lowercase()) {
        return base;
    }

    let mut ordinal = 2_usize;
    loop {
        let candidate = format!("{base}-{ordinal}");
        if taken.insert(candidate.to_lowercase()) {
            return candidate;
        }
        ordinal += 1;
    }
}

fn is_generic(identifier: &str) -> bool {
    identifier.split_whitespace().all(|token| {
        let lower = token.to_lowercase();
        GENERIC_STEMS.contains(&lower.as_str()) || lower.chars().all(|ch| ch.is_ascii_digit())
    })
}

fn separators() -> &'static Regex {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    SEPARATORS.get_or_init(|| Regex::new(r"[_\-.\s]+").expect("valid separator pattern"))
}

fn name_line() -> &'static Regex {
    static NAME_LINE: OnceLock<Regex> = OnceLock::new();
    NAME_LINE.get_or_init(|| {
        Regex::new(r"(?im)^[ \t]*(?:student[ \t]+name|student[ \t]+id|student|name)[ \t]*:[ \t]*(\S[^\r\n]*)")
            .expect("valid name line pattern")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, content: &[u8]) -> Document {
        Document { source_filename: name.to_string(), content: content.to_vec() }
    }

    #[test]
    fn filename_separators_collapse_to_spaces() {
        assert_eq!(identifier_from_filename("ada_lovelace.pdf").as_deref(), Some("ada lovelace"));
        assert_eq!(
            identifier_from_filename("nested/Grace--Hopper . final.PDF").as_deref(),
            Some("Grace Hopper final")
        );
    }

    #[test]
    fn generic_filenames_are_rejected() {
        assert_eq!(identifier_from_filename("submission.pdf"), None);
        assert_eq!(identifier_from_filename("Scan_0042.pdf"), None);
        assert_eq!(identifier_from_filename("12345.pdf"), None);
        assert_eq!(identifier_from_filename("___.pdf"), None);
    }

    #[test]
    fn text_name_lines_are_recognized() {
        let text = "Essay on bridges\nStudent Name:  Alan   Turing\nDate: today";
        assert_eq!(identifier_from_text(text).as_deref(), Some("Alan Turing"));
        assert_eq!(identifier_from_text("name: Emmy Noether").as_deref(), Some("Emmy Noether"));
        assert_eq!(identifier_from_text("Student ID: 20231187").as_deref(), Some("20231187"));
        assert_eq!(identifier_from_text("No identifying line here"), None);
    }

    #[test]
    fn generic_name_with_unreadable_content_falls_back() {
        let submissions = assign_identifiers(vec![doc("document.pdf", b"%PDF-1.4 garbage")]);
        assert_eq!(submissions[0].student_identifier, "submission");
        assert_eq!(submissions[0].source_filename, "document.pdf");
    }

    #[test]
    fn duplicates_get_ordinal_suffixes_in_order() {
        let submissions = assign_identifiers(vec![
            doc("ada.pdf", b"%PDF-"),
            doc("Ada.pdf", b"%PDF-"),
            doc("ada-2.pdf", b"%PDF-"),
            doc("ADA.pdf", b"%PDF-"),
        ]);
        let ids: Vec<&str> =
            submissions.iter().map(|submission| submission.student_identifier.as_str()).collect();
        assert_eq!(ids, vec!["ada", "Ada-2", "ada 2", "ADA-3"]);
    }

    #[test]
    fn identifiers_are_unique_case_insensitively() {
        let submissions = assign_identifiers(vec![
            doc("scan.pdf", b"not a pdf"),
            doc("untitled.pdf", b"not a pdf"),
            doc("file.pdf", b"not a pdf"),
        ]);
        let ids: Vec<&str> =
            submissions.iter().map(|submission| submission.student_identifier.as_str()).collect();
        assert_eq!(ids, vec!["submission", "submission-2", "submission-3"]);
    }
}
