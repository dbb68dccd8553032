//! Upload normalization: a single PDF or a ZIP of PDFs becomes a list of documents.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::core::config::Settings;
use crate::domain::PipelineError;

const PDF_MAGIC: &[u8] = b"%PDF-";
const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";

#[derive(Debug, Clone, Copy)]
pub(crate) struct NormalizerLimits {
    pub(crate) max_input_bytes: u64,
    pub(crate) max_entry_bytes: u64,
    pub(crate) max_entries: usize,
}

impl NormalizerLimits {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            max_input_bytes: settings.upload().max_upload_bytes(),
            max_entry_bytes: settings.upload().max_file_bytes(),
            max_entries: settings.upload().max_archive_entries,
        }
    }
}

/// A decoded document before an identifier has been assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Document {
    pub(crate) source_filename: String,
    pub(crate) content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Pdf,
    Zip,
}

pub(crate) fn normalize(
    bytes: &[u8],
    content_type: Option<&str>,
    filename: &str,
    limits: &NormalizerLimits,
) -> Result<Vec<Document>, PipelineError> {
    let size = bytes.len() as u64;
    if size > limits.max_input_bytes {
        return Err(PipelineError::OversizeInput { size, limit: limits.max_input_bytes });
    }

    match detect_format(bytes, content_type, filename) {
        Some(InputFormat::Pdf) => normalize_pdf(bytes, filename),
        Some(InputFormat::Zip) => normalize_zip(bytes, limits),
        None => Err(PipelineError::UnsupportedFormat(format!(
            "'{filename}' is neither a PDF nor a ZIP archive"
        ))),
    }
}

fn detect_format(bytes: &[u8], content_type: Option<&str>, filename: &str) -> Option<InputFormat> {
    let mime = content_type
        .map(|value| value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("application/pdf") => return Some(InputFormat::Pdf),
        Some("application/zip" | "application/x-zip-compressed" | "multipart/x-zip") => {
            return Some(InputFormat::Zip)
        }
        _ => {}
    }

    match extension(filename).as_deref() {
        Some("pdf") => return Some(InputFormat::Pdf),
        Some("zip") => return Some(InputFormat::Zip),
        _ => {}
    }

    if bytes.starts_with(PDF_MAGIC) {
        Some(InputFormat::Pdf)
    } else if bytes.starts_with(ZIP_LOCAL_HEADER) || bytes.starts_with(ZIP_EMPTY_ARCHIVE) {
        Some(InputFormat::Zip)
    } else {
        None
    }
}

fn normalize_pdf(bytes: &[u8], filename: &str) -> Result<Vec<Document>, PipelineError> {
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(PipelineError::UnsupportedFormat(format!(
            "'{filename}' does not contain PDF data"
        )));
    }

    let source_filename = sanitize_path(filename)
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().to_string()))
        .unwrap_or_else(|| "submission.pdf".to_string());

    Ok(vec![Document { source_filename, content: bytes.to_vec() }])
}

fn normalize_zip(bytes: &[u8], limits: &NormalizerLimits) -> Result<Vec<Document>, PipelineError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| PipelineError::UnsupportedFormat(format!("unreadable ZIP archive: {err}")))?;

    let mut documents = Vec::new();
    let mut decoded_bytes: u64 = 0;

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(index, error = %err, "Skipping unreadable archive entry");
                continue;
            }
        };

        if entry.is_dir() {
            continue;
        }

        let raw_name = entry.name().to_string();
        let Some(path) = sanitize_path(&raw_name) else {
            tracing::warn!(entry = %raw_name, "Skipping archive entry with unsafe path");
            continue;
        };

        if is_resource_fork(&path) {
            continue;
        }

        if extension(&raw_name).as_deref() != Some("pdf") {
            tracing::debug!(entry = %raw_name, "Skipping non-PDF archive entry");
            continue;
        }

        if entry.encrypted() {
            tracing::warn!(entry = %raw_name, "Skipping encrypted archive entry");
            continue;
        }

        if entry.size() > limits.max_entry_bytes {
            tracing::warn!(
                entry = %raw_name,
                size = entry.size(),
                limit = limits.max_entry_bytes,
                "Skipping oversized archive entry"
            );
            continue;
        }

        if documents.len() >= limits.max_entries {
            tracing::warn!(limit = limits.max_entries, "Archive entry limit reached, skipping rest");
            break;
        }

        // The declared size is untrusted, so the read itself is bounded too.
        let mut content = Vec::new();
        let read = (&mut entry)
            .take(limits.max_entry_bytes + 1)
            .read_to_end(&mut content);
        if let Err(err) = read {
            tracing::warn!(entry = %raw_name, error = %err, "Skipping undecodable archive entry");
            continue;
        }
        if content.len() as u64 > limits.max_entry_bytes {
            tracing::warn!(entry = %raw_name, "Skipping archive entry that inflates past limit");
            continue;
        }

        if !content.starts_with(PDF_MAGIC) {
            tracing::warn!(entry = %raw_name, "Skipping archive entry without PDF header");
            continue;
        }

        decoded_bytes += content.len() as u64;
        if decoded_bytes > limits.max_input_bytes {
            return Err(PipelineError::OversizeInput {
                size: decoded_bytes,
                limit: limits.max_input_bytes,
            });
        }

        let source_filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| raw_name.clone());
        documents.push(Document { source_filename, content });
    }

    if documents.is_empty() {
        return Err(PipelineError::UnsupportedFormat(
            "no PDF documents found in the archive".to_string(),
        ));
    }

    tracing::info!(documents = documents.len(), entries = archive.len(), "Archive normalized");

    Ok(documents)
}

fn extension(name: &str) -> Option<String> {
    Path::new(name).extension().and_then(|ext| ext.to_str()).map(|ext| ext.to_ascii_lowercase())
}

fn is_resource_fork(path: &Path) -> bool {
    let in_macosx_dir = path
        .components()
        .next()
        .is_some_and(|component| component.as_os_str() == "__MACOSX");
    let apple_double = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("._"));
    in_macosx_dir || apple_double
}

/// Keeps only normal components, so `../` and absolute prefixes are dropped.
fn sanitize_path(name: &str) -> Option<PathBuf> {
    let mut sanitized = PathBuf::new();
    for component in Path::new(name).components() {
        if let Component::Normal(part) = component {
            sanitized.push(part);
        }
    }

    if sanitized.as_os_str().is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_pdf, zip_archive};

    fn limits() -> NormalizerLimits {
        NormalizerLimits { max_input_bytes: 1024 * 1024, max_entry_bytes: 512 * 1024, max_entries: 10 }
    }

    #[test]
    fn single_pdf_yields_one_document() {
        let pdf = sample_pdf("Essay");
        let docs = normalize(&pdf, Some("application/pdf"), "uploads/ada_lovelace.pdf", &limits())
            .expect("normalize");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_filename, "ada_lovelace.pdf");
        assert_eq!(docs[0].content, pdf);
    }

    #[test]
    fn zip_filters_to_pdf_entries_in_archive_order() {
        let archive = zip_archive(&[
            ("b_student.pdf", sample_pdf("B")),
            ("notes.txt", b"not a pdf".to_vec()),
            ("nested/a_student.PDF", sample_pdf("A")),
            ("__MACOSX/._b_student.pdf", sample_pdf("fork")),
            ("c_student.pdf", sample_pdf("C")),
        ]);

        let docs = normalize(&archive, None, "batch.zip", &limits()).expect("normalize");
        let names: Vec<&str> = docs.iter().map(|doc| doc.source_filename.as_str()).collect();
        assert_eq!(names, vec!["b_student.pdf", "a_student.PDF", "c_student.pdf"]);
    }

    #[test]
    fn empty_zip_is_unsupported() {
        let archive = zip_archive(&[]);
        let err = normalize(&archive, Some("application/zip"), "empty.zip", &limits()).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[test]
    fn zip_without_pdfs_is_unsupported() {
        let archive = zip_archive(&[("readme.txt", b"hello".to_vec())]);
        let err = normalize(&archive, None, "batch.zip", &limits()).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[test]
    fn pdf_named_entry_without_pdf_header_is_skipped() {
        let archive = zip_archive(&[
            ("fake.pdf", b"plain text".to_vec()),
            ("real.pdf", sample_pdf("Real")),
        ]);
        let docs = normalize(&archive, None, "batch.zip", &limits()).expect("normalize");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_filename, "real.pdf");
    }

    #[test]
    fn oversize_input_is_rejected_before_decoding() {
        let limits = NormalizerLimits { max_input_bytes: 16, max_entry_bytes: 16, max_entries: 10 };
        let err = normalize(&sample_pdf("Too big"), None, "big.pdf", &limits).unwrap_err();
        assert!(matches!(err, PipelineError::OversizeInput { limit: 16, .. }));
    }

    #[test]
    fn oversized_entries_are_skipped() {
        let small = sample_pdf("ok");
        let mut large = sample_pdf("large");
        large.extend(std::iter::repeat(b' ').take(4096));
        let limits = NormalizerLimits {
            max_input_bytes: 1024 * 1024,
            max_entry_bytes: (small.len() + 16) as u64,
            max_entries: 10,
        };
        let archive = zip_archive(&[("large.pdf", large), ("small.pdf", small)]);

        let docs = normalize(&archive, None, "batch.zip", &limits).expect("normalize");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_filename, "small.pdf");
    }

    #[test]
    fn entry_limit_caps_document_count() {
        let entries: Vec<(String, Vec<u8>)> =
            (0..5).map(|idx| (format!("s{idx}.pdf"), sample_pdf("x"))).collect();
        let borrowed: Vec<(&str, Vec<u8>)> =
            entries.iter().map(|(name, bytes)| (name.as_str(), bytes.clone())).collect();
        let archive = zip_archive(&borrowed);
        let limits = NormalizerLimits { max_entries: 2, ..limits() };

        let docs = normalize(&archive, None, "batch.zip", &limits).expect("normalize");
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn unknown_format_is_unsupported() {
        let err = normalize(b"GIF89a....", Some("image/gif"), "photo.gif", &limits()).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[test]
    fn declared_pdf_without_pdf_bytes_is_unsupported() {
        let err = normalize(b"hello", Some("application/pdf"), "a.pdf", &limits()).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[test]
    fn format_is_sniffed_from_magic_bytes() {
        let pdf = sample_pdf("Sniffed");
        let docs = normalize(&pdf, Some("application/octet-stream"), "upload", &limits())
            .expect("normalize");
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn sanitize_path_drops_traversal() {
        assert_eq!(sanitize_path("../../etc/a.pdf"), Some(PathBuf::from("etc/a.pdf")));
        assert_eq!(sanitize_path(".."), None);
    }
}
