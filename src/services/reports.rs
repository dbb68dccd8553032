//! Detailed PDF report and CSV export for a graded batch.

use anyhow::{Context, Result};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

use crate::domain::models::format_score;
use crate::domain::BatchResult;

const CSV_HEADER: [&str; 6] =
    ["student_identifier", "source_filename", "score", "max_score", "feedback", "status"];

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 50;
const LEADING: i64 = 15;
const BODY_SIZE: i64 = 11;
const TITLE_SIZE: i64 = 14;
const WRAP_COLUMNS: usize = 90;
const TITLE_WRAP_COLUMNS: usize = 70;
const LINES_PER_PAGE: usize = ((PAGE_HEIGHT - 2 * MARGIN) / LEADING) as usize;

/// What both renderers print for one submission.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReportEntry {
    pub(crate) position: usize,
    pub(crate) student_identifier: String,
    pub(crate) source_filename: String,
    pub(crate) score: Option<String>,
    pub(crate) status: &'static str,
    pub(crate) body: String,
}

pub(crate) fn report_entries(batch: &BatchResult) -> Vec<ReportEntry> {
    batch
        .results
        .iter()
        .enumerate()
        .map(|(index, result)| ReportEntry {
            position: index + 1,
            student_identifier: result.student_identifier.clone(),
            source_filename: result.source_filename.clone(),
            score: result.score.map(format_score),
            status: result.status.flag(),
            body: match result.failure_reason() {
                Some(reason) => reason.to_string(),
                None => result.feedback.clone(),
            },
        })
        .collect()
}

/// One row per submission, in batch order. Identical input gives identical bytes.
pub(crate) fn render_csv(batch: &BatchResult) -> Result<Vec<u8>> {
    let max_score = format_score(batch.max_score);
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER).context("Failed to write CSV header")?;

    for entry in report_entries(batch) {
        writer
            .write_record([
                entry.student_identifier.as_str(),
                entry.source_filename.as_str(),
                entry.score.as_deref().unwrap_or_default(),
                max_score.as_str(),
                entry.body.as_str(),
                entry.status,
            ])
            .with_context(|| format!("Failed to write CSV row for {}", entry.student_identifier))?;
    }

    writer.into_inner().map_err(|err| anyhow::anyhow!("Failed to flush CSV report: {}", err.error()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Title,
    Body,
}

#[derive(Debug, Clone)]
struct Line {
    style: Style,
    text: String,
}

impl Line {
    fn title(text: impl Into<String>) -> Self {
        Self { style: Style::Title, text: text.into() }
    }

    fn body(text: impl Into<String>) -> Self {
        Self { style: Style::Body, text: text.into() }
    }

    fn blank() -> Self {
        Self::body(String::new())
    }

    fn wrapped_title(text: &str) -> Vec<Self> {
        wrap(text, TITLE_WRAP_COLUMNS).into_iter().map(Self::title).collect()
    }

    fn wrapped_body(text: &str) -> Vec<Self> {
        wrap(text, WRAP_COLUMNS).into_iter().map(Self::body).collect()
    }
}

/// Summary page followed by one section per submission, each starting on a new page.
pub(crate) fn render_pdf(batch: &BatchResult) -> Result<Vec<u8>> {
    let mut streams = encode_section(&summary_lines(batch), "Grading summary")
        .context("Failed to render summary page")?;

    for entry in report_entries(batch) {
        match encode_section(&entry_lines(&entry), &entry.student_identifier) {
            Ok(pages) => streams.extend(pages),
            Err(err) => {
                tracing::warn!(
                    submission = %entry.student_identifier,
                    error = %err,
                    "Report entry could not be encoded, using placeholder"
                );
                let mut placeholder = Line::wrapped_title(&format!(
                    "Grading Report {} - {}",
                    entry.position, entry.student_identifier
                ));
                placeholder.push(Line::blank());
                placeholder.push(Line::body("This entry could not be rendered. See the CSV export for its details."));
                streams.extend(
                    encode_section(&placeholder, &entry.student_identifier)
                        .context("Failed to render placeholder entry")?,
                );
            }
        }
    }

    assemble(streams)
}

fn summary_lines(batch: &BatchResult) -> Vec<Line> {
    let mut lines = vec![
        Line::title("Grading Summary"),
        Line::blank(),
        Line::body(format!("Submissions: {}", batch.total)),
        Line::body(format!("Graded: {}", batch.succeeded)),
        Line::body(format!("Failed: {}", batch.failed)),
        Line::body(format!("Maximum score: {}", format_score(batch.max_score))),
    ];

    let scores: Vec<f64> = batch.results.iter().filter_map(|result| result.score).collect();
    if !scores.is_empty() {
        let average = scores.iter().sum::<f64>() / scores.len() as f64;
        lines.push(Line::body(format!("Average score: {average:.1}")));
    }
    lines.push(Line::body(format!("Processing time: {:.1} s", batch.elapsed.as_secs_f64())));
    lines.push(Line::blank());

    for entry in report_entries(batch) {
        let outcome = match &entry.score {
            Some(score) => format!("{score} / {}", format_score(batch.max_score)),
            None => entry.status.to_string(),
        };
        lines.extend(Line::wrapped_body(&format!(
            "{}. {} ({}): {}",
            entry.position, entry.student_identifier, entry.source_filename, outcome
        )));
    }

    lines
}

fn entry_lines(entry: &ReportEntry) -> Vec<Line> {
    let mut lines =
        Line::wrapped_title(&format!("Grading Report {} - {}", entry.position, entry.student_identifier));
    lines.push(Line::blank());
    lines.extend(Line::wrapped_body(&format!("File: {}", entry.source_filename)));

    match &entry.score {
        Some(score) => lines.push(Line::body(format!("Score: {score}"))),
        None => lines.push(Line::body(format!("Status: {}", entry.status))),
    }
    lines.push(Line::blank());

    let heading = if entry.score.is_some() { "Feedback:" } else { "Failure:" };
    lines.push(Line::body(heading));
    lines.extend(Line::wrapped_body(&entry.body));
    lines
}

/// Encodes the lines into page content streams, continuing onto new pages as needed.
fn encode_section(lines: &[Line], continuation: &str) -> lopdf::Result<Vec<Vec<u8>>> {
    let mut pages = Vec::new();
    let mut remaining = lines;
    let mut first = true;

    while first || !remaining.is_empty() {
        let mut page: Vec<Line> = Vec::with_capacity(LINES_PER_PAGE);
        if !first {
            let name: String = continuation.chars().take(TITLE_WRAP_COLUMNS - 12).collect();
            page.push(Line::title(format!("{name} (continued)")));
            page.push(Line::blank());
        }
        let take = remaining.len().min(LINES_PER_PAGE - page.len());
        page.extend_from_slice(&remaining[..take]);
        remaining = &remaining[take..];
        first = false;

        pages.push(page_content(&page).encode()?);
    }

    Ok(pages)
}

fn page_content(lines: &[Line]) -> Content {
    let mut operations = Vec::with_capacity(lines.len() * 5);
    let mut y = PAGE_HEIGHT - MARGIN;

    for line in lines {
        y -= LEADING;
        if line.text.is_empty() {
            continue;
        }
        let (font, size) = match line.style {
            Style::Title => ("F2", TITLE_SIZE),
            Style::Body => ("F1", BODY_SIZE),
        };
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec![font.into(), size.into()]));
        operations.push(Operation::new("Td", vec![MARGIN.into(), y.into()]));
        operations.push(Operation::new("Tj", vec![Object::string_literal(win_ansi(&line.text))]));
        operations.push(Operation::new("ET", vec![]));
    }

    Content { operations }
}

fn assemble(streams: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let body_font = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let title_font = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => body_font,
            "F2" => title_font,
        },
    });

    let kids: Vec<ObjectId> = streams
        .into_iter()
        .map(|content| {
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            })
        })
        .collect();

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids.iter().map(|id| Object::Reference(*id)).collect::<Vec<Object>>(),
        "Count" => kids.len() as i64,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).context("Failed to serialize PDF report")?;
    Ok(buffer)
}

/// Greedy word wrap. Words longer than the width are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();

    for paragraph in text.lines() {
        let mut current = String::new();
        let mut current_len = 0;

        for word in paragraph.split_whitespace() {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > width {
                if current_len > 0 {
                    lines.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                let rest = word.split_off(width);
                lines.push(word.into_iter().collect());
                word = rest;
            }
            if word.is_empty() {
                continue;
            }

            let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
            if needed > width {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push(' ');
                current_len += 1;
            }
            current.extend(word.iter());
            current_len += word.len();
        }

        lines.push(current);
    }

    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

/// Bytes in the standard fonts' WinAnsi encoding. Anything else becomes `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| match ch {
            ' '..='~' => ch as u8,
            '\t' => b' ',
            '\u{a0}'..='\u{ff}' => ch as u32 as u8,
            '€' => 0x80,
            '‚' => 0x82,
            '„' => 0x84,
            '…' => 0x85,
            '‘' => 0x91,
            '’' => 0x92,
            '“' => 0x93,
            '”' => 0x94,
            '•' => 0x95,
            '–' => 0x96,
            '—' => 0x97,
            '™' => 0x99,
            _ => b'?',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::domain::types::FailureReason;
    use crate::domain::{GradingResult, Submission};

    fn submission(id: &str) -> Submission {
        Submission {
            student_identifier: id.to_string(),
            source_filename: format!("{id}.pdf"),
            raw_content: Arc::from(&b"%PDF-1.5"[..]),
        }
    }

    fn batch() -> BatchResult {
        let results = vec![
            GradingResult::ok(&submission("ada"), 9.0, "Clear thesis, strong structure.".to_string(), 1),
            GradingResult::failed(
                &submission("grace"),
                FailureReason::TransportError("connection reset".to_string()),
                3,
            ),
            GradingResult::ok(&submission("alan"), 6.5, "Good, but \"citations\", missing".to_string(), 2),
        ];
        BatchResult::new(results, Duration::from_millis(1500), 10.0)
    }

    #[test]
    fn csv_has_one_row_per_submission() {
        let csv = render_csv(&batch()).unwrap();
        let mut reader = csv::Reader::from_reader(csv.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), CSV_HEADER.to_vec());

        let rows: Vec<csv::StringRecord> = reader.records().map(|row| row.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][0], "ada");
        assert_eq!(&rows[0][2], "9");
        assert_eq!(&rows[0][3], "10");
        assert_eq!(&rows[0][5], "OK");
        assert_eq!(&rows[1][2], "");
        assert_eq!(&rows[1][4], "TransportError: connection reset");
        assert_eq!(&rows[1][5], "FAILED");
        assert_eq!(&rows[2][4], "Good, but \"citations\", missing");
    }

    #[test]
    fn csv_is_byte_identical_across_renders() {
        let batch = batch();
        assert_eq!(render_csv(&batch).unwrap(), render_csv(&batch).unwrap());
    }

    /// Text drawn on each page, in page order.
    fn page_texts(pdf: &[u8]) -> Vec<Vec<String>> {
        let doc = Document::load_mem(pdf).unwrap();
        doc.get_pages()
            .values()
            .map(|page_id| {
                let content = Content::decode(&doc.get_page_content(*page_id).unwrap()).unwrap();
                content
                    .operations
                    .iter()
                    .filter(|op| op.operator == "Tj")
                    .map(|op| String::from_utf8_lossy(op.operands[0].as_str().unwrap()).into_owned())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn csv_rows_match_pdf_entries_in_order() {
        let batch = batch();
        let csv = render_csv(&batch).unwrap();
        let mut reader = csv::Reader::from_reader(csv.as_slice());
        let rows: Vec<csv::StringRecord> = reader.records().map(|row| row.unwrap()).collect();

        let pages = page_texts(&render_pdf(&batch).unwrap());
        let entry_pages: Vec<&Vec<String>> =
            pages.iter().filter(|texts| texts.first().is_some_and(|t| t.starts_with("Grading Report"))).collect();
        assert_eq!(entry_pages.len(), rows.len());

        for (index, (texts, row)) in entry_pages.iter().zip(&rows).enumerate() {
            assert_eq!(texts[0], format!("Grading Report {} - {}", index + 1, &row[0]));
            assert!(texts.iter().any(|t| t == &format!("File: {}", &row[1])));
            assert!(texts.iter().any(|t| t == &row[4]), "feedback {:?} missing from {:?}", &row[4], texts);
        }
    }

    #[test]
    fn long_identifiers_are_wrapped_on_every_page() {
        let long_id = "x".repeat(200);
        let results = vec![
            GradingResult::ok(&submission(&long_id), 5.0, "Fine.".to_string(), 1),
            GradingResult::ok(&submission("ada"), 7.0, "Good.".to_string(), 1),
        ];
        let batch = BatchResult::new(results, Duration::from_secs(1), 10.0);

        for line in summary_lines(&batch) {
            assert!(line.text.chars().count() <= WRAP_COLUMNS, "summary line too long: {}", line.text);
        }
        for line in report_entries(&batch).iter().flat_map(entry_lines) {
            let limit = if line.style == Style::Title { TITLE_WRAP_COLUMNS } else { WRAP_COLUMNS };
            assert!(line.text.chars().count() <= limit, "entry line too long: {}", line.text);
        }

        let pages = page_texts(&render_pdf(&batch).unwrap());
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().flatten().all(|text| text.chars().count() <= WRAP_COLUMNS));
    }

    #[test]
    fn pdf_has_summary_plus_page_per_entry() {
        let pdf = render_pdf(&batch()).unwrap();
        assert!(pdf.starts_with(b"%PDF-1.5"));
        let doc = Document::load_mem(&pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 4);

        let text = String::from_utf8_lossy(&pdf);
        assert!(text.contains("Grading Report 2 - grace"));
        assert!(text.contains("TransportError: connection reset"));
    }

    #[test]
    fn long_feedback_continues_on_new_pages() {
        let long_feedback = "word ".repeat(WRAP_COLUMNS * LINES_PER_PAGE / 4);
        let results = vec![GradingResult::ok(&submission("ada"), 5.0, long_feedback, 1)];
        let batch = BatchResult::new(results, Duration::from_secs(1), 10.0);

        let doc = Document::load_mem(&render_pdf(&batch).unwrap()).unwrap();
        assert!(doc.get_pages().len() > 2);
    }

    #[test]
    fn wrap_respects_width_and_splits_long_words() {
        let lines = wrap("alpha beta gamma\n\nabcdefghij", 6);
        assert_eq!(lines, vec!["alpha", "beta", "gamma", "", "abcdef", "ghij"]);
        assert!(wrap("", 10) == vec![String::new()]);
    }

    #[test]
    fn non_latin_text_is_transliterated() {
        assert_eq!(win_ansi("Ana “quoted” – Łódź"), b"Ana \x93quoted\x94 \x96 ?\xf3d?".to_vec());
    }
}
