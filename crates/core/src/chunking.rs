use crate::error::IngestError;
use crate::models::{BoundingBox, Chunk, ChunkingOptions, Line};
use std::ops::Range;

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// A piece of a larger buffer. `range` indexes characters of the unsplit text.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub range: Range<usize>,
    pub text: String,
}

/// Cuts `text` into word-safe segments of at most `max_chars` characters, each one
/// starting `overlap` characters before the end of its predecessor.
pub fn split_with_overlap(text: &str, max_chars: usize, overlap: usize) -> Vec<Segment> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut previous_end = 0;

    while start < total {
        let mut end = (start + max_chars.max(1)).min(total);

        if end < total {
            let floor = start.max(previous_end);
            let mut cut = end;
            while cut > floor && !chars[cut].is_whitespace() {
                cut -= 1;
            }

            if cut == floor {
                // Token longer than the limit; keep it whole.
                cut = end;
                while cut < total && !chars[cut].is_whitespace() {
                    cut += 1;
                }
            }
            end = cut;
        }

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            segments.push(Segment {
                range: start..end,
                text: trimmed.to_string(),
            });
        }

        if end >= total {
            break;
        }

        previous_end = end;
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    segments
}

#[derive(Debug, Clone)]
struct Buffer {
    text: String,
    page: u32,
    bbox: BoundingBox,
}

impl Buffer {
    fn from_group(group: &[Line]) -> Option<Self> {
        let first = group.first()?;
        let text = group_text(group);
        if text.trim().is_empty() {
            return None;
        }

        let bbox = group
            .iter()
            .skip(1)
            .fold(first.bbox, |acc, line| acc.union(&line.bbox));

        Some(Self {
            text,
            page: first.page,
            bbox,
        })
    }

    fn absorb(&mut self, other: Buffer) {
        self.text.push(' ');
        self.text.push_str(&other.text);
        self.bbox = self.bbox.union(&other.bbox);
    }

    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

fn group_text(group: &[Line]) -> String {
    group
        .iter()
        .map(|line| line.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Groups positioned lines into retrieval-sized chunks.
#[derive(Debug, Clone, Copy)]
pub struct LineChunker {
    options: ChunkingOptions,
}

impl LineChunker {
    pub fn new(options: ChunkingOptions) -> Result<Self, IngestError> {
        if options.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be greater than zero".to_string(),
            ));
        }
        if options.overlap >= options.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than max_chars {}",
                options.overlap, options.max_chars
            )));
        }
        if options.min_size > options.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "min_size {} must not exceed max_chars {}",
                options.min_size, options.max_chars
            )));
        }
        if options.x_threshold < 0.0 || options.y_threshold < 0.0 {
            return Err(IngestError::InvalidChunkConfig(
                "position thresholds must not be negative".to_string(),
            ));
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &ChunkingOptions {
        &self.options
    }

    /// Lines are expected in reading order per page; no resorting happens here.
    pub fn group_lines(&self, lines: &[Line]) -> Vec<Vec<Line>> {
        let mut groups: Vec<Vec<Line>> = Vec::new();
        let mut current: Vec<Line> = Vec::new();

        for line in lines {
            let Some(previous) = current.last() else {
                current.push(line.clone());
                continue;
            };

            // Page first, then vertical offset; the horizontal gap only matters on the same row.
            let starts_group = line.page != previous.page
                || (line.bbox.top - previous.bbox.top).abs() > self.options.y_threshold
                || (line.bbox.left - previous.bbox.right).abs() > self.options.x_threshold;

            if starts_group {
                groups.push(std::mem::take(&mut current));
            }
            current.push(line.clone());
        }

        if !current.is_empty() {
            groups.push(current);
        }

        groups
    }

    pub fn chunk(&self, lines: &[Line], source: &str) -> Vec<Chunk> {
        let mut buffers: Vec<Buffer> = Vec::new();
        let mut pending: Option<Buffer> = None;

        for group in self.group_lines(lines) {
            let Some(buffer) = Buffer::from_group(&group) else {
                continue;
            };

            pending = match pending.take() {
                Some(mut current)
                    if current.char_len() < self.options.min_size
                        || buffer.char_len() < self.options.min_size =>
                {
                    current.absorb(buffer);
                    Some(current)
                }
                Some(current) => {
                    buffers.push(current);
                    Some(buffer)
                }
                None => Some(buffer),
            };
        }
        buffers.extend(pending);

        let mut chunks = Vec::new();
        for buffer in buffers {
            let locator = format!("{source}#page={}", buffer.page);
            let segments =
                split_with_overlap(&buffer.text, self.options.max_chars, self.options.overlap);
            for segment in segments {
                chunks.push(Chunk {
                    text: segment.text,
                    page: buffer.page,
                    bbox: buffer.bbox,
                    source: locator.clone(),
                    sequence: chunks.len() as u64,
                });
            }
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, page: u32, left: f64, top: f64, right: f64) -> Line {
        Line {
            text: text.to_string(),
            page,
            bbox: BoundingBox::new(left, top, right, top + 0.01),
        }
    }

    fn options(max_chars: usize, overlap: usize, min_size: usize) -> ChunkingOptions {
        ChunkingOptions {
            x_threshold: 0.03,
            y_threshold: 0.02,
            max_chars,
            overlap,
            min_size,
        }
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        let normalized = normalize_whitespace(input);
        assert_eq!(normalized, "A lot of spacing");
    }

    #[test]
    fn config_rejects_overlap_not_smaller_than_max() {
        assert!(LineChunker::new(options(10, 10, 0)).is_err());
        assert!(LineChunker::new(options(0, 0, 0)).is_err());
        assert!(LineChunker::new(options(10, 2, 0)).is_ok());
    }

    #[test]
    fn config_rejects_min_size_above_max_chars() {
        assert!(matches!(
            LineChunker::new(options(10, 2, 11)),
            Err(IngestError::InvalidChunkConfig(_))
        ));
        assert!(LineChunker::new(options(10, 2, 10)).is_ok());
    }

    #[test]
    fn page_change_vertical_and_horizontal_gaps_start_groups() -> Result<(), IngestError> {
        let chunker = LineChunker::new(options(1_000, 10, 0))?;
        let lines = vec![
            line("Full name of patient", 1, 0.10, 0.100, 0.30),
            line("Ali bin Hassan", 1, 0.31, 0.105, 0.50),
            line("far right column", 1, 0.80, 0.105, 0.95),
            line("next row", 1, 0.10, 0.200, 0.20),
            line("second page", 2, 0.10, 0.200, 0.20),
        ];

        let groups = chunker.group_lines(&lines);
        let texts: Vec<String> = groups.iter().map(|group| group_text(group)).collect();
        assert_eq!(
            texts,
            vec![
                "Full name of patient Ali bin Hassan",
                "far right column",
                "next row",
                "second page"
            ]
        );
        Ok(())
    }

    #[test]
    fn small_groups_merge_into_previous_buffer() -> Result<(), IngestError> {
        let chunker = LineChunker::new(options(1_000, 10, 20))?;
        let lines = vec![
            line("Diagnosis and management notes", 1, 0.1, 0.10, 0.5),
            line("Fever", 1, 0.1, 0.30, 0.2),
            line("A separate long paragraph of text", 1, 0.1, 0.50, 0.6),
        ];

        let chunks = chunker.chunk(&lines, "s3://bucket/a.pdf");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Diagnosis and management notes Fever");
        assert!((chunks[0].bbox.bottom - 0.31).abs() < 1e-9);
        assert_eq!(chunks[0].source, "s3://bucket/a.pdf#page=1");
        assert_eq!(chunks[1].sequence, 1);
        Ok(())
    }

    #[test]
    fn short_buffer_absorbs_following_group() -> Result<(), IngestError> {
        let chunker = LineChunker::new(options(1_000, 10, 20))?;
        let lines = vec![
            line("Allergies", 1, 0.1, 0.10, 0.2),
            line("Penicillin causes a rash on contact", 1, 0.1, 0.30, 0.6),
        ];

        let chunks = chunker.chunk(&lines, "a.pdf");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Allergies Penicillin causes a rash on contact");
        Ok(())
    }

    #[test]
    fn empty_groups_are_dropped() -> Result<(), IngestError> {
        let chunker = LineChunker::new(options(100, 10, 0))?;
        let lines = vec![line("   ", 1, 0.1, 0.1, 0.2), line("", 2, 0.1, 0.1, 0.2)];
        assert!(chunker.chunk(&lines, "a.pdf").is_empty());
        Ok(())
    }

    #[test]
    fn split_segments_respect_limit_and_overlap() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let segments = split_with_overlap(text, 20, 5);
        let chars: Vec<char> = text.chars().collect();

        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(segment.text.chars().count() <= 20);
        }
        for pair in segments.windows(2) {
            let earlier = &pair[0].range;
            let later = &pair[1].range;
            assert_eq!(later.start, earlier.end - 5);
            let tail: String = chars[earlier.end - 5..earlier.end].iter().collect();
            let head: String = chars[later.start..later.start + 5].iter().collect();
            assert_eq!(tail, head);
        }
        assert!(segments.last().is_some_and(|last| last.range.end == chars.len()));
    }

    #[test]
    fn split_points_fall_on_whitespace() {
        let text = "hypertension diabetes asthma bronchitis";
        let chars: Vec<char> = text.chars().collect();
        let segments = split_with_overlap(text, 15, 3);

        assert_eq!(segments[0].text, "hypertension");
        for segment in &segments {
            let end = segment.range.end;
            assert!(end == chars.len() || chars[end].is_whitespace());
        }
    }

    #[test]
    fn oversized_single_token_is_emitted_unsplit() {
        let token = "x".repeat(40);
        let text = format!("ab {token} cd");
        let segments = split_with_overlap(&text, 10, 2);
        assert!(segments.iter().any(|segment| segment.text == token));
        assert!(segments.iter().all(|segment| !segment.text.is_empty()));
    }

    #[test]
    fn long_token_after_a_cut_does_not_yield_an_overlap_only_segment() {
        let run = "x".repeat(30);
        let text = format!("aaaa bbbb {run}");
        let segments = split_with_overlap(&text, 10, 3);

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "aaaa bbbb");
        assert_eq!(segments[1].range.start, 6);
        assert!(segments[1].text.ends_with(&run));
        for pair in segments.windows(2) {
            assert!(pair[1].range.end > pair[0].range.end);
        }
    }

    #[test]
    fn long_token_chunks_stay_above_min_size() -> Result<(), IngestError> {
        let chunker = LineChunker::new(options(10, 3, 5))?;
        let text = format!("aaaa bbbb {}", "x".repeat(30));
        let lines = vec![line(&text, 1, 0.1, 0.1, 0.9)];

        let chunks = chunker.chunk(&lines, "a.pdf");
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.text.chars().count() >= 5, "short chunk: {}", chunk.text);
        }
        Ok(())
    }

    #[test]
    fn merge_keeps_every_chunk_but_the_last_above_min_size() -> Result<(), IngestError> {
        let chunker = LineChunker::new(options(200, 10, 25))?;
        let words = [
            "patient reports persistent cough",
            "no",
            "temperature recorded at thirty eight degrees in the evening",
            "ok",
            "follow up in two weeks with repeat chest imaging ordered",
            "end",
        ];
        let lines: Vec<Line> = words
            .iter()
            .enumerate()
            .map(|(index, text)| line(text, 1, 0.1, 0.1 + index as f64 * 0.1, 0.5))
            .collect();

        let chunks = chunker.chunk(&lines, "a.pdf");
        assert!(!chunks.is_empty());
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.text.chars().count() >= 25, "short chunk: {}", chunk.text);
        }
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 200);
            assert!(!chunk.text.is_empty());
        }
        Ok(())
    }
}
