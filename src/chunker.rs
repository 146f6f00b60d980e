//! Structure-aware source chunker.
//!
//! Splits a source file's text into [`ChunkSpan`]s. For recognized
//! languages the split happens at top-level definition boundaries
//! (`def`/`class` for Python, `- name:` task items for YAML/Ansible) so
//! each structural unit becomes a candidate chunk. Any candidate longer
//! than `chunk_size` characters is re-split with a fixed-size sliding
//! window using `chunk_overlap` characters of overlap, preserving context
//! across a cut boundary.
//!
//! Chunking is a pure function of its inputs: re-invoking it for the same
//! file yields the same spans, which is what makes re-vectorization of an
//! unchanged repository idempotent.

use crate::models::ChunkSpan;

/// Infer the chunk language from a file extension.
pub fn language_from_path(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "py" => "python",
        "yml" | "yaml" => "yaml",
        "rs" => "rust",
        "go" => "go",
        "js" => "javascript",
        "ts" => "typescript",
        "sh" => "shell",
        "java" => "java",
        "rb" => "ruby",
        _ => "unknown",
    }
}

/// Split text into spans respecting `chunk_size` and `chunk_overlap`.
///
/// Empty or whitespace-only input yields zero spans, not an error.
/// `chunk_overlap` must be smaller than `chunk_size` (enforced at config
/// load).
pub fn chunk_text(
    text: &str,
    language: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<ChunkSpan> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let line_of = line_numbers(&chars);
    let units = structural_units(text, language, &chars);

    let mut spans = Vec::new();
    for unit in units {
        windowed_spans(
            &chars,
            &line_of,
            &unit,
            chunk_size,
            chunk_overlap,
            &mut spans,
        );
    }

    spans
}

/// A contiguous region of the file, in char offsets, aligned with one
/// top-level definition (or the whole file when no structure was found).
struct Unit {
    start: usize,
    end: usize,
    function_name: Option<String>,
}

/// 1-based line number for every char index.
fn line_numbers(chars: &[char]) -> Vec<u32> {
    let mut line_of = Vec::with_capacity(chars.len());
    let mut line = 1u32;
    for &c in chars {
        line_of.push(line);
        if c == '\n' {
            line += 1;
        }
    }
    line_of
}

/// Scan for top-level definition boundaries. Returns one unit per
/// structural block, with any preamble before the first boundary as its
/// own unit. Falls back to a single whole-file unit when the language is
/// not recognized or no boundaries are found.
fn structural_units(text: &str, language: &str, chars: &[char]) -> Vec<Unit> {
    let mut boundaries: Vec<(usize, Option<String>)> = Vec::new();

    if matches!(language, "python" | "yaml") {
        let mut offset = 0usize;
        for line in text.split_inclusive('\n') {
            if let Some(name) = boundary_symbol(line, language) {
                boundaries.push((offset, name));
            }
            offset += line.chars().count();
        }
    }

    if boundaries.is_empty() {
        return vec![Unit {
            start: 0,
            end: chars.len(),
            function_name: None,
        }];
    }

    let mut units = Vec::new();
    if boundaries[0].0 > 0 {
        units.push(Unit {
            start: 0,
            end: boundaries[0].0,
            function_name: None,
        });
    }
    for (i, (start, name)) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(i + 1)
            .map(|(next, _)| *next)
            .unwrap_or(chars.len());
        units.push(Unit {
            start: *start,
            end,
            function_name: name.clone(),
        });
    }

    units
}

/// If `line` opens a top-level structural block, return the symbol name it
/// defines (when one can be extracted).
fn boundary_symbol(line: &str, language: &str) -> Option<Option<String>> {
    match language {
        "python" => {
            let def = line
                .strip_prefix("def ")
                .or_else(|| line.strip_prefix("async def "));
            if let Some(rest) = def {
                return Some(symbol_before(rest, &['(', ':', ' ']));
            }
            if let Some(rest) = line.strip_prefix("class ") {
                return Some(symbol_before(rest, &['(', ':', ' ']));
            }
            None
        }
        "yaml" => line
            .strip_prefix("- name:")
            .map(|rest| Some(rest.trim().trim_matches('"').to_string()).filter(|s| !s.is_empty())),
        _ => None,
    }
}

fn symbol_before(rest: &str, stops: &[char]) -> Option<String> {
    let name: String = rest.chars().take_while(|c| !stops.contains(c)).collect();
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Emit spans for one unit, sliding a `chunk_size` window with
/// `chunk_overlap` overlap when the unit is too large to fit in one chunk.
fn windowed_spans(
    chars: &[char],
    line_of: &[u32],
    unit: &Unit,
    chunk_size: usize,
    chunk_overlap: usize,
    out: &mut Vec<ChunkSpan>,
) {
    let len = unit.end - unit.start;
    if len == 0 {
        return;
    }

    let step = chunk_size.saturating_sub(chunk_overlap).max(1);
    let mut win_start = unit.start;

    loop {
        let win_end = (win_start + chunk_size).min(unit.end);
        let content: String = chars[win_start..win_end].iter().collect();

        if !content.trim().is_empty() {
            out.push(ChunkSpan {
                content,
                start_line: line_of[win_start],
                end_line: line_of[win_end - 1],
                function_name: unit.function_name.clone(),
            });
        }

        if win_end == unit.end {
            break;
        }
        win_start += step;
    }
}
