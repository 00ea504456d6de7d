use serde::{Deserialize, Serialize};

/// A run of `len` lines following `line` (1-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub line: u32,
    pub len: u32,
}

/// A document mutation: `range.len` lines removed after `range.line`,
/// `replace_len` lines inserted in their place.
///
/// `len == 0` is a pure insert, `replace_len == 0` a pure delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditBlock {
    pub range: LineRange,
    #[serde(rename = "replaceLen")]
    pub replace_len: u32,
}

impl EditBlock {
    pub fn new(line: u32, len: u32, replace_len: u32) -> Self {
        Self {
            range: LineRange { line, len },
            replace_len,
        }
    }

    pub fn insert(line: u32, count: u32) -> Self {
        Self::new(line, 0, count)
    }

    pub fn delete(line: u32, count: u32) -> Self {
        Self::new(line, count, 0)
    }

    /// Net change in document length
    pub fn delta(&self) -> i64 {
        i64::from(self.replace_len) - i64::from(self.range.len)
    }

    /// Build a block from an editor content change.
    ///
    /// Positions are zero-indexed, as editors report them. A change that
    /// starts at column 0 with an empty column span lands "after" the
    /// previous line, so its block line is one less.
    pub fn from_text_change(
        start_line: u32,
        start_char: u32,
        end_line: u32,
        end_char: u32,
        text: &str,
    ) -> Self {
        let at_line_start = start_char == 0 && end_char == 0;
        let line = start_line + 1 - u32::from(at_line_start);
        let len = end_line.saturating_sub(start_line);
        Self::new(line, len, count_line_breaks(text))
    }
}

/// Count line breaks, treating `\r\n` as a single break
fn count_line_breaks(text: &str) -> u32 {
    let mut count = 0;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => count += 1,
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                count += 1;
            }
            _ => {}
        }
    }
    count
}

/// Range part of a [`DiffBlock`], carrying the replacement lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRange {
    pub line: u32,
    pub len: u32,
    #[serde(default)]
    pub content: Vec<String>,
}

/// A peer change to be materialised in the editor.
///
/// The editor collaborator applies the content; the core only uses the
/// block to reposition markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffBlock {
    pub range: DiffRange,
    #[serde(rename = "replaceLen")]
    pub replace_len: u32,
}

impl DiffBlock {
    pub fn edit_block(&self) -> EditBlock {
        EditBlock::new(self.range.line, self.range.len, self.replace_len)
    }

    pub fn content(&self) -> &[String] {
        &self.range.content
    }

    pub fn is_insert(&self) -> bool {
        self.range.len == 0 && self.replace_len > 0
    }

    pub fn is_delete(&self) -> bool {
        self.replace_len == 0
    }
}
