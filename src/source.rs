//! Source listings around a line, for the `list` command.

use std::fmt::Display;
use std::path::Path;

use crate::errors::Result;

/// Default number of lines shown on each side of the listed line
pub const DEFAULT_LIST_RANGE: u64 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub file: String,
    pub line: u64,
    pub lines: Vec<(u64, String)>,
}

impl Listing {
    /// Reads `path` and keeps the lines `line - range ..= line + range`
    ///
    /// # Errors
    ///
    /// Fails if the file can not be read.
    pub fn read(path: impl AsRef<Path>, line: u64, range: u64) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_source(&path.to_string_lossy(), &content, line, range))
    }

    #[must_use]
    pub fn from_source(file: &str, content: &str, line: u64, range: u64) -> Self {
        let first = line.saturating_sub(range).max(1);
        let last = line.saturating_add(range);
        let lines = content
            .lines()
            .enumerate()
            .map(|(i, text)| (i as u64 + 1, text))
            .skip_while(|(n, _)| *n < first)
            .take_while(|(n, _)| *n <= last)
            .map(|(n, text)| (n, text.to_string()))
            .collect();
        Self {
            file: file.to_string(),
            line,
            lines,
        }
    }
}

impl Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "list {}:{}", self.file, self.line)?;
        for (n, text) in &self.lines {
            let marker = if *n == self.line { "==>" } else { "   " };
            writeln!(f, "{marker}{n:>7}: {text}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PROGRAM: &str = "package main\n\nimport \"fmt\"\n\nfunc p() {\n\ti := 20\n\t_ = i\n}\n\nfunc main() {\n\tp()\n\tfmt.Println(\"done\")\n}\n";

    #[test]
    fn test_listing_window() {
        let listing = Listing::from_source("main.go", PROGRAM, 6, 2);
        let numbers: Vec<u64> = listing.lines.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![4, 5, 6, 7, 8]);

        let text = listing.to_string();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("list main.go:6"));
        assert_eq!(lines.next(), Some("         4: "));
        assert_eq!(lines.next(), Some("         5: func p() {"));
        assert_eq!(lines.next(), Some("==>      6: \ti := 20"));
    }

    #[test]
    fn test_listing_clamps_at_file_edges() {
        let start = Listing::from_source("main.go", PROGRAM, 1, 3);
        assert_eq!(start.lines.first().map(|(n, _)| *n), Some(1));
        assert_eq!(start.lines.len(), 4);

        let end = Listing::from_source("main.go", PROGRAM, 13, 6);
        assert_eq!(end.lines.last().map(|(n, _)| *n), Some(13));
        assert_eq!(end.lines.first().map(|(n, _)| *n), Some(7));
    }

    #[test]
    fn test_read_missing_file() {
        assert!(Listing::read("/does/not/exist.go", 1, 1).is_err());
    }
}
