//! Output Comparator - Line-Oriented Exact Matching
//!
//! **Normalization Rules (Applied to Both Sides):**
//! - Split into lines (`\n` and `\r\n` both end a line)
//! - Trim trailing whitespace on each line: YES
//! - Drop trailing empty lines: YES
//! - Trim leading whitespace: NO (indentation is significant)
//! - Case sensitivity: YES
//! - Floating-point tolerance: NO
//!
//! Comparison is exact equality of the normalized line sequences.
//! Normalization is idempotent: `normalize(normalized_text(x)) == normalize(x)`.

/// Normalize output into comparable lines
pub fn normalize(output: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = output.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

/// Normalized output rejoined with `\n`, used for feedback diffs
pub fn normalized_text(output: &str) -> String {
    normalize(output).join("\n")
}

/// Compare produced output with the expected output
pub fn compare(actual: &str, expected: &str) -> bool {
    normalize(actual) == normalize(expected)
}
