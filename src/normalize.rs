use serde::Deserialize;

/// How program output is matched against the expected answer.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareMode {
    /// Both sides are normalized, then compared for exact equality.
    #[default]
    Standard,
    /// Byte-for-byte comparison without normalization.
    Strict,
}

impl CompareMode {
    pub fn matches(self, actual: &str, expected: &str) -> bool {
        match self {
            CompareMode::Standard => normalize(actual) == normalize(expected),
            CompareMode::Strict => actual == expected,
        }
    }
}

/// Canonicalizes program output before comparison.
///
/// Trailing whitespace is stripped from every line (which also drops `\r`
/// from CRLF line endings) and trailing empty lines are removed.
/// Leading whitespace and interior blank lines are significant.
pub fn normalize(output: &str) -> String {
    let mut normalized = output
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");

    let kept = normalized.trim_end().len();
    normalized.truncate(kept);
    normalized
}
