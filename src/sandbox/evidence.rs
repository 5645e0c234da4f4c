use serde::{Deserialize, Serialize};

pub const MAX_PHASE_LOG_BYTES: usize = 16 * 1024;
pub const MAX_HIGHLIGHTS: usize = 10;

const TRUNCATION_MARKER: &str = "[truncated]\n";

const HIGHLIGHT_MARKERS: [&str; 14] = [
    "npm ERR!",
    "ERESOLVE",
    "Cannot find module",
    "ERROR:",
    "No matching distribution found",
    "Could not find a version",
    "incompatible",
    "peer dep",
    "Traceback (most recent call last)",
    "ModuleNotFoundError:",
    "ImportError:",
    "SyntaxError:",
    "TypeError:",
    "ReferenceError:",
];

/// Keeps the last `max_bytes` of `log`, cut on a char boundary.
pub fn tail_truncate(log: &str, max_bytes: usize) -> String {
    if log.len() <= max_bytes {
        return log.to_string();
    }
    let mut start = log.len() - max_bytes;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    format!("{TRUNCATION_MARKER}{}", &log[start..])
}

/// Lines worth surfacing to a diagnoser, in log order, deduplicated.
pub fn extract_highlights(log: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in log.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let interesting = HIGHLIGHT_MARKERS
            .iter()
            .any(|marker| trimmed.contains(marker));
        if interesting && !out.iter().any(|seen| seen == trimmed) {
            out.push(trimmed.to_string());
            if out.len() == MAX_HIGHLIGHTS {
                break;
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFramework {
    Jest,
    Mocha,
    Pytest,
    Unittest,
    ExitCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub framework: TestFramework,
    #[serde(default)]
    pub passed: Option<u32>,
    #[serde(default)]
    pub failed: Option<u32>,
    pub exit_code: i32,
}

impl TestSummary {
    pub fn passed_overall(&self) -> bool {
        self.exit_code == 0 && self.failed.unwrap_or(0) == 0
    }
}

fn tokens(line: &str) -> Vec<&str> {
    line.split(|c: char| c.is_whitespace() || matches!(c, ',' | '(' | ')' | '=' | ':'))
        .filter(|token| !token.is_empty())
        .collect()
}

/// Number immediately preceding a token that starts with `word`.
fn count_before(tokens: &[&str], word: &str) -> Option<u32> {
    tokens
        .windows(2)
        .filter(|pair| pair[1].starts_with(word))
        .find_map(|pair| pair[0].parse().ok())
}

/// Number immediately following a token equal to `word`.
fn count_after(tokens: &[&str], word: &str) -> Option<u32> {
    tokens
        .windows(2)
        .filter(|pair| pair[0] == word)
        .find_map(|pair| pair[1].parse().ok())
}

fn sum(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

/// Best-effort summary of a test run's output. The exit code always
/// participates; parsed counts only add detail.
pub fn parse_test_summary(output: &str, exit_code: i32) -> TestSummary {
    let mut summary = TestSummary {
        framework: TestFramework::ExitCode,
        passed: None,
        failed: None,
        exit_code,
    };
    let mut unittest_ran: Option<u32> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        let toks = tokens(trimmed);
        if trimmed.starts_with("Tests:") {
            summary.framework = TestFramework::Jest;
            summary.passed = count_before(&toks, "passed").or(Some(0));
            summary.failed = count_before(&toks, "failed").or(Some(0));
        } else if toks.len() >= 2 && (toks[1] == "passing" || toks[1] == "failing") {
            summary.framework = TestFramework::Mocha;
            if toks[1] == "passing" {
                summary.passed = toks[0].parse().ok();
                summary.failed.get_or_insert(0);
            } else {
                summary.failed = toks[0].parse().ok();
            }
        } else if trimmed.starts_with("Ran ") && toks.get(2).is_some_and(|t| t.starts_with("test")) {
            summary.framework = TestFramework::Unittest;
            unittest_ran = toks.get(1).and_then(|t| t.parse().ok());
        } else if summary.framework == TestFramework::Unittest && trimmed.starts_with("OK") {
            summary.failed = Some(0);
            summary.passed = unittest_ran;
        } else if summary.framework == TestFramework::Unittest && trimmed.starts_with("FAILED") {
            let failed = sum(count_after(&toks, "failures"), count_after(&toks, "errors"));
            summary.failed = failed;
            summary.passed = match (unittest_ran, failed) {
                (Some(ran), Some(failed)) => Some(ran.saturating_sub(failed)),
                _ => None,
            };
        } else if is_pytest_summary(&toks) {
            summary.framework = TestFramework::Pytest;
            summary.passed = count_before(&toks, "passed").or(Some(0));
            summary.failed = sum(count_before(&toks, "failed"), count_before(&toks, "error"))
                .or(Some(0));
        }
    }
    summary
}

fn is_pytest_summary(toks: &[&str]) -> bool {
    let has_outcome = count_before(toks, "passed").is_some()
        || count_before(toks, "failed").is_some()
        || count_before(toks, "error").is_some();
    let has_duration = toks
        .windows(2)
        .any(|pair| pair[0] == "in" && pair[1].ends_with('s'));
    has_outcome && has_duration
}
