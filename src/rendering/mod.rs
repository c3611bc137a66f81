//! Response rendering: verbosity levels and token budgets.
//!
//! Every tool pre-builds three strings (minimal, standard, verbose) and
//! returns the level-selected one. Rendering paths enforce a caller-supplied
//! token budget and advertise truncation in a footer line.

use crate::models::Verbosity;

/// Rough character-per-token ratio used for budget math.
pub const CHARS_PER_TOKEN: usize = 4;

/// Default per-result budget for list views.
pub const LIST_VIEW_TOKENS: usize = 500;

/// Default budget for single-id lookups.
pub const DETAIL_VIEW_TOKENS: usize = 1000;

/// Footer appended when output was cut to fit the budget.
const TRUNCATION_FOOTER: &str = "… [truncated to fit token budget]";

/// A tool response pre-built at all three verbosity levels.
#[derive(Debug, Clone)]
pub struct LeveledResponse {
    /// Bare results only.
    pub minimal: String,
    /// Results plus one line of framing.
    pub standard: String,
    /// Results, framing, and diagnostic detail.
    pub verbose: String,
}

impl LeveledResponse {
    /// Builds a response whose three levels share one string.
    #[must_use]
    pub fn uniform(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            minimal: text.clone(),
            standard: text.clone(),
            verbose: text,
        }
    }

    /// Selects the rendering for a verbosity level.
    #[must_use]
    pub fn select(&self, verbosity: Verbosity) -> &str {
        match verbosity {
            Verbosity::Minimal => &self.minimal,
            Verbosity::Standard => &self.standard,
            Verbosity::Verbose => &self.verbose,
        }
    }
}

/// Estimated token count of a string.
#[must_use]
pub const fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Cuts `text` to fit `max_tokens`, appending the truncation footer when
/// anything was dropped. The cut lands on a char boundary.
#[must_use]
pub fn enforce_token_budget(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    if text.len() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_FOOTER.len() + 1);
    let mut cut = keep;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = text[..cut].trim_end().to_string();
    out.push('\n');
    out.push_str(TRUNCATION_FOOTER);
    out
}

/// Returns true when the text carries the truncation footer.
#[must_use]
pub fn is_truncated(text: &str) -> bool {
    text.ends_with(TRUNCATION_FOOTER)
}

/// Hard-caps a string at `max_chars`, on a char boundary, with an ellipsis.
#[must_use]
pub fn clip_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", clipped.trim_end())
}

/// First non-empty line of a text.
#[must_use]
pub fn first_line(text: &str) -> &str {
    text.lines().find(|line| !line.trim().is_empty()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leveled_response_selects() {
        let response = LeveledResponse {
            minimal: "m".to_string(),
            standard: "s".to_string(),
            verbose: "v".to_string(),
        };
        assert_eq!(response.select(Verbosity::Minimal), "m");
        assert_eq!(response.select(Verbosity::Standard), "s");
        assert_eq!(response.select(Verbosity::Verbose), "v");
    }

    #[test]
    fn budget_within_limit_is_untouched() {
        let text = "short response";
        assert_eq!(enforce_token_budget(text, 100), text);
        assert!(!is_truncated(&enforce_token_budget(text, 100)));
    }

    #[test]
    fn budget_truncates_with_footer_within_tolerance() {
        let text = "x".repeat(10_000);
        let budget = 100;
        let out = enforce_token_budget(&text, budget);
        assert!(is_truncated(&out));
        // Within 5% of the advertised budget.
        assert!(out.len() <= budget * CHARS_PER_TOKEN * 105 / 100);
    }

    #[test]
    fn budget_cut_respects_char_boundaries() {
        let text = "é".repeat(5_000);
        let out = enforce_token_budget(&text, 50);
        assert!(is_truncated(&out));
    }

    #[test]
    fn clip_chars_adds_ellipsis() {
        assert_eq!(clip_chars("abcdef", 10), "abcdef");
        let clipped = clip_chars("abcdefghij", 5);
        assert!(clipped.ends_with('…'));
        assert!(clipped.chars().count() <= 5);
    }

    #[test]
    fn first_line_skips_blanks() {
        assert_eq!(first_line("\n\n  \nreal line\nmore"), "real line");
        assert_eq!(first_line(""), "");
    }
}
