//! Request complexity scoring.
//!
//! Analyses a request and produces a complexity score in `0.0..=1.0` that
//! drives the routing rules:
//!
//! | Score (defaults) | Preferred backend                         |
//! |------------------|-------------------------------------------|
//! | `< 0.3`          | Fast local tier                           |
//! | `0.3 – 0.6`      | Secondary local tier                      |
//! | `>= 0.6`         | Cloud fallback (premium tenants only)     |
//!
//! ## Heuristics
//!
//! 1. **Prompt length** (whitespace words): `< 50` → 0.1, `< 200` → 0.3, else 0.5
//! 2. **Requested output**: `max_tokens >= 2048` → +0.2, `>= 1024` → +0.15
//! 3. **Code blocks**: fenced code (` ``` `) → +0.15
//! 4. **Multi-step instructions**: two or more numbered lines → +0.1
//! 5. **Analytical vocabulary**: "analyze", "compare", "prove", … → +0.1
//!
//! An empty or whitespace-only prompt scores `0.0`. Otherwise the raw sum is
//! clamped to `[0.0, 1.0]`.

use crate::InferenceRequest;

const ANALYTICAL_TERMS: [&str; 12] = [
    "analyze",
    "analyse",
    "compare",
    "contrast",
    "prove",
    "derive",
    "evaluate",
    "explain why",
    "trade-off",
    "tradeoff",
    "step by step",
    "justify",
];

/// A request complexity scorer.
///
/// Stateless and cheap to construct. Scoring is a single pass over the
/// prompt and is deterministic for identical input.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityScorer;

impl ComplexityScorer {
    /// Create a scorer.
    pub fn new() -> Self {
        Self
    }

    /// Score a request for complexity.
    ///
    /// # Example
    ///
    /// ```rust
    /// use edgellm_router::{ComplexityScorer, InferenceRequest};
    /// let scorer = ComplexityScorer::new();
    /// let score = scorer.score(&InferenceRequest::new("acme", "Say hello"));
    /// assert!(score < 0.3);
    /// ```
    pub fn score(&self, request: &InferenceRequest) -> f64 {
        self.breakdown(request).total
    }

    /// Score raw prompt text with an explicit output budget.
    pub fn score_prompt(&self, prompt: &str, max_tokens: u32) -> f64 {
        self.breakdown_prompt(prompt, max_tokens).total
    }

    /// Each signal's contribution, for logging and audit.
    pub fn breakdown(&self, request: &InferenceRequest) -> ScoreBreakdown {
        self.breakdown_prompt(&request.prompt, request.max_tokens)
    }

    /// Breakdown for raw prompt text.
    pub fn breakdown_prompt(&self, prompt: &str, max_tokens: u32) -> ScoreBreakdown {
        if prompt.trim().is_empty() {
            return ScoreBreakdown::default();
        }

        let length = length_signal(prompt);
        let output_size = output_size_signal(max_tokens);
        let code_blocks = code_block_signal(prompt);
        let multi_step = multi_step_signal(prompt);
        let analytical = analytical_signal(prompt);
        let total =
            clamp_score(length + output_size + code_blocks + multi_step + analytical);

        ScoreBreakdown {
            length,
            output_size,
            code_blocks,
            multi_step,
            analytical,
            total,
        }
    }
}

// ── Individual signals ─────────────────────────────────────────────────

fn length_signal(prompt: &str) -> f64 {
    match prompt.split_whitespace().count() {
        0..=49 => 0.1,
        50..=199 => 0.3,
        _ => 0.5,
    }
}

fn output_size_signal(max_tokens: u32) -> f64 {
    if max_tokens >= 2048 {
        0.2
    } else if max_tokens >= 1024 {
        0.15
    } else {
        0.0
    }
}

fn code_block_signal(prompt: &str) -> f64 {
    if prompt.contains("```") {
        0.15
    } else {
        0.0
    }
}

/// Counts lines that start with `N.` or `N)` after optional indentation.
fn multi_step_signal(prompt: &str) -> f64 {
    let numbered = prompt
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
            digits > 0 && matches!(trimmed[digits..].chars().next(), Some('.') | Some(')'))
        })
        .count();
    if numbered >= 2 {
        0.1
    } else {
        0.0
    }
}

fn analytical_signal(prompt: &str) -> f64 {
    let lower = prompt.to_lowercase();
    if ANALYTICAL_TERMS.iter().any(|t| lower.contains(t)) {
        0.1
    } else {
        0.0
    }
}

fn clamp_score(raw: f64) -> f64 {
    raw.clamp(0.0, 1.0)
}

/// Breakdown of individual complexity signal contributions.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct ScoreBreakdown {
    /// Prompt length band (0.1, 0.3 or 0.5).
    pub length: f64,
    /// Requested output size (0.0, 0.15 or 0.2).
    pub output_size: f64,
    /// Fenced code (0.0 or 0.15).
    pub code_blocks: f64,
    /// Numbered instructions (0.0 or 0.1).
    pub multi_step: f64,
    /// Analytical vocabulary (0.0 or 0.1).
    pub analytical: f64,
    /// Final clamped score in `[0.0, 1.0]`.
    pub total: f64,
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn test_empty_prompt_scores_zero() {
        let s = ComplexityScorer::new();
        assert!(approx(s.score_prompt("", 4096), 0.0));
        assert!(approx(s.score_prompt("   \n\t ", 4096), 0.0));
    }

    #[test]
    fn test_short_prompt_default_request_is_low() {
        let s = ComplexityScorer::new();
        let score = s.score(&InferenceRequest::new("t", "Say hello"));
        assert!(approx(score, 0.25), "0.1 length + 0.15 output, got {score}");
    }

    #[test]
    fn test_length_bands() {
        let s = ComplexityScorer::new();
        assert!(approx(s.breakdown_prompt(&words(49), 0).length, 0.1));
        assert!(approx(s.breakdown_prompt(&words(50), 0).length, 0.3));
        assert!(approx(s.breakdown_prompt(&words(199), 0).length, 0.3));
        assert!(approx(s.breakdown_prompt(&words(200), 0).length, 0.5));
    }

    #[test]
    fn test_output_size_bands() {
        assert!(approx(output_size_signal(512), 0.0));
        assert!(approx(output_size_signal(1024), 0.15));
        assert!(approx(output_size_signal(2048), 0.2));
    }

    #[test]
    fn test_code_fence_detected() {
        let b = ComplexityScorer::new().breakdown_prompt("fix this\n```rust\nfn main() {}\n```", 0);
        assert!(approx(b.code_blocks, 0.15));
    }

    #[test]
    fn test_multi_step_needs_two_numbered_lines() {
        assert!(approx(multi_step_signal("1. only one step"), 0.0));
        assert!(approx(multi_step_signal("1. first\n  2) second"), 0.1));
        assert!(approx(multi_step_signal("version 1.2 and 3.4"), 0.0));
    }

    #[test]
    fn test_analytical_vocabulary_case_insensitive() {
        assert!(approx(analytical_signal("Compare Rust and Go"), 0.1));
        assert!(approx(analytical_signal("say hi"), 0.0));
    }

    #[test]
    fn test_all_signals_clamp_to_one() {
        let prompt = format!(
            "{}\n1. analyze\n2. prove\n```\ncode\n```",
            words(300)
        );
        let b = ComplexityScorer::new().breakdown_prompt(&prompt, 4096);
        let raw = b.length + b.output_size + b.code_blocks + b.multi_step + b.analytical;
        assert!(raw > 1.0);
        assert!(approx(b.total, 1.0));
    }

    #[test]
    fn test_score_is_deterministic() {
        let s = ComplexityScorer::new();
        let req = InferenceRequest::new("t", "Explain why the sky is blue").with_max_tokens(2048);
        assert!(approx(s.score(&req), s.score(&req)));
    }

    #[test]
    fn test_score_always_in_unit_range() {
        let s = ComplexityScorer::new();
        for n in [0, 1, 49, 50, 199, 200, 5000] {
            for max in [0, 1024, 2048, u32::MAX] {
                let score = s.score_prompt(&words(n), max);
                assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
