//! Placeholder detection
//!
//! Planners often fill parameters they cannot know with filler ("TBD",
//! "<facility id>", a date from years ago, an amount of exactly 1000) or with a
//! literal pointer at an earlier step's output ("EXTRACT_FROM_STEP_1",
//! "{{step-1.id}}"). Neither is a real value. The heuristics are approximate,
//! so they sit behind the [`PlaceholderPolicy`] trait and can be swapped.

use crate::conductor::types::{Plan, Step};
use crate::config::ValidatorConfig;
use chrono::{Datelike, Utc};
use regex::{Regex, RegexBuilder};
use sdk::errors::EngineError;
use serde_json::Value;
use std::sync::OnceLock;

/// A parameter value that points at another step's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackReference {
    /// Step as written: a bare number (`1`) or an id (`step-1`)
    pub target: String,
    /// Dotted path into the referenced result, if one was given
    pub path: Option<String>,
}

impl BackReference {
    /// Find the referenced step in `plan`.
    ///
    /// An exact id match wins; otherwise a step number matches `step-N`,
    /// `step_N`, `stepN` or a step whose order is `N`.
    pub fn resolve<'a>(&self, plan: &'a Plan) -> Option<&'a Step> {
        if let Some(step) = plan.step(&self.target) {
            return Some(step);
        }
        let number: u32 = self
            .target
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok()?;
        plan.steps
            .iter()
            .find(|s| {
                s.id == format!("step-{}", number)
                    || s.id == format!("step_{}", number)
                    || s.id == format!("step{}", number)
            })
            .or_else(|| plan.steps.iter().find(|s| s.order == number))
    }
}

/// Pluggable placeholder heuristics
pub trait PlaceholderPolicy: Send + Sync {
    /// Whether `value` for `param` is filler rather than real data
    fn is_placeholder(&self, param: &str, value: &Value) -> bool;

    /// Parse `value` as a pointer to another step's output
    fn back_reference(&self, value: &Value) -> Option<BackReference>;
}

fn back_reference_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // EXTRACT_FROM_STEP_1, extracted_from_step_2.id, "extract from step 3"
            r"^extract(?:ed)?[_\s-]+from[_\s-]+step[_\s-]*(\d+)(?:\.([\w.]+))?$",
            // {{step-1.id}}, {{ step_2.result.0.id }}
            r"^\{\{\s*(step[-_]?\d+|[\w-]+)(?:\.([\w.]+))?\s*\}\}$",
            // $step_1.id, ${step-1.id}
            r"^\$\{?(step[-_]?\d+)(?:\.([\w.]+))?\}?$",
        ]
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
    })
}

/// Regex, stale-date and round-number heuristics
#[derive(Debug, Clone)]
pub struct DefaultPlaceholderPolicy {
    patterns: Vec<Regex>,
    stale_year_window: i32,
}

impl DefaultPlaceholderPolicy {
    pub fn new(config: &ValidatorConfig) -> Result<Self, EngineError> {
        let patterns = config
            .placeholder_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p).case_insensitive(true).build().map_err(|e| {
                    EngineError::Config(format!("Invalid placeholder pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            stale_year_window: config.stale_year_window,
        })
    }

    fn is_stale_date(&self, text: &str) -> bool {
        static DATE: OnceLock<Option<Regex>> = OnceLock::new();
        let Some(date) = DATE
            .get_or_init(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})").ok())
            .as_ref()
        else {
            return false;
        };
        date.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|year| year.as_str().parse::<i32>().ok())
            .is_some_and(|year| year < Utc::now().year() - self.stale_year_window)
    }
}

/// Powers of ten from 100 up, and digit runs like 123 / 1234 / 999
fn is_suspicious_round_number(n: f64) -> bool {
    if n.fract() != 0.0 || n < 100.0 {
        return false;
    }
    let digits = format!("{}", n as u64);
    let power_of_ten = digits.starts_with('1') && digits[1..].chars().all(|c| c == '0');
    let ascending = "1234567890".starts_with(digits.as_str());
    let repeated_nines = digits.chars().all(|c| c == '9');
    power_of_ten || ascending || repeated_nines
}

fn is_amount_like(param: &str) -> bool {
    let lower = param.to_lowercase();
    ["amount", "size", "quantity", "qty", "price", "total", "cost"]
        .iter()
        .any(|word| lower.contains(word))
}

impl PlaceholderPolicy for DefaultPlaceholderPolicy {
    fn is_placeholder(&self, param: &str, value: &Value) -> bool {
        match value {
            Value::String(s) => {
                let text = s.trim();
                if text.is_empty() {
                    return false;
                }
                if self.patterns.iter().any(|p| p.is_match(text)) || self.is_stale_date(text) {
                    return true;
                }
                is_amount_like(param)
                    && text.parse::<f64>().is_ok_and(is_suspicious_round_number)
            }
            Value::Number(n) => {
                is_amount_like(param) && n.as_f64().is_some_and(is_suspicious_round_number)
            }
            _ => false,
        }
    }

    fn back_reference(&self, value: &Value) -> Option<BackReference> {
        let text = value.as_str()?.trim();
        back_reference_patterns().iter().find_map(|pattern| {
            let caps = pattern.captures(text)?;
            let target = caps.get(1)?.as_str().to_string();
            let path = caps
                .get(2)
                .map(|m| m.as_str())
                .map(|p| p.strip_prefix("result").unwrap_or(p).trim_start_matches('.'))
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            Some(BackReference { target, path })
        })
    }
}
