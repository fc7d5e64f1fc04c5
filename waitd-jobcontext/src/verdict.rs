// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Parses a vision backend's raw text reply into a structured [`Verdict`].
//! Never fails: a reply that cannot be understood becomes a `watching`
//! verdict carrying the (truncated) raw text as its summary, rather than an
//! error — a scheduler tick is never allowed to die on an unparseable
//! backend reply.

use chrono::{DateTime, Utc};
use serde::Deserialize;

const RAW_SUMMARY_TRUNCATE_LEN: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  Resolved,
  Partial,
  Watching,
}

impl Decision {
  pub fn as_str(self) -> &'static str {
    match self {
      Decision::Resolved => "resolved",
      Decision::Partial => "partial",
      Decision::Watching => "watching",
    }
  }
}

#[derive(Debug, Clone)]
pub struct Verdict {
  pub decision: Decision,
  pub confidence: f64,
  pub evidence: Vec<String>,
  pub summary: String,
  pub timestamp: DateTime<Utc>,
}

impl Verdict {
  /// The human-facing description spec.md §4.5 asks for: `summary`,
  /// stringified `evidence`, and `confidence` combined into one string.
  /// Used for the wait job's persisted result description and wake-event
  /// text; `summary` alone is used for the short per-verdict prompt history
  /// line in [`crate::JobContext::build_prompt`].
  pub fn description(&self) -> String {
    if self.evidence.is_empty() {
      return format!("{} (confidence {:.2})", self.summary, self.confidence);
    }
    format!("{} (confidence {:.2}; evidence: {})", self.summary, self.confidence, self.evidence.join("; "))
  }
}

#[derive(Deserialize)]
struct FinalJson {
  decision: String,
  #[serde(default)]
  confidence: f64,
  #[serde(default)]
  evidence: Vec<String>,
  #[serde(default)]
  summary: String,
}

/// Parses a backend's raw reply at the given timestamp.
///
/// Resolution order:
/// 1. Find a `FINAL_JSON: {...}` fragment and decode its JSON object.
///    A `watching` decision with confidence at or above `resolve_threshold`
///    and non-empty evidence is promoted to `partial`.
/// 2. Fall back to scanning lines for a `YES`/`PARTIAL`/`NO` prefix.
/// 3. Fall back to `watching`, with the (truncated) raw text as the summary.
pub fn parse_verdict(raw: &str, resolve_threshold: f64, timestamp: DateTime<Utc>) -> Verdict {
  if let Some(verdict) = parse_final_json(raw, resolve_threshold, timestamp) {
    return verdict;
  }
  if let Some(verdict) = parse_line_prefix(raw, timestamp) {
    return verdict;
  }
  Verdict {
    decision: Decision::Watching,
    confidence: 0.0,
    evidence: Vec::new(),
    summary: truncate(raw),
    timestamp,
  }
}

fn parse_final_json(raw: &str, resolve_threshold: f64, timestamp: DateTime<Utc>) -> Option<Verdict> {
  let marker = "FINAL_JSON:";
  let start = raw.find(marker)? + marker.len();
  let tail = raw[start..].trim_start();
  let json_start = tail.find('{')?;
  let json_end = find_matching_brace(&tail[json_start..])?;
  let json_str = &tail[json_start..json_start + json_end + 1];
  let parsed: FinalJson = serde_json::from_str(json_str).ok()?;

  let mut decision = match parsed.decision.as_str() {
    "resolved" => Decision::Resolved,
    "partial" => Decision::Partial,
    _ => Decision::Watching,
  };
  if decision == Decision::Watching && parsed.confidence >= resolve_threshold && !parsed.evidence.is_empty() {
    decision = Decision::Partial;
  }

  Some(Verdict {
    decision,
    confidence: parsed.confidence,
    evidence: parsed.evidence,
    summary: parsed.summary,
    timestamp,
  })
}

fn find_matching_brace(s: &str) -> Option<usize> {
  let mut depth = 0i32;
  let mut in_string = false;
  let mut escaped = false;
  for (i, c) in s.char_indices() {
    if in_string {
      if escaped {
        escaped = false;
      } else if c == '\\' {
        escaped = true;
      } else if c == '"' {
        in_string = false;
      }
      continue;
    }
    match c {
      '"' => in_string = true,
      '{' => depth += 1,
      '}' => {
        depth -= 1;
        if depth == 0 {
          return Some(i);
        }
      }
      _ => {}
    }
  }
  None
}

/// True if `upper` (already uppercased) starts with `prefix` as a whole
/// word — followed by `:`, whitespace, or end-of-string — so "NO" doesn't
/// false-positive on "Nothing visible yet" or "YES" on "Yesterday's state".
fn starts_with_word(upper: &str, prefix: &str) -> bool {
  upper.strip_prefix(prefix).is_some_and(|rest| match rest.chars().next() {
    None => true,
    Some(c) => c == ':' || c.is_whitespace(),
  })
}

fn parse_line_prefix(raw: &str, timestamp: DateTime<Utc>) -> Option<Verdict> {
  for line in raw.lines() {
    let trimmed = line.trim();
    let upper = trimmed.to_ascii_uppercase();
    if starts_with_word(&upper, "YES") {
      return Some(Verdict {
        decision: Decision::Resolved,
        confidence: 1.0,
        evidence: Vec::new(),
        summary: trimmed.to_owned(),
        timestamp,
      });
    }
    if starts_with_word(&upper, "PARTIAL") {
      return Some(Verdict {
        decision: Decision::Partial,
        confidence: 0.5,
        evidence: Vec::new(),
        summary: trimmed.to_owned(),
        timestamp,
      });
    }
    if starts_with_word(&upper, "NO") {
      return Some(Verdict {
        decision: Decision::Watching,
        confidence: 0.0,
        evidence: Vec::new(),
        summary: trimmed.to_owned(),
        timestamp,
      });
    }
  }
  None
}

fn truncate(raw: &str) -> String {
  if raw.len() <= RAW_SUMMARY_TRUNCATE_LEN {
    raw.to_owned()
  } else {
    let mut truncated = raw.chars().take(RAW_SUMMARY_TRUNCATE_LEN).collect::<String>();
    truncated.push('…');
    truncated
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
  }

  #[test]
  fn parses_final_json_resolved() {
    let raw = "I can see the dialog closed.\nFINAL_JSON: {\"decision\":\"resolved\",\"confidence\":0.9,\"evidence\":[\"dialog gone\"],\"summary\":\"done\"}";
    let v = parse_verdict(raw, 0.75, now());
    assert_eq!(v.decision, Decision::Resolved);
    assert_eq!(v.confidence, 0.9);
  }

  #[test]
  fn promotes_high_confidence_watching_with_evidence_to_partial() {
    let raw = "FINAL_JSON: {\"decision\":\"watching\",\"confidence\":0.9,\"evidence\":[\"text visible\"],\"summary\":\"x\"}";
    let v = parse_verdict(raw, 0.75, now());
    assert_eq!(v.decision, Decision::Partial);
  }

  #[test]
  fn does_not_promote_watching_without_evidence() {
    let raw = "FINAL_JSON: {\"decision\":\"watching\",\"confidence\":0.9,\"evidence\":[],\"summary\":\"x\"}";
    let v = parse_verdict(raw, 0.75, now());
    assert_eq!(v.decision, Decision::Watching);
  }

  #[test]
  fn falls_back_to_line_prefix_scan() {
    let v = parse_verdict("some preamble\nPARTIAL: getting there\n", 0.75, now());
    assert_eq!(v.decision, Decision::Partial);
  }

  #[test]
  fn line_prefix_scan_requires_a_word_boundary() {
    let v = parse_verdict("Nothing has changed on screen yet", 0.75, now());
    assert_eq!(v.decision, Decision::Watching);
    assert_eq!(v.summary, "Nothing has changed on screen yet");

    let v = parse_verdict("Yesterday's dialog is still open", 0.75, now());
    assert_eq!(v.decision, Decision::Watching);
    assert_eq!(v.summary, "Yesterday's dialog is still open");
  }

  #[test]
  fn falls_back_to_watching_on_garbage() {
    let v = parse_verdict("the model said something unparseable entirely", 0.75, now());
    assert_eq!(v.decision, Decision::Watching);
    assert!(!v.summary.is_empty());
  }

  #[test]
  fn handles_nested_braces_in_final_json() {
    let raw = "FINAL_JSON: {\"decision\":\"resolved\",\"confidence\":1.0,\"evidence\":[\"{nested}\"],\"summary\":\"ok\"}";
    let v = parse_verdict(raw, 0.75, now());
    assert_eq!(v.decision, Decision::Resolved);
    assert_eq!(v.evidence, vec!["{nested}".to_owned()]);
  }
}
