// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! A wait job's rolling evidence window (recent frames and verdicts), the
//! prompt built from it, and the parser that turns a vision backend's raw
//! reply back into a structured [`Verdict`].

pub mod verdict;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

pub use verdict::{parse_verdict, Decision, Verdict};

#[derive(Debug, Clone)]
pub struct ContextFrame {
  pub jpeg: Vec<u8>,
  pub thumbnail: Vec<u8>,
  pub timestamp: DateTime<Utc>,
}

/// Rolling evidence a job accumulates across ticks: the last few frames and
/// the last few verdicts, used to build each new evaluation prompt.
pub struct JobContext {
  max_frames: usize,
  max_verdicts: usize,
  frames: VecDeque<ContextFrame>,
  verdicts: VecDeque<Verdict>,
  pub started_at: DateTime<Utc>,
  pub last_change_at: DateTime<Utc>,
}

impl JobContext {
  pub fn new(max_frames: usize, max_verdicts: usize, started_at: DateTime<Utc>) -> Self {
    JobContext {
      max_frames,
      max_verdicts,
      frames: VecDeque::new(),
      verdicts: VecDeque::new(),
      started_at,
      last_change_at: started_at,
    }
  }

  pub fn add_frame(&mut self, jpeg: Vec<u8>, thumbnail: Vec<u8>, timestamp: DateTime<Utc>) {
    self.last_change_at = timestamp;
    if self.frames.len() == self.max_frames {
      self.frames.pop_front();
    }
    self.frames.push_back(ContextFrame { jpeg, thumbnail, timestamp });
  }

  pub fn add_verdict(&mut self, verdict: Verdict) {
    if self.verdicts.len() == self.max_verdicts {
      self.verdicts.pop_front();
    }
    self.verdicts.push_back(verdict);
  }

  /// Builds the evaluation prompt text and the list of images to send
  /// alongside it: thumbnails of every frame but the last, followed by the
  /// full-resolution JPEG of the most recent frame.
  pub fn build_prompt(&self, criteria: &str, now: DateTime<Utc>) -> (String, Vec<Vec<u8>>) {
    let elapsed = now - self.started_at;
    let since_change = now - self.last_change_at;

    let mut verdict_lines = String::new();
    if self.verdicts.is_empty() {
      verdict_lines.push_str("(none yet)");
    } else {
      for verdict in &self.verdicts {
        let ago = format_duration((now - verdict.timestamp).num_seconds().max(0));
        verdict_lines.push_str(&format!(
          "- {ago} ago: {decision} — {summary}\n",
          decision = verdict.decision.as_str(),
          summary = verdict.summary
        ));
      }
    }

    let text = format!(
      "Evaluate whether the wait condition is satisfied using only visible evidence from the images.\n\n\
       CONDITION: {criteria}\n\n\
       Context:\n\
       - Elapsed since wait started: {elapsed}\n\
       - Time since last visible change: {since_change}\n\
       - Recent verdict history:\n{verdict_lines}\n\
       Decision policy:\n\
       - decision=resolved if the condition appears satisfied based on visible evidence (confidence >= 0.75 is enough — do not demand perfection).\n\
       - decision=partial if there is clear progress but the condition is not yet fully met.\n\
       - decision=watching only if the evidence is genuinely absent, unreadable, or contradicts the condition.\n\
       - Prefer resolving over watching when evidence is present but slightly ambiguous.\n\
       - Quote exact visible evidence (text/snippets) whenever possible.\n\n\
       Output contract (must follow exactly):\n\
       1) First write brief plain-text reasoning (2-6 lines).\n\
       2) Final line only:\n\
       FINAL_JSON: {{\"decision\":\"resolved|watching|partial\",\"confidence\":0.0,\"evidence\":[\"...\"],\"summary\":\"...\"}}\n",
      criteria = criteria,
      elapsed = format_duration(elapsed.num_seconds().max(0)),
      since_change = format_duration(since_change.num_seconds().max(0)),
      verdict_lines = verdict_lines,
    );

    let mut images: Vec<Vec<u8>> = self
      .frames
      .iter()
      .rev()
      .skip(1)
      .rev()
      .map(|f| f.thumbnail.clone())
      .collect();
    if let Some(last) = self.frames.back() {
      images.push(last.jpeg.clone());
    }

    (text, images)
  }
}

fn format_duration(total_seconds: i64) -> String {
  if total_seconds < 60 {
    format!("{total_seconds}s")
  } else if total_seconds < 3600 {
    format!("{}m{}s", total_seconds / 60, total_seconds % 60)
  } else {
    format!("{}h{}m", total_seconds / 3600, (total_seconds % 3600) / 60)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frames_and_verdicts_are_capped_to_their_window() {
    let now = Utc::now();
    let mut context = JobContext::new(2, 2, now);
    for i in 0..5u8 {
      context.add_frame(vec![i], vec![i], now);
    }
    assert_eq!(context.frames.len(), 2);
    assert_eq!(context.frames.back().unwrap().jpeg, vec![4]);
  }

  #[test]
  fn build_prompt_sends_thumbnails_then_the_last_full_frame() {
    let now = Utc::now();
    let mut context = JobContext::new(4, 3, now);
    context.add_frame(vec![1, 1], vec![1], now);
    context.add_frame(vec![2, 2], vec![2], now);
    let (text, images) = context.build_prompt("window says Done", now);
    assert!(text.contains("CONDITION: window says Done"));
    assert_eq!(images, vec![vec![1], vec![2, 2]]);
  }
}
