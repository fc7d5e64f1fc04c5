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

//! A bounded scalar poll interval that widens when nothing is happening and
//! narrows when the target is actively changing or close to resolving.

const SLOWDOWN_FACTOR: f64 = 1.5;
const SPEEDUP_FACTOR_ON_PARTIAL: f64 = 0.5;
/// Number of consecutive no-change ticks tolerated before the interval
/// actually starts widening.
const STATIC_TICKS_BEFORE_SLOWDOWN: u32 = 5;

/// spec.md §4.4: "the alternative simpler profile is a fixed per-job
/// interval with no adaptation; both must be supported as a compile-time
/// or config choice." Selected per process via `waitd-config`'s
/// `poll_profile` and threaded into every job's [`AdaptivePoller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollProfile {
  /// Shrinks/widens the interval based on recent outcomes (the default).
  Adaptive,
  /// Holds the interval at the job's base interval; outcome callbacks are
  /// no-ops.
  Fixed,
}

pub struct AdaptivePoller {
  profile: PollProfile,
  min: f64,
  max: f64,
  base: f64,
  interval: f64,
  static_ticks: u32,
}

impl AdaptivePoller {
  /// `base_interval` falls back to `default_interval` (the configured
  /// `DEFAULT_POLL_INTERVAL`) if it is `None` or out of bounds, matching
  /// the reference poller's fallback-to-config-default behavior.
  pub fn new(base_interval: Option<f64>, default_interval: f64, min: f64, max: f64, profile: PollProfile) -> Self {
    let base = base_interval
      .filter(|v| *v > 0.0 && v.is_finite())
      .unwrap_or(default_interval)
      .clamp(min, max);
    AdaptivePoller { profile, min, max, base, interval: base, static_ticks: 0 }
  }

  pub fn interval(&self) -> f64 {
    self.interval
  }

  pub fn static_ticks(&self) -> u32 {
    self.static_ticks
  }

  /// The pixel-diff gate skipped evaluation: nothing visibly changed.
  /// Only widens the interval once the static streak exceeds the threshold,
  /// so a handful of quiet ticks doesn't immediately slow polling down.
  pub fn on_no_change(&mut self) {
    if self.profile == PollProfile::Fixed {
      return;
    }
    self.static_ticks += 1;
    if self.static_ticks > STATIC_TICKS_BEFORE_SLOWDOWN {
      self.interval = (self.interval * SLOWDOWN_FACTOR).min(self.max);
    }
  }

  /// The frame changed but the verdict was still `watching`. Something is
  /// happening; fall back to the base interval.
  pub fn on_change_no_match(&mut self) {
    if self.profile == PollProfile::Fixed {
      return;
    }
    self.static_ticks = 0;
    self.interval = self.base.clamp(self.min, self.max);
  }

  /// The verdict was `partial`: real progress toward the condition. Poll
  /// aggressively, we may resolve soon.
  pub fn on_partial(&mut self) {
    if self.profile == PollProfile::Fixed {
      return;
    }
    self.static_ticks = 0;
    self.interval = (self.interval * SPEEDUP_FACTOR_ON_PARTIAL).max(self.min);
  }

  /// The job resolved; no further scheduling decision needed.
  pub fn on_match(&mut self) {}
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn falls_back_to_the_configured_default_when_base_is_invalid() {
    let poller = AdaptivePoller::new(None, 2.0, 0.5, 15.0, PollProfile::Adaptive);
    assert_eq!(poller.interval(), 2.0);
    let poller = AdaptivePoller::new(Some(-1.0), 2.0, 0.5, 15.0, PollProfile::Adaptive);
    assert_eq!(poller.interval(), 2.0);
  }

  #[test]
  fn default_interval_out_of_bounds_is_clamped() {
    let poller = AdaptivePoller::new(None, 100.0, 0.5, 15.0, PollProfile::Adaptive);
    assert_eq!(poller.interval(), 15.0);
  }

  #[test]
  fn no_change_does_not_widen_until_streak_exceeds_threshold() {
    let mut poller = AdaptivePoller::new(Some(10.0), 2.0, 0.5, 15.0, PollProfile::Adaptive);
    for _ in 0..5 {
      poller.on_no_change();
    }
    assert_eq!(poller.interval(), 10.0);
    poller.on_no_change();
    assert_eq!(poller.static_ticks(), 6);
    assert_eq!(poller.interval(), 15.0);
  }

  #[test]
  fn partial_narrows_interval_down_to_min() {
    let mut poller = AdaptivePoller::new(Some(1.0), 2.0, 0.5, 15.0, PollProfile::Adaptive);
    poller.on_partial();
    assert_eq!(poller.interval(), 0.5);
  }

  #[test]
  fn change_without_match_resets_to_base_interval() {
    let mut poller = AdaptivePoller::new(Some(2.0), 2.0, 0.5, 15.0, PollProfile::Adaptive);
    for _ in 0..6 {
      poller.on_no_change();
    }
    assert!(poller.interval() > 2.0);
    poller.on_change_no_match();
    assert_eq!(poller.static_ticks(), 0);
    assert_eq!(poller.interval(), 2.0);
  }

  #[test]
  fn fixed_profile_never_adapts() {
    let mut poller = AdaptivePoller::new(Some(3.0), 2.0, 0.5, 15.0, PollProfile::Fixed);
    for _ in 0..10 {
      poller.on_no_change();
    }
    assert_eq!(poller.interval(), 3.0);
    poller.on_partial();
    assert_eq!(poller.interval(), 3.0);
    poller.on_change_no_match();
    assert_eq!(poller.interval(), 3.0);
  }
}
