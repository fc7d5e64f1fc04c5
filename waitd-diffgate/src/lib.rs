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

//! Decides whether a newly captured frame is different enough from the last
//! one to be worth an (expensive) vision-backend evaluation. Forces
//! evaluation on the first frame and whenever the frame's shape changes
//! (a window resize).

use waitd_frame::Frame;

const DIFF_THRESHOLD_8BIT: i16 = 10;

/// Downsamples by integer-stride decimation (cheap, no interpolation) so
/// that comparisons stay fast even on large displays.
fn downsample(frame: &Frame, max_width: u32) -> (u32, u32, Vec<u8>) {
  if frame.width <= max_width {
    return (frame.width, frame.height, frame.rgb.to_vec());
  }
  let stride = (frame.width + max_width - 1) / max_width;
  let small_width = frame.width / stride;
  let small_height = frame.height / stride;
  let mut out = Vec::with_capacity((small_width * small_height * 3) as usize);
  for y in 0..small_height {
    for x in 0..small_width {
      let src_x = x * stride;
      let src_y = y * stride;
      let idx = ((src_y * frame.width + src_x) * 3) as usize;
      out.extend_from_slice(&frame.rgb[idx..idx + 3]);
    }
  }
  (small_width, small_height, out)
}

struct Downsampled {
  width: u32,
  height: u32,
  pixels: Vec<u8>,
}

/// Stateful gate: remembers the last (downsampled) frame it was shown and
/// reports how much the newest frame differs from it.
pub struct PixelDiffGate {
  max_width: u32,
  threshold: f64,
  last: Option<Downsampled>,
  pub last_diff_pct: f64,
}

impl PixelDiffGate {
  pub fn new(max_width: u32, threshold: f64) -> Self {
    PixelDiffGate { max_width, threshold, last: None, last_diff_pct: 0.0 }
  }

  /// Returns `true` if this frame should be sent to the vision backend.
  ///
  /// Always stores the downsampled frame it was just shown, even on a
  /// forced (first-frame or shape-mismatch) evaluation — matching the
  /// reference gate, which never special-cases those paths when updating
  /// its stored frame (see DESIGN.md's resolution of this open question).
  pub fn should_evaluate(&mut self, frame: &Frame) -> bool {
    let (width, height, pixels) = downsample(frame, self.max_width);

    let forced = match &self.last {
      None => true,
      Some(last) => last.width != width || last.height != height,
    };

    if forced {
      self.last_diff_pct = 1.0;
      self.last = Some(Downsampled { width, height, pixels });
      return true;
    }

    let last = self.last.as_ref().expect("checked above");
    let num_pixels = (width * height) as usize;
    let mut changed = 0usize;
    for px in 0..num_pixels {
      let base = px * 3;
      let mut channel_sum_diff = 0i16;
      for c in 0..3 {
        let a = last.pixels[base + c] as i16;
        let b = pixels[base + c] as i16;
        channel_sum_diff += (a - b).abs();
      }
      if channel_sum_diff > DIFF_THRESHOLD_8BIT {
        changed += 1;
      }
    }
    self.last_diff_pct = changed as f64 / num_pixels as f64;
    self.last = Some(Downsampled { width, height, pixels });

    self.last_diff_pct > self.threshold
  }

  pub fn reset(&mut self) {
    self.last = None;
    self.last_diff_pct = 0.0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn solid_frame(width: u32, height: u32, value: u8) -> Frame {
    Frame { width, height, rgb: Arc::from(vec![value; (width * height * 3) as usize]) }
  }

  #[test]
  fn first_frame_always_forces_evaluation() {
    let mut gate = PixelDiffGate::new(320, 0.01);
    assert!(gate.should_evaluate(&solid_frame(10, 10, 0)));
  }

  #[test]
  fn identical_frames_do_not_force_evaluation() {
    let mut gate = PixelDiffGate::new(320, 0.01);
    let frame = solid_frame(10, 10, 128);
    assert!(gate.should_evaluate(&frame));
    assert!(!gate.should_evaluate(&frame));
    assert_eq!(gate.last_diff_pct, 0.0);
  }

  #[test]
  fn large_change_forces_evaluation() {
    let mut gate = PixelDiffGate::new(320, 0.01);
    assert!(gate.should_evaluate(&solid_frame(10, 10, 0)));
    assert!(gate.should_evaluate(&solid_frame(10, 10, 255)));
  }

  #[test]
  fn shape_change_forces_evaluation_even_if_pixels_similar() {
    let mut gate = PixelDiffGate::new(320, 0.01);
    assert!(gate.should_evaluate(&solid_frame(10, 10, 50)));
    assert!(gate.should_evaluate(&solid_frame(20, 20, 50)));
  }

  #[test]
  fn reset_forgets_the_stored_frame() {
    let mut gate = PixelDiffGate::new(320, 0.01);
    let frame = solid_frame(10, 10, 50);
    assert!(gate.should_evaluate(&frame));
    assert!(!gate.should_evaluate(&frame));
    gate.reset();
    assert!(gate.should_evaluate(&frame));
  }
}
