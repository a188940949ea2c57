// Copyright (c) 2020, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use itertools::*;

use crate::api::Rational;
use crate::refs::ReferenceTopology;
use crate::serialize::{Deserialize, Serialize};

use std::fmt;

// Key frame scans run to twice the interval in i32 arithmetic.
pub(crate) const MAX_MAX_KEY_FRAME_INTERVAL: u64 = i32::MAX as u64 / 3;
// Deepest supported lookahead.
pub(crate) const MAX_LAG_IN_FRAMES: usize = 25;

/// Encoder settings which impact the frame schedule.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EncoderConfig {
  // output size
  /// Width of the frames in pixels.
  pub width: usize,
  /// Height of the frames in pixels.
  pub height: usize,
  /// Video time base.
  pub time_base: Rational,
  /// Bit depth.
  pub bit_depth: usize,

  // key frames
  /// The *minimum* interval between two detected key frames.
  pub min_key_frame_interval: u64,
  /// The *maximum* interval between two key frames.
  pub max_key_frame_interval: u64,
  /// Place key frames on scene cuts, and not only on the interval.
  pub auto_key: bool,

  // golden frame groups
  /// Shortest golden frame group.
  pub min_gf_interval: usize,
  /// Longest golden frame group, unless the content is static.
  pub max_gf_interval: usize,
  /// Longest golden frame group for static content.
  pub static_scene_max_gf_interval: usize,
  /// Number of source frames buffered ahead of the one being coded.
  pub lag_in_frames: usize,
  /// Allow alt-ref frames.
  pub enable_auto_arf: bool,
  /// Number of internal alt-ref layers per group.
  ///
  /// Only used with [`ReferenceTopology::Extended`].
  ///
  /// [`ReferenceTopology::Extended`]: ../refs/enum.ReferenceTopology.html
  pub max_extra_arfs: usize,
  /// Size of bi-predictive mini-groups, 0 disables them.
  pub bipred_group_interval: usize,
  /// Reference frames available to the codec.
  pub reference_topology: ReferenceTopology,

  // first pass
  /// Encoder speed, 0 being the slowest.
  pub speed: usize,
  /// Motion search range of the first pass, in pixels.
  pub first_pass_search_range: i16,
}

/// Default preset for EncoderConfig: it is a balance between quality and
/// speed. See [`with_speed_preset()`].
///
/// [`with_speed_preset()`]: struct.EncoderConfig.html#method.with_speed_preset
impl Default for EncoderConfig {
  fn default() -> Self {
    const DEFAULT_SPEED: usize = 1;
    Self::with_speed_preset(DEFAULT_SPEED)
  }
}

impl EncoderConfig {
  /// This is a preset which provides default settings according to a speed
  /// value in the range 0–8. Faster presets shorten the first pass motion
  /// search. Values above 8 behave like 8.
  pub fn with_speed_preset(speed: usize) -> Self {
    let speed = speed.min(8);
    EncoderConfig {
      width: 640,
      height: 480,
      time_base: Rational { num: 1, den: 30 },
      bit_depth: 8,

      min_key_frame_interval: 12,
      max_key_frame_interval: 240,
      auto_key: true,

      min_gf_interval: 4,
      max_gf_interval: 16,
      static_scene_max_gf_interval: 250,
      lag_in_frames: MAX_LAG_IN_FRAMES,
      enable_auto_arf: true,
      max_extra_arfs: 0,
      bipred_group_interval: 0,
      reference_topology: ReferenceTopology::Classic,

      speed,
      first_pass_search_range: 16 >> (speed / 3),
    }
  }

  /// Sets the minimum and maximum keyframe interval, handling special cases as needed.
  pub fn set_key_frame_interval(
    &mut self, min_interval: u64, max_interval: u64,
  ) {
    self.min_key_frame_interval = min_interval;

    // Map an input value of 0 to an infinite interval
    self.max_key_frame_interval = if max_interval == 0 {
      MAX_MAX_KEY_FRAME_INTERVAL
    } else {
      max_interval
    };
  }

  /// Returns the video frame rate computed from [`time_base`].
  ///
  /// [`time_base`]: #structfield.time_base
  pub fn frame_rate(&self) -> f64 {
    Rational::from_reciprocal(self.time_base).as_f64()
  }

  /// Whether alt-refs may be placed at all.
  #[inline]
  pub const fn altref_enabled(&self) -> bool {
    self.enable_auto_arf && self.lag_in_frames > 1
  }

  /// Longest golden group for static content, after the lookahead limit.
  pub fn effective_static_scene_max_gf_interval(&self) -> usize {
    if self.altref_enabled() {
      self.static_scene_max_gf_interval.min(self.lag_in_frames - 1)
    } else {
      self.static_scene_max_gf_interval
    }
  }
}

impl fmt::Display for EncoderConfig {
  fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
    let pairs = [
      ("keyint_min", self.min_key_frame_interval.to_string()),
      ("keyint_max", self.max_key_frame_interval.to_string()),
      ("auto_key", self.auto_key.to_string()),
      ("min_gf", self.min_gf_interval.to_string()),
      ("max_gf", self.max_gf_interval.to_string()),
      ("lag", self.lag_in_frames.to_string()),
      ("auto_arf", self.enable_auto_arf.to_string()),
      ("extra_arfs", self.max_extra_arfs.to_string()),
      ("bipred", self.bipred_group_interval.to_string()),
      ("refs", format!("{:?}", self.reference_topology)),
      ("speed", self.speed.to_string()),
    ];
    write!(
      f,
      "{}",
      pairs.iter().map(|pair| format!("{}={}", pair.0, pair.1)).join(" ")
    )
  }
}
