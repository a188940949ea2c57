// Copyright (c) 2020-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::api::config::TuningParams;
use crate::firstpass::{stats_from_slice, FirstPassRecord, StatsError};
use crate::quantize::MAXQ;
use crate::serialize::{Deserialize, Serialize};

use std::fmt;
use std::sync::Arc;

/// Rate control mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateMode {
  /// Variable bitrate, the usual two-pass mode.
  #[default]
  Vbr,
  /// Constrained quality: variable bitrate that never goes below
  /// `cq_level`.
  Cq,
  /// Two-pass planning with every section held to the average rate.
  Cbr,
  /// Fixed quantizer.
  Q,
}

impl fmt::Display for RateMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::RateMode::*;
    match self {
      Vbr => write!(f, "vbr"),
      Cq => write!(f, "cq"),
      Cbr => write!(f, "cbr"),
      Q => write!(f, "q"),
    }
  }
}

/// Rate control configuration
#[derive(Clone, Debug)]
pub struct RateControlConfig {
  /// Rate control mode.
  pub mode: RateMode,
  /// Target bitrate in bits per second.
  pub bitrate: i64,
  /// Best (lowest) qindex allowed.
  pub best_quality: u8,
  /// Worst (highest) qindex allowed.
  pub worst_quality: u8,
  /// Quality floor in constrained quality mode, and the quantizer in fixed
  /// Q mode.
  pub cq_level: u8,
  /// Smallest section rate, in percent of the average.
  pub vbr_min_section: u32,
  /// Largest section rate, in percent of the average.
  pub vbr_max_section: u32,
  /// How strongly bits follow frame complexity, in percent.
  pub vbr_bias: u32,
  /// Tolerated undershoot before the quantizer range is widened, percent.
  pub under_shoot_pct: i32,
  /// Tolerated overshoot before the quantizer range is widened, percent.
  pub over_shoot_pct: i32,
  /// Model constants.
  pub tuning: TuningParams,
  pub(crate) emit_pass_data: bool,
  pub(crate) stats: Option<Arc<[FirstPassRecord]>>,
}

impl Default for RateControlConfig {
  fn default() -> Self {
    RateControlConfig {
      mode: RateMode::Vbr,
      bitrate: 0,
      best_quality: 0,
      worst_quality: MAXQ,
      cq_level: 40,
      vbr_min_section: 0,
      vbr_max_section: 2000,
      vbr_bias: 50,
      under_shoot_pct: 25,
      over_shoot_pct: 25,
      tuning: TuningParams::default(),
      emit_pass_data: false,
      stats: None,
    }
  }
}

impl RateControlConfig {
  /// Create a rate control configuration from a first-pass stats stream
  ///
  /// # Errors
  ///
  /// Returns an error if the serialized data is invalid.
  pub fn from_stats_slice(bytes: &[u8]) -> Result<Self, StatsError> {
    Ok(Self::new().with_stats(stats_from_slice(bytes)?))
  }

  /// Create a default rate control configuration
  ///
  /// By default no pass is selected.
  pub fn new() -> Self {
    Default::default()
  }

  /// Set the first-pass statistics
  ///
  /// Enables the second pass.
  pub fn with_stats(mut self, stats: Vec<FirstPassRecord>) -> Self {
    self.stats = Some(stats.into());
    self
  }

  /// Emit the current pass data
  ///
  /// The pass data will be used in a second pass encoding session
  pub const fn with_emit_data(mut self, emit: bool) -> Self {
    self.emit_pass_data = emit;
    self
  }

  /// Set the rate control mode
  pub const fn with_mode(mut self, mode: RateMode) -> Self {
    self.mode = mode;
    self
  }

  /// Set the target bitrate in bits per second
  pub const fn with_bitrate(mut self, bitrate: i64) -> Self {
    self.bitrate = bitrate;
    self
  }

  /// Set the allowed qindex range
  pub const fn with_quality_bounds(mut self, best: u8, worst: u8) -> Self {
    self.best_quality = best;
    self.worst_quality = worst;
    self
  }

  /// Set the constrained quality level
  pub const fn with_cq_level(mut self, cq_level: u8) -> Self {
    self.cq_level = cq_level;
    self
  }

  /// Replace the model constants
  pub const fn with_tuning(mut self, tuning: TuningParams) -> Self {
    self.tuning = tuning;
    self
  }

  /// First-pass statistics of the second pass, if any.
  pub fn stats(&self) -> Option<&[FirstPassRecord]> {
    self.stats.as_deref()
  }

  /// Section limits as fractions of the average, after mode overrides.
  pub(crate) fn section_limits(&self) -> (f64, f64) {
    match self.mode {
      RateMode::Cbr => (1.0, 1.0),
      _ => {
        (self.vbr_min_section as f64 / 100.0, self.vbr_max_section as f64 / 100.0)
      }
    }
  }

  /// Bias exponent applied to frame scores.
  pub(crate) fn bias_exponent(&self) -> f64 {
    match self.mode {
      RateMode::Cbr => 0.0,
      _ => self.vbr_bias as f64 / 100.0,
    }
  }
}
