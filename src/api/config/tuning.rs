// Copyright (c) 2020-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::serialize::{Deserialize, Serialize};

/// Empirical constants of the two-pass model.
///
/// These are tuned heuristics, not derived quantities. The defaults match
/// long-standing encoder behaviour and are rarely worth changing outside of
/// experiments.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningParams {
  /// Exponent applied to the active area when scoring a frame.
  pub act_area_correction: f64,
  /// Exponent applied to the zero motion fraction in the prediction decay.
  pub zm_power_factor: f64,
  /// Floor of the cumulative prediction decay.
  pub min_decay_factor: f64,
  /// Error per macroblock that maps to a boost of `boost_factor`.
  pub baseline_err_per_mb: f64,
  /// `baseline_err_per_mb` for frames of at most 352x288.
  pub low_res_err_per_mb: f64,
  /// `baseline_err_per_mb` for frames of at least 1920x1080.
  pub high_res_err_per_mb: f64,
  /// Multiplier from inter error ratio to frame boost.
  pub boost_factor: f64,
  /// Cap on the boost contributed by one frame to a golden/alt-ref.
  pub gf_max_boost: f64,
  /// Cap on the boost contributed by one frame to a key frame.
  pub kf_max_frame_boost: f64,
  /// Cap on an alt-ref boost, per scanned frame.
  pub arf_boost_per_frame_cap: i32,
  /// Lowest alt-ref or golden boost.
  pub min_arf_gf_boost: i32,
  /// Lowest key frame boost.
  pub min_kf_boost: i32,
  /// Highest key frame boost.
  pub max_kf_boost: i32,

  /// Second reference usage below which a scene cut is plausible.
  pub second_ref_usage_thresh: f64,
  /// Inter fraction below which a frame is treated as a scene cut.
  pub very_low_inter_thresh: f64,
  /// Lowest intra fraction for the intra dominance test.
  pub min_intra_level: f64,
  /// Intra vs. inter dominance ratio.
  pub intra_vs_inter_thresh: f64,
  /// Highest intra/coded error ratio of a key frame candidate.
  pub kf_ii_err_threshold: f64,
  /// Relative error change that marks a discontinuity.
  pub err_change_threshold: f64,
  /// Intra/coded ratio of the next frame that signals recovery.
  pub ii_improvement_threshold: f64,
  /// Cap on the intra/inter ratio during key frame validation.
  pub kf_ii_max: f64,
  /// Intra/coded ratio below which a spike reads as a slide transition.
  pub very_low_ii: f64,
  /// Coded error ratio to both neighbours that counts as a spike.
  pub error_spike: f64,
  /// Intra error below which a frame is nearly flat.
  pub v_low_intra: f64,
  /// Frames examined when validating a key frame candidate.
  pub kf_validation_frames: usize,
  /// Boost a candidate must reach to be accepted as a key frame.
  pub kf_min_boost_score: f64,

  /// Intra/coded ratio below which neutral blocks are not counted as
  /// inter.
  pub ncount_frame_ii_thresh: f64,
  /// Second reference error difference below which it is ignored.
  pub low_sr_diff_thresh: f64,
  /// Cap on the second reference error difference.
  pub sr_diff_max: f64,
  /// Weight of the second reference error difference.
  pub sr_diff_part: f64,
  /// Weight of the motion amplitude.
  pub motion_amp_part: f64,
  /// Weight of the intra percentage.
  pub intra_part: f64,
  /// Lower bound on the second reference decay.
  pub default_decay_limit: f64,

  /// Zero motion accumulator above which content counts as static.
  pub static_zm_thresh: f64,
  /// Accumulated absolute zoom that ends a golden group.
  pub zoom_breakout: f64,
  /// Key frame group zero motion percentage above which golden groups
  /// are not capped at the active maximum interval.
  pub static_kf_group_thresh: i32,

  /// Base error divisor of the quantizer model.
  pub err_divisor: f64,
  /// Macroblock count that leaves the error divisor unchanged.
  pub ediv_size_factor: f64,
  /// Power term breakpoints of the correction factor, every 32 qindex.
  pub q_pow_term: [f64; 9],
  /// Fraction shaved off the last normal frame of a multi alt-ref group
  /// and given to its middle frame, as `(num, den)`.
  pub last_frame_reduction: (i64, i64),

  /// Boost below which key frames use the high motion minq table.
  pub kf_low: i32,
  /// Boost above which key frames use the low motion minq table.
  pub kf_high: i32,
  /// Boost below which golden frames use the high motion minq table.
  pub gf_low: i32,
  /// Boost above which golden frames use the low motion minq table.
  pub gf_high: i32,
  /// Lower bound of the drift weight on the group quantizer estimate.
  pub rc_factor_min: f64,
  /// Upper bound of the drift weight on the group quantizer estimate.
  pub rc_factor_max: f64,
  /// Highest `extend_minq` outside of constrained quality.
  pub minq_adj_limit: i32,
  /// Highest `extend_minq` in constrained quality.
  pub minq_adj_limit_cq: i32,
  /// Largest per frame correction from the accumulated error, percent.
  pub vbr_pct_adjustment_limit: i64,
  /// Undershoot ratio that triggers fast correction.
  pub high_undershoot_ratio: i64,
  /// Golden zero motion (per mille) at or above which the quantizer range
  /// is not extended.
  pub vlow_motion_threshold: i32,
  /// Key frame zero motion (percent) at which content is static.
  pub static_motion_thresh: i32,
  /// Lower bound of a rate correction factor.
  pub min_bpb_factor: f64,
  /// Upper bound of a rate correction factor.
  pub max_bpb_factor: f64,
}

impl Default for TuningParams {
  fn default() -> Self {
    TuningParams {
      act_area_correction: 0.5,
      zm_power_factor: 0.75,
      min_decay_factor: 0.01,
      baseline_err_per_mb: 1000.0,
      low_res_err_per_mb: 800.0,
      high_res_err_per_mb: 1250.0,
      boost_factor: 12.5,
      gf_max_boost: 96.0,
      kf_max_frame_boost: 128.0,
      arf_boost_per_frame_cap: 150,
      min_arf_gf_boost: 240,
      min_kf_boost: 300,
      max_kf_boost: 5000,

      second_ref_usage_thresh: 0.1,
      very_low_inter_thresh: 0.05,
      min_intra_level: 0.25,
      intra_vs_inter_thresh: 2.0,
      kf_ii_err_threshold: 2.5,
      err_change_threshold: 0.4,
      ii_improvement_threshold: 3.5,
      kf_ii_max: 128.0,
      very_low_ii: 1.5,
      error_spike: 5.0,
      v_low_intra: 0.5,
      kf_validation_frames: 16,
      kf_min_boost_score: 30.0,

      ncount_frame_ii_thresh: 5.0,
      low_sr_diff_thresh: 0.1,
      sr_diff_max: 128.0,
      sr_diff_part: 0.0015,
      motion_amp_part: 0.003,
      intra_part: 0.005,
      default_decay_limit: 0.75,

      static_zm_thresh: 0.995,
      zoom_breakout: 3.0,
      static_kf_group_thresh: 99,

      err_divisor: 100.0,
      ediv_size_factor: 800.0,
      q_pow_term: [0.65, 0.70, 0.75, 0.80, 0.85, 0.90, 0.95, 0.95, 0.95],
      last_frame_reduction: (1, 16),

      kf_low: 400,
      kf_high: 5000,
      gf_low: 400,
      gf_high: 2000,
      rc_factor_min: 0.75,
      rc_factor_max: 1.75,
      minq_adj_limit: 48,
      minq_adj_limit_cq: 20,
      vbr_pct_adjustment_limit: 50,
      high_undershoot_ratio: 2,
      vlow_motion_threshold: 950,
      static_motion_thresh: 95,
      min_bpb_factor: 0.005,
      max_bpb_factor: 50.0,
    }
  }
}
