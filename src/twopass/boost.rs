// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use super::cursor::StatsCursor;
use super::PlannerConfig;
use crate::api::config::TuningParams;
use crate::firstpass::FirstPassRecord;
use crate::util::div_check;

/// Running motion measures over a scan of frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct MotionAccumulator {
  /// Signed zoom, positive for content entering the frame.
  pub mv_in_out: f64,
  /// Absolute zoom.
  pub abs_mv_in_out: f64,
  /// How random the motion field is.
  pub mv_ratio: f64,
}

impl MotionAccumulator {
  /// Adds one frame. Returns its own zoom measure.
  pub fn accumulate(&mut self, r: &FirstPassRecord) -> f64 {
    let pct = r.pcnt_motion;
    let this_mv_in_out = r.mv_in_out_count * pct;
    self.mv_in_out += this_mv_in_out;
    self.abs_mv_in_out += this_mv_in_out.abs();

    if pct > 0.05 {
      let mvr_ratio = r.mvr_abs.abs() / div_check(r.mvr.abs());
      let mvc_ratio = r.mvc_abs.abs() / div_check(r.mvc.abs());
      self.mv_ratio += pct * mvr_ratio.min(r.mvr_abs);
      self.mv_ratio += pct * mvc_ratio.min(r.mvc_abs);
    }
    this_mv_in_out
  }
}

/// Whether the frame at `offset` recovers from a flash: it is better
/// predicted from the older reference than from the previous frame.
pub fn detect_flash(cursor: &StatsCursor<'_>, offset: isize) -> bool {
  cursor.peek(offset).map_or(false, |next| {
    next.pcnt_second_ref > next.pcnt_inter && next.pcnt_second_ref >= 0.5
  })
}

/// Whether a period of motion gives way to a still picture at the cursor.
///
/// Fires when prediction has just become near perfect after a run of
/// decay and the next `still_interval` frames are all static.
pub fn detect_transition_to_still(
  cursor: &StatsCursor<'_>, frame_interval: usize, min_gf_interval: usize,
  still_interval: usize, loop_decay_rate: f64, last_decay_rate: f64,
) -> bool {
  if frame_interval > min_gf_interval
    && loop_decay_rate >= 0.999
    && last_decay_rate < 0.9
  {
    let still = (0..still_interval)
      .map_while(|j| cursor.peek(j as isize))
      .take_while(|r| r.zero_motion_pct() >= 0.999)
      .count();
    return still == still_interval;
  }
  false
}

/// Boost of an alt-ref, split by scan direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArfBoost {
  /// Contribution of the frames after the alt-ref position.
  pub forward: i32,
  /// Contribution of the frames before it.
  pub backward: i32,
  /// Combined boost after floors and caps.
  pub total: i32,
}

/// Error per macroblock a frame boost is measured against at the given
/// frame size.
pub fn baseline_err_per_mb(
  t: &TuningParams, width: usize, height: usize,
) -> f64 {
  let area = width * height;
  if area <= 352 * 288 {
    t.low_res_err_per_mb
  } else if area >= 1920 * 1080 {
    t.high_res_err_per_mb
  } else {
    t.baseline_err_per_mb
  }
}

/// Prediction quality and boost model.
#[derive(Clone, Copy, Debug)]
pub struct BoostModel {
  /// Model constants.
  pub tuning: TuningParams,
  /// Frame height in macroblocks.
  pub mb_rows: usize,
  /// Error per macroblock that maps to a boost of `boost_factor`.
  pub err_per_mb: f64,
  /// Recent average quantizer of inter frames.
  pub lq: f64,
}

impl BoostModel {
  /// Model for the configured frame size at quantizer `lq`.
  pub fn new(cfg: &PlannerConfig, lq: f64) -> Self {
    BoostModel {
      tuning: cfg.tuning,
      mb_rows: cfg.mb_rows,
      err_per_mb: baseline_err_per_mb(&cfg.tuning, cfg.width, cfg.height),
      lq,
    }
  }

  /// How quickly prediction from an older reference decays at `r`.
  pub fn sr_decay_rate(&self, r: &FirstPassRecord) -> f64 {
    let t = &self.tuning;
    let mut sr_diff = r.sr_coded_error - r.coded_error;
    let motion_amplitude = r.pcnt_motion * ((r.mvc_abs + r.mvr_abs) / 2.0);

    let mut modified_pct_inter = r.pcnt_inter;
    if r.intra_error / div_check(r.coded_error) < t.ncount_frame_ii_thresh {
      modified_pct_inter = r.pcnt_inter - r.pcnt_neutral;
    }
    let modified_pcnt_intra = 100.0 * (1.0 - modified_pct_inter);

    let mut sr_decay = 1.0;
    if sr_diff > t.low_sr_diff_thresh {
      sr_diff = sr_diff.min(t.sr_diff_max);
      sr_decay = 1.0
        - t.sr_diff_part * sr_diff
        - t.motion_amp_part * motion_amplitude
        - t.intra_part * modified_pcnt_intra;
    }
    sr_decay.max(t.default_decay_limit.min(modified_pct_inter))
  }

  /// Lower of the second reference decay and the zero motion share.
  pub fn zero_motion_factor(&self, r: &FirstPassRecord) -> f64 {
    self.sr_decay_rate(r).min(r.zero_motion_pct())
  }

  /// Per-frame decay of prediction quality.
  pub fn prediction_decay_rate(&self, r: &FirstPassRecord) -> f64 {
    let sr_decay = self.sr_decay_rate(r);
    let zero_motion = 0.95
      * r.zero_motion_pct().max(0.).powf(self.tuning.zm_power_factor);
    zero_motion.max(sr_decay + (1.0 - sr_decay) * zero_motion)
  }

  fn boost_q_correction(&self, cap: f64) -> f64 {
    (0.5 + self.lq * 0.015).min(cap)
  }

  /// Boost a frame earns for a golden or alt-ref it predicts from.
  pub fn frame_boost(
    &self, r: &FirstPassRecord, this_mv_in_out: f64, max_boost: f64,
  ) -> f64 {
    let t = &self.tuning;
    let q_corr = self.boost_q_correction(1.5);
    let active_area = r.active_area(self.mb_rows);

    let mut boost = self.err_per_mb * active_area
      / div_check(r.coded_error)
      * t.boost_factor
      * q_corr;

    // Content entering the frame (zoom out) needs a better reference.
    if this_mv_in_out > 0.0 {
      boost += boost * this_mv_in_out * 2.0;
    } else {
      boost += boost * this_mv_in_out / 2.0;
    }
    boost.min(max_boost * q_corr)
  }

  /// Boost a frame earns for the key frame it follows.
  ///
  /// `sr_acc` tracks how much worse the older reference has become and
  /// is updated.
  pub fn kf_frame_boost(
    &self, r: &FirstPassRecord, sr_acc: &mut f64, this_mv_in_out: f64,
    max_boost: f64,
  ) -> f64 {
    let t = &self.tuning;
    let q_corr = self.boost_q_correction(2.0);
    let active_area = r.active_area(self.mb_rows);

    let mut boost = self.err_per_mb * active_area
      / div_check(r.coded_error + *sr_acc);

    *sr_acc += r.sr_coded_error - r.coded_error;
    *sr_acc = sr_acc.max(0.0);

    if this_mv_in_out > 0.0 {
      boost += boost * this_mv_in_out * 2.0;
    }
    boost *= q_corr;
    boost.min(max_boost * q_corr)
  }

  fn directional_boost(
    &self, cursor: &StatsCursor<'_>, offsets: impl Iterator<Item = isize>,
  ) -> f64 {
    let mut motion = MotionAccumulator::default();
    let mut decay = 1.0;
    let mut score = 0.0;
    for offset in offsets {
      let Some(r) = cursor.peek(offset) else {
        break;
      };
      let this_mv_in_out = motion.accumulate(r);

      // A flash and the frame after it both predict badly, but frames
      // beyond them recover.
      let flash =
        detect_flash(cursor, offset) || detect_flash(cursor, offset + 1);
      if !flash {
        decay *= self.prediction_decay_rate(r);
        decay = decay.max(self.tuning.min_decay_factor);
      }
      score +=
        decay * self.frame_boost(r, this_mv_in_out, self.tuning.gf_max_boost);
    }
    score
  }

  /// Boost of an alt-ref placed at `offset` from the cursor, scanning
  /// `f_frames` forward and `b_frames` backward.
  pub fn arf_boost(
    &self, cursor: &StatsCursor<'_>, offset: isize, f_frames: usize,
    b_frames: usize,
  ) -> ArfBoost {
    let t = &self.tuning;
    let forward =
      self.directional_boost(cursor, (0..f_frames as isize).map(|i| offset + i))
        as i32;
    let backward = self
      .directional_boost(cursor, (1..=b_frames as isize).map(|i| offset - i))
      as i32;

    let n = (f_frames + b_frames) as i32;
    let total = (forward + backward)
      .max(n * 20)
      .min(n * t.arf_boost_per_frame_cap)
      .max(t.min_arf_gf_boost);
    ArfBoost { forward, backward, total }
  }
}
