// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Quantizer selection and post-encode feedback.
//!
//! The model predicts the bits per macroblock a frame costs at a given
//! quantizer index. A correction factor per [`RateFactorLevel`] scales the
//! prediction and is refitted every time a coded size is reported.

use crate::api::config::RateMode;
use crate::firstpass::{AggregateStats, FirstPassRecord};
use crate::quantize::{compute_qdelta, qindex_to_q, QINDEX_RANGE};
use crate::twopass::alloc::frame_max_bits;
use crate::twopass::{
  GFGroupSchedule, GFGroupSlot, KeyFrameGroup, PlannerConfig, RateFactorLevel,
  UpdateType, RATE_FACTOR_LEVELS,
};
use crate::util::round_power_of_two;

/// Smallest size a frame is ever predicted to take.
pub const FRAME_OVERHEAD_BITS: i64 = 200;

// Bits per macroblock are kept with 9 fractional bits.
const BPER_MB_NORMBITS: u32 = 9;
const MAX_MB_RATE: i64 = 250;
const MAXRATE_1080P: i64 = 2025000;
const SECTION_NOISE_DEF: f64 = 250.0;
const NOISE_FACTOR_MIN: f64 = 0.9;
const NOISE_FACTOR_MAX: f64 = 1.1;

const RATE_FACTOR_DELTAS: [f64; RATE_FACTOR_LEVELS] =
  [1.00, 1.00, 1.50, 1.75, 2.00];

const KEY_FRAME: usize = 0;
const INTER_FRAME: usize = 1;

/// Predicted bits per macroblock, with [`BPER_MB_NORMBITS`] fractional
/// bits, of a frame coded at `qindex`.
pub fn bits_per_mb(is_key: bool, qindex: u8, correction_factor: f64) -> i64 {
  let q = qindex_to_q(qindex);
  let mut enumerator: i64 = if is_key { 2700000 } else { 1800000 };
  enumerator += ((enumerator as f64 * q) as i64) >> 12;
  (enumerator as f64 * correction_factor / q) as i64
}

/// Predicted size in bits of a frame of `mbs` macroblocks.
pub fn estimate_bits_at_q(
  is_key: bool, qindex: u8, mbs: usize, correction_factor: f64,
) -> i64 {
  let bpm = bits_per_mb(is_key, qindex, correction_factor);
  FRAME_OVERHEAD_BITS.max((bpm * mbs as i64) >> BPER_MB_NORMBITS)
}

fn calc_correction_factor(
  err_per_mb: f64, err_divisor: f64, q: u8, q_pow_term: &[f64; 9],
) -> f64 {
  let error_term = err_per_mb / crate::util::div_check(err_divisor);
  let index = q as usize >> 5;
  let power_term = q_pow_term[index]
    + (q_pow_term[index + 1] - q_pow_term[index]) * (q % 32) as f64 / 32.0;
  error_term.max(0.0).powf(power_term).clamp(0.05, 5.0)
}

/// Summary of a section of frames the worst quantizer is estimated for.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupQualityModel {
  /// Mean coded error per macroblock.
  pub av_err: f64,
  /// Fraction of the frame that carries no picture.
  pub inactive_zone: f64,
  /// Mean noise energy.
  pub av_noise: f64,
  /// Bits available per frame of the section.
  pub target_bits_per_frame: i64,
  /// Weight from the recent rate error.
  pub rc_factor: f64,
}

/// Smallest quantizer index expected to fit the section into its bits,
/// or `worst_quality` if there are none.
pub fn get_twopass_worst_quality(
  cfg: &PlannerConfig, section: &GroupQualityModel,
) -> u8 {
  if section.target_bits_per_frame <= 0 {
    return cfg.worst_quality;
  }
  let t = &cfg.tuning;
  let noise_factor = (section.av_noise / SECTION_NOISE_DEF)
    .max(0.0)
    .sqrt()
    .clamp(NOISE_FACTOR_MIN, NOISE_FACTOR_MAX);
  let active_pct = (1.0 - section.inactive_zone.clamp(0.0, 1.0)).max(0.01);
  let active_mbs = (cfg.num_mbs as f64 * active_pct).max(1.0) as i64;
  let av_err_per_mb = section.av_err / active_pct;
  let speed_term = 1.0 + 0.04 * cfg.speed as f64;
  let target_norm_bits_per_mb =
    (section.target_bits_per_frame << BPER_MB_NORMBITS) / active_mbs;

  // Larger formats cost a little more for the same error.
  let mut ediv_size_correction =
    (cfg.num_mbs as f64 / t.ediv_size_factor).clamp(0.2, 5.0);
  if ediv_size_correction < 1.0 {
    ediv_size_correction = -(1.0 / ediv_size_correction);
  }
  ediv_size_correction *= 4.0;

  let mut q = cfg.best_quality;
  while q < cfg.worst_quality {
    let factor = calc_correction_factor(
      av_err_per_mb,
      t.err_divisor - ediv_size_correction,
      q,
      &t.q_pow_term,
    );
    let cf = (factor * speed_term * section.rc_factor * noise_factor)
      .clamp(t.min_bpb_factor, t.max_bpb_factor);
    if bits_per_mb(false, q, cf) <= target_norm_bits_per_mb {
      break;
    }
    q += 1;
  }

  if cfg.mode == RateMode::Cq {
    q.max(cfg.cq_level)
  } else {
    q
  }
}

fn get_minq_index(maxq: f64, x3: f64, x2: f64, x1: f64) -> u8 {
  let minqtarget = (((x3 * maxq + x2) * maxq + x1) * maxq).min(maxq);
  // Only lossless lies below q 2.0.
  if minqtarget <= 2.0 {
    return 0;
  }
  (0..QINDEX_RANGE)
    .find(|&i| minqtarget <= qindex_to_q(i as u8))
    .unwrap_or(QINDEX_RANGE - 1) as u8
}

/// Lowest quantizer allowed for a frame, indexed by the active worst
/// quantizer.
#[derive(Clone)]
struct MinqTables {
  kf_low: [u8; QINDEX_RANGE],
  kf_high: [u8; QINDEX_RANGE],
  arfgf_low: [u8; QINDEX_RANGE],
  arfgf_high: [u8; QINDEX_RANGE],
  inter: [u8; QINDEX_RANGE],
}

impl MinqTables {
  fn new() -> Self {
    let mut tables = MinqTables {
      kf_low: [0; QINDEX_RANGE],
      kf_high: [0; QINDEX_RANGE],
      arfgf_low: [0; QINDEX_RANGE],
      arfgf_high: [0; QINDEX_RANGE],
      inter: [0; QINDEX_RANGE],
    };
    for i in 0..QINDEX_RANGE {
      let maxq = qindex_to_q(i as u8);
      tables.kf_low[i] = get_minq_index(maxq, 0.000001, -0.0004, 0.15);
      tables.kf_high[i] = get_minq_index(maxq, 0.0000021, -0.00125, 0.55);
      tables.arfgf_low[i] = get_minq_index(maxq, 0.0000015, -0.0009, 0.30);
      tables.arfgf_high[i] = get_minq_index(maxq, 0.0000021, -0.00125, 0.55);
      tables.inter[i] = get_minq_index(maxq, 0.00000271, -0.00113, 0.90);
    }
    tables
  }
}

impl std::fmt::Debug for MinqTables {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("MinqTables")
  }
}

// Interpolates between the low and high motion tables by boost.
fn get_active_quality(
  q: u8, boost: i32, low: i32, high: i32, low_motion_minq: &[u8],
  high_motion_minq: &[u8],
) -> i32 {
  let q = q as usize;
  if boost > high {
    low_motion_minq[q] as i32
  } else if boost < low {
    high_motion_minq[q] as i32
  } else {
    let gap = (high - low).max(1);
    let offset = high - boost;
    let qdiff = high_motion_minq[q] as i32 - low_motion_minq[q] as i32;
    let adjustment = (offset * qdiff + (gap >> 1)) / gap;
    low_motion_minq[q] as i32 + adjustment
  }
}

/// Quantizer chosen for a frame and the range a recode loop may search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantizerChoice {
  /// Quantizer index to code the frame at.
  pub q: u8,
  /// Lowest index a recode may use.
  pub bottom_index: u8,
  /// Highest index a recode may use.
  pub top_index: u8,
}

fn is_gf_or_arf(update: UpdateType) -> bool {
  matches!(update, UpdateType::Gf | UpdateType::Arf | UpdateType::IntnlArf)
}

/// Rate control state carried from frame to frame.
#[derive(Clone, Debug)]
pub struct RateControlState {
  minq: MinqTables,

  // budget
  pub(crate) bits_left: i64,
  pub(crate) kf_group_bits: i64,
  pub(crate) kf_group_error_left: f64,
  pub(crate) gf_group_bits: i64,
  pub(crate) kf_bits: i64,
  pub(crate) avg_frame_bandwidth: i64,
  pub(crate) min_frame_bandwidth: i64,
  pub(crate) max_frame_bandwidth: i64,
  pub(crate) base_frame_target: i64,
  pub(crate) this_frame_target: i64,

  // schedule
  pub(crate) frames_to_key: usize,
  pub(crate) frames_since_key: usize,
  pub(crate) frames_till_gf_update_due: usize,
  pub(crate) baseline_gf_interval: usize,
  pub(crate) this_key_frame_forced: bool,
  pub(crate) next_key_frame_forced: bool,
  pub(crate) source_alt_ref_pending: bool,
  pub(crate) source_alt_ref_active: bool,
  pub(crate) kf_boost: i32,
  pub(crate) gfu_boost: i32,
  pub(crate) kf_zeromotion_pct: i32,
  pub(crate) last_kfgroup_zeromotion_pct: i32,
  pub(crate) gf_zeromotion_pct: i32,

  // quantizer
  pub(crate) active_worst_quality: u8,
  pub(crate) avg_frame_qindex: [u8; 2],
  pub(crate) last_boosted_qindex: u8,
  pub(crate) last_kf_qindex: u8,
  pub(crate) rate_correction_factors: [f64; RATE_FACTOR_LEVELS],
  pub(crate) extend_minq: i32,
  pub(crate) extend_maxq: i32,
  pub(crate) extend_minq_fast: i32,

  // feedback
  pub(crate) projected_frame_size: i64,
  pub(crate) vbr_bits_off_target: i64,
  pub(crate) vbr_bits_off_target_fast: i64,
  pub(crate) rate_error_estimate: i32,
  pub(crate) rolling_target_bits: i64,
  pub(crate) rolling_actual_bits: i64,
  pub(crate) rolling_arf_group_target_bits: i64,
  pub(crate) rolling_arf_group_actual_bits: i64,
  pub(crate) total_actual_bits: i64,

  pub(crate) total_frames: usize,
  pub(crate) frames_shown: usize,
  pub(crate) frames_coded: usize,
}

impl RateControlState {
  /// Sets up the second pass from the statistics of the whole clip.
  pub fn new(cfg: &PlannerConfig, stats: &[FirstPassRecord]) -> Self {
    let total = AggregateStats::from_records(stats);
    let sum = total.sum();
    let count = sum.count.max(1.0);

    let framerate = if sum.duration > 0.0 {
      sum.count / sum.duration
    } else {
      cfg.framerate
    };
    let duration = if sum.duration > 0.0 {
      sum.duration
    } else {
      sum.count / cfg.framerate.max(f64::EPSILON)
    };
    let avg_frame_bandwidth = (cfg.target_bandwidth as f64 / framerate) as i64;
    let min_frame_bandwidth = (avg_frame_bandwidth
      * cfg.vbr_min_section as i64
      / 100)
      .max(FRAME_OVERHEAD_BITS);
    let vbr_max_bits = avg_frame_bandwidth * cfg.vbr_max_section as i64 / 100;
    let max_frame_bandwidth = (cfg.num_mbs as i64 * MAX_MB_RATE)
      .max(MAXRATE_1080P)
      .max(vbr_max_bits);
    let bits_left = (duration * cfg.target_bandwidth as f64) as i64;

    let mid_q = ((cfg.best_quality as u16 + cfg.worst_quality as u16) / 2) as u8;
    let mut rc = RateControlState {
      minq: MinqTables::new(),
      bits_left,
      kf_group_bits: 0,
      kf_group_error_left: 0.0,
      gf_group_bits: 0,
      kf_bits: 0,
      avg_frame_bandwidth,
      min_frame_bandwidth,
      max_frame_bandwidth,
      base_frame_target: 0,
      this_frame_target: 0,
      frames_to_key: 0,
      frames_since_key: 0,
      frames_till_gf_update_due: 0,
      baseline_gf_interval: 0,
      this_key_frame_forced: false,
      next_key_frame_forced: false,
      source_alt_ref_pending: false,
      source_alt_ref_active: false,
      kf_boost: 0,
      gfu_boost: 0,
      kf_zeromotion_pct: 100,
      last_kfgroup_zeromotion_pct: 100,
      gf_zeromotion_pct: 0,
      active_worst_quality: cfg.worst_quality,
      avg_frame_qindex: [mid_q; 2],
      last_boosted_qindex: mid_q,
      last_kf_qindex: mid_q,
      rate_correction_factors: [1.0; RATE_FACTOR_LEVELS],
      extend_minq: 0,
      extend_maxq: 0,
      extend_minq_fast: 0,
      projected_frame_size: 0,
      vbr_bits_off_target: 0,
      vbr_bits_off_target_fast: 0,
      rate_error_estimate: 0,
      rolling_target_bits: avg_frame_bandwidth,
      rolling_actual_bits: avg_frame_bandwidth,
      rolling_arf_group_target_bits: 1,
      rolling_arf_group_actual_bits: 1,
      total_actual_bits: 0,
      total_frames: stats.len(),
      frames_shown: 0,
      frames_coded: 0,
    };

    // Starting point of the quantizer, from the clip as a whole.
    if !stats.is_empty() {
      let section = GroupQualityModel {
        av_err: sum.coded_error / count,
        inactive_zone: sum.intra_skip_pct / count
          + sum.inactive_zone_rows * 2.0 / (cfg.mb_rows.max(1) as f64 * count),
        av_noise: sum.frame_noise_energy / count,
        target_bits_per_frame: bits_left / stats.len() as i64,
        rc_factor: 1.0,
      };
      let tmp_q = get_twopass_worst_quality(cfg, &section);
      rc.active_worst_quality = tmp_q;
      rc.avg_frame_qindex[INTER_FRAME] = tmp_q;
      rc.avg_frame_qindex[KEY_FRAME] =
        ((tmp_q as u16 + cfg.best_quality as u16) / 2) as u8;
    }

    debug!(
      "second pass: {} frames, {} bits, avg frame {} bits, worst q {}",
      stats.len(),
      bits_left,
      avg_frame_bandwidth,
      rc.active_worst_quality
    );
    rc
  }

  /// Bits left for the rest of the clip.
  #[inline]
  pub fn bits_left(&self) -> i64 {
    self.bits_left
  }

  /// Bits left in the current key frame group.
  #[inline]
  pub fn kf_group_bits_left(&self) -> i64 {
    self.kf_group_bits
  }

  /// Bits left in the golden frame group being coded.
  #[inline]
  pub fn gf_group_bits_left(&self) -> i64 {
    self.gf_group_bits
  }

  /// Shown frames left in the current key frame group.
  #[inline]
  pub fn frames_to_key(&self) -> usize {
    self.frames_to_key
  }

  /// Current worst quantizer estimate.
  #[inline]
  pub fn active_worst_quality(&self) -> u8 {
    self.active_worst_quality
  }

  /// Accumulated difference between targets and coded sizes.
  #[inline]
  pub fn vbr_bits_off_target(&self) -> i64 {
    self.vbr_bits_off_target
  }

  /// Current `(extend_minq, extend_maxq, extend_minq_fast)`.
  #[inline]
  pub fn quality_extension(&self) -> (i32, i32, i32) {
    (self.extend_minq, self.extend_maxq, self.extend_minq_fast)
  }

  /// Largest allocation of a single inter frame.
  pub fn max_bits(&self, cfg: &PlannerConfig) -> i64 {
    frame_max_bits(
      self.avg_frame_bandwidth,
      self.max_frame_bandwidth,
      cfg.vbr_max_section,
    )
  }

  pub(crate) fn start_key_frame_group(&mut self, kf: &KeyFrameGroup) {
    self.this_key_frame_forced = self.next_key_frame_forced;
    self.next_key_frame_forced = kf.next_key_frame_forced;
    self.frames_to_key = kf.frames_to_key;
    self.kf_group_bits = kf.kf_group_bits;
    self.kf_group_error_left = kf.kf_group_error_left;
    self.kf_bits = kf.kf_bits;
    self.kf_boost = kf.kf_boost;
    self.kf_zeromotion_pct = kf.kf_zeromotion_pct;
    self.source_alt_ref_active = false;
    self.source_alt_ref_pending = false;
  }

  pub(crate) fn start_gf_group(&mut self, group: &GFGroupSchedule) {
    self.kf_group_error_left -= group.gf_group_err;
    self.active_worst_quality = group.active_worst_quality;
    self.baseline_gf_interval = group.baseline_gf_interval;
    self.frames_till_gf_update_due = group.baseline_gf_interval;
    self.gfu_boost = group.gfu_boost;
    self.gf_zeromotion_pct = group.gf_zeromotion_pct;
    self.source_alt_ref_pending = group.source_alt_ref_pending;
    // The overlay of the previous alt-ref is the first slot of this group.
    self.source_alt_ref_active = false;
    self.rolling_arf_group_target_bits = 1;
    self.rolling_arf_group_actual_bits = 1;
    self.gf_group_bits = group.bit_budget;
  }

  fn rate_correction_factor(
    &self, cfg: &PlannerConfig, rf_level: RateFactorLevel,
  ) -> f64 {
    self.rate_correction_factors[rf_level.to_index()]
      .clamp(cfg.tuning.min_bpb_factor, cfg.tuning.max_bpb_factor)
  }

  /// Index delta that scales the predicted rate of a frame by `ratio`.
  pub fn compute_qdelta_by_rate(
    &self, cfg: &PlannerConfig, is_key: bool, qindex: u8, ratio: f64,
  ) -> i32 {
    let base_bits_per_mb = bits_per_mb(is_key, qindex, 1.0);
    let target_bits_per_mb = (ratio * base_bits_per_mb as f64) as i64;
    let target_index = (cfg.best_quality..cfg.worst_quality)
      .find(|&i| bits_per_mb(is_key, i, 1.0) <= target_bits_per_mb)
      .unwrap_or(cfg.worst_quality);
    target_index as i32 - qindex as i32
  }

  fn frame_type_qdelta(
    &self, cfg: &PlannerConfig, rf_level: RateFactorLevel, q: u8,
  ) -> i32 {
    self.compute_qdelta_by_rate(
      cfg,
      rf_level == RateFactorLevel::KfStd,
      q,
      RATE_FACTOR_DELTAS[rf_level.to_index()],
    )
  }

  /// Lowest index in `[active_best, active_worst]` whose predicted size
  /// fits `target_bits`. A target of zero or less yields `active_worst`.
  pub fn regulate_q(
    &self, cfg: &PlannerConfig, target_bits: i64, active_best: u8,
    active_worst: u8, rf_level: RateFactorLevel,
  ) -> u8 {
    if target_bits <= 0 {
      return active_worst;
    }
    let is_key = rf_level == RateFactorLevel::KfStd;
    let correction_factor = self.rate_correction_factor(cfg, rf_level);
    let target_bits_per_mb =
      (target_bits << BPER_MB_NORMBITS) / cfg.num_mbs.max(1) as i64;

    let mut q = active_worst;
    let mut last_error = i64::MAX;
    let mut i = active_best;
    loop {
      let bits_per_mb_at_this_q = bits_per_mb(is_key, i, correction_factor);
      if bits_per_mb_at_this_q <= target_bits_per_mb {
        // Take whichever neighbour lands closer to the target.
        q = if target_bits_per_mb - bits_per_mb_at_this_q <= last_error {
          i
        } else {
          i - 1
        };
        break;
      }
      last_error = bits_per_mb_at_this_q - target_bits_per_mb;
      if i >= active_worst {
        break;
      }
      i += 1;
    }
    q
  }

  fn clamp_pframe_target(&self, target: i64, overlay: bool) -> i64 {
    let min_frame_target =
      self.min_frame_bandwidth.max(self.avg_frame_bandwidth >> 5);
    let target = if overlay { min_frame_target } else { target.max(min_frame_target) };
    target.min(self.max_frame_bandwidth)
  }

  // Pushes part of the accumulated error back into this frame.
  fn vbr_rate_correction(
    &mut self, cfg: &PlannerConfig, target: &mut i64, update: UpdateType,
  ) {
    let off = self.vbr_bits_off_target;
    let frame_window =
      16.min(self.total_frames.saturating_sub(self.frames_shown)) as i64;
    if frame_window > 0 {
      let max_delta = (off.abs() / frame_window)
        .min(*target * cfg.tuning.vbr_pct_adjustment_limit / 100);
      if off > 0 {
        *target += off.min(max_delta);
      } else {
        *target -= (-off).min(max_delta);
      }
    }

    // Large local undershoots are paid back quickly, on normal frames only.
    if !update.is_boosted()
      && !is_gf_or_arf(update)
      && !update.is_overlay()
      && self.vbr_bits_off_target_fast > 0
    {
      let one_frame_bits = self.avg_frame_bandwidth.max(*target);
      let fast_extra_bits = self
        .vbr_bits_off_target_fast
        .min(one_frame_bits)
        .min((one_frame_bits / 8).max(self.vbr_bits_off_target_fast / 8));
      *target += fast_extra_bits;
      self.vbr_bits_off_target_fast -= fast_extra_bits;
    }
  }

  /// Turns the allocation of a slot into the target of the frame.
  pub fn frame_target(&mut self, cfg: &PlannerConfig, slot: &GFGroupSlot) -> i64 {
    let update = slot.update_type;
    if update == UpdateType::ShowExisting {
      self.base_frame_target = 0;
      self.this_frame_target = 0;
      return 0;
    }
    self.base_frame_target = slot.bit_allocation;
    let mut target = if update == UpdateType::Kf {
      slot.bit_allocation.min(self.max_frame_bandwidth)
    } else {
      self.clamp_pframe_target(slot.bit_allocation, update.is_overlay())
    };
    if matches!(cfg.mode, RateMode::Vbr | RateMode::Cq) {
      self.vbr_rate_correction(cfg, &mut target, update);
    }
    self.this_frame_target = target.max(0);
    self.this_frame_target
  }

  /// Picks the quantizer of a frame and the recode range around it.
  ///
  /// Must be called after [`frame_target`](Self::frame_target) for the
  /// same slot.
  pub fn pick_q_and_bounds(
    &self, cfg: &PlannerConfig, slot: &GFGroupSlot,
  ) -> QuantizerChoice {
    let t = &cfg.tuning;
    let update = slot.update_type;
    let is_key = update == UpdateType::Kf;
    let gf_or_arf = is_gf_or_arf(update);
    let cq_level = cfg.cq_level as i32;
    let mut active_worst_quality = self.active_worst_quality as i32;
    let mut active_best_quality: i32;
    let static_kf_group =
      self.last_kfgroup_zeromotion_pct >= t.static_motion_thresh;

    if is_key {
      if self.frames_to_key <= 1 && cfg.mode == RateMode::Q {
        active_best_quality = cq_level;
        active_worst_quality = cq_level;
      } else if self.this_key_frame_forced {
        // Stay near the ambient quantizer so a forced key frame does not
        // pop.
        if static_kf_group {
          let qindex = self.last_kf_qindex.min(self.last_boosted_qindex);
          let q = qindex_to_q(qindex);
          active_best_quality = qindex as i32;
          let delta = compute_qdelta(
            q,
            q * 1.25,
            cfg.best_quality,
            cfg.worst_quality,
          );
          active_worst_quality =
            (qindex as i32 + delta).min(active_worst_quality);
        } else {
          let qindex = self.last_boosted_qindex;
          let q = qindex_to_q(qindex);
          let delta = compute_qdelta(
            q,
            q * 0.75,
            cfg.best_quality,
            cfg.worst_quality,
          );
          active_best_quality =
            (qindex as i32 + delta).max(cfg.best_quality as i32);
        }
      } else {
        active_best_quality = get_active_quality(
          self.active_worst_quality,
          self.kf_boost,
          t.kf_low,
          t.kf_high,
          &self.minq.kf_low,
          &self.minq.kf_high,
        );
        if self.kf_zeromotion_pct >= t.static_kf_group_thresh {
          active_best_quality /= 4;
        }
        // Never lossless unless the worst quantizer already is.
        active_best_quality =
          active_worst_quality.min(active_best_quality.max(1));

        let mut q_adj_factor = 1.0;
        if cfg.width * cfg.height <= 352 * 288 {
          q_adj_factor -= 0.25;
        }
        q_adj_factor += 0.05 - 0.001 * self.kf_zeromotion_pct as f64;
        let q_val = qindex_to_q(active_best_quality.clamp(0, 255) as u8);
        active_best_quality += compute_qdelta(
          q_val,
          q_val * q_adj_factor,
          cfg.best_quality,
          cfg.worst_quality,
        );
      }
    } else if gf_or_arf {
      // Base the boosted quantizer on recent inter frames unless the last
      // frame was the key frame.
      let avg_inter = self.avg_frame_qindex[INTER_FRAME] as i32;
      let mut q = if self.frames_since_key > 1 && avg_inter < active_worst_quality
      {
        avg_inter
      } else {
        active_worst_quality
      };
      if cfg.mode == RateMode::Cq {
        q = q.max(cq_level);
      }
      let gf_quality = |q: i32| {
        get_active_quality(
          q.clamp(0, 255) as u8,
          self.gfu_boost,
          t.gf_low,
          t.gf_high,
          &self.minq.arfgf_low,
          &self.minq.arfgf_high,
        )
      };
      active_best_quality = gf_quality(q);
      if cfg.mode == RateMode::Cq {
        active_best_quality = active_best_quality * 15 / 16;
      }
      if cfg.mode == RateMode::Q {
        if update == UpdateType::Gf {
          active_best_quality = cq_level;
        } else {
          active_best_quality = gf_quality(q);
          if slot.rf_level == RateFactorLevel::GfArfLow {
            active_best_quality = (active_best_quality + cq_level + 1) / 2;
          }
        }
      }
    } else if cfg.mode == RateMode::Q {
      active_best_quality = cq_level;
    } else {
      active_best_quality =
        self.minq.inter[self.active_worst_quality as usize] as i32;
      if cfg.mode == RateMode::Cq {
        active_best_quality = active_best_quality.max(cq_level);
      }
    }

    // Widen the range when the clip drifts off its budget.
    if cfg.mode != RateMode::Q {
      let extend_minq = self.extend_minq + self.extend_minq_fast;
      if is_key || gf_or_arf {
        active_best_quality -= extend_minq;
        active_worst_quality += self.extend_maxq / 2;
      } else {
        active_best_quality -= extend_minq / 2;
        active_worst_quality += self.extend_maxq;
      }
    }

    // Forced static key frames are handled by the ambient quantizer above.
    if !is_key || !self.this_key_frame_forced || !static_kf_group {
      let q = active_worst_quality.clamp(0, 255) as u8;
      let qdelta = self.frame_type_qdelta(cfg, slot.rf_level, q);
      active_worst_quality =
        (active_worst_quality + qdelta).max(active_best_quality);
    }

    let best = cfg.best_quality as i32;
    let worst = cfg.worst_quality as i32;
    active_best_quality = active_best_quality.clamp(best, worst);
    active_worst_quality = active_worst_quality.clamp(active_best_quality, worst);

    let mut q = if cfg.mode == RateMode::Q {
      active_best_quality
    } else if is_key && self.this_key_frame_forced {
      if static_kf_group {
        self.last_kf_qindex.min(self.last_boosted_qindex) as i32
      } else {
        self.last_boosted_qindex as i32
      }
    } else {
      let q = self.regulate_q(
        cfg,
        self.this_frame_target,
        active_best_quality as u8,
        active_worst_quality as u8,
        slot.rf_level,
      ) as i32;
      if q > active_worst_quality {
        // Targeting the largest allowed frame may exceed the range.
        if self.this_frame_target >= self.max_frame_bandwidth {
          active_worst_quality = q;
        }
        q.min(active_worst_quality)
      } else {
        q
      }
    };
    q = q.clamp(active_best_quality, active_worst_quality);

    if cfg.mode == RateMode::Cq {
      q = q.max(cq_level);
      active_best_quality = active_best_quality.max(cq_level);
      active_worst_quality = active_worst_quality.max(active_best_quality);
    }

    QuantizerChoice {
      q: q as u8,
      bottom_index: active_best_quality as u8,
      top_index: active_worst_quality as u8,
    }
  }

  /// Refits the correction factor of `rf_level` to the size a frame
  /// actually took at `q`.
  pub fn update_rate_correction_factors(
    &mut self, cfg: &PlannerConfig, rf_level: RateFactorLevel, q: u8,
    actual_bits: i64,
  ) {
    let is_key = rf_level == RateFactorLevel::KfStd;
    let mut rate_correction_factor = self.rate_correction_factor(cfg, rf_level);
    let projected_size_based_on_q =
      estimate_bits_at_q(is_key, q, cfg.num_mbs, rate_correction_factor);

    let mut correction_factor = 100;
    if projected_size_based_on_q > FRAME_OVERHEAD_BITS {
      correction_factor = 100 * actual_bits / projected_size_based_on_q;
    }
    // Damp the update more when close to the prediction.
    let adjustment_limit = 0.25
      + 0.5 * (0.01 * correction_factor as f64).log10().abs().min(1.0);

    if correction_factor > 102 {
      let c =
        (100.0 + (correction_factor - 100) as f64 * adjustment_limit) as i64;
      rate_correction_factor = (rate_correction_factor * c as f64 / 100.0)
        .min(cfg.tuning.max_bpb_factor);
    } else if correction_factor < 99 {
      let c =
        (100.0 - (100 - correction_factor) as f64 * adjustment_limit) as i64;
      rate_correction_factor = (rate_correction_factor * c as f64 / 100.0)
        .max(cfg.tuning.min_bpb_factor);
    }
    self.rate_correction_factors[rf_level.to_index()] = rate_correction_factor;
  }

  /// Folds the coded size of a frame back into the state.
  pub fn postencode(
    &mut self, cfg: &PlannerConfig, slot: &GFGroupSlot, q: u8,
    actual_bits: i64,
  ) {
    let update = slot.update_type;
    let is_key = update == UpdateType::Kf;
    let overlay = update.is_overlay();
    let gf_or_arf = is_gf_or_arf(update);

    if update != UpdateType::ShowExisting {
      self.projected_frame_size = actual_bits;
      if !overlay {
        self.update_rate_correction_factors(cfg, slot.rf_level, q, actual_bits);
      }

      let qi = q as i64;
      if is_key {
        self.avg_frame_qindex[KEY_FRAME] = round_power_of_two(
          3 * self.avg_frame_qindex[KEY_FRAME] as i64 + qi,
          2,
        ) as u8;
        self.last_kf_qindex = q;
      } else if !overlay && !gf_or_arf {
        self.avg_frame_qindex[INTER_FRAME] = round_power_of_two(
          3 * self.avg_frame_qindex[INTER_FRAME] as i64 + qi,
          2,
        ) as u8;
      }
      if q < self.last_boosted_qindex || is_key || gf_or_arf {
        self.last_boosted_qindex = q;
      }
      if !is_key {
        self.rolling_target_bits = round_power_of_two(
          self.rolling_target_bits * 3 + self.this_frame_target,
          2,
        );
        self.rolling_actual_bits =
          round_power_of_two(self.rolling_actual_bits * 3 + actual_bits, 2);
      }
      self.total_actual_bits += actual_bits;

      let bits_used = self.base_frame_target;
      self.vbr_bits_off_target += bits_used - actual_bits;
      self.bits_left = (self.bits_left - bits_used).max(0);
      self.rolling_arf_group_target_bits += self.this_frame_target;
      self.rolling_arf_group_actual_bits += actual_bits;

      self.rate_error_estimate = if self.total_actual_bits != 0 {
        (self.vbr_bits_off_target * 100 / self.total_actual_bits)
          .clamp(-100, 100) as i32
      } else {
        0
      };
      if !is_key {
        self.kf_group_bits -= bits_used;
        self.last_kfgroup_zeromotion_pct = self.kf_zeromotion_pct;
      }
      self.kf_group_bits = self.kf_group_bits.max(0);
      self.gf_group_bits = (self.gf_group_bits - bits_used).max(0);

      if cfg.mode != RateMode::Q
        && self.gf_zeromotion_pct < cfg.tuning.vlow_motion_threshold
        && !overlay
      {
        self.update_quality_extension(cfg, update, actual_bits);
      }

      if update == UpdateType::Arf {
        self.source_alt_ref_pending = false;
        self.source_alt_ref_active = true;
      }
      if !slot.show_frame {
        trace!("hidden {} at {}: {} bits", update, slot.display_index, actual_bits);
      }
    }

    if is_key {
      self.frames_since_key = 0;
    }
    if slot.show_frame {
      self.frames_since_key += 1;
      self.frames_to_key = self.frames_to_key.saturating_sub(1);
      self.frames_till_gf_update_due =
        self.frames_till_gf_update_due.saturating_sub(1);
      self.frames_shown += 1;
    }
    self.frames_coded += 1;
  }

  // Moves the quantizer limits when the clip under- or overshoots.
  fn update_quality_extension(
    &mut self, cfg: &PlannerConfig, update: UpdateType, actual_bits: i64,
  ) {
    let t = &cfg.tuning;
    let maxq_adj_limit =
      cfg.worst_quality as i32 - self.active_worst_quality as i32;
    let minq_adj_limit = if cfg.mode == RateMode::Cq {
      t.minq_adj_limit_cq
    } else {
      t.minq_adj_limit
    };

    if self.rate_error_estimate > cfg.under_shoot_pct {
      self.extend_maxq -= 1;
      if self.rolling_target_bits >= self.rolling_actual_bits {
        self.extend_minq += 1;
      }
    } else if self.rate_error_estimate < -cfg.over_shoot_pct {
      self.extend_minq -= 1;
      if self.rolling_target_bits < self.rolling_actual_bits {
        self.extend_maxq += 1;
      }
    } else {
      // Extreme local overshoot.
      if actual_bits > 2 * self.base_frame_target
        && actual_bits > 2 * self.avg_frame_bandwidth
      {
        self.extend_maxq += 1;
      }
      // Unwind.
      if self.rolling_target_bits < self.rolling_actual_bits {
        self.extend_minq -= 1;
      } else if self.rolling_target_bits > self.rolling_actual_bits {
        self.extend_maxq -= 1;
      }
    }
    self.extend_minq = self.extend_minq.clamp(0, minq_adj_limit);
    self.extend_maxq = self.extend_maxq.clamp(0, maxq_adj_limit.max(0));

    // A normal frame far below its target hands its bits on quickly.
    if !is_gf_or_arf(update) && update != UpdateType::Kf {
      let fast_extra_thresh = self.base_frame_target / t.high_undershoot_ratio;
      if actual_bits < fast_extra_thresh {
        self.vbr_bits_off_target_fast += fast_extra_thresh - actual_bits;
        self.vbr_bits_off_target_fast =
          self.vbr_bits_off_target_fast.min(4 * self.avg_frame_bandwidth);
        if self.avg_frame_bandwidth > 0 {
          self.extend_minq_fast =
            (self.vbr_bits_off_target_fast * 8 / self.avg_frame_bandwidth) as i32;
        }
        self.extend_minq_fast =
          self.extend_minq_fast.min(minq_adj_limit - self.extend_minq);
      } else if self.vbr_bits_off_target_fast != 0 {
        // Falls as the frame targets pay the undershoot back.
        if self.avg_frame_bandwidth > 0 {
          let owed =
            (self.vbr_bits_off_target_fast * 8 / self.avg_frame_bandwidth) as i32;
          self.extend_minq_fast = self.extend_minq_fast.min(owed);
        }
        self.extend_minq_fast =
          self.extend_minq_fast.min(minq_adj_limit - self.extend_minq);
      } else {
        self.extend_minq_fast = 0;
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::config::{EncoderConfig, RateControlConfig};
  use crate::refs::ReferenceTopology;
  use crate::twopass::keyframe::test::random_clip;
  use interpolate_name::interpolate_test;

  fn planner(mode: RateMode) -> PlannerConfig {
    let enc = EncoderConfig { width: 352, height: 288, ..Default::default() };
    let rc = RateControlConfig::new()
      .with_mode(mode)
      .with_bitrate(400_000)
      .with_cq_level(120);
    PlannerConfig::new(&enc, &rc)
  }

  fn slot(update_type: UpdateType, bits: i64) -> GFGroupSlot {
    GFGroupSlot {
      update_type,
      display_index: 1,
      arf_src_offset: 0,
      show_frame: true,
      rf_level: RateFactorLevel::for_update(update_type),
      refresh: crate::refs::RefreshFlags::for_update(
        update_type,
        ReferenceTopology::Classic,
      ),
      bit_allocation: bits,
    }
  }

  #[test]
  fn bits_fall_as_q_rises() {
    for q in 1..255u8 {
      assert!(bits_per_mb(false, q, 1.0) <= bits_per_mb(false, q - 1, 1.0));
    }
    assert!(bits_per_mb(true, 60, 1.0) > bits_per_mb(false, 60, 1.0));
    assert_eq!(estimate_bits_at_q(false, 255, 1, 0.005), FRAME_OVERHEAD_BITS);
  }

  #[test]
  fn zero_target_gives_worst_quality() {
    let cfg = planner(RateMode::Vbr);
    let section = GroupQualityModel {
      av_err: 500.0,
      target_bits_per_frame: 0,
      rc_factor: 1.0,
      ..Default::default()
    };
    assert_eq!(get_twopass_worst_quality(&cfg, &section), cfg.worst_quality);

    let rc = RateControlState::new(&cfg, &random_clip(30, 3));
    assert_eq!(rc.regulate_q(&cfg, 0, 10, 200, RateFactorLevel::InterNormal), 200);
  }

  #[test]
  fn worst_quality_follows_rate() {
    let cfg = planner(RateMode::Vbr);
    let q_at = |bits| {
      get_twopass_worst_quality(
        &cfg,
        &GroupQualityModel {
          av_err: 400.0,
          av_noise: 250.0,
          target_bits_per_frame: bits,
          rc_factor: 1.0,
          ..Default::default()
        },
      )
    };
    assert!(q_at(200_000) <= q_at(20_000));
    assert!(q_at(20_000) <= q_at(2_000));
  }

  #[test]
  fn cq_worst_quality_is_floored() {
    let cfg = planner(RateMode::Cq);
    let q = get_twopass_worst_quality(
      &cfg,
      &GroupQualityModel {
        av_err: 1.0,
        target_bits_per_frame: 10_000_000,
        rc_factor: 1.0,
        ..Default::default()
      },
    );
    assert_eq!(q, cfg.cq_level);
  }

  #[test]
  fn minq_tables_stay_below_maxq() {
    let m = MinqTables::new();
    for i in 0..QINDEX_RANGE {
      assert!(m.kf_low[i] as usize <= i);
      assert!(m.inter[i] as usize <= i);
      assert!(m.kf_low[i] <= m.kf_high[i]);
      assert!(m.arfgf_low[i] <= m.arfgf_high[i]);
    }
  }

  #[test]
  fn correction_factor_tracks_overshoot() {
    let cfg = planner(RateMode::Vbr);
    let mut rc = RateControlState::new(&cfg, &random_clip(30, 1));
    let level = RateFactorLevel::InterNormal;
    let predicted = estimate_bits_at_q(false, 100, cfg.num_mbs, 1.0);
    rc.update_rate_correction_factors(&cfg, level, 100, predicted * 3);
    assert!(rc.rate_correction_factors[0] > 1.0);
    let up = rc.rate_correction_factors[0];
    rc.update_rate_correction_factors(&cfg, level, 100, 0);
    assert!(rc.rate_correction_factors[0] < up);
    assert!(rc.rate_correction_factors[0] >= cfg.tuning.min_bpb_factor);
  }

  #[test]
  fn undershoots_stay_within_minq_limit() {
    let cfg = planner(RateMode::Vbr);
    let mut rc = RateControlState::new(&cfg, &random_clip(200, 2));
    rc.gf_zeromotion_pct = 0;
    let s = slot(UpdateType::Lf, rc.avg_frame_bandwidth);
    let limit = cfg.tuning.minq_adj_limit;
    for _ in 0..60 {
      rc.frame_target(&cfg, &s);
      rc.postencode(&cfg, &s, 100, 1);
      assert!(rc.extend_minq_fast >= 0);
      assert!(rc.extend_minq + rc.extend_minq_fast <= limit);
      assert!(rc.vbr_bits_off_target_fast <= 4 * rc.avg_frame_bandwidth);
    }
    assert_eq!(rc.extend_minq, limit);
    assert_eq!(rc.extend_minq_fast, 0);
    assert_eq!(rc.rate_error_estimate, 100);
  }

  #[test]
  fn deep_undershoot_extends_minq_fast() {
    let cfg = planner(RateMode::Vbr);
    let mut rc = RateControlState::new(&cfg, &random_clip(200, 7));
    rc.gf_zeromotion_pct = 0;
    let s = slot(UpdateType::Lf, rc.avg_frame_bandwidth);
    let limit = cfg.tuning.minq_adj_limit;

    let mut last = rc.extend_minq_fast;
    for _ in 0..3 {
      rc.frame_target(&cfg, &s);
      rc.postencode(&cfg, &s, 100, rc.base_frame_target / 10);
      assert!(rc.extend_minq_fast > last);
      assert!(rc.extend_minq + rc.extend_minq_fast <= limit);
      last = rc.extend_minq_fast;
    }

    // Back on target, the extension unwinds with the bits handed on.
    rc.frame_target(&cfg, &s);
    rc.postencode(&cfg, &s, 100, rc.base_frame_target);
    assert!(rc.extend_minq_fast < last);
    assert!(rc.extend_minq_fast >= 0);
  }

  #[test]
  fn overshoot_raises_maxq() {
    let cfg = planner(RateMode::Vbr);
    let mut rc = RateControlState::new(&cfg, &random_clip(200, 4));
    rc.active_worst_quality = 100;
    rc.gf_zeromotion_pct = 0;
    let s = slot(UpdateType::Lf, rc.avg_frame_bandwidth);
    for _ in 0..10 {
      rc.frame_target(&cfg, &s);
      rc.postencode(&cfg, &s, 100, rc.avg_frame_bandwidth * 4);
    }
    assert!(rc.rate_error_estimate < -cfg.over_shoot_pct);
    assert!(rc.extend_maxq > 0);
    assert_eq!(rc.extend_minq, 0);
  }

  #[test]
  fn postencode_moves_budget() {
    let cfg = planner(RateMode::Vbr);
    let mut rc = RateControlState::new(&cfg, &random_clip(60, 5));
    rc.frames_to_key = 10;
    rc.kf_group_bits = 1_000_000;
    rc.gf_group_bits = 30_000;
    let left = rc.bits_left;
    let s = slot(UpdateType::Lf, 20_000);
    rc.frame_target(&cfg, &s);
    rc.postencode(&cfg, &s, 80, 15_000);
    assert_eq!(rc.bits_left, left - 20_000);
    assert_eq!(rc.kf_group_bits_left(), 980_000);
    assert_eq!(rc.gf_group_bits_left(), 10_000);
    assert_eq!(rc.vbr_bits_off_target, 5_000);
    assert_eq!(rc.frames_to_key, 9);
    assert_eq!(rc.total_actual_bits, 15_000);

    rc.frame_target(&cfg, &s);
    rc.postencode(&cfg, &s, 80, 15_000);
    assert_eq!(rc.gf_group_bits_left(), 0);
  }

  #[interpolate_test(vbr, RateMode::Vbr)]
  #[interpolate_test(cq, RateMode::Cq)]
  #[interpolate_test(cbr, RateMode::Cbr)]
  #[interpolate_test(q, RateMode::Q)]
  fn q_within_bounds(mode: RateMode) {
    let cfg = planner(mode);
    let mut rc = RateControlState::new(&cfg, &random_clip(60, 6));
    rc.frames_to_key = 30;
    rc.kf_boost = 2000;
    rc.gfu_boost = 1000;
    for update in [
      UpdateType::Kf,
      UpdateType::Arf,
      UpdateType::Gf,
      UpdateType::Lf,
      UpdateType::Overlay,
      UpdateType::IntnlArf,
    ] {
      for bits in [0, 1_000, 20_000, 2_000_000] {
        let s = slot(update, bits);
        rc.frame_target(&cfg, &s);
        let c = rc.pick_q_and_bounds(&cfg, &s);
        assert!(cfg.best_quality <= c.bottom_index);
        assert!(c.bottom_index <= c.q && c.q <= c.top_index);
        assert!(c.top_index <= cfg.worst_quality);
        if mode == RateMode::Cq {
          assert!(c.q >= cfg.cq_level);
        }
        if mode == RateMode::Q && update == UpdateType::Lf {
          assert_eq!(c.q, cfg.cq_level);
        }
      }
    }
  }

  #[test]
  fn forced_static_key_frame_reuses_ambient_q() {
    let cfg = planner(RateMode::Vbr);
    let mut rc = RateControlState::new(&cfg, &random_clip(60, 7));
    rc.frames_to_key = 30;
    rc.this_key_frame_forced = true;
    rc.last_kfgroup_zeromotion_pct = 100;
    rc.last_kf_qindex = 70;
    rc.last_boosted_qindex = 60;
    let s = slot(UpdateType::Kf, 50_000);
    rc.frame_target(&cfg, &s);
    assert_eq!(rc.pick_q_and_bounds(&cfg, &s).q, 60);
  }
}
