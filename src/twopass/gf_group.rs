// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Golden frame groups.
//!
//! A group covers the display frames `[start, start + len)`. Its first
//! slot is the key frame, a fresh golden frame, or the overlay of the
//! alt-ref coded by the previous group. When the group carries an alt-ref,
//! that frame is coded second, hidden, from the source frame at
//! `start + len`, and it is shown by the first slot of the next group.

use super::alloc::{
  allocate_gf_group_bits, calculate_boost_bits, calculate_total_gf_group_bits,
};
use super::boost::{
  detect_flash, detect_transition_to_still, BoostModel, MotionAccumulator,
};
use super::cursor::StatsCursor;
use super::score::ScoreNormalizer;
use super::PlannerConfig;
use crate::api::config::RateMode;
use crate::quantize::qindex_to_q;
use crate::rate::{get_twopass_worst_quality, GroupQualityModel};
use crate::refs::{RefreshFlags, ReferenceTopology};

use std::fmt;

// Shortest sub-group an internal alt-ref is placed in.
const MIN_EXT_ARF_INTERVAL: usize = 4;

/// Role of a frame inside its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateType {
  /// Key frame.
  Kf,
  /// Normal inter frame, refreshes the last frame.
  Lf,
  /// Golden frame.
  Gf,
  /// Hidden alt-ref of the group.
  Arf,
  /// Shows the previous group's alt-ref.
  Overlay,
  /// Hidden backward reference of a bi-predictive mini-group.
  Brf,
  /// Bi-predicted frame that is not kept as a reference.
  Bipred,
  /// Last bi-predicted frame of a mini-group.
  LastBipred,
  /// Hidden alt-ref of a sub-group.
  IntnlArf,
  /// Shows the sub-group alt-ref.
  IntnlOverlay,
  /// Shows the backward reference without coding it again.
  ShowExisting,
}

impl UpdateType {
  /// Key, golden and alt-ref frames get a boosted allocation.
  pub const fn is_boosted(self) -> bool {
    matches!(self, UpdateType::Kf | UpdateType::Gf | UpdateType::Arf)
  }

  /// Frames that show an already coded picture.
  pub const fn is_overlay(self) -> bool {
    matches!(
      self,
      UpdateType::Overlay | UpdateType::IntnlOverlay | UpdateType::ShowExisting
    )
  }
}

impl fmt::Display for UpdateType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::UpdateType::*;
    let s = match self {
      Kf => "KF",
      Lf => "LF",
      Gf => "GF",
      Arf => "ARF",
      Overlay => "OVERLAY",
      Brf => "BRF",
      Bipred => "BIPRED",
      LastBipred => "LAST_BIPRED",
      IntnlArf => "INTNL_ARF",
      IntnlOverlay => "INTNL_OVERLAY",
      ShowExisting => "SHOW_EXISTING",
    };
    f.write_str(s)
  }
}

/// Rate factor level of a frame: selects the correction factor of the
/// quantizer model and how far the worst quantizer is pulled down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RateFactorLevel {
  /// Normal inter frame.
  InterNormal = 0,
  /// Inter frame kept as a backward reference.
  InterHigh = 1,
  /// Internal alt-ref.
  GfArfLow = 2,
  /// Golden frame or alt-ref.
  GfArfStd = 3,
  /// Key frame.
  KfStd = 4,
}

/// Number of [`RateFactorLevel`] values.
pub const RATE_FACTOR_LEVELS: usize = 5;

impl RateFactorLevel {
  /// Level of a frame with the given role.
  pub const fn for_update(update: UpdateType) -> Self {
    match update {
      UpdateType::Kf => RateFactorLevel::KfStd,
      UpdateType::Gf | UpdateType::Arf => RateFactorLevel::GfArfStd,
      UpdateType::IntnlArf => RateFactorLevel::GfArfLow,
      UpdateType::Brf => RateFactorLevel::InterHigh,
      _ => RateFactorLevel::InterNormal,
    }
  }

  /// Index into per-level tables.
  #[inline]
  pub const fn to_index(self) -> usize {
    self as usize
  }
}

/// One frame of a group, in coding order.
#[derive(Clone, Debug, PartialEq)]
pub struct GFGroupSlot {
  /// Role of the frame.
  pub update_type: UpdateType,
  /// Display index of the source frame this slot codes or shows.
  pub display_index: usize,
  /// For hidden frames, how far ahead of the next frame to show the
  /// source frame lies. 0 for shown frames.
  pub arf_src_offset: usize,
  /// The frame is displayed when decoded.
  pub show_frame: bool,
  /// Rate factor level.
  pub rf_level: RateFactorLevel,
  /// Reference buffers updated by the frame.
  pub refresh: RefreshFlags,
  /// Bits allocated to the frame.
  pub bit_allocation: i64,
}

impl GFGroupSlot {
  fn new(
    update_type: UpdateType, display_index: usize, next_shown: usize,
    topology: ReferenceTopology,
  ) -> Self {
    let show_frame = !matches!(
      update_type,
      UpdateType::Arf | UpdateType::IntnlArf | UpdateType::Brf
    );
    GFGroupSlot {
      update_type,
      display_index,
      arf_src_offset: if show_frame { 0 } else { display_index - next_shown },
      show_frame,
      rf_level: RateFactorLevel::for_update(update_type),
      refresh: RefreshFlags::for_update(update_type, topology),
      bit_allocation: 0,
    }
  }
}

/// Shape of a group, before any bits are assigned.
#[derive(Clone, Copy, Debug)]
pub struct GroupLayout {
  /// Display index of the first frame.
  pub start: usize,
  /// Number of frames shown by the group.
  pub baseline_gf_interval: usize,
  /// Role of the first frame: key frame, golden frame or overlay.
  pub first: UpdateType,
  /// The group codes an alt-ref of `start + baseline_gf_interval`.
  pub alt_ref: bool,
  /// Internal alt-refs.
  pub num_extra_arfs: usize,
  /// Size of bi-predictive mini-groups, 0 if disabled.
  pub bipred_group_interval: usize,
  /// Reference set of the codec.
  pub topology: ReferenceTopology,
}

impl GroupLayout {
  /// Frames between internal alt-refs.
  pub fn ext_arf_interval(&self) -> usize {
    (self.baseline_gf_interval / (self.extra_arfs() + 1)).saturating_sub(1)
  }

  /// Internal alt-refs actually placed: each needs a sub-group of at
  /// least two frames.
  pub fn extra_arfs(&self) -> usize {
    if !self.alt_ref
      || self.baseline_gf_interval / (self.num_extra_arfs + 1) < 2
    {
      0
    } else {
      self.num_extra_arfs
    }
  }

  /// Builds the slots in coding order.
  pub fn slots(&self) -> Vec<GFGroupSlot> {
    let start = self.start;
    let len = self.baseline_gf_interval;
    let topo = self.topology;
    let mut slots = Vec::with_capacity(len + 2 * self.num_extra_arfs + 2);

    slots.push(GFGroupSlot::new(self.first, start, start, topo));
    if len == 0 {
      return slots;
    }
    if self.alt_ref {
      slots.push(GFGroupSlot::new(UpdateType::Arf, start + len, start + 1, topo));
    }

    let extra = self.extra_arfs();
    let chunk = len / (extra + 1);
    let mut pos = 1;
    for k in 0..extra {
      let target = (k + 1) * chunk;
      slots.push(GFGroupSlot::new(
        UpdateType::IntnlArf,
        start + target,
        start + pos,
        topo,
      ));
      self.fill_inter(&mut slots, pos, target, chunk);
      slots.push(GFGroupSlot::new(
        UpdateType::IntnlOverlay,
        start + target,
        start + target,
        topo,
      ));
      pos = target + 1;
    }
    self.fill_inter(&mut slots, pos, len, len - extra * chunk);
    slots
  }

  // Lays out the inter frames at group positions `[from, to)`, using
  // bi-predictive mini-groups when they fit strictly inside the sub-group.
  fn fill_inter(
    &self, slots: &mut Vec<GFGroupSlot>, from: usize, to: usize,
    sub_group_len: usize,
  ) {
    let topo = self.topology;
    let g = self.bipred_group_interval;
    let bipred = g >= 2 && g < sub_group_len && topo.is_extended();

    let mut pos = from;
    if bipred {
      while pos + g <= to {
        let brf = self.start + pos + g - 1;
        slots.push(GFGroupSlot::new(UpdateType::Brf, brf, self.start + pos, topo));
        for p in pos..pos + g - 2 {
          slots.push(GFGroupSlot::new(
            UpdateType::Bipred,
            self.start + p,
            self.start + p,
            topo,
          ));
        }
        let last = self.start + pos + g - 2;
        slots.push(GFGroupSlot::new(UpdateType::LastBipred, last, last, topo));
        slots.push(GFGroupSlot::new(UpdateType::ShowExisting, brf, brf, topo));
        pos += g;
      }
    }
    for p in pos..to {
      let d = self.start + p;
      slots.push(GFGroupSlot::new(UpdateType::Lf, d, d, topo));
    }
  }
}

/// A planned golden frame group.
#[derive(Clone, Debug, PartialEq)]
pub struct GFGroupSchedule {
  /// Display index of the first frame.
  pub start: usize,
  /// Number of frames shown by the group.
  pub baseline_gf_interval: usize,
  /// Frames in coding order.
  pub slots: Vec<GFGroupSlot>,
  /// Bits the group may spend, key frame included.
  pub bit_budget: i64,
  /// Boost of the golden frame or alt-ref.
  pub gfu_boost: i32,
  /// Bits of the golden frame or alt-ref.
  pub gf_arf_bits: i64,
  /// The group codes an alt-ref.
  pub source_alt_ref_pending: bool,
  /// Internal alt-refs.
  pub num_extra_arfs: usize,
  /// Normalized score of the group.
  pub gf_group_err: f64,
  /// Share of static blocks over the group, in tenths of a percent.
  pub gf_zeromotion_pct: i32,
  /// Worst quantizer estimated for the group.
  pub active_worst_quality: u8,
}

impl GFGroupSchedule {
  /// Number of slots.
  #[inline]
  pub fn len(&self) -> usize {
    self.slots.len()
  }

  /// The group has no slots.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// Display index after the last frame shown by the group.
  #[inline]
  pub fn end(&self) -> usize {
    self.start + self.baseline_gf_interval
  }

  /// Display indices of shown frames, in coding order.
  pub fn shown_frames(&self) -> impl Iterator<Item = usize> + '_ {
    self.slots.iter().filter(|s| s.show_frame).map(|s| s.display_index)
  }

  /// Sum of all allocations.
  pub fn total_allocation(&self) -> i64 {
    self.slots.iter().map(|s| s.bit_allocation).sum()
  }
}

/// Rate control state a group is planned against.
#[derive(Clone, Copy, Debug)]
pub struct GroupState {
  /// The first frame of the group is a key frame.
  pub is_key_frame: bool,
  /// The first frame shows an alt-ref coded by the previous group.
  pub source_alt_ref_active: bool,
  /// Frames left in the key frame group, the first frame included.
  pub frames_to_key: usize,
  /// Zero motion percentage of the key frame group.
  pub kf_zeromotion_pct: i32,
  /// Current worst quantizer estimate.
  pub active_worst_quality: u8,
  /// Quantizer of the last boosted frame.
  pub last_boosted_qindex: u8,
  /// Bits left in the key frame group.
  pub kf_group_bits: i64,
  /// Score left in the key frame group.
  pub kf_group_error_left: f64,
  /// Bits already reserved for the key frame.
  pub kf_bits: i64,
  /// Recent rate error, in percent.
  pub rate_error_estimate: i32,
  /// Largest allocation of a single inter frame.
  pub max_bits: i64,
}

/// Plans the group starting under the cursor.
pub fn define_gf_group(
  cfg: &PlannerConfig, model: &BoostModel, norm: &ScoreNormalizer,
  cursor: StatsCursor<'_>, st: &GroupState,
) -> GFGroupSchedule {
  let t = &cfg.tuning;
  let start = cursor.position();
  let first_type = if st.is_key_frame {
    UpdateType::Kf
  } else if st.source_alt_ref_active {
    UpdateType::Overlay
  } else {
    UpdateType::Gf
  };
  let Some(first) = cursor.peek(0) else {
    return GFGroupSchedule {
      start,
      baseline_gf_interval: 0,
      slots: Vec::new(),
      bit_budget: 0,
      gfu_boost: 0,
      gf_arf_bits: 0,
      source_alt_ref_pending: false,
      num_extra_arfs: 0,
      gf_group_err: 0.0,
      gf_zeromotion_pct: 0,
      active_worst_quality: st.active_worst_quality,
    };
  };

  // The first frame is already paid for when it is a key frame or the
  // overlay of an alt-ref.
  let arf_active_or_kf = st.is_key_frame || st.source_alt_ref_active;
  let mut gf_group_err = 0.0;
  let mut gf_group_raw_error = 0.0;
  let mut gf_group_noise = 0.0;
  let mut gf_group_skip_pct = 0.0;
  let mut gf_group_inactive_zone_rows = 0.0;
  if arf_active_or_kf {
    gf_group_err -= norm.normalized_score(first);
    gf_group_raw_error -= first.coded_error;
    gf_group_noise -= first.frame_noise_energy;
    gf_group_skip_pct -= first.intra_skip_pct;
    gf_group_inactive_zone_rows -= first.inactive_zone_rows;
  }

  let mv_ratio_accumulator_thresh = (cfg.width + cfg.height) as f64 / 4.0;
  let aok = arf_active_or_kf as usize;
  let int_max_q = qindex_to_q(st.active_worst_quality) as usize;
  let int_lbq = qindex_to_q(st.last_boosted_qindex) as usize;
  let active_min_gf_interval = (cfg.min_gf_interval + aok + (int_max_q / 200).min(2))
    .min(cfg.max_gf_interval + aok);
  let active_max_gf_interval = if cfg.multi_arf_allowed() {
    cfg.max_gf_interval
  } else {
    // Low quantizers leave bits to spare for shorter groups with smaller
    // boosts. At high quantizers a longer group spreads the cost.
    let m = 12 + aok + (int_lbq / 6).min(4);
    let m = if m < active_min_gf_interval {
      active_min_gf_interval
    } else {
      m.min(cfg.max_gf_interval + aok)
    };
    // Do not stop just short of the next key frame.
    if m <= st.frames_to_key
      && m >= st.frames_to_key.saturating_sub(cfg.min_gf_interval)
    {
      st.frames_to_key / 2
    } else {
      m
    }
  };

  let mut motion = MotionAccumulator::default();
  let mut decay_accumulator = 1.0;
  let mut zero_motion_accumulator = 1.0f64;
  let mut loop_decay_rate = 1.0;
  let mut sr_accumulator = 0.0;
  let mut boost_score = 0.0;
  let mut allow_alt_ref = cfg.altref_enabled;

  let mut scan = cursor;
  let mut i = 0;
  while i < cfg.static_scene_max_gf_interval && i < st.frames_to_key {
    let Some(this) = scan.next_record() else {
      break;
    };
    i += 1;
    gf_group_err += norm.normalized_score(this);
    gf_group_raw_error += this.coded_error;
    gf_group_noise += this.frame_noise_energy;
    gf_group_skip_pct += this.intra_skip_pct;
    gf_group_inactive_zone_rows += this.inactive_zone_rows;

    let Some(next) = scan.peek(0) else {
      break;
    };
    let flash_detected = detect_flash(&scan, 0);
    let this_mv_in_out = motion.accumulate(next);

    if !flash_detected {
      let last_loop_decay_rate = loop_decay_rate;
      loop_decay_rate = model.prediction_decay_rate(next);
      decay_accumulator *= loop_decay_rate;
      zero_motion_accumulator =
        zero_motion_accumulator.min(model.zero_motion_factor(next));

      // Look past `next` for a still run, then come back.
      let saved = scan.save();
      scan.next_record();
      let to_still = detect_transition_to_still(
        &scan,
        i,
        cfg.min_gf_interval,
        5,
        loop_decay_rate,
        last_loop_decay_rate,
      );
      scan.restore(saved);
      if to_still {
        allow_alt_ref = false;
        break;
      }
    }

    if i == 1 {
      sr_accumulator += next.coded_error;
    } else {
      sr_accumulator += next.sr_coded_error - next.coded_error;
    }
    boost_score += decay_accumulator
      * model.frame_boost(next, this_mv_in_out, t.gf_max_boost);

    let almost_static = zero_motion_accumulator >= t.static_zm_thresh;
    if (st.kf_zeromotion_pct < t.static_kf_group_thresh
      && i >= active_max_gf_interval
      && !almost_static)
      || (i >= active_min_gf_interval
        && st.frames_to_key - i >= cfg.min_gf_interval
        && !flash_detected
        && !(almost_static && i < active_max_gf_interval)
        && (motion.mv_ratio > mv_ratio_accumulator_thresh
          || motion.abs_mv_in_out > t.zoom_breakout
          || sr_accumulator > next.intra_error))
    {
      break;
    }
  }

  let gf_zeromotion_pct = (zero_motion_accumulator * 1000.0) as i32;
  let source_alt_ref_pending = allow_alt_ref
    && i < cfg.lag_in_frames
    && i >= cfg.min_gf_interval.max(2);
  let baseline_gf_interval =
    if source_alt_ref_pending { i - 1 } else { i }.max(1);

  let num_extra_arfs = if source_alt_ref_pending
    && cfg.multi_arf_allowed()
    && baseline_gf_interval >= 6
    && zero_motion_accumulator < t.static_zm_thresh
  {
    cfg
      .max_extra_arfs
      .min((baseline_gf_interval / MIN_EXT_ARF_INTERVAL).saturating_sub(1))
  } else {
    0
  };

  let gfu_boost = if source_alt_ref_pending {
    let mut from = cursor;
    from.seek(start + 1);
    let boost =
      model.arf_boost(&from, baseline_gf_interval as isize - 1, i - 1, i - 1);
    debug!(
      "alt-ref at {}: boost {} (forward {}, backward {})",
      start + baseline_gf_interval,
      boost.total,
      boost.forward,
      boost.backward
    );
    boost.total
  } else {
    (boost_score as i32).max(t.min_arf_gf_boost)
  };

  let gf_group_bits = calculate_total_gf_group_bits(
    st.kf_group_bits,
    st.kf_group_error_left,
    gf_group_err,
    st.max_bits,
    baseline_gf_interval,
  );

  // Correct the worst quantizer estimate, more eagerly when the section
  // risks an overshoot.
  let mut active_worst_quality = st.active_worst_quality;
  if cfg.mode != RateMode::Q && baseline_gf_interval > 1 {
    let l = baseline_gf_interval as f64;
    let rc_factor = if st.rate_error_estimate > 0 {
      ((100 - st.rate_error_estimate) as f64 / 100.0).max(t.rc_factor_min)
    } else {
      ((100 - st.rate_error_estimate) as f64 / 100.0).min(t.rc_factor_max)
    };
    let section = GroupQualityModel {
      av_err: gf_group_raw_error / l,
      inactive_zone: gf_group_skip_pct / l
        + gf_group_inactive_zone_rows * 2.0 / (l * cfg.mb_rows as f64),
      av_noise: gf_group_noise / l,
      target_bits_per_frame: gf_group_bits / baseline_gf_interval as i64,
      rc_factor,
    };
    let tmp_q = get_twopass_worst_quality(cfg, &section);
    active_worst_quality = tmp_q.max(st.active_worst_quality >> 1);
  }

  let gf_arf_bits = calculate_boost_bits(
    baseline_gf_interval as i64,
    gfu_boost,
    gf_group_bits,
  );

  let layout = GroupLayout {
    start,
    baseline_gf_interval,
    first: first_type,
    alt_ref: source_alt_ref_pending,
    num_extra_arfs,
    bipred_group_interval: cfg.bipred_group_interval,
    topology: cfg.topology,
  };
  let mut schedule = GFGroupSchedule {
    start,
    baseline_gf_interval,
    slots: layout.slots(),
    bit_budget: gf_group_bits + if st.is_key_frame { st.kf_bits } else { 0 },
    gfu_boost,
    gf_arf_bits,
    source_alt_ref_pending,
    num_extra_arfs,
    gf_group_err,
    gf_zeromotion_pct,
    active_worst_quality,
  };
  allocate_gf_group_bits(
    &mut schedule,
    &layout,
    |d| cursor.records().get(d).map_or(0.0, |r| norm.normalized_score(r)),
    st.kf_bits,
    st.max_bits,
    t.last_frame_reduction,
  );

  debug!(
    "gf group [{}, {}) first={} arf={} extra_arfs={} boost={} bits={} \
     worst_q={}",
    start,
    schedule.end(),
    first_type,
    source_alt_ref_pending,
    num_extra_arfs,
    gfu_boost,
    schedule.bit_budget,
    active_worst_quality
  );
  schedule
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::config::{EncoderConfig, RateControlConfig};
  use crate::firstpass::FirstPassRecord;
  use crate::twopass::keyframe::test::{random_clip, slide_clip, static_record};
  use crate::twopass::keyframe::{
    find_next_key_frame, KeyFrameBudget, KeyFrameGroup,
  };
  use interpolate_name::interpolate_test;
  use pretty_assertions::assert_eq;

  fn layout(
    len: usize, first: UpdateType, alt_ref: bool, extra: usize, bipred: usize,
    topology: ReferenceTopology,
  ) -> GroupLayout {
    GroupLayout {
      start: 40,
      baseline_gf_interval: len,
      first,
      alt_ref,
      num_extra_arfs: extra,
      bipred_group_interval: bipred,
      topology,
    }
  }

  fn check_coverage(l: &GroupLayout) {
    let slots = l.slots();
    let shown: Vec<_> =
      slots.iter().filter(|s| s.show_frame).map(|s| s.display_index).collect();
    let expected: Vec<_> =
      (l.start..l.start + l.baseline_gf_interval).collect();
    assert_eq!(shown, expected);
    for s in slots.iter().filter(|s| !s.show_frame) {
      assert!(s.display_index > l.start);
      assert!(s.display_index <= l.start + l.baseline_gf_interval);
      assert!(s.arf_src_offset > 0);
    }
  }

  #[interpolate_test(classic_gf, 10, UpdateType::Gf, false, 0, 0, ReferenceTopology::Classic)]
  #[interpolate_test(classic_arf, 15, UpdateType::Overlay, true, 0, 0, ReferenceTopology::Classic)]
  #[interpolate_test(key_arf, 23, UpdateType::Kf, true, 0, 0, ReferenceTopology::Classic)]
  #[interpolate_test(extra_arf, 16, UpdateType::Gf, true, 1, 0, ReferenceTopology::Extended)]
  #[interpolate_test(extra_arfs_bipred, 16, UpdateType::Overlay, true, 2, 3, ReferenceTopology::Extended)]
  #[interpolate_test(bipred_only, 11, UpdateType::Gf, false, 0, 3, ReferenceTopology::Extended)]
  #[interpolate_test(short_extra, 3, UpdateType::Gf, true, 2, 0, ReferenceTopology::Extended)]
  #[interpolate_test(single, 1, UpdateType::Kf, false, 0, 2, ReferenceTopology::Extended)]
  fn shown_frames_cover_group(
    len: usize, first: UpdateType, alt_ref: bool, extra: usize, bipred: usize,
    topology: ReferenceTopology,
  ) {
    check_coverage(&layout(len, first, alt_ref, extra, bipred, topology));
  }

  #[test]
  fn alt_ref_is_coded_second() {
    let l = layout(15, UpdateType::Gf, true, 0, 0, ReferenceTopology::Classic);
    let slots = l.slots();
    assert_eq!(slots.len(), 16);
    assert_eq!(slots[0].update_type, UpdateType::Gf);
    assert_eq!(slots[1].update_type, UpdateType::Arf);
    assert_eq!(slots[1].display_index, 55);
    assert_eq!(slots[1].arf_src_offset, 14);
    assert!(!slots[1].show_frame);
    assert_eq!(slots[1].rf_level, RateFactorLevel::GfArfStd);
  }

  #[test]
  fn internal_alt_ref_layout() {
    let l = layout(16, UpdateType::Gf, true, 1, 3, ReferenceTopology::Extended);
    assert_eq!(l.extra_arfs(), 1);
    assert_eq!(l.ext_arf_interval(), 7);
    let types: Vec<_> = l.slots().iter().map(|s| s.update_type).collect();
    use self::UpdateType::*;
    assert_eq!(
      types,
      vec![
        Gf, Arf, IntnlArf, Brf, Bipred, LastBipred, ShowExisting, Brf, Bipred,
        LastBipred, ShowExisting, Lf, IntnlOverlay, Brf, Bipred, LastBipred,
        ShowExisting, Brf, Bipred, LastBipred, ShowExisting, Lf,
      ]
    );
  }

  #[test]
  fn extra_arfs_need_room() {
    let l = layout(3, UpdateType::Gf, true, 2, 0, ReferenceTopology::Extended);
    assert_eq!(l.extra_arfs(), 0);
    let l = layout(8, UpdateType::Gf, false, 1, 0, ReferenceTopology::Extended);
    assert_eq!(l.extra_arfs(), 0);
  }

  #[test]
  fn bipred_is_extended_only() {
    let l = layout(11, UpdateType::Gf, false, 0, 3, ReferenceTopology::Classic);
    assert!(l.slots().iter().all(|s| s.update_type != UpdateType::Brf));
  }

  fn planner(
    records: &[FirstPassRecord],
  ) -> (PlannerConfig, BoostModel, ScoreNormalizer) {
    let mut enc = EncoderConfig { width: 352, height: 288, ..Default::default() };
    enc.set_key_frame_interval(12, 30);
    let rc = RateControlConfig::new().with_bitrate(500_000);
    let cfg = PlannerConfig::new(&enc, &rc);
    let model = BoostModel::new(&cfg, qindex_to_q(128));
    let norm = ScoreNormalizer::from_records(
      records,
      cfg.bias,
      cfg.section_limits,
      cfg.tuning.act_area_correction,
      cfg.mb_rows,
    );
    (cfg, model, norm)
  }

  fn first_group(records: &[FirstPassRecord]) -> GFGroupSchedule {
    plan_first(records).1
  }

  fn plan_first(
    records: &[FirstPassRecord],
  ) -> (KeyFrameGroup, GFGroupSchedule) {
    let (cfg, model, norm) = planner(records);
    let cursor = StatsCursor::new(records);
    let max_bits = 500_000 / 30 * 20;
    let kf = find_next_key_frame(
      &cfg,
      &model,
      &norm,
      cursor,
      KeyFrameBudget {
        bits_left: 500_000 * records.len() as i64 / 30,
        modified_error_left: norm.total_score(records),
        max_bits,
      },
    );
    let st = GroupState {
      is_key_frame: true,
      source_alt_ref_active: false,
      frames_to_key: kf.frames_to_key,
      kf_zeromotion_pct: kf.kf_zeromotion_pct,
      active_worst_quality: 128,
      last_boosted_qindex: 128,
      kf_group_bits: kf.kf_group_bits,
      kf_group_error_left: kf.kf_group_error_left,
      kf_bits: kf.kf_bits,
      rate_error_estimate: 0,
      max_bits,
    };
    (kf, define_gf_group(&cfg, &model, &norm, cursor, &st))
  }

  #[test]
  fn static_clip_gets_long_alt_ref_group() {
    let records: Vec<_> = (0..60).map(static_record).collect();
    let g = first_group(&records);
    assert!(g.source_alt_ref_pending);
    assert_eq!(g.baseline_gf_interval, 23);
    assert_eq!(g.gf_zeromotion_pct, 1000);
    assert_eq!(g.slots[0].update_type, UpdateType::Kf);
    assert_eq!(g.slots[1].update_type, UpdateType::Arf);
    assert_eq!(g.slots[1].display_index, 23);
    assert_eq!(
      g.shown_frames().collect::<Vec<_>>(),
      (0..23).collect::<Vec<_>>()
    );
    assert!(g.total_allocation() <= g.bit_budget);
  }

  #[interpolate_test(seed_1, 1)]
  #[interpolate_test(seed_2, 2)]
  #[interpolate_test(seed_3, 3)]
  fn random_group_fits_budget(seed: u64) {
    let records = random_clip(80, seed);
    let g = first_group(&records);
    assert!(g.baseline_gf_interval >= 1);
    assert!(g.total_allocation() <= g.bit_budget);
    assert!(g.slots.iter().all(|s| s.bit_allocation >= 0));
    assert_eq!(
      g.shown_frames().collect::<Vec<_>>(),
      (0..g.baseline_gf_interval).collect::<Vec<_>>()
    );
  }

  #[test]
  fn planning_is_repeatable() {
    let records = random_clip(80, 9);
    assert_eq!(first_group(&records), first_group(&records));
  }

  #[test]
  fn error_scale_does_not_move_groups() {
    let records = slide_clip(60, 20);
    let louder: Vec<_> = records
      .iter()
      .map(|r| FirstPassRecord {
        intra_error: r.intra_error * 4.0,
        coded_error: r.coded_error * 4.0,
        sr_coded_error: r.sr_coded_error * 4.0,
        ..*r
      })
      .collect();
    let (kf_a, g_a) = plan_first(&records);
    let (kf_b, g_b) = plan_first(&louder);

    assert_eq!(kf_a.frames_to_key, 20);
    assert_eq!(kf_a.frames_to_key, kf_b.frames_to_key);
    assert_eq!(g_a.baseline_gf_interval, g_b.baseline_gf_interval);
    assert_eq!(g_a.source_alt_ref_pending, g_b.source_alt_ref_pending);
    assert!((kf_a.kf_group_err - kf_b.kf_group_err).abs() < 1e-9);
    assert!((g_a.gf_group_err - g_b.gf_group_err).abs() < 1e-9);
  }
}
