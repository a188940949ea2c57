// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Second pass planning.
//!
//! The clip is split into key frame groups, each key frame group into
//! golden frame groups, and each golden frame group into slots in coding
//! order. Groups are planned one at a time, when the previous one has been
//! fully coded, so that the rate feedback of the frames already coded can
//! steer the next plan.

pub mod alloc;
pub mod boost;
pub mod cursor;
pub mod gf_group;
pub mod keyframe;
pub mod score;

pub use self::cursor::StatsCursor;
pub use self::gf_group::*;
pub use self::keyframe::{KeyFrameBudget, KeyFrameGroup};
pub use self::score::ScoreNormalizer;

use self::boost::BoostModel;
use self::keyframe::find_next_key_frame;
use crate::api::config::{
  EncoderConfig, RateControlConfig, RateMode, TuningParams,
};
use crate::firstpass::FirstPassRecord;
use crate::quantize::qindex_to_q;
use crate::rate::RateControlState;
use crate::refs::ReferenceTopology;
use crate::util::mb_dims;

use std::sync::Arc;

/// Settings the planner works from, resolved from the user configuration.
#[derive(Clone, Copy, Debug)]
pub struct PlannerConfig {
  /// Frame width in pixels.
  pub width: usize,
  /// Frame height in pixels.
  pub height: usize,
  /// Macroblock columns.
  pub mb_cols: usize,
  /// Macroblock rows.
  pub mb_rows: usize,
  /// Macroblocks per frame.
  pub num_mbs: usize,

  /// Shortest key frame group a scene cut may open.
  pub min_kf_interval: usize,
  /// Longest key frame group.
  pub key_freq: usize,
  /// Scene cuts open key frame groups.
  pub auto_key: bool,

  /// Shortest golden frame group.
  pub min_gf_interval: usize,
  /// Longest golden frame group, bounded by the lookahead.
  pub max_gf_interval: usize,
  /// Longest golden frame group for static content.
  pub static_scene_max_gf_interval: usize,
  /// Lookahead depth.
  pub lag_in_frames: usize,
  /// Groups may code an alt-ref.
  pub altref_enabled: bool,
  /// Internal alt-refs per group.
  pub max_extra_arfs: usize,
  /// Bi-predictive mini-group size, 0 if disabled.
  pub bipred_group_interval: usize,
  /// Reference set of the codec.
  pub topology: ReferenceTopology,

  /// Rate control mode.
  pub mode: RateMode,
  /// Bits per second.
  pub target_bandwidth: i64,
  /// Frames per second.
  pub framerate: f64,
  /// Lowest qindex.
  pub best_quality: u8,
  /// Highest qindex.
  pub worst_quality: u8,
  /// Constrained quality floor, or the fixed quantizer.
  pub cq_level: u8,
  /// Smallest section rate, percent of the average.
  pub vbr_min_section: u32,
  /// Largest section rate, percent of the average.
  pub vbr_max_section: u32,
  /// Tolerated undershoot, percent.
  pub under_shoot_pct: i32,
  /// Tolerated overshoot, percent.
  pub over_shoot_pct: i32,
  /// Exponent of the frame score.
  pub bias: f64,
  /// Section score limits as fractions of the average.
  pub section_limits: (f64, f64),
  /// Encoder speed.
  pub speed: usize,

  /// Model constants.
  pub tuning: TuningParams,
}

impl PlannerConfig {
  /// Resolves the planner settings of a session.
  pub fn new(enc: &EncoderConfig, rc: &RateControlConfig) -> Self {
    let (mb_cols, mb_rows) = mb_dims(enc.width, enc.height);
    let altref_enabled = enc.altref_enabled();
    // Groups with an alt-ref cannot reach past the lookahead.
    let max_gf_interval = if altref_enabled {
      enc.max_gf_interval.min(enc.lag_in_frames - 1)
    } else {
      enc.max_gf_interval
    }
    .max(1);
    PlannerConfig {
      width: enc.width,
      height: enc.height,
      mb_cols,
      mb_rows,
      num_mbs: mb_cols * mb_rows,
      min_kf_interval: enc.min_key_frame_interval.min(usize::MAX as u64)
        as usize,
      key_freq: enc.max_key_frame_interval.min(usize::MAX as u64) as usize,
      auto_key: enc.auto_key,
      min_gf_interval: enc.min_gf_interval.min(max_gf_interval),
      max_gf_interval,
      static_scene_max_gf_interval: enc.effective_static_scene_max_gf_interval(),
      lag_in_frames: enc.lag_in_frames,
      altref_enabled,
      max_extra_arfs: enc.max_extra_arfs,
      bipred_group_interval: enc.bipred_group_interval,
      topology: enc.reference_topology,
      mode: rc.mode,
      target_bandwidth: rc.bitrate,
      framerate: enc.frame_rate(),
      best_quality: rc.best_quality,
      worst_quality: rc.worst_quality,
      cq_level: rc.cq_level,
      vbr_min_section: rc.vbr_min_section,
      vbr_max_section: rc.vbr_max_section,
      under_shoot_pct: rc.under_shoot_pct,
      over_shoot_pct: rc.over_shoot_pct,
      bias: rc.bias_exponent(),
      section_limits: rc.section_limits(),
      speed: enc.speed,
      tuning: rc.tuning,
    }
  }

  /// Groups may carry internal alt-refs.
  #[inline]
  pub const fn multi_arf_allowed(&self) -> bool {
    self.topology.is_extended() && self.max_extra_arfs > 0
  }
}

/// Walks the first-pass statistics group by group.
#[derive(Clone, Debug)]
pub struct TwoPass {
  stats: Arc<[FirstPassRecord]>,
  norm: ScoreNormalizer,
  modified_error_left: f64,
  key_frame_group: Option<KeyFrameGroup>,
  gf_group: Option<GFGroupSchedule>,
  gf_index: usize,
}

impl TwoPass {
  /// Prepares the planner and the rate control state it drives.
  pub fn new(
    cfg: &PlannerConfig, stats: Arc<[FirstPassRecord]>,
  ) -> (Self, RateControlState) {
    let norm = ScoreNormalizer::from_records(
      &stats,
      cfg.bias,
      cfg.section_limits,
      cfg.tuning.act_area_correction,
      cfg.mb_rows,
    );
    let modified_error_left = norm.total_score(stats.iter());
    let rc = RateControlState::new(cfg, &stats);
    let twopass = TwoPass {
      stats,
      norm,
      modified_error_left,
      key_frame_group: None,
      gf_group: None,
      gf_index: 0,
    };
    (twopass, rc)
  }

  /// All records of the clip.
  pub fn stats(&self) -> &[FirstPassRecord] {
    &self.stats
  }

  /// Scores of the clip.
  pub fn normalizer(&self) -> &ScoreNormalizer {
    &self.norm
  }

  /// The group being coded.
  pub fn current_group(&self) -> Option<&GFGroupSchedule> {
    self.gf_group.as_ref()
  }

  /// The key frame group being coded.
  pub fn current_key_frame_group(&self) -> Option<&KeyFrameGroup> {
    self.key_frame_group.as_ref()
  }

  /// Position of the next slot inside the current group.
  #[inline]
  pub fn gf_index(&self) -> usize {
    self.gf_index
  }

  /// Display index the next group will start at.
  pub fn next_group_start(&self) -> usize {
    self.gf_group.as_ref().map_or(0, |g| g.end())
  }

  /// The current group still has slots to code.
  pub fn in_group(&self) -> bool {
    self.gf_group.as_ref().map_or(false, |g| self.gf_index < g.len())
  }

  /// Score of the frames that are not yet in a key frame group.
  #[inline]
  pub fn modified_error_left(&self) -> f64 {
    self.modified_error_left
  }

  /// Returns the next slot to code, planning a new group when the current
  /// one is done. Records at or past `horizon` are not looked at.
  pub fn next_slot(
    &mut self, cfg: &PlannerConfig, rc: &mut RateControlState, horizon: usize,
  ) -> Option<GFGroupSlot> {
    if !self.in_group() {
      self.plan_group(cfg, rc, horizon)?;
    }
    let group = self.gf_group.as_ref()?;
    group.slots.get(self.gf_index).cloned()
  }

  /// Moves past the slot returned by [`next_slot`](Self::next_slot).
  pub fn advance(&mut self) {
    self.gf_index += 1;
  }

  fn plan_group(
    &mut self, cfg: &PlannerConfig, rc: &mut RateControlState, horizon: usize,
  ) -> Option<()> {
    let start = self.next_group_start();
    let horizon = horizon.min(self.stats.len());
    if start >= horizon {
      return None;
    }
    let mut cursor = StatsCursor::new(&self.stats).with_end(horizon);
    cursor.seek(start);
    let model = BoostModel::new(cfg, qindex_to_q(rc.avg_frame_qindex[1]));

    let is_key_frame = rc.frames_to_key == 0;
    if is_key_frame {
      let kf = find_next_key_frame(
        cfg,
        &model,
        &self.norm,
        cursor,
        KeyFrameBudget {
          bits_left: rc.bits_left,
          modified_error_left: self.modified_error_left,
          max_bits: rc.max_bits(cfg),
        },
      );
      self.modified_error_left -= kf.kf_group_err;
      rc.start_key_frame_group(&kf);
      self.key_frame_group = Some(kf);
    }

    let state = GroupState {
      is_key_frame,
      source_alt_ref_active: rc.source_alt_ref_active,
      frames_to_key: rc.frames_to_key,
      kf_zeromotion_pct: rc.kf_zeromotion_pct,
      active_worst_quality: rc.active_worst_quality,
      last_boosted_qindex: rc.last_boosted_qindex,
      kf_group_bits: rc.kf_group_bits,
      kf_group_error_left: rc.kf_group_error_left,
      kf_bits: if is_key_frame { rc.kf_bits } else { 0 },
      rate_error_estimate: rc.rate_error_estimate,
      max_bits: rc.max_bits(cfg),
    };
    let group = define_gf_group(cfg, &model, &self.norm, cursor, &state);
    if group.is_empty() {
      return None;
    }
    rc.start_gf_group(&group);
    self.gf_group = Some(group);
    self.gf_index = 0;
    Some(())
  }
}
