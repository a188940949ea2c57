// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Key frame placement.
//!
//! A scan walks forward from the current key frame looking for a scene
//! cut. A frame that looks like a cut is only accepted if it predicts the
//! frames after it reasonably well; otherwise the scan resumes. The scan
//! also stops on a transition to a still scene and at the configured
//! maximum interval.

use super::alloc::calculate_boost_bits;
use super::boost::{detect_transition_to_still, BoostModel};
use super::cursor::StatsCursor;
use super::score::ScoreNormalizer;
use super::PlannerConfig;
use crate::api::config::TuningParams;
use crate::firstpass::FirstPassRecord;
use crate::util::div_check;

// Window of recent prediction decay rates used to spot a transition to a
// still scene.
const FRAMES_TO_CHECK_DECAY: usize = 8;

/// A committed key frame group.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct KeyFrameGroup {
  /// Display index of the key frame.
  pub start: usize,
  /// Frames in the group, key frame included.
  pub frames_to_key: usize,
  /// The key frame that ends this group was placed by interval, not by a
  /// scene cut.
  pub next_key_frame_forced: bool,
  /// Normalized score of the whole group.
  pub kf_group_err: f64,
  /// Normalized score of the group without the key frame.
  pub kf_group_error_left: f64,
  /// Bits left for the group once the key frame is paid for.
  pub kf_group_bits: i64,
  /// Bits of the key frame itself.
  pub kf_bits: i64,
  /// Boost of the key frame.
  pub kf_boost: i32,
  /// Share of static blocks over the group, in percent.
  pub kf_zeromotion_pct: i32,
}

/// Budget a key frame group is carved from.
#[derive(Clone, Copy, Debug)]
pub struct KeyFrameBudget {
  /// Bits left for the rest of the clip.
  pub bits_left: i64,
  /// Normalized score of the rest of the clip.
  pub modified_error_left: f64,
  /// Largest allocation of a single inter frame.
  pub max_bits: i64,
}

fn slide_transition(
  t: &TuningParams, last: &FirstPassRecord, this: &FirstPassRecord,
  next: &FirstPassRecord,
) -> bool {
  this.intra_error < this.coded_error * t.very_low_ii
    && this.coded_error > last.coded_error * t.error_spike
    && this.coded_error > next.coded_error * t.error_spike
}

fn looks_like_scene_cut(
  t: &TuningParams, last: &FirstPassRecord, this: &FirstPassRecord,
  next: &FirstPassRecord,
) -> bool {
  let pcnt_intra = 1.0 - this.pcnt_inter;
  let modified_pcnt_inter = this.pcnt_inter - this.pcnt_neutral;

  let intra_dominant = pcnt_intra > t.min_intra_level
    && pcnt_intra > t.intra_vs_inter_thresh * modified_pcnt_inter
    && this.intra_error / div_check(this.coded_error) < t.kf_ii_err_threshold
    && ((last.coded_error - this.coded_error).abs()
      / div_check(this.coded_error)
      > t.err_change_threshold
      || (last.intra_error - this.intra_error).abs()
        / div_check(this.intra_error)
        > t.err_change_threshold
      || next.intra_error / div_check(next.coded_error)
        > t.ii_improvement_threshold);

  this.pcnt_second_ref < t.second_ref_usage_thresh
    && next.pcnt_second_ref < t.second_ref_usage_thresh
    && (this.pcnt_inter < t.very_low_inter_thresh
      || slide_transition(t, last, this, next)
      || intra_dominant)
}

/// Whether the frame under the cursor should start a new key frame group.
///
/// Needs the previous and the next frame. A frame that passes the scene
/// cut heuristics is accepted only if the frames after it are well
/// predicted from it.
pub fn test_candidate_kf(t: &TuningParams, cursor: &StatsCursor<'_>) -> bool {
  let (Some(last), Some(this), Some(next)) =
    (cursor.peek(-1), cursor.peek(0), cursor.peek(1))
  else {
    return false;
  };
  if !looks_like_scene_cut(t, last, this, next) {
    return false;
  }

  let mut boost_score = 0.0;
  let mut old_boost_score = 0.0;
  let mut decay_accumulator = 1.0;
  let mut i = 0;
  while i < t.kf_validation_frames {
    let Some(r) = cursor.peek(1 + i as isize) else {
      break;
    };
    let next_iiratio =
      (t.boost_factor * r.intra_error / div_check(r.coded_error)).min(t.kf_ii_max);

    if r.pcnt_inter > 0.85 {
      decay_accumulator *= r.pcnt_inter;
    } else {
      decay_accumulator *= (0.85 + r.pcnt_inter) / 2.0;
    }
    boost_score += decay_accumulator * next_iiratio;

    if r.pcnt_inter < t.very_low_inter_thresh
      || next_iiratio < t.very_low_ii
      || (r.pcnt_inter - r.pcnt_neutral < 0.20 && next_iiratio < 3.0)
      || boost_score - old_boost_score < 3.0
      || r.intra_error < t.v_low_intra
    {
      break;
    }
    old_boost_score = boost_score;
    i += 1;
  }

  let viable = boost_score > t.kf_min_boost_score && i > 3;
  if !viable {
    debug!(
      "scene cut at frame {} rejected: boost {:.1} over {} frames",
      this.frame, boost_score, i
    );
  }
  viable
}

/// Places the key frame after the one under the cursor and sizes the
/// budget of the group in between.
pub fn find_next_key_frame(
  cfg: &PlannerConfig, model: &BoostModel, norm: &ScoreNormalizer,
  cursor: StatsCursor<'_>, budget: KeyFrameBudget,
) -> KeyFrameGroup {
  let t = &cfg.tuning;
  let start = cursor.position();
  let Some(kf) = cursor.peek(0) else {
    return KeyFrameGroup { start, ..Default::default() };
  };
  let key_freq = cfg.key_freq.max(1);
  let limit = if cfg.auto_key { key_freq.saturating_mul(2) } else { key_freq };

  let mut recent_loop_decay = [1.0f64; FRAMES_TO_CHECK_DECAY];
  let mut frames_to_key = 1;
  while frames_to_key < cursor.remaining() && frames_to_key < limit {
    let i = frames_to_key - 1;
    let mut candidate = cursor;
    candidate.seek(start + frames_to_key);

    if let (true, Some(next)) = (cfg.auto_key, candidate.peek(1)) {
      if frames_to_key >= cfg.min_kf_interval && test_candidate_kf(t, &candidate)
      {
        break;
      }

      let loop_decay_rate = model.prediction_decay_rate(next);
      recent_loop_decay[i % FRAMES_TO_CHECK_DECAY] = loop_decay_rate;
      let decay_accumulator: f64 = recent_loop_decay.iter().product();

      let mut ahead = candidate;
      ahead.seek(start + frames_to_key + 1);
      if detect_transition_to_still(
        &ahead,
        i,
        cfg.min_gf_interval,
        key_freq.saturating_sub(i),
        loop_decay_rate,
        decay_accumulator,
      ) {
        break;
      }
    }
    frames_to_key += 1;
  }

  // Center the key frame when the natural interval lies between one and
  // two maximum intervals.
  let end_of_stats = frames_to_key >= cursor.remaining();
  let next_key_frame_forced = if cfg.auto_key && frames_to_key > key_freq {
    frames_to_key /= 2;
    true
  } else {
    end_of_stats || frames_to_key >= key_freq
  };

  let group = &cursor.records()[start..start + frames_to_key];
  let kf_group_err = norm.total_score(group);

  let mut kf_group_bits =
    if budget.bits_left > 0 && budget.modified_error_left > 0.0 {
      let bits = (budget.bits_left as f64
        * (kf_group_err / budget.modified_error_left)) as i64;
      bits.min(budget.max_bits.saturating_mul(frames_to_key as i64))
    } else {
      0
    }
    .max(0);

  // Boost of the key frame from how well it predicts the frames after it.
  let kf_raw_err = kf.intra_error;
  let mut zero_motion_accumulator = 1.0f64;
  let mut sr_accumulator = 0.0;
  let mut boost_score = 0.0;
  for (i, r) in group.iter().skip(1).enumerate() {
    // A static key frame group must be static throughout, not only over
    // the frames that count towards the boost.
    zero_motion_accumulator =
      zero_motion_accumulator.min(model.zero_motion_factor(r));

    if sr_accumulator >= kf_raw_err * 1.5 || i > cfg.max_gf_interval * 2 {
      break;
    }
    let zm_factor = 0.75 + zero_motion_accumulator / 2.0;
    if i < 2 {
      sr_accumulator = 0.0;
    }
    let frame_boost = model.kf_frame_boost(
      r,
      &mut sr_accumulator,
      0.0,
      t.kf_max_frame_boost * zm_factor,
    );
    boost_score += frame_boost;
    if frame_boost < 25.0 {
      break;
    }
  }

  let kf_zeromotion_pct = (zero_motion_accumulator * 100.0) as i32;
  let kf_boost = (boost_score as i32)
    .max(frames_to_key as i32 * 3)
    .max(t.min_kf_boost)
    .min(t.max_kf_boost);

  // A lone key frame takes the whole group.
  let kf_bits = if frames_to_key == 1 {
    kf_group_bits
  } else {
    calculate_boost_bits(frames_to_key as i64 - 1, kf_boost, kf_group_bits)
  };
  kf_group_bits -= kf_bits;

  debug!(
    "key frame group [{}, {}) forced={} boost={} zm={}% bits={}+{}",
    start,
    start + frames_to_key,
    next_key_frame_forced,
    kf_boost,
    kf_zeromotion_pct,
    kf_bits,
    kf_group_bits
  );

  KeyFrameGroup {
    start,
    frames_to_key,
    next_key_frame_forced,
    kf_group_err,
    kf_group_error_left: kf_group_err - norm.normalized_score(kf),
    kf_group_bits,
    kf_bits,
    kf_boost,
    kf_zeromotion_pct,
  }
}

#[cfg(test)]
pub(crate) mod test {
  use super::*;
  use crate::api::config::{EncoderConfig, RateControlConfig};
  use interpolate_name::interpolate_test;
  use rand::{Rng, SeedableRng};
  use rand_chacha::ChaCha8Rng;

  pub(crate) fn static_record(i: usize) -> FirstPassRecord {
    FirstPassRecord {
      frame: i as f64,
      weight: 1.0,
      intra_error: 800.0,
      coded_error: 20.0,
      sr_coded_error: 20.0,
      pcnt_inter: 1.0,
      duration: 1.0 / 30.0,
      count: 1.0,
      ..Default::default()
    }
  }

  pub(crate) fn slide_clip(n: usize, spike: usize) -> Vec<FirstPassRecord> {
    (0..n)
      .map(|i| {
        let mut r = FirstPassRecord {
          frame: i as f64,
          weight: 1.0,
          intra_error: 1000.0,
          coded_error: 100.0,
          sr_coded_error: 100.0,
          pcnt_inter: 0.95,
          duration: 1.0 / 30.0,
          count: 1.0,
          ..Default::default()
        };
        if i == spike {
          r.coded_error = 1000.0;
          r.sr_coded_error = 1000.0;
          r.intra_error = 1200.0;
          r.pcnt_inter = 0.6;
        }
        r
      })
      .collect()
  }

  pub(crate) fn random_clip(n: usize, seed: u64) -> Vec<FirstPassRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
      .map(|i| {
        let coded: f64 = rng.gen_range(1.0..2000.0);
        let pcnt_inter: f64 = rng.gen_range(0.0..1.0);
        FirstPassRecord {
          frame: i as f64,
          weight: 1.0,
          intra_error: coded * rng.gen_range(0.5..20.0),
          coded_error: coded,
          sr_coded_error: coded * rng.gen_range(1.0..3.0),
          pcnt_inter,
          pcnt_motion: pcnt_inter * rng.gen_range(0.0..1.0),
          pcnt_second_ref: rng.gen_range(0.0..0.2),
          pcnt_neutral: rng.gen_range(0.0..0.1),
          mvr: rng.gen_range(-20.0..20.0),
          mvr_abs: rng.gen_range(0.0..30.0),
          mvc: rng.gen_range(-20.0..20.0),
          mvc_abs: rng.gen_range(0.0..30.0),
          mv_in_out_count: rng.gen_range(-0.5..0.5),
          duration: 1.0 / 30.0,
          count: 1.0,
          ..Default::default()
        }
      })
      .collect()
  }

  fn setup(
    key_freq: u64, records: &[FirstPassRecord],
  ) -> (PlannerConfig, BoostModel, ScoreNormalizer, KeyFrameBudget) {
    let mut enc = EncoderConfig { width: 352, height: 288, ..Default::default() };
    enc.set_key_frame_interval(12, key_freq);
    let rc = RateControlConfig::new().with_bitrate(500_000);
    let cfg = PlannerConfig::new(&enc, &rc);
    let model = BoostModel::new(&cfg, crate::quantize::qindex_to_q(128));
    let norm = ScoreNormalizer::from_records(
      records,
      rc.bias_exponent(),
      rc.section_limits(),
      cfg.tuning.act_area_correction,
      cfg.mb_rows,
    );
    let budget = KeyFrameBudget {
      bits_left: 500_000 * records.len() as i64 / 30,
      modified_error_left: norm.total_score(records),
      max_bits: 2 * 500_000 / 30 * 20,
    };
    (cfg, model, norm, budget)
  }

  #[test]
  fn static_clip_is_split_at_half_interval() {
    let records: Vec<_> = (0..60).map(static_record).collect();
    let (cfg, model, norm, budget) = setup(30, &records);
    let kf = find_next_key_frame(
      &cfg,
      &model,
      &norm,
      StatsCursor::new(&records),
      budget,
    );
    assert_eq!(kf.frames_to_key, 30);
    assert!(kf.next_key_frame_forced);
    assert_eq!(kf.kf_zeromotion_pct, 100);
    assert!(kf.kf_bits > 0);
  }

  #[test]
  fn slide_transition_is_a_scene_cut() {
    let records = slide_clip(60, 20);
    let (cfg, model, norm, budget) = setup(240, &records);
    let c = StatsCursor::new(&records);
    let kf = find_next_key_frame(&cfg, &model, &norm, c, budget);
    assert_eq!(kf.frames_to_key, 20);
    assert!(!kf.next_key_frame_forced);

    let mut at = c;
    at.seek(20);
    assert!(test_candidate_kf(&cfg.tuning, &at));
    at.seek(19);
    assert!(!test_candidate_kf(&cfg.tuning, &at));
  }

  #[test]
  fn fixed_interval_without_auto_key() {
    let records = slide_clip(60, 20);
    let (mut cfg, model, norm, budget) = setup(25, &records);
    cfg.auto_key = false;
    let kf = find_next_key_frame(
      &cfg,
      &model,
      &norm,
      StatsCursor::new(&records),
      budget,
    );
    assert_eq!(kf.frames_to_key, 25);
    assert!(kf.next_key_frame_forced);
  }

  #[test]
  fn last_group_runs_to_end_of_stats() {
    let records: Vec<_> = (0..60).map(static_record).collect();
    let (cfg, model, norm, budget) = setup(30, &records);
    let mut c = StatsCursor::new(&records);
    c.seek(45);
    let kf = find_next_key_frame(&cfg, &model, &norm, c, budget);
    assert_eq!(kf.start, 45);
    assert_eq!(kf.frames_to_key, 15);
    assert!(kf.next_key_frame_forced);
  }

  #[interpolate_test(short, 10)]
  #[interpolate_test(medium, 30)]
  #[interpolate_test(long, 120)]
  fn interval_is_bounded(key_freq: u64) {
    for seed in 0..8 {
      let records = random_clip(400, seed);
      let (cfg, model, norm, budget) = setup(key_freq, &records);
      let mut c = StatsCursor::new(&records);
      while c.remaining() > 0 {
        let kf = find_next_key_frame(&cfg, &model, &norm, c, budget);
        assert!(kf.frames_to_key >= 1);
        assert!(kf.frames_to_key as u64 <= key_freq);
        assert!(kf.kf_group_bits >= 0);
        assert!(kf.kf_bits >= 0);
        assert!(kf.kf_bits + kf.kf_group_bits <= budget.bits_left);
        c.seek(c.position() + kf.frames_to_key);
      }
    }
  }

  #[test]
  fn replay_is_identical() {
    let records = random_clip(200, 7);
    let (cfg, model, norm, budget) = setup(60, &records);
    let c = StatsCursor::new(&records);
    let a = find_next_key_frame(&cfg, &model, &norm, c, budget);
    let b = find_next_key_frame(&cfg, &model, &norm, c, budget);
    assert_eq!(a, b);
  }
}
