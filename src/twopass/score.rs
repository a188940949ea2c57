// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::firstpass::{AggregateStats, FirstPassRecord};
use crate::util::div_check;

/// Turns raw frame errors into scores that bits can be shared by.
///
/// Scores are relative to the clip average. `bias` flattens (towards 0) or
/// steepens (towards 1) the relation between error and score, and frames
/// with a reduced active area are scored as slightly easier.
#[derive(Clone, Debug)]
pub struct ScoreNormalizer {
  av_err: f64,
  bias: f64,
  act_area_correction: f64,
  mb_rows: usize,
  min_err: f64,
  max_err: f64,
  min_pct: f64,
  max_pct: f64,
  mean_mod_score: f64,
}

impl ScoreNormalizer {
  /// Builds a normalizer from the statistics of the whole clip.
  ///
  /// `section_limits` bounds a frame score as a fraction of the average.
  pub fn new(
    total: &AggregateStats, bias: f64, section_limits: (f64, f64),
    act_area_correction: f64, mb_rows: usize,
  ) -> Self {
    let sum = total.sum();
    let count = sum.count.max(1.0);
    let av_weight = sum.weight / count;
    let av_err = sum.coded_error * av_weight / count;
    let (min_pct, max_pct) = section_limits;
    ScoreNormalizer {
      av_err,
      bias,
      act_area_correction,
      mb_rows,
      min_err: av_err * min_pct,
      max_err: av_err * max_pct,
      min_pct,
      max_pct,
      mean_mod_score: 1.0,
    }
  }

  /// Builds a normalizer and computes its mean score over `records`.
  pub fn from_records(
    records: &[FirstPassRecord], bias: f64, section_limits: (f64, f64),
    act_area_correction: f64, mb_rows: usize,
  ) -> Self {
    let total = AggregateStats::from_records(records);
    let mut norm =
      Self::new(&total, bias, section_limits, act_area_correction, mb_rows);
    norm.update_mean(records);
    norm
  }

  /// Average coded error of the clip, weighted.
  #[inline]
  pub fn av_err(&self) -> f64 {
    self.av_err
  }

  /// Bias corrected score of one frame, clamped to the section limits.
  pub fn modified_score(&self, r: &FirstPassRecord) -> f64 {
    let modified = self.av_err
      * (r.coded_error * r.weight / div_check(self.av_err))
        .max(0.)
        .powf(self.bias)
      * r.active_area(self.mb_rows).powf(self.act_area_correction);
    modified.clamp(self.min_err, self.max_err.max(self.min_err))
  }

  /// Modified score relative to the clip mean, clamped to the section
  /// limits.
  pub fn normalized_score(&self, r: &FirstPassRecord) -> f64 {
    let score = self.modified_score(r) / div_check(self.mean_mod_score);
    score.clamp(self.min_pct, self.max_pct.max(self.min_pct))
  }

  /// Recomputes the mean modified score over a full scan of `records`.
  pub fn update_mean(&mut self, records: &[FirstPassRecord]) {
    if records.is_empty() {
      return;
    }
    let sum: f64 = records.iter().map(|r| self.modified_score(r)).sum();
    self.mean_mod_score = sum / records.len() as f64;
  }

  /// Sum of normalized scores. Groups and frames share bits by it.
  pub fn total_score<'a, I>(&self, records: I) -> f64
  where
    I: IntoIterator<Item = &'a FirstPassRecord>,
  {
    records.into_iter().map(|r| self.normalized_score(r)).sum()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn record(coded: f64) -> FirstPassRecord {
    FirstPassRecord {
      weight: 1.0,
      coded_error: coded,
      intra_error: coded * 3.0,
      count: 1.0,
      ..Default::default()
    }
  }

  fn normalizer(records: &[FirstPassRecord]) -> ScoreNormalizer {
    ScoreNormalizer::from_records(records, 0.5, (0.0, 20.0), 0.5, 30)
  }

  #[test]
  fn flat_clip_scores_average() {
    let records = vec![record(50.); 10];
    let norm = normalizer(&records);
    for r in &records {
      assert!((norm.modified_score(r) - 50.).abs() < 1e-4);
      assert!((norm.normalized_score(r) - 1.).abs() < 1e-6);
    }
  }

  #[test]
  fn harder_frames_score_higher() {
    let records: Vec<_> = (1..=10).map(|i| record(i as f64 * 10.)).collect();
    let norm = normalizer(&records);
    for w in records.windows(2) {
      assert!(norm.modified_score(&w[0]) < norm.modified_score(&w[1]));
    }
  }

  #[test]
  fn scores_are_clamped() {
    let mut records = vec![record(1.); 99];
    records.push(record(1e9));
    let norm =
      ScoreNormalizer::from_records(&records, 1.0, (0.5, 2.0), 0.5, 30);
    let av = norm.av_err();
    assert!(norm.modified_score(&records[99]) <= av * 2.0 + 1e-9);
    assert!(norm.modified_score(&records[0]) >= av * 0.5 - 1e-9);
  }

  #[test]
  fn error_scale_does_not_change_totals() {
    let records: Vec<_> = (1..=20).map(|i| record(i as f64 * 7.)).collect();
    let louder: Vec<_> = records
      .iter()
      .map(|r| FirstPassRecord {
        coded_error: r.coded_error * 40.,
        intra_error: r.intra_error * 40.,
        ..*r
      })
      .collect();
    let a = normalizer(&records);
    let b = normalizer(&louder);
    assert!((a.total_score(&records) - b.total_score(&louder)).abs() < 1e-9);
    assert!((a.total_score(&records) - 20.).abs() < 1e-9);
  }

  #[test]
  fn zero_error_is_finite() {
    let records = vec![record(0.); 4];
    let norm = normalizer(&records);
    let s = norm.normalized_score(&records[0]);
    assert!(s.is_finite());
    assert!(norm.modified_score(&records[0]).is_finite());
  }

  #[test]
  fn letterbox_reduces_score() {
    let records = vec![record(50.); 4];
    let norm = normalizer(&records);
    let mut boxed = record(50.);
    boxed.inactive_zone_rows = 5.;
    assert!(norm.modified_score(&boxed) < norm.modified_score(&records[0]));
  }
}
