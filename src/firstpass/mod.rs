// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! First-pass statistics.
//!
//! A [`FirstPassRecord`] summarises one source frame. Error terms are
//! expressed per 16x16 macroblock (mean squared error of the block, in the
//! 8-bit domain) and percentages are fractions in `[0, 1]` of the
//! macroblocks of the frame. Motion vector terms are in 1/8 pel units,
//! averaged over the blocks that moved.

pub mod accumulator;
pub mod block;
pub mod serialize;

pub use self::accumulator::*;
pub use self::block::*;
pub use self::serialize::*;

use crate::serialize::{Deserialize, Serialize};

use std::ops::{AddAssign, SubAssign};

// Every numeric field of the record, in the order it is serialized.
macro_rules! for_each_stat {
  ($m:ident) => {
    $m! {
      frame,
      weight,
      intra_error,
      coded_error,
      sr_coded_error,
      frame_noise_energy,
      pcnt_inter,
      pcnt_motion,
      pcnt_second_ref,
      pcnt_neutral,
      pcnt_intra_low,
      pcnt_intra_high,
      intra_skip_pct,
      intra_smooth_pct,
      inactive_zone_rows,
      inactive_zone_cols,
      mvr,
      mvr_abs,
      mvc,
      mvc_abs,
      mvrv,
      mvcv,
      mv_in_out_count,
      duration,
      count,
      spatial_layer_id
    }
  };
}

/// Statistics gathered by the first pass for a single frame.
///
/// Records are produced once and never mutated afterwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FirstPassRecord {
  /// Display index of the frame.
  pub frame: f64,
  /// Relative importance of the frame, 1.0 unless a caller reweights it.
  pub weight: f64,
  /// Error of the flat intra predictor.
  pub intra_error: f64,
  /// Best of intra and last-frame inter error.
  pub coded_error: f64,
  /// Best of last-frame and second-reference (golden) inter error.
  pub sr_coded_error: f64,
  /// Residual energy of static blocks, a proxy for source noise.
  pub frame_noise_energy: f64,
  /// Blocks better predicted by inter than intra.
  pub pcnt_inter: f64,
  /// Inter blocks with a non-zero motion vector.
  pub pcnt_motion: f64,
  /// Blocks better predicted from the second reference.
  pub pcnt_second_ref: f64,
  /// Blocks where intra and inter predictions score about the same.
  pub pcnt_neutral: f64,
  /// Intra blocks with a low error.
  pub pcnt_intra_low: f64,
  /// Intra blocks with a high error.
  pub pcnt_intra_high: f64,
  /// Blocks whose intra error is small enough to be skipped.
  pub intra_skip_pct: f64,
  /// Blocks with a nearly flat source.
  pub intra_smooth_pct: f64,
  /// Macroblock rows at the top of the frame that carry no picture.
  pub inactive_zone_rows: f64,
  /// Macroblock columns at the left of the frame that carry no picture.
  pub inactive_zone_cols: f64,
  /// Mean row component of the motion vectors.
  pub mvr: f64,
  /// Mean absolute row component of the motion vectors.
  pub mvr_abs: f64,
  /// Mean column component of the motion vectors.
  pub mvc: f64,
  /// Mean absolute column component of the motion vectors.
  pub mvc_abs: f64,
  /// Variance of the row components.
  pub mvrv: f64,
  /// Variance of the column components.
  pub mvcv: f64,
  /// Signed balance of vectors pointing towards (-) or away from (+) the
  /// frame centre, in `[-1, 1]`. Positive values indicate a zoom out.
  pub mv_in_out_count: f64,
  /// Duration of the frame in seconds.
  pub duration: f64,
  /// Number of frames summed in this record; 1 for a single frame.
  pub count: f64,
  /// Spatial layer the frame belongs to.
  pub spatial_layer_id: f64,
}

macro_rules! impl_record_fields {
  ($($field:ident),*) => {
    impl AddAssign<&FirstPassRecord> for FirstPassRecord {
      fn add_assign(&mut self, rhs: &FirstPassRecord) {
        $(self.$field += rhs.$field;)*
      }
    }

    impl SubAssign<&FirstPassRecord> for FirstPassRecord {
      fn sub_assign(&mut self, rhs: &FirstPassRecord) {
        $(self.$field -= rhs.$field;)*
      }
    }

    impl FirstPassRecord {
      /// Number of `f64` fields in a record.
      pub const FIELDS: usize = [$(stringify!($field)),*].len();

      pub(crate) fn to_array(&self) -> [f64; Self::FIELDS] {
        [$(self.$field),*]
      }

      pub(crate) fn from_array(a: [f64; Self::FIELDS]) -> Self {
        let [$($field),*] = a;
        FirstPassRecord { $($field),* }
      }

      fn scale(&mut self, s: f64) {
        $(self.$field *= s;)*
      }
    }
  };
}

for_each_stat!(impl_record_fields);

impl FirstPassRecord {
  /// Fraction of the frame that carries picture, discounting letterbox
  /// rows and blocks that are trivially intra coded.
  pub fn active_area(&self, mb_rows: usize) -> f64 {
    let active_pct = 1.0
      - (self.intra_skip_pct / 2.0
        + (self.inactive_zone_rows * 2.0) / mb_rows.max(1) as f64);
    active_pct.clamp(MIN_ACTIVE_AREA, MAX_ACTIVE_AREA)
  }

  /// Share of blocks that were predicted with no motion.
  #[inline]
  pub fn zero_motion_pct(&self) -> f64 {
    self.pcnt_inter - self.pcnt_motion
  }
}

/// Lower bound of [`FirstPassRecord::active_area`].
pub const MIN_ACTIVE_AREA: f64 = 0.5;
/// Upper bound of [`FirstPassRecord::active_area`].
pub const MAX_ACTIVE_AREA: f64 = 1.0;

/// Running sums of [`FirstPassRecord`] fields over a contiguous range of
/// frames.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AggregateStats {
  sum: FirstPassRecord,
}

impl AggregateStats {
  /// An empty aggregate.
  pub fn zero() -> Self {
    Self::default()
  }

  /// Sums every record of `records`.
  pub fn from_records<'a, I>(records: I) -> Self
  where
    I: IntoIterator<Item = &'a FirstPassRecord>,
  {
    let mut stats = Self::zero();
    for r in records {
      stats.accumulate(r);
    }
    stats
  }

  /// Adds one record to the sums.
  pub fn accumulate(&mut self, record: &FirstPassRecord) {
    self.sum += record;
  }

  /// Removes one record from the sums. Used to maintain the statistics of
  /// the frames still left to code.
  pub fn subtract(&mut self, record: &FirstPassRecord) {
    self.sum -= record;
  }

  /// Removes a whole range from the sums.
  pub fn subtract_stats(&mut self, other: &AggregateStats) {
    self.sum -= &other.sum;
  }

  /// Raw field sums.
  pub const fn sum(&self) -> &FirstPassRecord {
    &self.sum
  }

  /// Number of frames summed.
  pub fn count(&self) -> f64 {
    self.sum.count
  }

  /// Per-frame mean of every field, or an empty record if nothing was
  /// accumulated.
  pub fn average(&self) -> FirstPassRecord {
    if self.sum.count <= 0. {
      return FirstPassRecord::default();
    }
    let mut avg = self.sum;
    avg.scale(1.0 / self.sum.count);
    avg
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use pretty_assertions::assert_eq;

  fn record(i: usize, coded: f64) -> FirstPassRecord {
    FirstPassRecord {
      frame: i as f64,
      weight: 1.0,
      intra_error: coded * 4.0,
      coded_error: coded,
      sr_coded_error: coded,
      pcnt_inter: 0.9,
      duration: 1.0 / 30.0,
      count: 1.0,
      ..Default::default()
    }
  }

  #[test]
  fn field_count_matches_struct() {
    assert_eq!(
      FirstPassRecord::FIELDS * 8,
      std::mem::size_of::<FirstPassRecord>()
    );
  }

  #[test]
  fn subtract_undoes_accumulate() {
    let records: Vec<_> = (0..10).map(|i| record(i, 100. + i as f64)).collect();
    let total = AggregateStats::from_records(&records);
    let mut left = total;
    for r in &records[..4] {
      left.subtract(r);
    }
    let tail = AggregateStats::from_records(&records[4..]);
    assert_eq!(left.count(), 6.0);
    assert!((left.sum().coded_error - tail.sum().coded_error).abs() < 1e-9);
    assert!((left.sum().intra_error - tail.sum().intra_error).abs() < 1e-9);
  }

  #[test]
  fn average_of_empty_is_zero() {
    assert_eq!(AggregateStats::zero().average(), FirstPassRecord::default());
  }

  #[test]
  fn average_divides_by_count() {
    let records = [record(0, 100.), record(1, 300.)];
    let avg = AggregateStats::from_records(&records).average();
    assert_eq!(avg.coded_error, 200.);
    assert_eq!(avg.count, 1.);
  }

  #[test]
  fn active_area_is_clamped() {
    let mut r = record(0, 1.);
    assert_eq!(r.active_area(18), 1.0);
    r.inactive_zone_rows = 9.0;
    assert_eq!(r.active_area(18), MIN_ACTIVE_AREA);
    r.inactive_zone_rows = 2.0;
    r.intra_skip_pct = 0.2;
    let expected = 1.0 - (0.1 + 4.0 / 18.0);
    assert!((r.active_area(18) - expected).abs() < 1e-12);
  }
}
