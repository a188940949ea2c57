// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use super::block::*;
use super::FirstPassRecord;
use crate::util::mb_dims;

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::sync::Arc;
use v_frame::pixel::Pixel;
use v_frame::plane::Plane;

// Per-pixel mean squared error thresholds, in the 8-bit domain.
const INTRA_SKIP_THRESH: f64 = 0.2;
const LOW_I_THRESH: f64 = 94.0;
const HIGH_I_THRESH: f64 = 240.0;
const SMOOTH_VARIANCE_THRESH: f64 = 4.0;
// Intra and inter predictions closer than this ratio count as neutral.
const NEUTRAL_RATIO: f64 = 1.1;

// Second reference refresh criteria.
const GOLDEN_MIN_PCNT_INTER: f64 = 0.2;
const GOLDEN_MIN_II_RATIO: f64 = 2.0;

#[derive(Clone, Default)]
struct RowStats {
  intra_error: f64,
  coded_error: f64,
  sr_coded_error: f64,
  noise_energy: f64,
  noise_blocks: u32,
  inter: u32,
  motion: u32,
  second_ref: u32,
  neutral: u32,
  intra_low: u32,
  intra_high: u32,
  intra_skip: u32,
  smooth: u32,
  leading_skip: u32,
  sum_mvr: i64,
  sum_mvr_abs: i64,
  sum_mvc: i64,
  sum_mvc_abs: i64,
  sum_mvrs: i64,
  sum_mvcs: i64,
  sum_in_vectors: i64,
}

/// Turns block analyses into a [`FirstPassRecord`] per frame.
pub struct FrameAccumulator<A> {
  analyzer: A,
  bit_depth: usize,
  mb_cols: usize,
  mb_rows: usize,
}

impl<A> FrameAccumulator<A> {
  /// Creates an accumulator for frames of `width`x`height` luma pixels.
  pub fn new(analyzer: A, width: usize, height: usize, bit_depth: usize) -> Self {
    let (mb_cols, mb_rows) = mb_dims(width, height);
    FrameAccumulator { analyzer, bit_depth, mb_cols, mb_rows }
  }

  /// Total number of macroblocks in a frame.
  pub const fn num_mbs(&self) -> usize {
    self.mb_cols * self.mb_rows
  }

  fn row_stats<T: Pixel>(
    &self, src: &Plane<T>, refs: &BlockReferences<'_, T>, by: usize,
  ) -> RowStats
  where
    A: FirstPassBlockAnalyzer<T>,
  {
    let shift = 2 * (self.bit_depth - 8);
    let mut row = RowStats::default();
    let mut leading = true;

    for bx in 0..self.mb_cols {
      let a = self.analyzer.analyze_block(src, refs, bx, by, self.bit_depth);
      let npix = a.pixels.max(1) as f64;
      let mse = |sse: u64| (sse >> shift) as f64 / npix;

      let intra = mse(a.intra_error);
      row.intra_error += intra;
      if intra < INTRA_SKIP_THRESH {
        row.intra_skip += 1;
        if leading {
          row.leading_skip += 1;
        }
      } else {
        leading = false;
      }
      if mse(a.source_variance) < SMOOTH_VARIANCE_THRESH {
        row.smooth += 1;
      }

      let coded = match a.motion_error {
        Some(motion_error) => {
          let motion = mse(motion_error);
          if intra.max(motion) <= NEUTRAL_RATIO * intra.min(motion) {
            row.neutral += 1;
          }
          if motion < intra {
            row.inter += 1;
            if a.mv.is_zero() {
              row.noise_energy += motion;
              row.noise_blocks += 1;
            } else {
              self.accumulate_mv(&mut row, a.mv, bx, by);
            }
            motion
          } else {
            intra
          }
        }
        None => intra,
      };
      if coded == intra {
        if intra < LOW_I_THRESH {
          row.intra_low += 1;
        } else if intra > HIGH_I_THRESH {
          row.intra_high += 1;
        }
      }
      row.coded_error += coded;

      row.sr_coded_error += match a.golden_error {
        Some(golden_error) => {
          let golden = mse(golden_error);
          if a.motion_error.map_or(false, |m| golden < mse(m))
            && golden < intra
          {
            row.second_ref += 1;
          }
          golden.min(intra)
        }
        None => coded,
      };
    }
    row
  }

  fn accumulate_mv(
    &self, row: &mut RowStats, mv: MotionVector, bx: usize, by: usize,
  ) {
    // Stored in 1/8 pel units.
    let r = mv.row as i64 * 8;
    let c = mv.col as i64 * 8;
    row.motion += 1;
    row.sum_mvr += r;
    row.sum_mvr_abs += r.abs();
    row.sum_mvc += c;
    row.sum_mvc_abs += c.abs();
    row.sum_mvrs += r * r;
    row.sum_mvcs += c * c;

    // Vectors pointing away from the frame centre mean content moving
    // towards it, as in a zoom out.
    let outward = |pos: usize, half: usize, v: i64| -> i64 {
      if pos < half {
        -v.signum()
      } else {
        v.signum()
      }
    };
    row.sum_in_vectors += outward(bx, self.mb_cols / 2, c);
    row.sum_in_vectors += outward(by, self.mb_rows / 2, r);
  }

  /// Analyzes one frame and summarises it.
  pub fn analyze_frame<T: Pixel>(
    &self, frame: u64, duration: f64, src: &Plane<T>,
    refs: BlockReferences<'_, T>,
  ) -> FirstPassRecord
  where
    A: FirstPassBlockAnalyzer<T>,
  {
    let rows: Vec<RowStats> = (0..self.mb_rows)
      .into_par_iter()
      .map(|by| self.row_stats(src, &refs, by))
      .collect();

    // Sum in row order so the result does not depend on scheduling.
    let mut total = RowStats::default();
    for r in &rows {
      total.intra_error += r.intra_error;
      total.coded_error += r.coded_error;
      total.sr_coded_error += r.sr_coded_error;
      total.noise_energy += r.noise_energy;
      total.noise_blocks += r.noise_blocks;
      total.inter += r.inter;
      total.motion += r.motion;
      total.second_ref += r.second_ref;
      total.neutral += r.neutral;
      total.intra_low += r.intra_low;
      total.intra_high += r.intra_high;
      total.intra_skip += r.intra_skip;
      total.smooth += r.smooth;
      total.sum_mvr += r.sum_mvr;
      total.sum_mvr_abs += r.sum_mvr_abs;
      total.sum_mvc += r.sum_mvc;
      total.sum_mvc_abs += r.sum_mvc_abs;
      total.sum_mvrs += r.sum_mvrs;
      total.sum_mvcs += r.sum_mvcs;
      total.sum_in_vectors += r.sum_in_vectors;
    }

    let cols = self.mb_cols as u32;
    let inactive_rows =
      rows.iter().take_while(|r| r.leading_skip == cols).count();
    let inactive_cols = rows
      .iter()
      .skip(inactive_rows)
      .map(|r| r.leading_skip)
      .min()
      .unwrap_or(0);

    let num_mbs = self.num_mbs().max(1) as f64;
    let mut record = FirstPassRecord {
      frame: frame as f64,
      weight: 1.0,
      intra_error: total.intra_error / num_mbs,
      coded_error: total.coded_error / num_mbs,
      sr_coded_error: total.sr_coded_error / num_mbs,
      frame_noise_energy: if total.noise_blocks > 0 {
        total.noise_energy / total.noise_blocks as f64
      } else {
        0.
      },
      pcnt_inter: total.inter as f64 / num_mbs,
      pcnt_motion: total.motion as f64 / num_mbs,
      pcnt_second_ref: total.second_ref as f64 / num_mbs,
      pcnt_neutral: total.neutral as f64 / num_mbs,
      pcnt_intra_low: total.intra_low as f64 / num_mbs,
      pcnt_intra_high: total.intra_high as f64 / num_mbs,
      intra_skip_pct: total.intra_skip as f64 / num_mbs,
      intra_smooth_pct: total.smooth as f64 / num_mbs,
      inactive_zone_rows: inactive_rows.min(self.mb_rows / 2) as f64,
      inactive_zone_cols: (inactive_cols as usize).min(self.mb_cols / 2)
        as f64,
      duration,
      count: 1.0,
      ..Default::default()
    };

    if total.motion > 0 {
      let n = total.motion as f64;
      record.mvr = total.sum_mvr as f64 / n;
      record.mvr_abs = total.sum_mvr_abs as f64 / n;
      record.mvc = total.sum_mvc as f64 / n;
      record.mvc_abs = total.sum_mvc_abs as f64 / n;
      record.mvrv =
        (total.sum_mvrs as f64 - record.mvr * record.mvr * n) / n;
      record.mvcv =
        (total.sum_mvcs as f64 - record.mvc * record.mvc * n) / n;
      record.mv_in_out_count = total.sum_in_vectors as f64 / (n * 2.0);
    }

    record
  }
}

/// Runs the first pass over a stream of frames.
///
/// The previous source frame serves as the last reference. A lagging
/// golden reference is refreshed from it whenever the current frame is
/// well predicted, so `sr_coded_error` measures how quickly prediction
/// from an older frame decays.
pub struct FirstPass<T: Pixel, A> {
  acc: FrameAccumulator<A>,
  last: Option<Arc<Plane<T>>>,
  golden: Option<Arc<Plane<T>>>,
  records: Vec<FirstPassRecord>,
}

impl<T: Pixel, A: FirstPassBlockAnalyzer<T>> FirstPass<T, A> {
  /// Creates a first pass for frames of the given geometry.
  pub fn new(analyzer: A, width: usize, height: usize, bit_depth: usize) -> Self {
    FirstPass {
      acc: FrameAccumulator::new(analyzer, width, height, bit_depth),
      last: None,
      golden: None,
      records: Vec::new(),
    }
  }

  /// Analyzes the next frame in display order and appends its record.
  pub fn push_frame(
    &mut self, frame: Arc<Plane<T>>, duration: f64,
  ) -> &FirstPassRecord {
    let index = self.records.len() as u64;
    let record = {
      let refs = BlockReferences {
        last: self.last.as_deref(),
        golden: self.golden.as_deref(),
      };
      self.acc.analyze_frame(index, duration, &frame, refs)
    };

    if index > 0
      && record.pcnt_inter > GOLDEN_MIN_PCNT_INTER
      && record.intra_error / crate::util::div_check(record.coded_error)
        > GOLDEN_MIN_II_RATIO
    {
      self.golden = self.last.clone();
    }
    if index == 0 {
      self.golden = Some(frame.clone());
    }
    self.last = Some(frame);

    trace!(
      "first pass frame {}: intra {:.1} coded {:.1} inter {:.2}",
      index,
      record.intra_error,
      record.coded_error,
      record.pcnt_inter
    );
    self.records.push(record);
    &self.records[self.records.len() - 1]
  }

  /// Records produced so far, in display order.
  pub fn records(&self) -> &[FirstPassRecord] {
    &self.records
  }

  /// Consumes the pass and returns its records.
  pub fn into_records(self) -> Vec<FirstPassRecord> {
    self.records
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use rand::{Rng, SeedableRng};
  use rand_chacha::ChaCha8Rng;

  fn noise_plane(rng: &mut ChaCha8Rng, w: usize, h: usize) -> Plane<u8> {
    let data: Vec<u8> = (0..w * h).map(|_| rng.gen()).collect();
    Plane::from_slice(&data, w)
  }

  // Shifts `p` right by `dx` pixels, repeating the left edge.
  fn shifted(p: &Plane<u8>, dx: usize) -> Plane<u8> {
    let (w, h) = (p.cfg.width, p.cfg.height);
    let data: Vec<u8> = (0..h)
      .flat_map(|y| (0..w).map(move |x| (x, y)))
      .map(|(x, y)| p.p(x.saturating_sub(dx), y))
      .collect();
    Plane::from_slice(&data, w)
  }

  #[test]
  fn first_frame_is_all_intra() {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let mut fp = FirstPass::new(DiamondSearch::default(), 64, 48, 8);
    let r = *fp.push_frame(Arc::new(noise_plane(&mut rng, 64, 48)), 0.04);
    assert_eq!(r.pcnt_inter, 0.);
    assert_eq!(r.coded_error, r.intra_error);
    assert_eq!(r.sr_coded_error, r.coded_error);
    assert_eq!(r.count, 1.);
  }

  #[test]
  fn repeated_frame_is_static() {
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let p = Arc::new(noise_plane(&mut rng, 64, 48));
    let mut fp = FirstPass::new(DiamondSearch::default(), 64, 48, 8);
    fp.push_frame(p.clone(), 0.04);
    let r = *fp.push_frame(p, 0.04);
    assert_eq!(r.pcnt_inter, 1.);
    assert_eq!(r.pcnt_motion, 0.);
    assert_eq!(r.coded_error, 0.);
    assert_eq!(r.zero_motion_pct(), 1.);
  }

  #[test]
  fn panning_frame_has_motion() {
    let (w, h) = (96, 64);
    let ramp: Vec<u8> = (0..w * h).map(|i| ((i % w) * 2) as u8).collect();
    let a = Plane::from_slice(&ramp, w);
    let b = shifted(&a, 3);
    let mut fp = FirstPass::new(DiamondSearch::default(), 96, 64, 8);
    fp.push_frame(Arc::new(a), 0.04);
    let r = *fp.push_frame(Arc::new(b), 0.04);
    assert!(r.pcnt_inter > 0.5);
    assert!(r.pcnt_motion > 0.5);
    assert!(r.coded_error < r.intra_error);
    // Content moves right: vectors point left into the reference.
    assert!(r.mvc < 0.);
    assert_eq!(r.mvr, 0.);
  }

  #[test]
  fn letterbox_rows_are_inactive() {
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let (w, h) = (64, 64);
    let data: Vec<u8> = (0..h)
      .flat_map(|y| (0..w).map(move |x| (x, y)))
      .map(|(_, y)| if y < 16 { 128 } else { rng.gen() })
      .collect();
    let acc = FrameAccumulator::new(DiamondSearch::default(), w, h, 8);
    let p = Plane::from_slice(&data, w);
    let r = acc.analyze_frame(
      0,
      0.04,
      &p,
      BlockReferences { last: None, golden: None },
    );
    assert_eq!(r.inactive_zone_rows, 1.);
    assert!(r.intra_skip_pct >= 0.25);
  }
}
