// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::util::{MB_SIZE, MB_SIZE_LOG2};

use v_frame::pixel::Pixel;
use v_frame::plane::Plane;

/// A full-pel motion vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MotionVector {
  /// Vertical displacement.
  pub row: i16,
  /// Horizontal displacement.
  pub col: i16,
}

impl MotionVector {
  /// The zero vector.
  pub const fn zero() -> Self {
    MotionVector { row: 0, col: 0 }
  }

  /// Whether both components are zero.
  pub const fn is_zero(self) -> bool {
    self.row == 0 && self.col == 0
  }
}

/// Reference planes available to a first-pass block.
#[derive(Clone, Copy)]
pub struct BlockReferences<'a, T: Pixel> {
  /// The previous frame.
  pub last: Option<&'a Plane<T>>,
  /// A lagging second reference.
  pub golden: Option<&'a Plane<T>>,
}

/// Errors measured on one block. All errors are sums of squared
/// differences over the `pixels` valid pixels of the block, in the
/// native bit depth of the source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockAnalysis {
  /// Number of pixels of the block inside the frame.
  pub pixels: u32,
  /// Error against the flat DC predictor.
  pub intra_error: u64,
  /// Spread of the source around its own mean.
  pub source_variance: u64,
  /// Error against the co-located block of the last frame.
  pub zero_mv_error: Option<u64>,
  /// Error after motion search in the last frame.
  pub motion_error: Option<u64>,
  /// Vector found by the motion search.
  pub mv: MotionVector,
  /// Best error against the second reference.
  pub golden_error: Option<u64>,
}

/// Measures intra and inter prediction errors of one 16x16 block.
///
/// The default implementation is [`DiamondSearch`]; an encoder with its
/// own motion estimation can plug it in here.
pub trait FirstPassBlockAnalyzer<T: Pixel>: Sync {
  /// Analyzes the block at macroblock coordinates `(bx, by)`.
  fn analyze_block(
    &self, src: &Plane<T>, refs: &BlockReferences<'_, T>, bx: usize,
    by: usize, bit_depth: usize,
  ) -> BlockAnalysis;
}

/// Bounded small-diamond motion search, started at the zero vector.
#[derive(Clone, Copy, Debug)]
pub struct DiamondSearch {
  /// Largest displacement explored on either axis, in pixels.
  pub search_range: i16,
}

impl Default for DiamondSearch {
  fn default() -> Self {
    DiamondSearch { search_range: 16 }
  }
}

#[derive(Clone, Copy)]
struct BlockRect {
  x: usize,
  y: usize,
  w: usize,
  h: usize,
}

impl BlockRect {
  fn new<T: Pixel>(plane: &Plane<T>, bx: usize, by: usize) -> Self {
    let x = bx << MB_SIZE_LOG2;
    let y = by << MB_SIZE_LOG2;
    BlockRect {
      x,
      y,
      w: MB_SIZE.min(plane.cfg.width - x),
      h: MB_SIZE.min(plane.cfg.height - y),
    }
  }
}

#[inline]
fn px<T: Pixel>(plane: &Plane<T>, x: usize, y: usize) -> i32 {
  plane.p(x, y).into()
}

fn block_sse<T: Pixel>(
  src: &Plane<T>, r: BlockRect, reference: &Plane<T>, mv: MotionVector,
) -> u64 {
  let rx = (r.x as isize + mv.col as isize) as usize;
  let ry = (r.y as isize + mv.row as isize) as usize;
  let mut sse = 0u64;
  for j in 0..r.h {
    for i in 0..r.w {
      let d = px(src, r.x + i, r.y + j) - px(reference, rx + i, ry + j);
      sse += (d * d) as u64;
    }
  }
  sse
}

// The candidate block must lie entirely inside the reference plane.
fn mv_in_bounds<T: Pixel>(
  reference: &Plane<T>, r: BlockRect, mv: MotionVector,
) -> bool {
  let x = r.x as isize + mv.col as isize;
  let y = r.y as isize + mv.row as isize;
  x >= 0
    && y >= 0
    && x as usize + r.w <= reference.cfg.width
    && y as usize + r.h <= reference.cfg.height
}

fn dc_intra<T: Pixel>(
  src: &Plane<T>, r: BlockRect, bit_depth: usize,
) -> (u64, u64) {
  let mut edge_sum = 0i64;
  let mut edge_count = 0i64;
  if r.y > 0 {
    for i in 0..r.w {
      edge_sum += px(src, r.x + i, r.y - 1) as i64;
    }
    edge_count += r.w as i64;
  }
  if r.x > 0 {
    for j in 0..r.h {
      edge_sum += px(src, r.x - 1, r.y + j) as i64;
    }
    edge_count += r.h as i64;
  }
  let dc = if edge_count > 0 {
    (edge_sum + edge_count / 2) / edge_count
  } else {
    128i64 << (bit_depth - 8)
  };

  let n = (r.w * r.h) as i64;
  let mut sum = 0i64;
  let mut sum_sq = 0i64;
  let mut sse = 0u64;
  for j in 0..r.h {
    for i in 0..r.w {
      let v = px(src, r.x + i, r.y + j) as i64;
      let d = v - dc;
      sse += (d * d) as u64;
      sum += v;
      sum_sq += v * v;
    }
  }
  let variance = (sum_sq - (sum * sum + n / 2) / n).max(0) as u64;
  (sse, variance)
}

impl DiamondSearch {
  fn search<T: Pixel>(
    &self, src: &Plane<T>, reference: &Plane<T>, r: BlockRect,
    start_error: u64,
  ) -> (MotionVector, u64) {
    let mut best = MotionVector::zero();
    let mut best_error = start_error;
    let mut step = 8i16.min(self.search_range.max(1));
    while step > 0 {
      loop {
        let center = best;
        for (dr, dc) in [(-step, 0), (step, 0), (0, -step), (0, step)] {
          let cand = MotionVector { row: center.row + dr, col: center.col + dc };
          if cand.row.abs() > self.search_range
            || cand.col.abs() > self.search_range
            || !mv_in_bounds(reference, r, cand)
          {
            continue;
          }
          let err = block_sse(src, r, reference, cand);
          if err < best_error {
            best_error = err;
            best = cand;
          }
        }
        if best == center {
          break;
        }
      }
      step >>= 1;
    }
    (best, best_error)
  }
}

impl<T: Pixel> FirstPassBlockAnalyzer<T> for DiamondSearch {
  fn analyze_block(
    &self, src: &Plane<T>, refs: &BlockReferences<'_, T>, bx: usize,
    by: usize, bit_depth: usize,
  ) -> BlockAnalysis {
    let r = BlockRect::new(src, bx, by);
    let (intra_error, source_variance) = dc_intra(src, r, bit_depth);
    let mut analysis = BlockAnalysis {
      pixels: (r.w * r.h) as u32,
      intra_error,
      source_variance,
      ..Default::default()
    };

    if let Some(last) = refs.last {
      if mv_in_bounds(last, r, MotionVector::zero()) {
        let zero_mv_error = block_sse(src, r, last, MotionVector::zero());
        let (mv, motion_error) = self.search(src, last, r, zero_mv_error);
        analysis.zero_mv_error = Some(zero_mv_error);
        analysis.motion_error = Some(motion_error);
        analysis.mv = mv;

        if let Some(golden) = refs.golden {
          if mv_in_bounds(golden, r, MotionVector::zero()) {
            let zero = block_sse(src, r, golden, MotionVector::zero());
            let (_, golden_error) = self.search(src, golden, r, zero);
            analysis.golden_error = Some(golden_error);
          }
        }
      }
    }

    analysis
  }
}
