// Copyright (c) 2017-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

/// Size in pixels of the square block the statistics are gathered on.
pub const MB_SIZE_LOG2: usize = 4;
pub const MB_SIZE: usize = 1 << MB_SIZE_LOG2;

/// Bias added to a divisor so that a perfectly predicted frame (zero
/// error) never divides by zero. Keeps the sign of the input.
#[inline]
pub fn div_check(x: f64) -> f64 {
  if x < 0. {
    x - 0.000001
  } else {
    x + 0.000001
  }
}

/// Number of 16x16 macroblocks along each axis, rounding up.
#[inline]
pub const fn mb_dims(width: usize, height: usize) -> (usize, usize) {
  (
    (width + MB_SIZE - 1) >> MB_SIZE_LOG2,
    (height + MB_SIZE - 1) >> MB_SIZE_LOG2,
  )
}

/// Rounds `x * 2^-n` to the nearest integer, ties away from zero.
#[inline]
pub const fn round_power_of_two(x: i64, n: u32) -> i64 {
  if n == 0 {
    x
  } else {
    (x + (1 << (n - 1))) >> n
  }
}
