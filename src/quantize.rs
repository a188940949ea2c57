// Copyright (c) 2017-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Mapping between quantizer indices and real quantizer step sizes.
//!
//! All rate modelling happens in the 8-bit domain: first-pass errors of
//! high bit depth input are scaled down before they are stored, so the
//! 8-bit AC table serves every bit depth.

/// Number of quantizer indices.
pub const QINDEX_RANGE: usize = 256;
/// Largest quantizer index.
pub const MAXQ: u8 = 255;

#[rustfmt::skip]
static AC_QLOOKUP: [i16; QINDEX_RANGE] = [
  4, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
  26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44,
  45, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63,
  64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82,
  83, 84, 85, 86, 87, 88, 89, 90, 91, 92, 93, 94, 95, 96, 97, 98, 99, 100,
  101, 102, 104, 106, 108, 110, 112, 114, 116, 118, 120, 122, 124, 126, 128,
  130, 132, 134, 136, 138, 140, 142, 144, 146, 148, 150, 152, 155, 158, 161,
  164, 167, 170, 173, 176, 179, 182, 185, 188, 191, 194, 197, 200, 203, 207,
  211, 215, 219, 223, 227, 231, 235, 239, 243, 247, 251, 255, 260, 265, 270,
  275, 280, 285, 290, 295, 300, 305, 311, 317, 323, 329, 335, 341, 347, 353,
  359, 366, 373, 380, 387, 394, 401, 408, 416, 424, 432, 440, 448, 456, 465,
  474, 483, 492, 501, 510, 520, 530, 540, 550, 560, 571, 582, 593, 604, 615,
  627, 639, 651, 663, 676, 689, 702, 715, 729, 743, 757, 771, 786, 801, 816,
  832, 848, 864, 881, 898, 915, 933, 951, 969, 988, 1007, 1026, 1046, 1066,
  1087, 1108, 1129, 1151, 1173, 1196, 1219, 1243, 1267, 1292, 1317, 1343,
  1369, 1396, 1423, 1451, 1479, 1508, 1537, 1567, 1597, 1628, 1660, 1692,
  1725, 1759, 1793, 1828,
];

#[inline]
pub fn ac_q(qindex: u8) -> i16 {
  AC_QLOOKUP[qindex as usize]
}

/// Real quantizer step for `qindex`, in the units the rate model expects.
#[inline]
pub fn qindex_to_q(qindex: u8) -> f64 {
  ac_q(qindex) as f64 / 4.0
}

/// Smallest index in `[best, worst)` whose quantizer reaches `q`, or
/// `worst` if none does.
pub fn q_to_qindex(q: f64, best: u8, worst: u8) -> u8 {
  (best..worst).find(|&i| qindex_to_q(i) >= q).unwrap_or(worst)
}

/// Index delta needed to move from quantizer `qstart` to `qtarget`, both
/// searched inside `[best, worst]`.
pub fn compute_qdelta(qstart: f64, qtarget: f64, best: u8, worst: u8) -> i32 {
  let start = q_to_qindex(qstart, best, worst);
  let target = q_to_qindex(qtarget, best, worst);
  target as i32 - start as i32
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn table_is_monotonic() {
    for w in AC_QLOOKUP.windows(2) {
      assert!(w[0] < w[1]);
    }
  }

  #[test]
  fn endpoints() {
    assert_eq!(qindex_to_q(0), 1.0);
    assert_eq!(qindex_to_q(MAXQ), 457.0);
  }

  #[test]
  fn qindex_round_trip() {
    for i in 0..MAXQ {
      assert_eq!(q_to_qindex(qindex_to_q(i), 0, MAXQ), i);
    }
  }

  #[test]
  fn qdelta_sign() {
    let q = qindex_to_q(100);
    assert!(compute_qdelta(q, q * 1.25, 0, MAXQ) > 0);
    assert!(compute_qdelta(q, q * 0.75, 0, MAXQ) < 0);
    assert_eq!(compute_qdelta(q, q, 0, MAXQ), 0);
  }
}
