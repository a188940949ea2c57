// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use super::gf_group::{GFGroupSchedule, GroupLayout, UpdateType};
use crate::util::div_check;

/// Bits of a boosted frame out of `total_group_bits`, when it is worth
/// `boost` percent of a frame next to `frame_count` normal frames.
pub fn calculate_boost_bits(
  frame_count: i64, boost: i32, total_group_bits: i64,
) -> i64 {
  if frame_count <= 0 || boost <= 0 || total_group_bits <= 0 {
    return 0;
  }
  let mut boost = boost as i64;
  let mut allocation_chunks = frame_count * 100 + boost;

  // Keep the product in range.
  if boost > 1023 {
    let divisor = boost >> 10;
    boost /= divisor;
    allocation_chunks /= divisor;
  }
  ((boost * total_group_bits) / allocation_chunks).max(0)
}

/// Share of the key frame group budget that goes to a golden group with
/// score `gf_group_err`.
pub fn calculate_total_gf_group_bits(
  kf_group_bits: i64, kf_group_error_left: f64, gf_group_err: f64,
  max_bits: i64, baseline_gf_interval: usize,
) -> i64 {
  let total = if kf_group_bits > 0 && kf_group_error_left > 0.0 {
    (kf_group_bits as f64 * (gf_group_err / kf_group_error_left)) as i64
  } else {
    0
  };
  total
    .max(0)
    .min(kf_group_bits.max(0))
    .min(max_bits.saturating_mul(baseline_gf_interval as i64))
}

/// Largest allocation of a single inter frame.
pub fn frame_max_bits(
  avg_frame_bandwidth: i64, max_frame_bandwidth: i64, vbr_max_section: u32,
) -> i64 {
  let max_bits = avg_frame_bandwidth * vbr_max_section as i64 / 100;
  max_bits.max(0).min(max_frame_bandwidth)
}

fn is_normal(update: UpdateType, alt_ref: bool) -> bool {
  match update {
    UpdateType::Lf
    | UpdateType::Brf
    | UpdateType::Bipred
    | UpdateType::LastBipred => true,
    // A golden frame coded next to a new alt-ref is not boosted itself.
    UpdateType::Gf => alt_ref,
    _ => false,
  }
}

/// Spreads the group budget over its slots.
///
/// The key frame keeps `kf_bits`. The golden frame or alt-ref receives
/// the group's boost bits, internal alt-refs a boost out of their
/// sub-group, and the remaining frames split what is left in proportion
/// to their scores, each capped at `max_bits`. Overlays cost nothing.
pub fn allocate_gf_group_bits<F>(
  schedule: &mut GFGroupSchedule, layout: &GroupLayout, score: F,
  kf_bits: i64, max_bits: i64, last_frame_reduction: (i64, i64),
) where
  F: Fn(usize) -> f64,
{
  let alt_ref = schedule.source_alt_ref_pending;
  let gf_arf_bits = schedule.gf_arf_bits;
  let mut total_group_bits = schedule.bit_budget;
  if layout.first == UpdateType::Kf {
    total_group_bits -= kf_bits;
  }
  if alt_ref || layout.first == UpdateType::Gf {
    total_group_bits -= gf_arf_bits;
  }
  total_group_bits = total_group_bits.max(0);

  for slot in schedule.slots.iter_mut() {
    slot.bit_allocation = match slot.update_type {
      UpdateType::Kf => kf_bits,
      UpdateType::Arf => gf_arf_bits,
      UpdateType::Gf if !alt_ref => gf_arf_bits,
      _ => 0,
    };
  }

  let extra_arfs = layout.extra_arfs();
  if extra_arfs > 0 {
    let len = layout.baseline_gf_interval.max(1) as i64;
    let chunk = (layout.baseline_gf_interval / (extra_arfs + 1)) as i64;
    let sub_group_bits = total_group_bits * chunk / len;
    let ext_arf_bits = calculate_boost_bits(
      layout.ext_arf_interval() as i64,
      schedule.gfu_boost,
      sub_group_bits,
    );
    let mut spent = 0;
    for slot in schedule.slots.iter_mut() {
      if slot.update_type == UpdateType::IntnlArf {
        slot.bit_allocation = ext_arf_bits;
        spent += ext_arf_bits;
      }
    }
    total_group_bits -= spent;
  }

  let normals: Vec<usize> = (0..schedule.slots.len())
    .filter(|&i| is_normal(schedule.slots[i].update_type, alt_ref))
    .collect();
  let scores: Vec<f64> =
    normals.iter().map(|&i| score(schedule.slots[i].display_index)).collect();
  let group_error: f64 = scores.iter().sum();
  let cap = max_bits.max(0).min(total_group_bits);

  for (&i, &s) in normals.iter().zip(scores.iter()) {
    let err_fraction =
      if group_error > 0.0 { s / div_check(group_error) } else { 0.0 };
    let target = (total_group_bits as f64 * err_fraction) as i64;
    schedule.slots[i].bit_allocation = target.max(0).min(cap);
  }

  // With internal alt-refs the last frame of the group is predicted from
  // a close reference; move a small share of it to the middle frame.
  if extra_arfs > 0 && normals.len() > 2 {
    let mut by_display = normals.clone();
    by_display.sort_by_key(|&i| schedule.slots[i].display_index);
    let last = by_display[by_display.len() - 1];
    let mid = by_display[(by_display.len() - 1) / 2];
    let (num, den) = last_frame_reduction;
    if den > 0 && mid != last {
      let shaved = schedule.slots[last].bit_allocation * num / den;
      schedule.slots[last].bit_allocation -= shaved;
      schedule.slots[mid].bit_allocation += shaved;
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::refs::ReferenceTopology;
  use interpolate_name::interpolate_test;

  #[test]
  fn boost_bits_edge_cases() {
    assert_eq!(calculate_boost_bits(0, 500, 1000), 0);
    assert_eq!(calculate_boost_bits(10, 0, 1000), 0);
    assert_eq!(calculate_boost_bits(10, 500, 0), 0);
    assert_eq!(calculate_boost_bits(10, 500, -5), 0);
    // 500 / (1000 + 500) of the bits.
    assert_eq!(calculate_boost_bits(10, 500, 3000), 1000);
  }

  #[test]
  fn large_boost_is_rescaled() {
    let bits = calculate_boost_bits(5, 5000, 1_000_000);
    // 5000 / 5500 before rescaling; the divisor of 4 changes little.
    assert!(bits > 900_000 && bits < 1_000_000, "{}", bits);
    assert!(calculate_boost_bits(5, 4000, 1_000_000) < bits);
  }

  #[test]
  fn total_group_bits_clamps() {
    assert_eq!(calculate_total_gf_group_bits(1000, 10.0, 5.0, 1000, 10), 500);
    assert_eq!(calculate_total_gf_group_bits(1000, 10.0, 50.0, 1000, 10), 1000);
    assert_eq!(calculate_total_gf_group_bits(1000, 10.0, 5.0, 20, 10), 200);
    assert_eq!(calculate_total_gf_group_bits(1000, 0.0, 5.0, 1000, 10), 0);
    assert_eq!(calculate_total_gf_group_bits(-1, 10.0, 5.0, 1000, 10), 0);
  }

  #[test]
  fn max_bits_is_clamped() {
    assert_eq!(frame_max_bits(1000, 1_000_000, 200), 2000);
    assert_eq!(frame_max_bits(1000, 1500, 200), 1500);
    assert_eq!(frame_max_bits(-10, 1500, 200), 0);
  }

  fn schedule(
    first: UpdateType, alt_ref: bool, extra: usize, bipred: usize,
    len: usize, budget: i64,
  ) -> (GFGroupSchedule, GroupLayout) {
    let layout = GroupLayout {
      start: 10,
      baseline_gf_interval: len,
      first,
      alt_ref,
      num_extra_arfs: extra,
      bipred_group_interval: bipred,
      topology: ReferenceTopology::Extended,
    };
    let s = GFGroupSchedule {
      start: 10,
      baseline_gf_interval: len,
      slots: layout.slots(),
      bit_budget: budget,
      gfu_boost: 800,
      gf_arf_bits: calculate_boost_bits(len as i64, 800, budget / 2),
      source_alt_ref_pending: alt_ref,
      num_extra_arfs: extra,
      gf_group_err: 0.0,
      gf_zeromotion_pct: 0,
      active_worst_quality: 100,
    };
    (s, layout)
  }

  #[interpolate_test(kf_plain, UpdateType::Kf, false, 0, 0)]
  #[interpolate_test(kf_arf, UpdateType::Kf, true, 0, 0)]
  #[interpolate_test(gf_plain, UpdateType::Gf, false, 0, 0)]
  #[interpolate_test(gf_arf, UpdateType::Gf, true, 0, 0)]
  #[interpolate_test(overlay_multi_arf, UpdateType::Overlay, true, 2, 0)]
  #[interpolate_test(overlay_bipred, UpdateType::Overlay, true, 1, 3)]
  fn allocation_fits_budget(
    first: UpdateType, alt_ref: bool, extra: usize, bipred: usize,
  ) {
    for len in [1, 2, 5, 9, 16, 23] {
      let budget = 400_000;
      let kf_bits = if first == UpdateType::Kf { budget / 2 } else { 0 };
      let (mut s, layout) = schedule(first, alt_ref, extra, bipred, len, budget);
      allocate_gf_group_bits(
        &mut s,
        &layout,
        |d| 10.0 + (d % 7) as f64,
        kf_bits,
        budget / 4,
        (1, 16),
      );
      assert!(s.slots.iter().all(|x| x.bit_allocation >= 0));
      assert!(
        s.total_allocation() <= budget,
        "len {}: {} > {}",
        len,
        s.total_allocation(),
        budget
      );
      for slot in &s.slots {
        if slot.update_type.is_overlay() {
          assert_eq!(slot.bit_allocation, 0);
        }
      }
    }
  }

  #[test]
  fn boosted_frames_get_more() {
    let (mut s, layout) = schedule(UpdateType::Gf, true, 0, 0, 12, 240_000);
    allocate_gf_group_bits(&mut s, &layout, |_| 10.0, 0, 100_000, (1, 16));
    let arf = s.slots.iter().find(|x| x.update_type == UpdateType::Arf);
    let lf = s.slots.iter().find(|x| x.update_type == UpdateType::Lf);
    assert!(arf.unwrap().bit_allocation > lf.unwrap().bit_allocation);
    // The golden frame next to a new alt-ref is paid like a normal frame.
    assert_eq!(s.slots[0].bit_allocation, lf.unwrap().bit_allocation);
  }
}
