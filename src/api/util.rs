// Copyright (c) 2018-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use crate::rate::QuantizerChoice;
use crate::refs::RefreshFlags;
use crate::serialize::{Deserialize, Serialize};
use crate::twopass::{GFGroupSlot, RateFactorLevel, UpdateType};

use std::fmt;

use thiserror::*;

/// A rational number.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Rational {
  /// Numerator.
  pub num: u64,
  /// Denominator.
  pub den: u64,
}

impl Rational {
  /// Creates a rational number from the given numerator and denominator.
  pub const fn new(num: u64, den: u64) -> Self {
    Rational { num, den }
  }

  /// Returns a rational number that is the reciprocal of the given one.
  pub const fn from_reciprocal(reciprocal: Self) -> Self {
    Rational { num: reciprocal.den, den: reciprocal.num }
  }

  /// Returns the rational number as a floating-point number.
  pub fn as_f64(self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

#[cfg(feature = "serialize")]
impl serde::Serialize for Rational {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    (self.num, self.den).serialize(serializer)
  }
}

#[cfg(feature = "serialize")]
impl<'a> serde::Deserialize<'a> for Rational {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'a>,
  {
    let (num, den) = serde::Deserialize::deserialize(deserializer)?;

    Ok(Rational::new(num, den))
  }
}

/// Possible types of a frame.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[repr(C)]
pub enum FrameType {
  /// Key frame.
  Key,
  /// Inter-frame.
  Inter,
}

impl fmt::Display for FrameType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::FrameType::*;
    match self {
      Key => write!(f, "Key frame"),
      Inter => write!(f, "Inter frame"),
    }
  }
}

/// Status that can be returned by [`Context`] functions.
///
/// [`Context`]: struct.Context.html
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EncoderStatus {
  /// The encoder needs more source frames before it can plan the next one.
  ///
  /// May be emitted by [`Context::get_next_frame_plan()`] while the
  /// lookahead is not full.
  ///
  /// [`Context::get_next_frame_plan()`]: struct.Context.html#method.get_next_frame_plan
  #[error("need more data")]
  NeedMoreData,
  /// Every frame has been planned.
  ///
  /// May be emitted by [`Context::get_next_frame_plan()`] after a flush
  /// request had been processed, and by [`Context::push_source_frame()`]
  /// when trying to push a frame after the encoder has been flushed.
  ///
  /// [`Context::get_next_frame_plan()`]: struct.Context.html#method.get_next_frame_plan
  /// [`Context::push_source_frame()`]: struct.Context.html#method.push_source_frame
  #[error("limit reached")]
  LimitReached,
  /// Fatal error, the session cannot continue.
  #[error("failure: {0}")]
  Failure(&'static str),
  /// The call does not match the plan/report sequence: a plan was
  /// requested while the size of the previous one was not reported yet,
  /// or a size was reported without a plan outstanding.
  #[error("not ready")]
  NotReady,
}

/// What the caller must do to code the next frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FramePlan {
  /// Position of the frame in coding order.
  pub coding_index: u64,
  /// Display index of the source frame.
  pub display_index: u64,
  /// For hidden frames, how far ahead of the next shown frame the source
  /// lies. 0 for shown frames.
  pub arf_src_offset: usize,
  /// Key or inter frame.
  pub frame_type: FrameType,
  /// Role of the frame in its group.
  pub update_type: UpdateType,
  /// Rate factor level.
  pub rf_level: RateFactorLevel,
  /// The frame is displayed when decoded.
  pub show_frame: bool,
  /// Reference buffers the frame refreshes.
  pub refresh: RefreshFlags,
  /// Quantizer index to code the frame at.
  pub qindex: u8,
  /// Lowest quantizer index a recode may use.
  pub q_low: u8,
  /// Highest quantizer index a recode may use.
  pub q_high: u8,
  /// Number of bits the frame should take.
  pub target_bits: i64,
}

impl FramePlan {
  pub(crate) fn new(
    coding_index: u64, slot: &GFGroupSlot, q: QuantizerChoice,
    target_bits: i64,
  ) -> Self {
    FramePlan {
      coding_index,
      display_index: slot.display_index as u64,
      arf_src_offset: slot.arf_src_offset,
      frame_type: if slot.update_type == UpdateType::Kf {
        FrameType::Key
      } else {
        FrameType::Inter
      },
      update_type: slot.update_type,
      rf_level: slot.rf_level,
      show_frame: slot.show_frame,
      refresh: slot.refresh.clone(),
      qindex: q.q,
      q_low: q.bottom_index,
      q_high: q.top_index,
      target_bits,
    }
  }

  /// The frame reuses an already coded picture and needs no encoding.
  #[inline]
  pub fn is_show_existing(&self) -> bool {
    self.update_type == UpdateType::ShowExisting
  }

  /// Returns the `(q_low, q_high)` window a recode loop should search after
  /// the frame came out at `actual_bits`.
  ///
  /// An overshoot moves the lower bound above the quantizer just tried, an
  /// undershoot moves the upper bound below it. A frame within its target
  /// keeps its window.
  pub fn recode_bounds(&self, actual_bits: i64) -> (u8, u8) {
    let (low, high) = (self.q_low, self.q_high);
    let q = self.qindex.clamp(low, high);
    if actual_bits > self.target_bits && q < high {
      ((q + 1).max(low), high)
    } else if actual_bits < self.target_bits && q > low {
      (low, (q - 1).min(high))
    } else {
      (low, high)
    }
  }
}

impl fmt::Display for FramePlan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Frame {} ({}) - {} - q {} [{}, {}] - {} bits",
      self.display_index,
      self.update_type,
      self.frame_type,
      self.qindex,
      self.q_low,
      self.q_high,
      self.target_bits
    )
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::refs::ReferenceTopology;

  fn plan(q: u8, low: u8, high: u8) -> FramePlan {
    FramePlan {
      coding_index: 3,
      display_index: 3,
      arf_src_offset: 0,
      frame_type: FrameType::Inter,
      update_type: UpdateType::Lf,
      rf_level: RateFactorLevel::InterNormal,
      show_frame: true,
      refresh: RefreshFlags::for_update(
        UpdateType::Lf,
        ReferenceTopology::Classic,
      ),
      qindex: q,
      q_low: low,
      q_high: high,
      target_bits: 10_000,
    }
  }

  #[test]
  fn recode_bounds_follow_the_miss() {
    let p = plan(100, 80, 140);
    assert_eq!(p.recode_bounds(20_000), (101, 140));
    assert_eq!(p.recode_bounds(5_000), (80, 99));
    assert_eq!(p.recode_bounds(10_000), (80, 140));
  }

  #[test]
  fn recode_bounds_stay_in_range() {
    assert_eq!(plan(140, 80, 140).recode_bounds(20_000), (80, 140));
    assert_eq!(plan(80, 80, 140).recode_bounds(1), (80, 140));
  }
}
