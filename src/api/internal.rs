// Copyright (c) 2018-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use crate::api::{EncoderConfig, EncoderStatus, FramePlan, RateControlConfig};
use crate::firstpass::{
  stats_to_vec, DiamondSearch, FirstPass, FirstPassRecord, STATS_HEADER_SZ,
};
use crate::rate::RateControlState;
use crate::refs::{required_reference, BufferPool, ReferencePool};
use crate::twopass::{GFGroupSlot, PlannerConfig, TwoPass};

use std::collections::VecDeque;
use std::sync::Arc;
use v_frame::pixel::Pixel;
use v_frame::plane::Plane;

/// The second pass: planner, rate control and the reference pool the
/// planned frames are checked against.
pub(crate) struct SecondPass {
  pub(crate) twopass: TwoPass,
  pub(crate) rc: RateControlState,
  /// Display index of the frame held by each reference.
  pub(crate) refs: BufferPool<u64>,
  /// Slot whose size has not been reported yet.
  pub(crate) outstanding: Option<(GFGroupSlot, u8)>,
}

pub(crate) struct ContextInner<T: Pixel> {
  pub(crate) planner: PlannerConfig,
  /// Seconds per time base tick.
  tick: f64,
  /// Frames pushed so far.
  pub(crate) frame_count: u64,
  /// Frames to be planned, `None` until the encoder is flushed.
  pub(crate) limit: Option<u64>,
  last_timestamp: Option<u64>,
  /// Frames coded so far, hidden ones included.
  pub(crate) coded_frames: u64,
  pub(crate) first_pass: Option<FirstPass<T, DiamondSearch>>,
  /// First-pass records not yet handed out by `twopass_out`.
  pub(crate) pending_records: VecDeque<FirstPassRecord>,
  twopass_buf: Vec<u8>,
  header_emitted: bool,
  pub(crate) second_pass: Option<SecondPass>,
}

impl<T: Pixel> ContextInner<T> {
  pub fn new(enc: &EncoderConfig, rc: &RateControlConfig) -> Self {
    let planner = PlannerConfig::new(enc, rc);

    let first_pass = rc.emit_pass_data.then(|| {
      FirstPass::new(
        DiamondSearch { search_range: enc.first_pass_search_range },
        enc.width,
        enc.height,
        enc.bit_depth,
      )
    });

    let second_pass = rc.stats.clone().map(|stats| {
      info!("second pass: {} frames of statistics", stats.len());
      let (twopass, rc) = TwoPass::new(&planner, stats);
      SecondPass {
        twopass,
        rc,
        refs: BufferPool::new(planner.topology),
        outstanding: None,
      }
    });

    ContextInner {
      planner,
      tick: enc.time_base.as_f64(),
      frame_count: 0,
      limit: None,
      last_timestamp: None,
      coded_frames: 0,
      first_pass,
      pending_records: VecDeque::new(),
      twopass_buf: Vec::new(),
      header_emitted: false,
      second_pass,
    }
  }

  pub fn push_source_frame(
    &mut self, frame: Option<Arc<Plane<T>>>, timestamp: u64,
  ) -> Result<(), EncoderStatus> {
    let frame = match frame {
      Some(frame) => frame,
      None => return Ok(()),
    };
    if self.frame_count == i32::MAX as u64 {
      return Err(EncoderStatus::LimitReached);
    }
    // Only the first pass reads pixels.
    if self.first_pass.is_some()
      && (frame.cfg.width != self.planner.width
        || frame.cfg.height != self.planner.height)
    {
      return Err(EncoderStatus::Failure(
        "frame size does not match the configuration",
      ));
    }

    let ticks = match self.last_timestamp {
      Some(last) if timestamp > last => timestamp - last,
      _ => 1,
    };
    self.last_timestamp = Some(timestamp);

    if let Some(ref mut fp) = self.first_pass {
      let record = fp.push_frame(frame, ticks as f64 * self.tick);
      self.pending_records.push_back(*record);
    }
    self.frame_count += 1;
    Ok(())
  }

  pub fn twopass_out(&mut self) -> Option<&[u8]> {
    if self.first_pass.is_none()
      || (self.header_emitted && self.pending_records.is_empty())
    {
      return None;
    }
    let records: Vec<_> = self.pending_records.drain(..).collect();
    let bytes = stats_to_vec(&records);
    let skip = if self.header_emitted { STATS_HEADER_SZ } else { 0 };
    self.header_emitted = true;
    self.twopass_buf.clear();
    self.twopass_buf.extend_from_slice(&bytes[skip..]);
    Some(&self.twopass_buf)
  }

  // Highest record the planner may read: the whole clip, or only the
  // frames that were actually pushed once the encoder is flushed.
  fn stats_horizon(&self, stats_len: usize) -> usize {
    match self.limit {
      Some(limit) => (limit as usize).min(stats_len),
      None => stats_len,
    }
  }

  pub fn get_next_frame_plan(&mut self) -> Result<FramePlan, EncoderStatus> {
    let horizon = match self.second_pass {
      Some(ref sp) => self.stats_horizon(sp.twopass.stats().len()),
      None => {
        return Err(if self.limit.is_some() {
          EncoderStatus::LimitReached
        } else {
          EncoderStatus::NeedMoreData
        })
      }
    };
    let lag = self.planner.lag_in_frames as u64;
    let frame_count = self.frame_count;
    let flushing = self.limit.is_some();
    let coding_index = self.coded_frames;
    let cfg = &self.planner;
    let sp = self.second_pass.as_mut().ok_or(EncoderStatus::NotReady)?;

    if sp.outstanding.is_some() {
      return Err(EncoderStatus::NotReady);
    }

    if !sp.twopass.in_group() {
      let start = sp.twopass.next_group_start() as u64;
      if start >= horizon as u64 {
        return Err(if flushing || start >= sp.twopass.stats().len() as u64 {
          EncoderStatus::LimitReached
        } else {
          EncoderStatus::NeedMoreData
        });
      }
      // The group may reach as far as the lookahead.
      if !flushing && frame_count < (start + lag + 1).min(horizon as u64) {
        return Err(EncoderStatus::NeedMoreData);
      }
    }

    let slot = match sp.twopass.next_slot(cfg, &mut sp.rc, horizon) {
      Some(slot) => slot,
      None => return Err(EncoderStatus::LimitReached),
    };
    if slot.display_index as u64 >= frame_count {
      return Err(EncoderStatus::NeedMoreData);
    }
    if let Some(role) = required_reference(slot.update_type) {
      if sp.refs.get_reference_buffer(role).is_none() {
        return Err(EncoderStatus::Failure(
          "reference frame missing for the scheduled frame",
        ));
      }
    }

    let target = sp.rc.frame_target(cfg, &slot);
    let q = sp.rc.pick_q_and_bounds(cfg, &slot);
    debug!(
      "frame {} {} at {}: target {} q {} [{}, {}]",
      coding_index,
      slot.update_type,
      slot.display_index,
      target,
      q.q,
      q.bottom_index,
      q.top_index
    );
    let plan = FramePlan::new(coding_index, &slot, q, target);
    sp.outstanding = Some((slot, q.q));
    Ok(plan)
  }

  pub fn report_encoded_size(
    &mut self, actual_bits: u64,
  ) -> Result<(), EncoderStatus> {
    let cfg = &self.planner;
    let sp = self.second_pass.as_mut().ok_or(EncoderStatus::NotReady)?;
    let (slot, q) = sp.outstanding.take().ok_or(EncoderStatus::NotReady)?;

    let actual_bits = actual_bits.min(i64::MAX as u64) as i64;
    sp.rc.postencode(cfg, &slot, q, actual_bits);
    sp.refs.refresh(&slot.refresh, slot.display_index as u64);
    sp.twopass.advance();
    self.coded_frames += 1;
    trace!(
      "frame {} reported {} bits, {} left",
      slot.display_index,
      actual_bits,
      sp.rc.bits_left()
    );
    Ok(())
  }
}
