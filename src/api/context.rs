// Copyright (c) 2018-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use crate::api::config::*;
use crate::api::internal::*;
use crate::api::util::*;
use crate::firstpass::FirstPassRecord;
use crate::rate::RateControlState;
use crate::twopass::GFGroupSchedule;

use rayon::ThreadPool;
use std::sync::Arc;
use v_frame::pixel::Pixel;
use v_frame::plane::Plane;

/// The encoder context.
///
/// Contains the planning state of one encoding session.
pub struct Context<T: Pixel> {
  pub(crate) inner: ContextInner<T>,
  pub(crate) config: EncoderConfig,
  pub(crate) pool: Option<Arc<ThreadPool>>,
  pub(crate) is_flushing: bool,
}

/// Types which can be pushed as source frames.
///
/// This trait is used in [`Context::push_source_frame`] to accept the luma
/// plane either owned or wrapped in `Arc`, and `None` to flush.
///
/// [`Context::push_source_frame`]: struct.Context.html#method.push_source_frame
pub trait IntoSource<T: Pixel> {
  /// Converts the type into an optional shared plane.
  fn into(self) -> Option<Arc<Plane<T>>>;
}

impl<T: Pixel> IntoSource<T> for Option<Arc<Plane<T>>> {
  fn into(self) -> Option<Arc<Plane<T>>> {
    self
  }
}

impl<T: Pixel> IntoSource<T> for Arc<Plane<T>> {
  fn into(self) -> Option<Arc<Plane<T>>> {
    Some(self)
  }
}

impl<T: Pixel> IntoSource<T> for Plane<T> {
  fn into(self) -> Option<Arc<Plane<T>>> {
    Some(Arc::new(self))
  }
}

impl<T: Pixel> Context<T> {
  /// Allocates and returns a new luma plane of the configured size.
  ///
  /// # Examples
  ///
  /// ```
  /// use vpxrc::prelude::*;
  ///
  /// # fn main() -> Result<(), InvalidConfig> {
  /// let rc = RateControlConfig::new().with_emit_data(true);
  /// let cfg = Config::default().with_rate_control(rc);
  /// let ctx: Context<u8> = cfg.new_context()?;
  /// let plane = ctx.new_plane();
  /// # Ok(())
  /// # }
  /// ```
  #[inline]
  pub fn new_plane(&self) -> Plane<T> {
    Plane::new(self.config.width, self.config.height, 0, 0, 0, 0)
  }

  /// Pushes a source frame into the lookahead.
  ///
  /// In a first pass the frame is analyzed right away and its statistics
  /// become available through [`twopass_out`]. In a second pass the frame
  /// only extends the lookahead the planner may use.
  ///
  /// `timestamp` is in [`time_base`] units and gives the frame duration
  /// from its distance to the previous frame.
  ///
  /// Passing `None` is equivalent to calling [`flush`].
  ///
  /// # Errors
  ///
  /// If this method is called with a frame after the encoder has been
  /// flushed, the [`EncoderStatus::LimitReached`] error is returned.
  ///
  /// # Examples
  ///
  /// ```
  /// use vpxrc::prelude::*;
  ///
  /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
  /// let rc = RateControlConfig::new().with_emit_data(true);
  /// let cfg = Config::default().with_rate_control(rc);
  /// let mut ctx: Context<u8> = cfg.new_context()?;
  /// let f1 = ctx.new_plane();
  /// let f2 = f1.clone();
  ///
  /// ctx.push_source_frame(f1, 0)?;
  /// ctx.push_source_frame(f2, 1)?;
  /// // Flush the encoder, it is equivalent to a call to `flush()`
  /// ctx.push_source_frame(None, 2)?;
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`flush`]: #method.flush
  /// [`twopass_out`]: #method.twopass_out
  /// [`time_base`]: struct.EncoderConfig.html#structfield.time_base
  /// [`EncoderStatus::LimitReached`]: enum.EncoderStatus.html#variant.LimitReached
  #[inline]
  pub fn push_source_frame<F>(
    &mut self, frame: F, timestamp: u64,
  ) -> Result<(), EncoderStatus>
  where
    F: IntoSource<T>,
  {
    let frame = frame.into();

    if frame.is_none() {
      if self.is_flushing {
        return Ok(());
      }
      self.inner.limit = Some(self.inner.frame_count);
      self.is_flushing = true;
      return Ok(());
    } else if self.is_flushing {
      return Err(EncoderStatus::LimitReached);
    }

    let inner = &mut self.inner;
    match self.pool {
      Some(ref pool) => {
        pool.install(|| inner.push_source_frame(frame, timestamp))
      }
      None => inner.push_source_frame(frame, timestamp),
    }
  }

  /// Flushes the encoder.
  ///
  /// Flushing signals the end of the video. After the encoder has been
  /// flushed, no additional frames are accepted and the planner only looks
  /// at the statistics of the frames that were pushed.
  #[inline]
  pub fn flush(&mut self) {
    if !self.is_flushing {
      self.inner.limit = Some(self.inner.frame_count);
      self.is_flushing = true;
    }
  }

  /// Returns the first-pass statistics produced since the last call.
  ///
  /// The first call returns the stream header followed by the records
  /// available so far. Concatenating the returned chunks gives a stream
  /// [`RateControlConfig::from_stats_slice`] accepts. Returns `None` when
  /// there is nothing new, or when the context does not run a first pass.
  ///
  /// [`RateControlConfig::from_stats_slice`]: struct.RateControlConfig.html#method.from_stats_slice
  #[inline]
  pub fn twopass_out(&mut self) -> Option<&[u8]> {
    self.inner.twopass_out()
  }

  /// First-pass records gathered so far, in display order.
  pub fn first_pass_records(&self) -> &[FirstPassRecord] {
    self.inner.first_pass.as_ref().map_or(&[], |fp| fp.records())
  }

  /// Plans the next frame to code, in coding order.
  ///
  /// This is the one call the encoding loop makes before running its pixel
  /// pipeline. The frame must then be coded and its size reported with
  /// [`report_encoded_size`] before the next plan can be requested.
  ///
  /// # Errors
  ///
  /// - [`EncoderStatus::NeedMoreData`] if the lookahead does not hold the
  ///   frames the next group needs.
  /// - [`EncoderStatus::LimitReached`] once every frame has been planned.
  /// - [`EncoderStatus::NotReady`] if the previous plan was not reported.
  /// - [`EncoderStatus::Failure`] if the schedule cannot be coded.
  ///
  /// # Examples
  ///
  /// ```
  /// use vpxrc::prelude::*;
  ///
  /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
  /// # let mut stats = Vec::new();
  /// # for i in 0..8 {
  /// #   stats.push(FirstPassRecord {
  /// #     frame: i as f64,
  /// #     weight: 1.0,
  /// #     intra_error: 2000.0,
  /// #     coded_error: 400.0,
  /// #     sr_coded_error: 400.0,
  /// #     pcnt_inter: 0.9,
  /// #     duration: 1.0 / 30.0,
  /// #     count: 1.0,
  /// #     ..Default::default()
  /// #   });
  /// # }
  /// let rc = RateControlConfig::new().with_bitrate(500_000).with_stats(stats);
  /// let cfg = Config::default().with_rate_control(rc);
  /// let mut ctx: Context<u8> = cfg.new_context()?;
  /// for i in 0..8 {
  ///   ctx.push_source_frame(ctx.new_plane(), i)?;
  /// }
  /// ctx.flush();
  ///
  /// loop {
  ///   match ctx.get_next_frame_plan() {
  ///     Ok(plan) => {
  ///       // Code the frame at `plan.qindex`, then report its size.
  ///       ctx.report_encoded_size(plan.target_bits.max(0) as u64)?;
  ///     }
  ///     Err(EncoderStatus::LimitReached) => break,
  ///     Err(err) => Err(err)?,
  ///   }
  /// }
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`report_encoded_size`]: #method.report_encoded_size
  /// [`EncoderStatus::NeedMoreData`]: enum.EncoderStatus.html#variant.NeedMoreData
  /// [`EncoderStatus::LimitReached`]: enum.EncoderStatus.html#variant.LimitReached
  /// [`EncoderStatus::NotReady`]: enum.EncoderStatus.html#variant.NotReady
  /// [`EncoderStatus::Failure`]: enum.EncoderStatus.html#variant.Failure
  #[inline]
  pub fn get_next_frame_plan(&mut self) -> Result<FramePlan, EncoderStatus> {
    self.inner.get_next_frame_plan()
  }

  /// Reports the size of the frame returned by the last
  /// [`get_next_frame_plan`] call and runs the rate feedback.
  ///
  /// # Errors
  ///
  /// Returns [`EncoderStatus::NotReady`] if no plan is outstanding.
  ///
  /// [`get_next_frame_plan`]: #method.get_next_frame_plan
  /// [`EncoderStatus::NotReady`]: enum.EncoderStatus.html#variant.NotReady
  #[inline]
  pub fn report_encoded_size(
    &mut self, actual_bits: u64,
  ) -> Result<(), EncoderStatus> {
    self.inner.report_encoded_size(actual_bits)
  }

  /// The golden frame group being coded, if the second pass started.
  pub fn current_group(&self) -> Option<&GFGroupSchedule> {
    self.inner.second_pass.as_ref().and_then(|sp| sp.twopass.current_group())
  }

  /// Rate control state of the second pass.
  pub fn rate_control_state(&self) -> Option<&RateControlState> {
    self.inner.second_pass.as_ref().map(|sp| &sp.rc)
  }

  /// Returns the configuration the context was created with.
  #[inline]
  pub fn config(&self) -> &EncoderConfig {
    &self.config
  }
}
