// Copyright (c) 2020-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use thiserror::Error;

use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

use crate::api::{Context, ContextInner};
use v_frame::pixel::Pixel;

mod encoder;
pub use encoder::*;

mod rate;
pub use rate::{RateControlConfig, RateMode};

mod tuning;
pub use tuning::*;

pub use crate::firstpass::StatsError;

/// Enumeration of possible invalid configuration errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected >= 16, <= 65535)")]
  InvalidWidth(usize),
  /// The height is invalid.
  #[error("invalid height {0} (expected >= 16, <= 65535)")]
  InvalidHeight(usize),
  /// The bit depth is not supported.
  #[error("invalid bit depth {0} (expected 8, 10 or 12)")]
  InvalidBitDepth(usize),
  /// Maximal keyframe interval is invalid.
  #[error("invalid max keyframe interval {actual} (expected <= {max})")]
  InvalidMaxKeyFrameInterval {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Framerate numerator is invalid.
  #[error("invalid framerate numerator {actual} (expected > 0, <= {max})")]
  InvalidFrameRateNum {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Framerate denominator is invalid.
  #[error("invalid framerate denominator {actual} (expected > 0, <= {max})")]
  InvalidFrameRateDen {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// The golden frame interval range is empty.
  #[error("invalid golden frame interval {min}..={max}")]
  InvalidGoldenFrameInterval {
    /// The shortest group.
    min: usize,
    /// The longest group.
    max: usize,
  },
  /// Lookahead depth is invalid.
  #[error("invalid lag in frames {actual} (expected <= {max})")]
  InvalidLagInFrames {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// Bi-predictive mini-groups need at least two frames.
  #[error("invalid bipred group interval {0} (expected 0 or >= 2)")]
  InvalidBipredGroupInterval(usize),

  /// The rate control needs a target bitrate in order to produce results
  #[error("The rate control requires a target bitrate")]
  TargetBitrateNeeded,
  /// The quality range is empty.
  #[error("invalid quality range {best}..={worst}")]
  InvalidQualityRange {
    /// Best quality.
    best: u8,
    /// Worst quality.
    worst: u8,
  },
  /// The constrained quality level lies outside the quality range.
  #[error("invalid cq level {0}")]
  InvalidCqLevel(u8),
  /// Section limits are inverted.
  #[error("invalid section limits {min}%..={max}%")]
  InvalidSectionLimits {
    /// Smallest section, percent.
    min: u32,
    /// Largest section, percent.
    max: u32,
  },

  /// The configuration asks for a second pass without statistics, or for
  /// no pass at all.
  #[error("Mismatch in the rate control configuration")]
  RateControlConfigurationMismatch,
}

/// Contains the encoder configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
  /// Settings which impact the frame schedule.
  pub(crate) enc: EncoderConfig,
  /// Rate control configuration
  pub(crate) rate_control: RateControlConfig,
  /// The number of threads in the threadpool.
  pub(crate) threads: usize,
  /// Shared thread pool
  pub(crate) pool: Option<Arc<ThreadPool>>,
}

impl Config {
  /// Create a default configuration
  ///
  /// same as `Default::default()`
  pub fn new() -> Self {
    Config::default()
  }

  /// Set the encoder configuration
  ///
  /// `EncoderConfig` contains the settings impacting the group structure.
  pub fn with_encoder_config(mut self, enc: EncoderConfig) -> Self {
    self.enc = enc;
    self
  }

  /// Set the number of workers in the threadpool
  ///
  /// The threadpool runs the first pass block analysis.
  ///
  /// If it is left unset, the encoder will use the default global
  /// threadpool provided by Rayon instead.
  pub const fn with_threads(mut self, threads: usize) -> Self {
    self.threads = threads;
    self
  }

  /// Set the rate control configuration
  pub fn with_rate_control(mut self, rate_control: RateControlConfig) -> Self {
    self.rate_control = rate_control;
    self
  }

  /// Use the provided threadpool
  ///
  /// It takes priority over `with_threads()`
  pub fn with_thread_pool(mut self, pool: Arc<ThreadPool>) -> Self {
    self.pool = Some(pool);
    self
  }

  /// The encoder configuration.
  pub fn encoder_config(&self) -> &EncoderConfig {
    &self.enc
  }

  /// The rate control configuration.
  pub fn rate_control(&self) -> &RateControlConfig {
    &self.rate_control
  }
}

impl Config {
  pub(crate) fn new_inner<T: Pixel>(
    &self,
  ) -> Result<ContextInner<T>, InvalidConfig> {
    self.validate()?;

    let mut enc = self.enc;
    enc.set_key_frame_interval(
      enc.min_key_frame_interval,
      enc.max_key_frame_interval,
    );

    Ok(ContextInner::new(&enc, &self.rate_control))
  }

  /// Create a new threadpool with this configuration if set,
  /// or return `None` if global threadpool should be used instead.
  pub(crate) fn new_thread_pool(&self) -> Option<Arc<ThreadPool>> {
    if let Some(ref p) = self.pool {
      Some(p.clone())
    } else if self.threads != 0 {
      match ThreadPoolBuilder::new().num_threads(self.threads).build() {
        Ok(pool) => Some(Arc::new(pool)),
        Err(e) => {
          warn!("falling back to the global thread pool: {}", e);
          None
        }
      }
    } else {
      None
    }
  }

  /// Creates a [`Context`] with this configuration.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` if the config is invalid.
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
  /// # Ok(())
  /// # }
  /// ```
  ///
  /// [`Context`]: struct.Context.html
  pub fn new_context<T: Pixel>(&self) -> Result<Context<T>, InvalidConfig> {
    let inner = self.new_inner()?;
    let pool = self.new_thread_pool();

    Ok(Context { is_flushing: false, inner, pool, config: self.enc })
  }

  /// Validates the configuration.
  ///
  /// # Errors
  ///
  /// - Returns `InvalidConfig` if any setting is out of range or the
  ///   rate control settings contradict each other.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let config = &self.enc;

    if config.width < 16 || config.width > u16::MAX as usize {
      return Err(InvalidWidth(config.width));
    }
    if config.height < 16 || config.height > u16::MAX as usize {
      return Err(InvalidHeight(config.height));
    }
    if !matches!(config.bit_depth, 8 | 10 | 12) {
      return Err(InvalidBitDepth(config.bit_depth));
    }

    if config.max_key_frame_interval > MAX_MAX_KEY_FRAME_INTERVAL {
      return Err(InvalidMaxKeyFrameInterval {
        actual: config.max_key_frame_interval,
        max: MAX_MAX_KEY_FRAME_INTERVAL,
      });
    }

    if config.time_base.num == 0 || config.time_base.num > u32::MAX as u64 {
      return Err(InvalidFrameRateNum {
        actual: config.time_base.num,
        max: u32::MAX as u64,
      });
    }
    if config.time_base.den == 0 || config.time_base.den > u32::MAX as u64 {
      return Err(InvalidFrameRateDen {
        actual: config.time_base.den,
        max: u32::MAX as u64,
      });
    }

    if config.min_gf_interval == 0
      || config.min_gf_interval > config.max_gf_interval
    {
      return Err(InvalidGoldenFrameInterval {
        min: config.min_gf_interval,
        max: config.max_gf_interval,
      });
    }
    if config.lag_in_frames > MAX_LAG_IN_FRAMES {
      return Err(InvalidLagInFrames {
        actual: config.lag_in_frames,
        max: MAX_LAG_IN_FRAMES,
      });
    }
    if config.bipred_group_interval == 1 {
      return Err(InvalidBipredGroupInterval(config.bipred_group_interval));
    }

    let rc = &self.rate_control;

    if rc.best_quality > rc.worst_quality {
      return Err(InvalidQualityRange {
        best: rc.best_quality,
        worst: rc.worst_quality,
      });
    }
    if matches!(rc.mode, RateMode::Cq | RateMode::Q)
      && !(rc.best_quality..=rc.worst_quality).contains(&rc.cq_level)
    {
      return Err(InvalidCqLevel(rc.cq_level));
    }
    if rc.vbr_min_section > rc.vbr_max_section {
      return Err(InvalidSectionLimits {
        min: rc.vbr_min_section,
        max: rc.vbr_max_section,
      });
    }

    if rc.stats.is_some() {
      if rc.mode != RateMode::Q && rc.bitrate <= 0 {
        return Err(TargetBitrateNeeded);
      }
    } else if !rc.emit_pass_data {
      return Err(RateControlConfigurationMismatch);
    }

    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::twopass::keyframe::test::static_record;

  fn second_pass(rc: RateControlConfig) -> Config {
    let stats = (0..10).map(static_record).collect();
    Config::new().with_rate_control(rc.with_stats(stats))
  }

  #[test]
  fn no_pass_is_rejected() {
    assert_eq!(
      Config::new().validate(),
      Err(InvalidConfig::RateControlConfigurationMismatch)
    );
  }

  #[test]
  fn second_pass_needs_bitrate() {
    let cfg = second_pass(RateControlConfig::new());
    assert_eq!(cfg.validate(), Err(InvalidConfig::TargetBitrateNeeded));
    let cfg = second_pass(RateControlConfig::new().with_bitrate(800_000));
    assert_eq!(cfg.validate(), Ok(()));
    let cfg = second_pass(
      RateControlConfig::new().with_mode(RateMode::Q).with_cq_level(100),
    );
    assert_eq!(cfg.validate(), Ok(()));
  }

  #[test]
  fn cq_level_must_be_in_range() {
    let rc = RateControlConfig::new()
      .with_mode(RateMode::Cq)
      .with_bitrate(800_000)
      .with_quality_bounds(20, 200)
      .with_cq_level(10);
    assert_eq!(second_pass(rc).validate(), Err(InvalidConfig::InvalidCqLevel(10)));
  }

  #[test]
  fn inverted_ranges_are_rejected() {
    let rc = RateControlConfig::new()
      .with_bitrate(800_000)
      .with_quality_bounds(200, 100);
    assert_eq!(
      second_pass(rc).validate(),
      Err(InvalidConfig::InvalidQualityRange { best: 200, worst: 100 })
    );

    let enc =
      EncoderConfig { min_gf_interval: 20, max_gf_interval: 10, ..Default::default() };
    let cfg = second_pass(RateControlConfig::new().with_bitrate(800_000))
      .with_encoder_config(enc);
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::InvalidGoldenFrameInterval { min: 20, max: 10 })
    );
  }

  #[test]
  fn encoder_limits() {
    let rc = RateControlConfig::new().with_emit_data(true);
    let base = Config::new().with_rate_control(rc);

    let enc = EncoderConfig { width: 8, ..Default::default() };
    assert_eq!(
      base.clone().with_encoder_config(enc).validate(),
      Err(InvalidConfig::InvalidWidth(8))
    );
    let enc = EncoderConfig { bit_depth: 9, ..Default::default() };
    assert_eq!(
      base.clone().with_encoder_config(enc).validate(),
      Err(InvalidConfig::InvalidBitDepth(9))
    );
    let enc = EncoderConfig { lag_in_frames: 40, ..Default::default() };
    assert_eq!(
      base.clone().with_encoder_config(enc).validate(),
      Err(InvalidConfig::InvalidLagInFrames { actual: 40, max: 25 })
    );
    let enc = EncoderConfig { bipred_group_interval: 1, ..Default::default() };
    assert_eq!(
      base.clone().with_encoder_config(enc).validate(),
      Err(InvalidConfig::InvalidBipredGroupInterval(1))
    );
    let mut enc = EncoderConfig::default();
    enc.max_key_frame_interval = MAX_MAX_KEY_FRAME_INTERVAL + 1;
    assert!(matches!(
      base.with_encoder_config(enc).validate(),
      Err(InvalidConfig::InvalidMaxKeyFrameInterval { .. })
    ));
  }
}
