// Copyright (c) 2017-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! vpxrc is the two-pass rate control and golden/alt-ref group scheduler
//! of a VP8/VP9-family encoder.
//!
//! The crate does not touch the bitstream. A driver pushes source frames
//! with [`Context::push_source_frame`], asks for the next frame to code
//! with [`Context::get_next_frame_plan`], runs its own pixel pipeline at
//! the returned quantizer and reports back the produced size through
//! [`Context::report_encoded_size`].
//!
//! A first pass collects one [`FirstPassRecord`] per frame. The records
//! can be written out as a flat binary stream and fed to a second pass
//! that plans key-frame groups, golden/alt-ref groups and per-frame bit
//! budgets from them.
//!
//! [`Context::push_source_frame`]: struct.Context.html#method.push_source_frame
//! [`Context::get_next_frame_plan`]: struct.Context.html#method.get_next_frame_plan
//! [`Context::report_encoded_size`]: struct.Context.html#method.report_encoded_size
//! [`FirstPassRecord`]: firstpass/struct.FirstPassRecord.html

#![deny(bare_trait_objects)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::verbose_bit_mask)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::wrong_self_convention)]
#![warn(clippy::expl_impl_clone_on_copy)]
#![warn(clippy::linkedlist)]
#![warn(clippy::map_flatten)]
#![warn(clippy::mem_forget)]
#![warn(clippy::mut_mut)]
#![warn(clippy::mutex_integer)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_continue)]
#![warn(clippy::path_buf_push_overwrite)]
#![warn(clippy::range_plus_one)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

mod serialize {
  cfg_if::cfg_if! {
    if #[cfg(feature="serialize")] {
      pub use serde::*;
    } else {
      pub use noop_proc_macro::{Deserialize, Serialize};
    }
  }
}

pub(crate) mod util;

pub mod firstpass;
pub mod quantize;
pub mod rate;
pub mod refs;
pub mod twopass;

mod api;

pub use crate::api::*;

/// Commonly used types and traits.
pub mod prelude {
  pub use crate::api::*;
  pub use crate::firstpass::{AggregateStats, FirstPassRecord};
  pub use crate::refs::{RefRole, ReferencePool, ReferenceTopology};
  pub use crate::twopass::{GFGroupSchedule, UpdateType};
  pub use v_frame::pixel::Pixel;
  pub use v_frame::plane::Plane;
}
