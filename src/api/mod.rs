// Copyright (c) 2018-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

/// Encoder Configuration
pub mod config;
/// Encoder Context
mod context;
/// Internal implementation
pub(crate) mod internal;
/// Rational numbers, statuses and frame plans
mod util;


pub use config::*;
pub use context::*;
pub(crate) use internal::*;
pub use util::*;
