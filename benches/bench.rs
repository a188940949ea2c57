// Copyright (c) 2017-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use criterion::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;
use std::sync::Arc;
use vpxrc::firstpass::{DiamondSearch, FirstPass};
use vpxrc::prelude::*;

fn init_plane_u8(ra: &mut ChaChaRng, width: usize, height: usize) -> Plane<u8> {
  let data: Vec<u8> = (0..(width * height)).map(|_| ra.gen()).collect();
  Plane::from_slice(&data, width)
}

fn synthetic_stats(ra: &mut ChaChaRng, n: usize) -> Vec<FirstPassRecord> {
  (0..n)
    .map(|i| {
      let coded: f64 = ra.gen_range(10.0..2000.0);
      let pcnt_inter: f64 = ra.gen_range(0.3..1.0);
      FirstPassRecord {
        frame: i as f64,
        weight: 1.0,
        intra_error: coded * ra.gen_range(1.0..10.0),
        coded_error: coded,
        sr_coded_error: coded * ra.gen_range(1.0..2.0),
        pcnt_inter,
        pcnt_motion: pcnt_inter * ra.gen_range(0.0..1.0),
        pcnt_second_ref: ra.gen_range(0.0..0.3),
        mvr_abs: ra.gen_range(0.0..16.0),
        mvc_abs: ra.gen_range(0.0..16.0),
        duration: 1.0 / 30.0,
        count: 1.0,
        ..Default::default()
      }
    })
    .collect()
}

pub fn first_pass_frame(c: &mut Criterion) {
  let mut ra = ChaChaRng::from_seed([0; 32]);
  let a = Arc::new(init_plane_u8(&mut ra, 640, 480));
  let b = Arc::new(init_plane_u8(&mut ra, 640, 480));
  c.bench_function("first_pass_frame_640x480", move |bench| {
    bench.iter(|| {
      let mut fp = FirstPass::new(DiamondSearch::default(), 640, 480, 8);
      fp.push_frame(a.clone(), 1.0 / 30.0);
      black_box(fp.push_frame(b.clone(), 1.0 / 30.0).coded_error)
    })
  });
}

pub fn second_pass_session(c: &mut Criterion) {
  let mut ra = ChaChaRng::from_seed([1; 32]);
  let stats = synthetic_stats(&mut ra, 300);
  let mut enc = EncoderConfig::with_speed_preset(4);
  enc.width = 1280;
  enc.height = 720;
  let rc = RateControlConfig::new().with_bitrate(2_000_000).with_stats(stats);
  let cfg = Config::new().with_encoder_config(enc).with_rate_control(rc);

  c.bench_function("second_pass_300_frames", move |bench| {
    bench.iter(|| {
      let mut ctx: Context<u8> = cfg.new_context().unwrap();
      for i in 0..300 {
        ctx.push_source_frame(Plane::new(16, 16, 0, 0, 0, 0), i).unwrap();
      }
      ctx.flush();
      let mut bits = 0;
      while let Ok(plan) = ctx.get_next_frame_plan() {
        bits += plan.target_bits;
        ctx.report_encoded_size(plan.target_bits.max(0) as u64).unwrap();
      }
      black_box(bits)
    })
  });
}

criterion_group!(firstpass, first_pass_frame);
criterion_group!(twopass, second_pass_session);
criterion_main!(firstpass, twopass);
