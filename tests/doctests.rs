use vpxrc::prelude::*;

#[test]
fn push_source_frame() -> Result<(), Box<dyn std::error::Error>> {
  let rc = RateControlConfig::new().with_emit_data(true);
  let cfg = Config::default().with_rate_control(rc);
  let mut ctx: Context<u8> = cfg.new_context()?;
  let f1 = ctx.new_plane();
  let f2 = f1.clone();

  // Send the plain plane data
  ctx.push_source_frame(f1, 0)?;
  ctx.push_source_frame(f2, 1)?;
  // Flush the encoder, it is equivalent to a call to `flush()`
  ctx.push_source_frame(None, 2)?;
  assert_eq!(ctx.first_pass_records().len(), 2);
  Ok(())
}

#[test]
fn twopass_out() -> Result<(), Box<dyn std::error::Error>> {
  let rc = RateControlConfig::new().with_emit_data(true);
  let cfg = Config::default().with_rate_control(rc);
  let mut ctx: Context<u8> = cfg.new_context()?;

  let mut data = Vec::new();
  for i in 0..3 {
    ctx.push_source_frame(ctx.new_plane(), i)?;
    if let Some(chunk) = ctx.twopass_out() {
      data.extend_from_slice(chunk);
    }
  }
  assert!(ctx.twopass_out().is_none());

  let rc = RateControlConfig::from_stats_slice(&data)?;
  assert_eq!(rc.stats().map(|s| s.len()), Some(3));
  Ok(())
}

fn plan_frames(
  ctx: &mut Context<u8>, mut frames: impl Iterator<Item = Plane<u8>>,
) -> Result<Vec<FramePlan>, EncoderStatus> {
  // Frames are produced lazily and only pushed when the planner asks for
  // them, so the lookahead never holds more than it needs.
  let mut plans = Vec::new();
  let mut timestamp = 0;
  let mut flushed = false;
  loop {
    match ctx.get_next_frame_plan() {
      Ok(plan) => {
        // Code the frame here. This example pretends it hit its target.
        ctx.report_encoded_size(plan.target_bits.max(0) as u64)?;
        plans.push(plan);
      }
      Err(EncoderStatus::LimitReached) => {
        // Every frame has been planned.
        break;
      }
      Err(EncoderStatus::NeedMoreData) if !flushed => {
        // Push the next frame in, or flush the encoder if there are no
        // frames left (on None).
        let frame = frames.next();
        flushed = frame.is_none();
        ctx.push_source_frame(frame.map(std::sync::Arc::new), timestamp)?;
        timestamp += 1;
      }
      Err(err) => return Err(err),
    }
  }

  Ok(plans)
}

#[test]
fn two_pass_session() -> Result<(), Box<dyn std::error::Error>> {
  let mut enc = EncoderConfig::default();
  // So it runs faster.
  enc.width = 16;
  enc.height = 16;

  let rc = RateControlConfig::new().with_emit_data(true);
  let cfg = Config::new().with_encoder_config(enc).with_rate_control(rc);
  let mut ctx: Context<u8> = cfg.new_context()?;
  let frames = vec![ctx.new_plane(); 6];
  for (i, frame) in frames.iter().enumerate() {
    ctx.push_source_frame(frame.clone(), i as u64)?;
  }
  ctx.flush();
  let stats = ctx.first_pass_records().to_vec();

  let rc = RateControlConfig::new().with_bitrate(200_000).with_stats(stats);
  let cfg = Config::new().with_encoder_config(enc).with_rate_control(rc);
  let mut ctx: Context<u8> = cfg.new_context()?;
  let plans = plan_frames(&mut ctx, frames.into_iter())?;

  let mut shown: Vec<_> = plans
    .iter()
    .filter(|p| p.show_frame)
    .map(|p| p.display_index)
    .collect();
  shown.sort_unstable();
  assert_eq!(shown, (0..6).collect::<Vec<_>>());
  assert_eq!(plans[0].frame_type, FrameType::Key);
  Ok(())
}
