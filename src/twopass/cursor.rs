// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::firstpass::FirstPassRecord;

/// A read position over first-pass records.
///
/// The records themselves are never mutated. Lookahead is done with
/// [`peek`](StatsCursor::peek) or by saving and restoring the position.
#[derive(Clone, Copy, Debug)]
pub struct StatsCursor<'a> {
  stats: &'a [FirstPassRecord],
  pos: usize,
  end: usize,
}

impl<'a> StatsCursor<'a> {
  /// Creates a cursor at the first record.
  pub fn new(stats: &'a [FirstPassRecord]) -> Self {
    StatsCursor { stats, pos: 0, end: stats.len() }
  }

  /// Limits the visible records to `[.., end)`.
  pub fn with_end(mut self, end: usize) -> Self {
    self.end = end.min(self.stats.len());
    self
  }

  /// Current position.
  #[inline]
  pub fn position(&self) -> usize {
    self.pos
  }

  /// Number of records left to read.
  #[inline]
  pub fn remaining(&self) -> usize {
    self.end.saturating_sub(self.pos)
  }

  /// Record `offset` entries after the current one, without moving.
  #[inline]
  pub fn peek(&self, offset: isize) -> Option<&'a FirstPassRecord> {
    let idx = self.pos as isize + offset;
    if idx < 0 || idx as usize >= self.end {
      return None;
    }
    self.stats.get(idx as usize)
  }

  /// Returns the current record and advances.
  #[inline]
  pub fn next_record(&mut self) -> Option<&'a FirstPassRecord> {
    let r = self.peek(0)?;
    self.pos += 1;
    Some(r)
  }

  /// Moves to an absolute position, clamped to the visible range.
  #[inline]
  pub fn seek(&mut self, pos: usize) {
    self.pos = pos.min(self.end);
  }

  /// Opaque token for [`restore`](StatsCursor::restore).
  #[inline]
  pub fn save(&self) -> usize {
    self.pos
  }

  /// Returns to a position obtained from [`save`](StatsCursor::save).
  #[inline]
  pub fn restore(&mut self, saved: usize) {
    self.seek(saved);
  }

  /// The visible records.
  pub fn records(&self) -> &'a [FirstPassRecord] {
    &self.stats[..self.end]
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn records(n: usize) -> Vec<FirstPassRecord> {
    (0..n)
      .map(|i| FirstPassRecord { frame: i as f64, ..Default::default() })
      .collect()
  }

  #[test]
  fn peek_does_not_move() {
    let stats = records(4);
    let c = StatsCursor::new(&stats);
    assert_eq!(c.peek(2).map(|r| r.frame), Some(2.));
    assert_eq!(c.peek(-1), None);
    assert_eq!(c.peek(4), None);
    assert_eq!(c.position(), 0);
  }

  #[test]
  fn save_restore() {
    let stats = records(5);
    let mut c = StatsCursor::new(&stats);
    c.next_record();
    let saved = c.save();
    while c.next_record().is_some() {}
    assert_eq!(c.remaining(), 0);
    c.restore(saved);
    assert_eq!(c.position(), 1);
    assert_eq!(c.next_record().map(|r| r.frame), Some(1.));
  }

  #[test]
  fn end_limits_visibility() {
    let stats = records(10);
    let mut c = StatsCursor::new(&stats).with_end(3);
    assert_eq!(c.remaining(), 3);
    assert!(c.peek(3).is_none());
    c.seek(8);
    assert_eq!(c.position(), 3);
  }
}
