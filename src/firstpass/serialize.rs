// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Binary first-pass statistics stream.
//!
//! The stream is a 16 byte header followed by a flat array of records,
//! one per frame, in display order. Every field is a little-endian IEEE
//! 754 double, in the declaration order of [`FirstPassRecord`].

use super::FirstPassRecord;

use bitstream_io::{ByteRead, ByteReader, ByteWrite, ByteWriter, LittleEndian};
use std::io;
use thiserror::Error;

const STATS_MAGIC: &[u8; 4] = b"VPXS";
/// Version of the stream layout written by this crate.
pub const STATS_VERSION: u32 = 1;
/// Size of the stream header in bytes.
pub const STATS_HEADER_SZ: usize = 16;
/// Size of one serialized record in bytes.
pub const STATS_RECORD_SZ: usize = FirstPassRecord::FIELDS * 8;

/// Errors raised while reading a statistics stream.
#[derive(Debug, Error)]
pub enum StatsError {
  /// The stream does not start with the expected magic.
  #[error("not a first-pass statistics stream")]
  BadMagic,
  /// The stream was written by an incompatible version.
  #[error("incompatible statistics version {0}")]
  InvalidVersion(u32),
  /// The header announces a record layout we cannot read.
  #[error("invalid record size {0} (expected 208)")]
  InvalidRecordSize(u32),
  /// The stream ends inside a record.
  #[error("truncated statistics: {len} trailing bytes")]
  Truncated {
    /// Bytes of the incomplete record.
    len: usize,
  },
  /// The underlying reader failed.
  #[error("i/o error reading statistics: {0}")]
  Io(#[from] io::Error),
}

/// Streams records to a writer, one per call.
pub struct StatsWriter<W: io::Write> {
  bw: ByteWriter<W, LittleEndian>,
  records: usize,
}

impl<W: io::Write> StatsWriter<W> {
  /// Writes the stream header.
  ///
  /// # Errors
  ///
  /// Returns any error of the underlying writer.
  pub fn new(w: W) -> io::Result<Self> {
    let mut bw = ByteWriter::endian(w, LittleEndian);
    bw.write_bytes(STATS_MAGIC)?;
    bw.write::<u32>(STATS_VERSION)?;
    bw.write::<u32>(STATS_RECORD_SZ as u32)?;
    bw.write::<u32>(0)?;
    Ok(StatsWriter { bw, records: 0 })
  }

  /// Appends one record.
  ///
  /// # Errors
  ///
  /// Returns any error of the underlying writer.
  pub fn write_record(&mut self, record: &FirstPassRecord) -> io::Result<()> {
    for v in record.to_array() {
      self.bw.write::<u64>(v.to_bits())?;
    }
    self.records += 1;
    Ok(())
  }

  /// Number of records written so far.
  pub const fn records(&self) -> usize {
    self.records
  }

  /// Returns the underlying writer.
  pub fn into_writer(self) -> W {
    self.bw.into_writer()
  }
}

/// Serializes a whole sequence of records.
pub fn stats_to_vec(records: &[FirstPassRecord]) -> Vec<u8> {
  let mut out =
    Vec::with_capacity(STATS_HEADER_SZ + records.len() * STATS_RECORD_SZ);
  // Writing to a Vec cannot fail.
  if let Ok(mut sw) = StatsWriter::new(&mut out) {
    for r in records {
      let _ = sw.write_record(r);
    }
  }
  out
}

/// Reads a stream produced by [`StatsWriter`] until its end.
///
/// # Errors
///
/// Returns a [`StatsError`] if the header is not recognized or the stream
/// stops inside a record.
pub fn read_stats<R: io::Read>(
  r: R,
) -> Result<Vec<FirstPassRecord>, StatsError> {
  let mut br = ByteReader::endian(r, LittleEndian);

  let mut magic = [0u8; 4];
  read_exact_or(&mut br, &mut magic, StatsError::BadMagic)?;
  if &magic != STATS_MAGIC {
    return Err(StatsError::BadMagic);
  }
  let mut header = [0u8; STATS_HEADER_SZ - 4];
  read_exact_or(&mut br, &mut header, StatsError::BadMagic)?;
  let version = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
  if version != STATS_VERSION {
    return Err(StatsError::InvalidVersion(version));
  }
  let record_sz =
    u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
  if record_sz as usize != STATS_RECORD_SZ {
    return Err(StatsError::InvalidRecordSize(record_sz));
  }

  let mut records = Vec::new();
  let mut buf = [0u8; STATS_RECORD_SZ];
  loop {
    let len = fill(br.reader(), &mut buf)?;
    if len == 0 {
      break;
    }
    if len < STATS_RECORD_SZ {
      return Err(StatsError::Truncated { len });
    }
    let mut fields = [0f64; FirstPassRecord::FIELDS];
    for (f, b) in fields.iter_mut().zip(buf.chunks_exact(8)) {
      let mut bytes = [0u8; 8];
      bytes.copy_from_slice(b);
      *f = f64::from_le_bytes(bytes);
    }
    records.push(FirstPassRecord::from_array(fields));
  }

  debug!("read {} first-pass records", records.len());
  Ok(records)
}

/// Deserializes a byte slice holding a whole statistics stream.
///
/// # Errors
///
/// See [`read_stats`].
pub fn stats_from_slice(
  bytes: &[u8],
) -> Result<Vec<FirstPassRecord>, StatsError> {
  read_stats(bytes)
}

fn read_exact_or<R: io::Read>(
  br: &mut ByteReader<R, LittleEndian>, buf: &mut [u8], err: StatsError,
) -> Result<(), StatsError> {
  match br.read_bytes(buf) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(err),
    Err(e) => Err(e.into()),
  }
}

// Reads until `buf` is full or the stream ends, returning the byte count.
fn fill<R: io::Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
  let mut len = 0;
  while len < buf.len() {
    match r.read(&mut buf[len..]) {
      Ok(0) => break,
      Ok(n) => len += n,
      Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
      Err(e) => return Err(e),
    }
  }
  Ok(len)
}
