// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Reference frame roles and the buffer pool that backs them.

use crate::serialize::{Deserialize, Serialize};
use crate::twopass::UpdateType;

use arrayvec::ArrayVec;
use std::fmt;

/// Number of distinct reference roles across all topologies.
pub const REF_ROLES: usize = 7;

/// A logical reference a frame may predict from or refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefRole {
  /// Most recently coded frame.
  Last = 0,
  /// Second most recent frame (extended topology only).
  Last2,
  /// Third most recent frame (extended topology only).
  Last3,
  /// Golden frame.
  Golden,
  /// Backward reference used by bi-predictive mini-groups.
  BwdRef,
  /// Internal alt-ref of a multi-layer group.
  AltRef2,
  /// Alt-ref frame.
  AltRef,
}

impl RefRole {
  const ALL: [RefRole; REF_ROLES] = [
    RefRole::Last,
    RefRole::Last2,
    RefRole::Last3,
    RefRole::Golden,
    RefRole::BwdRef,
    RefRole::AltRef2,
    RefRole::AltRef,
  ];

  #[inline]
  const fn to_index(self) -> usize {
    self as usize
  }
}

impl fmt::Display for RefRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::RefRole::*;
    match self {
      Last => write!(f, "LAST"),
      Last2 => write!(f, "LAST2"),
      Last3 => write!(f, "LAST3"),
      Golden => write!(f, "GOLDEN"),
      BwdRef => write!(f, "BWDREF"),
      AltRef2 => write!(f, "ALTREF2"),
      AltRef => write!(f, "ALTREF"),
    }
  }
}

/// Set of reference roles available to the codec.
///
/// Chosen once per session. Everything downstream asks the topology
/// which roles exist instead of branching on the codec generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceTopology {
  /// Last, golden and alt-ref.
  #[default]
  Classic,
  /// Three last frames, golden, backward ref and two alt-refs. Allows
  /// internal alt-refs and bi-predictive mini-groups.
  Extended,
}

impl ReferenceTopology {
  /// Roles present in this topology.
  pub fn roles(self) -> &'static [RefRole] {
    match self {
      ReferenceTopology::Classic => {
        &[RefRole::Last, RefRole::Golden, RefRole::AltRef]
      }
      ReferenceTopology::Extended => &RefRole::ALL,
    }
  }

  /// Whether `role` exists in this topology.
  pub fn has_role(self, role: RefRole) -> bool {
    self.roles().contains(&role)
  }

  /// Whether groups may carry internal alt-refs and bi-predictive frames.
  pub const fn is_extended(self) -> bool {
    matches!(self, ReferenceTopology::Extended)
  }
}

/// Reference updates to apply once a frame has been coded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshFlags {
  /// Roles that receive the newly coded frame.
  pub refresh: ArrayVec<RefRole, REF_ROLES>,
  /// A buffer reassignment `(from, to)` applied before any refresh.
  pub promote: Option<(RefRole, RefRole)>,
}

impl RefreshFlags {
  /// Derives the updates for a frame of the given kind.
  pub fn for_update(update: UpdateType, topology: ReferenceTopology) -> Self {
    use self::RefRole::*;
    let mut flags = RefreshFlags::default();
    let roles: &[RefRole] = match update {
      UpdateType::Kf => topology.roles(),
      UpdateType::Lf | UpdateType::LastBipred | UpdateType::IntnlOverlay => {
        &[Last]
      }
      UpdateType::Gf => &[Last, Golden],
      UpdateType::Overlay => &[Golden],
      UpdateType::Arf => &[AltRef],
      UpdateType::IntnlArf => &[AltRef2],
      UpdateType::Brf => &[BwdRef],
      UpdateType::Bipred => &[],
      UpdateType::ShowExisting => {
        flags.promote = Some((BwdRef, Last));
        &[]
      }
    };
    for &role in roles {
      if topology.has_role(role) {
        flags.refresh.push(role);
      }
    }
    flags
  }

  /// Whether the coded frame is stored under `role`.
  pub fn refreshes(&self, role: RefRole) -> bool {
    self.refresh.contains(&role)
  }
}

/// The reference the frame cannot be coded without, if any.
pub fn required_reference(update: UpdateType) -> Option<RefRole> {
  match update {
    UpdateType::Kf => None,
    UpdateType::Overlay => Some(RefRole::AltRef),
    UpdateType::IntnlOverlay => Some(RefRole::AltRef2),
    UpdateType::ShowExisting => Some(RefRole::BwdRef),
    _ => Some(RefRole::Last),
  }
}

/// The reference frame buffer pool.
///
/// Rate control only emits abstract refresh intents. The pool maps them to
/// physical buffers.
pub trait ReferencePool {
  /// Stored frame type.
  type Buffer;

  /// The buffer currently playing `role`.
  fn get_reference_buffer(&self, role: RefRole) -> Option<&Self::Buffer>;

  /// Makes `to` refer to the buffer currently held by `from`.
  fn promote_buffer(&mut self, from: RefRole, to: RefRole);

  /// Stores a newly coded frame under the roles named by `flags`.
  fn refresh(&mut self, flags: &RefreshFlags, buffer: Self::Buffer);
}

/// In-memory pool that reassigns slot indices instead of copying frames.
#[derive(Clone, Debug)]
pub struct BufferPool<B> {
  topology: ReferenceTopology,
  slots: Vec<Option<B>>,
  map: [Option<usize>; REF_ROLES],
}

impl<B> BufferPool<B> {
  /// Creates an empty pool.
  pub fn new(topology: ReferenceTopology) -> Self {
    BufferPool { topology, slots: Vec::new(), map: [None; REF_ROLES] }
  }

  fn free_slot(&mut self) -> usize {
    let used = self.map;
    for (i, slot) in self.slots.iter_mut().enumerate() {
      if !used.contains(&Some(i)) {
        *slot = None;
        return i;
      }
    }
    self.slots.push(None);
    self.slots.len() - 1
  }

  /// Number of physical buffers allocated so far.
  pub fn allocated(&self) -> usize {
    self.slots.len()
  }
}

impl<B> ReferencePool for BufferPool<B> {
  type Buffer = B;

  fn get_reference_buffer(&self, role: RefRole) -> Option<&B> {
    self.map[role.to_index()].and_then(|i| self.slots[i].as_ref())
  }

  fn promote_buffer(&mut self, from: RefRole, to: RefRole) {
    if self.topology.has_role(to) {
      self.map[to.to_index()] = self.map[from.to_index()];
    }
  }

  fn refresh(&mut self, flags: &RefreshFlags, buffer: B) {
    if let Some((from, to)) = flags.promote {
      self.promote_buffer(from, to);
    }
    if flags.refresh.is_empty() {
      return;
    }
    // Refreshing the last frame ages the older last frames.
    if self.topology.is_extended() && flags.refreshes(RefRole::Last) {
      self.map[RefRole::Last3.to_index()] = self.map[RefRole::Last2.to_index()];
      self.map[RefRole::Last2.to_index()] = self.map[RefRole::Last.to_index()];
    }
    let slot = self.free_slot();
    self.slots[slot] = Some(buffer);
    for role in &flags.refresh {
      self.map[role.to_index()] = Some(slot);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn classic_drops_extended_roles() {
    let f = RefreshFlags::for_update(UpdateType::Brf, ReferenceTopology::Classic);
    assert!(f.refresh.is_empty());
    let f = RefreshFlags::for_update(UpdateType::Kf, ReferenceTopology::Classic);
    assert_eq!(&f.refresh[..], &[RefRole::Last, RefRole::Golden, RefRole::AltRef]);
  }

  #[test]
  fn key_frame_fills_every_role() {
    let mut pool = BufferPool::new(ReferenceTopology::Extended);
    pool.refresh(
      &RefreshFlags::for_update(UpdateType::Kf, ReferenceTopology::Extended),
      0u64,
    );
    for &role in ReferenceTopology::Extended.roles() {
      assert_eq!(pool.get_reference_buffer(role), Some(&0));
    }
    assert_eq!(pool.allocated(), 1);
  }

  #[test]
  fn last_frames_age() {
    let topo = ReferenceTopology::Extended;
    let mut pool = BufferPool::new(topo);
    pool.refresh(&RefreshFlags::for_update(UpdateType::Kf, topo), 0u64);
    pool.refresh(&RefreshFlags::for_update(UpdateType::Lf, topo), 1);
    pool.refresh(&RefreshFlags::for_update(UpdateType::Lf, topo), 2);
    assert_eq!(pool.get_reference_buffer(RefRole::Last), Some(&2));
    assert_eq!(pool.get_reference_buffer(RefRole::Last2), Some(&1));
    assert_eq!(pool.get_reference_buffer(RefRole::Last3), Some(&0));
    assert_eq!(pool.get_reference_buffer(RefRole::Golden), Some(&0));
    pool.refresh(&RefreshFlags::for_update(UpdateType::Lf, topo), 3);
    assert_eq!(pool.allocated(), 4);
  }

  #[test]
  fn show_existing_promotes_backward_ref() {
    let topo = ReferenceTopology::Extended;
    let mut pool = BufferPool::new(topo);
    pool.refresh(&RefreshFlags::for_update(UpdateType::Kf, topo), 0u64);
    pool.refresh(&RefreshFlags::for_update(UpdateType::Brf, topo), 4);
    pool.refresh(&RefreshFlags::for_update(UpdateType::ShowExisting, topo), 99);
    assert_eq!(pool.get_reference_buffer(RefRole::Last), Some(&4));
    assert_eq!(pool.get_reference_buffer(RefRole::BwdRef), Some(&4));
    assert_eq!(pool.allocated(), 2);
  }

  #[test]
  fn classic_pool_has_no_last2() {
    let topo = ReferenceTopology::Classic;
    let mut pool = BufferPool::new(topo);
    pool.refresh(&RefreshFlags::for_update(UpdateType::Kf, topo), 0u64);
    pool.refresh(&RefreshFlags::for_update(UpdateType::Lf, topo), 1);
    assert_eq!(pool.get_reference_buffer(RefRole::Last2), None);
    assert_eq!(pool.get_reference_buffer(RefRole::Last), Some(&1));
  }
}
