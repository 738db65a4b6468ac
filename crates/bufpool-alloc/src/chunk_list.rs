use getset::CopyGetters;

/// Usage tier of a chunk. A chunk enters at `Init`, climbs as its usage
/// grows and sinks back as buffers are freed. `Q100` holds byte-exact full
/// chunks and never serves allocations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tier {
  Init,
  Q000,
  Q025,
  Q050,
  Q075,
  Q100,
}

pub const TIER_COUNT: usize = 6;

pub const ALL_TIERS: [Tier; TIER_COUNT] = [
  Tier::Init,
  Tier::Q000,
  Tier::Q025,
  Tier::Q050,
  Tier::Q075,
  Tier::Q100,
];

/// Order in which tiers are offered an allocation. Preferring the middle
/// tiers packs existing chunks tighter before half-empty ones are touched,
/// which gives mostly-free chunks time to drain and be released.
pub const ALLOC_ORDER: [Tier; 5] = [
  Tier::Q050,
  Tier::Q025,
  Tier::Q000,
  Tier::Init,
  Tier::Q075,
];

/// What to do with a chunk that sank below its tier's usage floor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PrevAction {
  /// Stay put. `Init` keeps its chunks forever as a standing reserve.
  Keep,
  /// Hand the chunk back to the operating system.
  Destroy,
  /// Move down one tier and re-check against that tier's floor.
  Move(Tier),
}

impl Tier {
  pub const fn index(self) -> usize {
    match self {
      Tier::Init => 0,
      Tier::Q000 => 1,
      Tier::Q025 => 2,
      Tier::Q050 => 3,
      Tier::Q075 => 4,
      Tier::Q100 => 5,
    }
  }

  /// Usage floor. A chunk whose usage drops below this leaves the tier.
  pub const fn min_usage(self) -> i32 {
    match self {
      Tier::Init => i32::MIN,
      Tier::Q000 => 1,
      Tier::Q025 => 25,
      Tier::Q050 => 50,
      Tier::Q075 => 75,
      Tier::Q100 => 100,
    }
  }

  /// Usage ceiling. A chunk whose usage reaches this moves to `next()`.
  pub const fn max_usage(self) -> i32 {
    match self {
      Tier::Init => 25,
      Tier::Q000 => 50,
      Tier::Q025 => 75,
      Tier::Q050 => 100,
      Tier::Q075 => 100,
      Tier::Q100 => i32::MAX,
    }
  }

  pub const fn next(self) -> Option<Tier> {
    match self {
      Tier::Init => Some(Tier::Q000),
      Tier::Q000 => Some(Tier::Q025),
      Tier::Q025 => Some(Tier::Q050),
      Tier::Q050 => Some(Tier::Q075),
      Tier::Q075 => Some(Tier::Q100),
      Tier::Q100 => None,
    }
  }

  pub const fn prev(self) -> PrevAction {
    match self {
      Tier::Init => PrevAction::Keep,
      Tier::Q000 => PrevAction::Destroy,
      Tier::Q025 => PrevAction::Move(Tier::Q000),
      Tier::Q050 => PrevAction::Move(Tier::Q025),
      Tier::Q075 => PrevAction::Move(Tier::Q050),
      Tier::Q100 => PrevAction::Move(Tier::Q075),
    }
  }
}

/// The chunks currently sitting in one tier, by registry id.
#[derive(CopyGetters)]
pub struct ChunkList {
  #[getset(get_copy = "pub")]
  tier: Tier,
  ids: Vec<u32>,
  /// Largest request this tier will serve. A tier whose chunks are at
  /// least `min_usage` percent full cannot hold more than the remainder.
  #[getset(get_copy = "pub")]
  max_alloc: usize,
}

impl ChunkList {
  fn new(tier: Tier, chunk_size: usize) -> Self {
    let min_usage = tier.min_usage().max(1);
    let max_alloc = if min_usage == 100 {
      0
    } else {
      chunk_size * (100 - min_usage) as usize / 100
    };
    Self {
      tier,
      ids: Vec::new(),
      max_alloc,
    }
  }

  pub fn can_allocate(&self, norm: usize) -> bool {
    norm <= self.max_alloc
  }

  pub fn ids(&self) -> &[u32] {
    &self.ids
  }

  pub fn push(&mut self, id: u32) {
    debug_assert!(!self.ids.contains(&id));
    self.ids.push(id);
  }

  pub fn remove(&mut self, id: u32) {
    let pos = self
      .ids
      .iter()
      .position(|&other| other == id)
      .unwrap_or_else(|| panic!("chunk {id} is not in tier {:?}", self.tier));
    self.ids.swap_remove(pos);
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }
}

/// All six tiers of one arena. Lives inside the arena lock.
pub struct ChunkLists {
  lists: [ChunkList; TIER_COUNT],
}

impl ChunkLists {
  pub fn new(chunk_size: usize) -> Self {
    Self {
      lists: [
        ChunkList::new(Tier::Init, chunk_size),
        ChunkList::new(Tier::Q000, chunk_size),
        ChunkList::new(Tier::Q025, chunk_size),
        ChunkList::new(Tier::Q050, chunk_size),
        ChunkList::new(Tier::Q075, chunk_size),
        ChunkList::new(Tier::Q100, chunk_size),
      ],
    }
  }

  pub fn list(&self, tier: Tier) -> &ChunkList {
    &self.lists[tier.index()]
  }

  pub fn list_mut(&mut self, tier: Tier) -> &mut ChunkList {
    &mut self.lists[tier.index()]
  }

  pub fn total_chunks(&self) -> usize {
    self.lists.iter().map(ChunkList::len).sum()
  }
}
