use skiff_shared::types::PeerId;

/// Peers known to hold a file, served round-robin.
///
/// The cursor persists across dispatch rounds so consecutive requests spread
/// over every known seeder.
#[derive(Debug, Default, Clone)]
pub struct SeederSet {
    seeders: Vec<PeerId>,
    cursor: usize,
}

impl SeederSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the seeder was not known yet.
    pub fn insert(&mut self, peer: PeerId) -> bool {
        if self.seeders.contains(&peer) {
            return false;
        }
        self.seeders.push(peer);
        true
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let before = self.seeders.len();
        self.seeders.retain(|p| p != peer);
        before != self.seeders.len()
    }

    /// Next seeder in rotation, skipping `avoid` when another one exists.
    pub fn pick(&mut self, avoid: Option<&PeerId>) -> Option<PeerId> {
        let n = self.seeders.len();
        if n == 0 {
            return None;
        }

        for _ in 0..n {
            let candidate = &self.seeders[self.cursor % n];
            self.cursor = (self.cursor + 1) % n;
            if n == 1 || Some(candidate) != avoid {
                return Some(candidate.clone());
            }
        }
        self.seeders.first().cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.seeders.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.seeders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeders.is_empty()
    }
}
