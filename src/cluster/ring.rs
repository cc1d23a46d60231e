//! Consistent-hash ring.
//!
//! Every shard owns `replicas + 1` points on a 28-bit hash space. A point is
//! the first seven hex digits of `md5("host:port-<n>")`. A key belongs to the
//! shard owning the first point at or after the key's own digest, wrapping
//! around to the lowest point.

/// Digest of `key` on the ring's hash space.
///
/// Seven hex digits of the md5 digest, i.e. its top 28 bits.
pub fn slot(key: &str) -> u32 {
    let md5::Digest(bytes) = md5::compute(key.as_bytes());
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) >> 4
}

/// Sorted ring of `(slot, shard index)` points.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    points: Vec<(u32, usize)>,
    replicas: usize,
}

impl HashRing {
    /// Builds a ring for shards identified by `host:port` addresses, in
    /// order. The position of an address is the shard index it maps to.
    pub fn new<S: AsRef<str>>(addresses: &[S], replicas: usize) -> Self {
        let mut ring = Self {
            points: Vec::with_capacity(addresses.len() * (replicas + 1)),
            replicas,
        };
        for (index, address) in addresses.iter().enumerate() {
            ring.add(address.as_ref(), index);
        }
        ring.seal();
        ring
    }

    /// Adds the virtual points of one shard. Call [`HashRing::seal`] after the
    /// last addition.
    fn add(&mut self, address: &str, index: usize) {
        for replica in 0..=self.replicas {
            self.points.push((slot(&format!("{address}-{replica}")), index));
        }
    }

    /// Sorts the points and resolves slot collisions in favour of the shard
    /// added last.
    fn seal(&mut self) {
        // Stable sort keeps insertion order among equal slots.
        self.points.sort_by_key(|&(slot, _)| slot);
        let mut sealed: Vec<(u32, usize)> = Vec::with_capacity(self.points.len());
        for point in self.points.drain(..) {
            match sealed.last_mut() {
                Some(last) if last.0 == point.0 => *last = point,
                _ => sealed.push(point),
            }
        }
        self.points = sealed;
    }

    /// Shard index owning `key`, or `None` for an empty ring.
    pub fn lookup(&self, key: &str) -> Option<usize> {
        self.owner_of(slot(key))
    }

    /// Shard index owning a precomputed slot.
    pub fn owner_of(&self, needle: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let position = self.points.partition_point(|&(slot, _)| slot < needle);
        let (_, index) = self.points[position % self.points.len()];
        Some(index)
    }

    /// Number of points on the ring.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Virtual points per shard, minus one.
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Ring points in ascending slot order.
    pub fn points(&self) -> &[(u32, usize)] {
        &self.points
    }
}
