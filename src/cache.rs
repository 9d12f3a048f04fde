/*!
Rank-side set-associative LRU filter for reference-vector lookups.

Geometry comes from config: total size, block size, associativity. `access`
combines lookup and fill: a hit refreshes LRU order and returns true, a miss
loads the block (evicting the least recently used way) and returns false.
The host uses hits to short-circuit DRAM reads when `sram_enabled` is on.
*/

#[derive(Copy, Clone, Debug)]
struct CacheBlock {
    tag: u64,
    /// 0 = most recently used; grows with age.
    lru_counter: u32,
}

#[derive(Clone, Debug)]
struct CacheSet {
    blocks: Vec<Option<CacheBlock>>,
}

impl CacheSet {
    fn new(associativity: usize) -> Self {
        Self {
            blocks: vec![None; associativity],
        }
    }

    fn touch(&mut self, way: usize) {
        let touched_age = self.blocks[way].expect("touched way is filled").lru_counter;
        for (i, slot) in self.blocks.iter_mut().enumerate() {
            if let Some(block) = slot {
                if i != way && block.lru_counter < touched_age {
                    block.lru_counter += 1;
                }
            }
        }
        if let Some(block) = &mut self.blocks[way] {
            block.lru_counter = 0;
        }
    }

    fn access(&mut self, tag: u64) -> bool {
        if let Some(way) = self
            .blocks
            .iter()
            .position(|b| b.is_some_and(|b| b.tag == tag))
        {
            self.touch(way);
            return true;
        }
        self.load(tag);
        false
    }

    fn load(&mut self, tag: u64) {
        // Fill an empty way first.
        if let Some(way) = self.blocks.iter().position(Option::is_none) {
            self.blocks[way] = Some(CacheBlock {
                tag,
                lru_counter: way as u32,
            });
            self.touch(way);
            return;
        }
        // Replace the oldest way.
        let victim = self
            .blocks
            .iter()
            .enumerate()
            .max_by_key(|(_, b)| b.expect("full set").lru_counter)
            .map(|(i, _)| i)
            .expect("set has ways");
        self.blocks[victim] = Some(CacheBlock {
            tag,
            lru_counter: u32::MAX,
        });
        self.touch(victim);
    }
}

pub struct Cache {
    sets: Vec<CacheSet>,
    block_size: usize,
    hits: u64,
    misses: u64,
}

impl Cache {
    pub fn new(size: usize, block_size: usize, associativity: usize) -> Self {
        let num_sets = (size / (block_size * associativity)).max(1);
        Self {
            sets: (0..num_sets).map(|_| CacheSet::new(associativity)).collect(),
            block_size,
            hits: 0,
            misses: 0,
        }
    }

    /// Lookup-and-fill. True on hit.
    pub fn access(&mut self, address: u64) -> bool {
        let block = address / self.block_size as u64;
        let set_index = (block % self.sets.len() as u64) as usize;
        let tag = block / self.sets.len() as u64;
        let hit = self.sets[set_index].access(tag);
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        hit
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
