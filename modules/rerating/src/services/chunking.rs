//! Budget-bounded, group-aligned chunk packing
//!
//! Rows arrive in cursor order with a group key (the billing account) and
//! a unit count. Consecutive rows sharing a group key form one group, and a
//! group is never split across chunks. The packing decision lives in
//! [`ChunkPacker`], an explicit accumulator fed one row at a time.

/// A row the packer can place into a chunk
pub trait Packable {
    /// Rows with equal consecutive keys belong to the same group
    fn group_key(&self) -> i64;

    /// Units this row contributes to the chunk budget
    fn units(&self) -> u64;

    /// Keyset position used by cursors to resume after this row
    fn position(&self) -> i64;
}

/// Per-chunk unit budget: `min(total_units / workers, max_units_per_tx)`
///
/// The division truncates; a zero budget is valid and yields one group per
/// chunk.
pub fn effective_budget(total_units: u64, workers: usize, max_units_per_tx: u64) -> u64 {
    let workers = workers.max(1) as u64;
    (total_units / workers).min(max_units_per_tx)
}

/// Whether a group joins the open chunk or closes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackDecision {
    Include,
    CloseBefore,
}

/// Pure budget decision for the next group
///
/// An empty chunk always takes the group, so an oversized group (or a zero
/// budget) still makes progress.
pub fn decide(chunk_units: u64, chunk_is_empty: bool, group_units: u64, budget: u64) -> PackDecision {
    if chunk_is_empty || chunk_units.saturating_add(group_units) <= budget {
        PackDecision::Include
    } else {
        PackDecision::CloseBefore
    }
}

/// A non-empty, ordered slice of rows processed as one unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T> {
    rows: Vec<T>,
    units: u64,
}

impl<T: Packable> Chunk<T> {
    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<T> {
        self.rows
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    /// Smallest cursor position in the chunk
    pub fn min_position(&self) -> i64 {
        self.rows.iter().map(Packable::position).min().unwrap_or_default()
    }

    /// Largest cursor position in the chunk
    pub fn max_position(&self) -> i64 {
        self.rows.iter().map(Packable::position).max().unwrap_or_default()
    }

    pub fn group_count(&self) -> usize {
        let mut count = 0;
        let mut last = None;
        for row in &self.rows {
            if last != Some(row.group_key()) {
                count += 1;
                last = Some(row.group_key());
            }
        }
        count
    }
}

/// Accumulator that turns a row stream into chunks
#[derive(Debug)]
pub struct ChunkPacker<T> {
    budget: u64,
    chunk: Vec<T>,
    chunk_units: u64,
    group: Vec<T>,
    group_units: u64,
}

impl<T: Packable> ChunkPacker<T> {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            chunk: Vec::new(),
            chunk_units: 0,
            group: Vec::new(),
            group_units: 0,
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Feed the next row; returns a chunk when one closes
    pub fn push(&mut self, row: T) -> Option<Chunk<T>> {
        let closed = match self.group.last() {
            Some(last) if last.group_key() != row.group_key() => self.seal_group(),
            _ => None,
        };

        self.group_units += row.units();
        self.group.push(row);
        closed
    }

    /// Flush the pending group and return the next remaining chunk
    ///
    /// Call repeatedly until it returns `None`: sealing the last group can
    /// close the open chunk, leaving the group itself as a final chunk.
    pub fn finish(&mut self) -> Option<Chunk<T>> {
        self.seal_group().or_else(|| self.take_chunk())
    }

    fn seal_group(&mut self) -> Option<Chunk<T>> {
        if self.group.is_empty() {
            return None;
        }

        let group = std::mem::take(&mut self.group);
        let group_units = std::mem::take(&mut self.group_units);

        let closed = match decide(self.chunk_units, self.chunk.is_empty(), group_units, self.budget) {
            PackDecision::Include => None,
            PackDecision::CloseBefore => self.take_chunk(),
        };

        self.chunk.extend(group);
        self.chunk_units += group_units;
        closed
    }

    fn take_chunk(&mut self) -> Option<Chunk<T>> {
        if self.chunk.is_empty() {
            return None;
        }

        Some(Chunk {
            rows: std::mem::take(&mut self.chunk),
            units: std::mem::take(&mut self.chunk_units),
        })
    }
}

/// Pack a complete row sequence into chunks
pub fn pack_chunks<T, I>(rows: I, budget: u64) -> Vec<Chunk<T>>
where
    T: Packable,
    I: IntoIterator<Item = T>,
{
    let mut packer = ChunkPacker::new(budget);
    let mut chunks: Vec<Chunk<T>> = rows.into_iter().filter_map(|row| packer.push(row)).collect();
    while let Some(chunk) = packer.finish() {
        chunks.push(chunk);
    }
    chunks
}
