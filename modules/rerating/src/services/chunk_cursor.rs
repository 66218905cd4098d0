//! Forward-only chunk cursor over a paged row source
//!
//! Rows are fetched page by page and fed through a [`ChunkPacker`]; the
//! cursor hands out chunks as soon as the packer closes them.

use async_trait::async_trait;
use std::collections::VecDeque;

use crate::job::{JobError, WorkCursor};
use crate::services::chunking::{Chunk, ChunkPacker, Packable};

/// Default number of rows fetched per page
pub const DEFAULT_PAGE_SIZE: i64 = 1_000;

/// Ordered, paged source of packable rows
///
/// Each call returns the rows following the previous page; an empty or
/// short page means the source is exhausted.
#[async_trait]
pub trait RowSource: Send {
    type Row: Packable + Send;

    async fn fetch_next(&mut self, limit: i64) -> Result<Vec<Self::Row>, sqlx::Error>;
}

pub struct ChunkCursor<S: RowSource> {
    source: S,
    packer: ChunkPacker<S::Row>,
    page_size: i64,
    ready: VecDeque<Chunk<S::Row>>,
    exhausted: bool,
}

impl<S: RowSource> ChunkCursor<S> {
    pub fn new(source: S, budget: u64) -> Self {
        Self::with_page_size(source, budget, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(source: S, budget: u64, page_size: i64) -> Self {
        Self {
            source,
            packer: ChunkPacker::new(budget),
            page_size: page_size.max(1),
            ready: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn budget(&self) -> u64 {
        self.packer.budget()
    }
}

#[async_trait]
impl<S: RowSource> WorkCursor for ChunkCursor<S> {
    type Item = Chunk<S::Row>;

    async fn next(&mut self) -> Result<Option<Self::Item>, JobError> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Ok(Some(chunk));
            }

            if self.exhausted {
                return Ok(self.packer.finish());
            }

            let page = self
                .source
                .fetch_next(self.page_size)
                .await
                .map_err(|e| JobError::Cursor(e.to_string()))?;

            if (page.len() as i64) < self.page_size {
                self.exhausted = true;
            }

            for row in page {
                if let Some(chunk) = self.packer.push(row) {
                    self.ready.push_back(chunk);
                }
            }
        }
    }
}
