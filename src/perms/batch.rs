//! Splits large writes so no single statement exceeds the Postgres
//! bind-parameter limit. Every chunk runs on the caller's connection, so a
//! failing chunk aborts the caller's transaction together with the chunks
//! already written.

use crate::error::StoreResult;

/// Hard limit on bind parameters in one Postgres statement.
pub const MAX_BIND_PARAMETERS: usize = 65_535;

/// Ids per page when rewriting array columns.
pub const DEFAULT_PAGE_SIZE: usize = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_parameters: usize,
    pub page_size: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_parameters: MAX_BIND_PARAMETERS,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl BatchLimits {
    pub fn rows_per_statement(&self, params_per_row: usize) -> usize {
        (self.max_parameters / params_per_row.max(1)).max(1)
    }
}

/// Runs `write` once per chunk of at most `rows_per_chunk` rows, in order,
/// and concatenates the results. Empty input issues no statements.
pub fn write_in_chunks<T, R, F>(rows: &[T], rows_per_chunk: usize, mut write: F) -> StoreResult<Vec<R>>
where
    F: FnMut(&[T]) -> StoreResult<Vec<R>>,
{
    let mut returned = Vec::new();
    for chunk in rows.chunks(rows_per_chunk.max(1)) {
        returned.extend(write(chunk)?);
    }
    Ok(returned)
}

/// Like [`write_in_chunks`] for statements that only report affected rows.
pub fn execute_in_chunks<T, F>(rows: &[T], rows_per_chunk: usize, mut execute: F) -> StoreResult<usize>
where
    F: FnMut(&[T]) -> StoreResult<usize>,
{
    let mut affected = 0;
    for chunk in rows.chunks(rows_per_chunk.max(1)) {
        affected += execute(chunk)?;
    }
    Ok(affected)
}

/// One page of an add/remove rewrite. `added` are ids gaining the object,
/// `removed` are ids losing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPage<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
}

impl<T: Copy> IdPage<T> {
    /// Every id touched by the page.
    pub fn all(&self) -> Vec<T> {
        self.added.iter().chain(self.removed.iter()).copied().collect()
    }
}

/// Drains the add queue first, then the remove queue, `page_size` ids per
/// page. A page may mix the tail of one queue with the head of the other.
pub fn plan_pages<T: Copy>(added: &[T], removed: &[T], page_size: usize) -> Vec<IdPage<T>> {
    let page_size = page_size.max(1);
    let mut pages = Vec::new();
    let mut adds = added.iter().copied().peekable();
    let mut removes = removed.iter().copied().peekable();

    while adds.peek().is_some() || removes.peek().is_some() {
        let mut page = IdPage {
            added: Vec::new(),
            removed: Vec::new(),
        };
        while page.added.len() < page_size {
            match adds.next() {
                Some(id) => page.added.push(id),
                None => break,
            }
        }
        while page.added.len() + page.removed.len() < page_size {
            match removes.next() {
                Some(id) => page.removed.push(id),
                None => break,
            }
        }
        pages.push(page);
    }
    pages
}
