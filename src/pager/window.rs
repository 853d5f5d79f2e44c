/// An offset range owned by one pager worker. `end` is exclusive; `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub worker_id: usize,
    pub start: u64,
    pub end: Option<u64>,
}

impl PageWindow {
    pub fn bounded(worker_id: usize, start: u64, end: u64) -> Self {
        Self {
            worker_id,
            start,
            end: Some(end.max(start)),
        }
    }

    pub fn unbounded(worker_id: usize, start: u64) -> Self {
        Self {
            worker_id,
            start,
            end: None,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.end.is_some()
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Split `[start, end)` into at most `workers` contiguous, non-overlapping windows with ids
    /// `1..=workers`. Sizes differ by at most one; empty windows are dropped.
    pub fn partition(start: u64, end: u64, workers: usize) -> Vec<PageWindow> {
        if workers == 0 || end <= start {
            return Vec::new();
        }
        let total = end - start;
        let n = workers as u64;
        let base = total / n;
        let remainder = total % n;

        let mut windows = Vec::with_capacity(workers);
        let mut cursor = start;
        for i in 0..n {
            let size = base + u64::from(i < remainder);
            if size == 0 {
                break;
            }
            windows.push(PageWindow::bounded(i as usize + 1, cursor, cursor + size));
            cursor += size;
        }
        windows
    }

    /// Fixed-size windows of `records_per_worker`, worker `i` owning `[(i-1)·R, i·R)`.
    /// The last worker starts at `(N-1)·R` and runs unbounded so nothing past `N·R` is lost.
    pub fn staggered(records_per_worker: u64, workers: usize) -> Vec<PageWindow> {
        (1..=workers)
            .map(|id| {
                let start = (id as u64 - 1) * records_per_worker;
                if id == workers {
                    PageWindow::unbounded(id, start)
                } else {
                    PageWindow::bounded(id, start, start + records_per_worker)
                }
            })
            .collect()
    }
}

/// Records collected by one worker, with the boundary invariant enforced on every append:
/// the offset never passes `end` and the record count never exceeds the window length.
#[derive(Debug, Clone)]
pub struct WindowAccumulator<T> {
    window: PageWindow,
    offset: u64,
    records: Vec<T>,
}

impl<T> WindowAccumulator<T> {
    pub fn new(window: PageWindow) -> Self {
        Self {
            window,
            offset: window.start,
            records: Vec::new(),
        }
    }

    pub fn window(&self) -> PageWindow {
        self.window
    }

    /// Next offset to request.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_full(&self) -> bool {
        self.window.end.is_some_and(|end| self.offset >= end)
    }

    /// Page size to request next: never more than what is left in the window.
    pub fn next_limit(&self, page_size: usize) -> usize {
        match self.window.end {
            Some(end) => {
                let remaining = end.saturating_sub(self.offset);
                page_size.min(usize::try_from(remaining).unwrap_or(usize::MAX))
            }
            None => page_size,
        }
    }

    /// Append one page, advancing by the number of records actually returned.
    /// Anything past the window end is trimmed from the tail. Returns how many records were kept.
    pub fn append_and_clamp(&mut self, mut page: Vec<T>) -> usize {
        let returned = page.len() as u64;
        let mut next = self.offset + returned;
        if let Some(end) = self.window.end {
            if next > end {
                let excess = next - end;
                let keep = returned.saturating_sub(excess) as usize;
                page.truncate(keep);
                next = end;
            }
        }
        let kept = page.len();
        self.records.extend(page);
        self.offset = next;
        kept
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}
