//! Pagination position for one conversation's history.
//!
//! Pages are 1-based and numbered from the newest messages backwards.
//! The cursor only moves when a fetched page has been merged, so a failed
//! fetch leaves it where it was.

/// Returned by [`PageCursor::advance`] when every page has been loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("all history pages are already loaded")]
pub struct AlreadyComplete;

/// Tracks the last merged page and whether older pages exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    current: u32,
    has_more: bool,
}

impl PageCursor {
    /// A cursor positioned before the first page.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: 0,
            has_more: true,
        }
    }

    /// Moves back before the first page.
    pub const fn reset(&mut self) {
        *self = Self::new();
    }

    /// The page to request next. Does not move the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyComplete`] when the last recorded page was the final one.
    pub const fn advance(&self) -> Result<u32, AlreadyComplete> {
        if self.has_more {
            Ok(self.current.saturating_add(1))
        } else {
            Err(AlreadyComplete)
        }
    }

    /// Records that `page` of `total_pages` has been merged.
    pub const fn record_page(&mut self, page: u32, total_pages: u32) {
        self.current = page;
        self.has_more = page < total_pages;
    }

    /// The last merged page, 0 if none.
    #[must_use]
    pub const fn current(&self) -> u32 {
        self.current
    }

    /// Whether older pages remain on the server.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::new()
    }
}
