//! Paging parameters and result pages.

use serde::{Deserialize, Serialize};

/// Paging parameters for page queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingParams {
    /// Number of items to skip. `None` (or a negative value) means unset.
    #[serde(default)]
    pub skip: Option<i64>,
    /// Maximum number of items to return. Defaults to the configured max page size.
    #[serde(default)]
    pub take: Option<i64>,
    /// Also return the total number of matching items.
    #[serde(default)]
    pub total: bool,
}

impl PagingParams {
    pub fn new(skip: Option<i64>, take: Option<i64>, total: bool) -> Self {
        Self { skip, take, total }
    }

    /// Get skip, `None` when unset.
    pub fn skip(&self) -> Option<i64> {
        self.skip.filter(|s| *s >= 0)
    }

    /// Get take, limited to `max_page_size`.
    pub fn take(&self, max_page_size: i64) -> i64 {
        match self.take {
            Some(take) if take >= 0 => take.min(max_page_size),
            _ => max_page_size,
        }
    }
}

/// A page of items with an optional total count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPage<T> {
    pub data: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

impl<T> DataPage<T> {
    pub fn new(data: Vec<T>, total: Option<i64>) -> Self {
        Self { data, total }
    }
}

impl<T> Default for DataPage<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            total: None,
        }
    }
}
