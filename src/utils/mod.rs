//! Common utilities and helper functions
//!
//! This module provides shared utilities used across the application.

pub mod retry;

use std::collections::BTreeSet;

use crate::models::UserId;

/// Sort and deduplicate a list of user ids
pub fn unique_sorted(ids: impl IntoIterator<Item = UserId>) -> Vec<UserId> {
    ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Parse a comma separated id list such as `"3, 1,2"`
pub fn parse_id_list(input: &str) -> Result<Vec<i64>, std::num::ParseIntError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<i64>)
        .collect()
}

/// Truncate text to a maximum number of characters
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
