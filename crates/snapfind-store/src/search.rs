//! Keyword filter over stored filenames.

use crate::store::StoredImage;

/// Lowercase whitespace-separated keywords of a query.
pub fn keywords(query: &str) -> Vec<String> {
    query.split_whitespace().map(str::to_lowercase).collect()
}

/// Keep the images whose filename stem contains every query keyword.
///
/// Matching is case-insensitive substring AND: `"cat"` also matches
/// `"category"`, and keyword order is irrelevant. A blank query keeps
/// everything. Input order is preserved.
pub fn filter(query: &str, files: impl IntoIterator<Item = StoredImage>) -> Vec<StoredImage> {
    let keywords = keywords(query);
    files
        .into_iter()
        .filter(|image| {
            let stem = image.stem().to_lowercase();
            keywords.iter().all(|k| stem.contains(k.as_str()))
        })
        .collect()
}
