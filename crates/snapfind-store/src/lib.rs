//! snapfind-store: Directory-backed image store and keyword search.
//!
//! Every stored image is a JPEG named `{uuid}_{caption_with_underscores}.jpg`.
//! The caption lives only in the filename; search is a substring filter over
//! those names.

pub mod name;
pub mod search;
pub mod store;

pub use name::StoredName;
pub use search::filter;
pub use store::{has_image_extension, FileStore, StoreError, StoredImage, IMAGE_EXTENSIONS};
