//! Filename codec: `{uuid}_{caption_with_underscores}.jpg`.
//!
//! The caption is embedded in the filename rather than stored as separate
//! metadata, so identity and searchable text share one string.

use snapfind_core::Caption;
use uuid::Uuid;

/// Extension written for every saved image.
pub const SAVED_EXTENSION: &str = "jpg";
/// Slug used when a caption has no filename-safe characters left.
const EMPTY_CAPTION_SLUG: &str = "untitled";
/// Hyphenated UUID length.
const UUID_LEN: usize = 36;

/// Parsed identity of a stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredName {
    pub id: Uuid,
    /// Caption slug with underscores, as it appears in the filename.
    pub slug: String,
}

impl StoredName {
    /// Fresh name for a newly captioned image.
    pub fn generate(caption: &Caption) -> Self {
        Self {
            id: Uuid::new_v4(),
            slug: caption_slug(caption.as_str()),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.{SAVED_EXTENSION}", self.id.hyphenated(), self.slug)
    }

    /// Caption text recovered from the slug (underscores back to spaces).
    pub fn caption(&self) -> String {
        self.slug.replace('_', " ")
    }

    /// Parse a conforming filename. Returns `None` for anything that does not
    /// start with a hyphenated UUID followed by `_` and a non-empty slug.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = match file_name.rsplit_once('.') {
            Some((stem, _ext)) => stem,
            None => file_name,
        };
        let id = Uuid::try_parse(stem.get(..UUID_LEN)?).ok()?;
        let slug = stem.get(UUID_LEN..)?.strip_prefix('_')?;
        if slug.is_empty() {
            return None;
        }
        Some(Self {
            id,
            slug: slug.to_string(),
        })
    }
}

/// Turn a caption into a filename-safe slug.
///
/// Whitespace runs become a single `_`; only ASCII alphanumerics and `-` are
/// kept otherwise, so a caption can never contribute a path separator.
pub fn caption_slug(caption: &str) -> String {
    let words: Vec<String> = caption
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect();

    if words.is_empty() {
        EMPTY_CAPTION_SLUG.to_string()
    } else {
        words.join("_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_replaces_spaces() {
        assert_eq!(caption_slug("a man riding a horse"), "a_man_riding_a_horse");
    }

    #[test]
    fn test_slug_strips_unsafe_characters() {
        assert_eq!(caption_slug("a cat / on ../the mat."), "a_cat_on_the_mat");
        assert_eq!(caption_slug("well-lit room"), "well-lit_room");
    }

    #[test]
    fn test_slug_never_empty() {
        assert_eq!(caption_slug(""), "untitled");
        assert_eq!(caption_slug("  ... !!"), "untitled");
    }

    #[test]
    fn test_generate_file_name_shape() {
        let name = StoredName::generate(&Caption::new("A Red Car"));
        let file = name.file_name();
        assert!(file.ends_with("_A_Red_Car.jpg"), "{file}");
        assert_eq!(file.find('_'), Some(UUID_LEN));
        assert!(Uuid::try_parse(&file[..UUID_LEN]).is_ok());
    }

    #[test]
    fn test_parse_roundtrip() {
        let name = StoredName::generate(&Caption::new("two dogs playing"));
        let parsed = StoredName::parse(&name.file_name()).unwrap();
        assert_eq!(parsed, name);
        assert_eq!(parsed.caption(), "two dogs playing");
    }

    #[test]
    fn test_parse_rejects_nonconforming() {
        assert_eq!(StoredName::parse("holiday.png"), None);
        assert_eq!(StoredName::parse("a_cat.jpg"), None);
        assert_eq!(StoredName::parse("67e55044-10b1-426f-9247-bb680e5fe0c8.jpg"), None);
        assert_eq!(StoredName::parse("67e55044-10b1-426f-9247-bb680e5fe0c8_.jpg"), None);
    }

    #[test]
    fn test_parse_accepts_other_extensions() {
        let parsed = StoredName::parse("67e55044-10b1-426f-9247-bb680e5fe0c8_sunset.png").unwrap();
        assert_eq!(parsed.slug, "sunset");
    }

    #[test]
    fn test_generated_ids_distinct() {
        let caption = Caption::new("same caption");
        let a = StoredName::generate(&caption);
        let b = StoredName::generate(&caption);
        assert_ne!(a.file_name(), b.file_name());
    }
}
