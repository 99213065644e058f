//! Character-safe text truncation

use std::borrow::Cow;

/// Marker appended to excerpts that were cut short.
pub const ELLIPSIS: char = '…';

/// Text operations that count characters, never bytes, so multi-byte input
/// is never split inside a code point.
pub struct TextUtils;

impl TextUtils {
    /// First `max_chars` characters of `text`, borrowed when nothing is cut.
    pub fn truncate_chars(text: &str, max_chars: usize) -> Cow<'_, str> {
        match text.char_indices().nth(max_chars) {
            Some((byte_pos, _)) => Cow::Borrowed(&text[..byte_pos]),
            None => Cow::Borrowed(text),
        }
    }

    /// Like [`TextUtils::truncate_chars`], with [`ELLIPSIS`] appended when the text was cut.
    pub fn excerpt(text: &str, max_chars: usize) -> Cow<'_, str> {
        match text.char_indices().nth(max_chars) {
            Some((byte_pos, _)) => {
                let mut result = String::with_capacity(byte_pos + ELLIPSIS.len_utf8());
                result.push_str(&text[..byte_pos]);
                result.push(ELLIPSIS);
                Cow::Owned(result)
            }
            None => Cow::Borrowed(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_truncate_short_text_is_borrowed() {
        assert!(matches!(TextUtils::truncate_chars("short", 60), Cow::Borrowed("short")));
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(TextUtils::truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(TextUtils::truncate_chars("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn test_excerpt_marks_truncation() {
        assert_eq!(TextUtils::excerpt("abcdef", 3), "abc…");
        assert_eq!(TextUtils::excerpt("abc", 3), "abc");
        assert_eq!(TextUtils::excerpt("", 3), "");
    }

    proptest! {
        #[test]
        fn prop_truncate_is_a_prefix_of_bounded_length(text in "\\PC*", max in 0usize..80) {
            let cut = TextUtils::truncate_chars(&text, max);
            prop_assert!(text.starts_with(cut.as_ref()));
            prop_assert_eq!(cut.chars().count(), text.chars().count().min(max));
        }
    }
}
