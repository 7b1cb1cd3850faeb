//! Sliding-window text chunker and term tokenizer.
//!
//! Text is first cleaned by collapsing every whitespace run into a single
//! space. The cleaned text is then cut into windows of `chunk_chars`
//! characters, each window starting `max(1, chunk_chars - overlap)`
//! characters after the previous one. The last window may be shorter than
//! the others; text shorter than one window becomes a single chunk.
//!
//! All lengths and offsets are measured in `char`s, never bytes, so
//! multi-byte text is never split inside a code point.

/// Collapse whitespace runs into single spaces and trim both ends.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Split `text` into overlapping windows.
///
/// Returns an empty vector when the cleaned text is empty.
pub fn chunk_text(text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<String> {
    let cleaned = clean_text(text);
    if cleaned.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = cleaned.chars().collect();
    if chunk_chars == 0 || chars.len() <= chunk_chars {
        return vec![cleaned];
    }

    let step = chunk_chars.saturating_sub(overlap_chars).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let end = (start + chunk_chars).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Minimum token length in characters.
const MIN_TOKEN_CHARS: usize = 2;

/// Split text into lowercase runs of Unicode letters and digits.
///
/// Runs shorter than two characters are dropped. Re-tokenizing the joined
/// output yields the same sequence.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for c in text.chars() {
        if c.is_alphanumeric() {
            // Lowercasing can yield combining marks, e.g. 'İ' -> "i\u{307}".
            for lower in c.to_lowercase().filter(|l| l.is_alphanumeric()) {
                current.push(lower);
                current_len += 1;
            }
        } else if !current.is_empty() {
            if current_len >= MIN_TOKEN_CHARS {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            current_len = 0;
        }
    }

    if current_len >= MIN_TOKEN_CHARS {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_collapses_whitespace() {
        assert_eq!(clean_text("  a \n\n b\t\tc  "), "a b c");
        assert_eq!(clean_text(" \n\t "), "");
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("Hello,   world!", 1000, 200);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(chunk_text("", 1000, 200).is_empty());
        assert!(chunk_text("   \n ", 1000, 200).is_empty());
    }

    #[test]
    fn test_window_offsets() {
        let text: String = (0..2500).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk_text(&text, 1000, 200);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], text[0..1000]);
        assert_eq!(chunks[1], text[800..1800]);
        assert_eq!(chunks[2], text[1600..2500]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1000));
    }

    #[test]
    fn test_overlap_not_smaller_than_window_still_advances() {
        let chunks = chunk_text("abcdef", 3, 5);
        assert_eq!(chunks, vec!["abc", "bcd", "cde", "def"]);
    }

    #[test]
    fn test_multibyte_windows() {
        let chunks = chunk_text("ééééé", 2, 0);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma delta epsilon zeta eta theta";
        assert_eq!(chunk_text(text, 10, 3), chunk_text(text, 10, 3));
    }

    #[test]
    fn test_tokenize_basic() {
        let tokens = tokenize("The Token-Bucket, a rate limiter (v2)!");
        assert_eq!(
            tokens,
            vec!["the", "token", "bucket", "rate", "limiter", "v2"]
        );
    }

    #[test]
    fn test_tokenize_unicode() {
        assert_eq!(tokenize("Größe café 東京"), vec!["größe", "café", "東京"]);
    }

    #[test]
    fn test_tokenize_idempotent() {
        let first = tokenize("Rate-limiting: Token BUCKET x 42 ab_cd İstanbul");
        let second = tokenize(&first.join(" "));
        assert_eq!(first, second);
        assert!(first.contains(&"istanbul".to_string()));
        for t in &first {
            assert!(t.chars().count() >= 2);
            assert!(t.chars().all(|c| c.is_alphanumeric()));
            assert_eq!(t, &t.to_lowercase());
        }
    }
}
