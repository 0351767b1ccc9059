use crate::error::{RagError, RagResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    /// Offset of the first character within the source text, in chars.
    pub start: usize,
    pub char_len: usize,
}

// 日本語の句読点も区切りとして扱う
const SENTENCE_ENDS: [char; 4] = ['。', '？', '！', '\n'];
const LATIN_SENTENCE_ENDS: [char; 3] = ['.', '?', '!'];

/// Split `text` into overlapping windows of at most `chunk_size` characters.
///
/// Consecutive chunks share exactly `chunk_overlap` characters, so
/// `chunks[0] + chunks[1][overlap..] + ...` reproduces `text`. A window is
/// pulled back to the last sentence end or whitespace it contains, as long
/// as that keeps it longer than `max(chunk_overlap, chunk_size / 2)`.
pub fn split(text: &str, chunk_size: usize, chunk_overlap: usize) -> RagResult<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(RagError::InvalidInput("chunk_size must be positive".to_string()));
    }
    if chunk_overlap == 0 {
        return Err(RagError::InvalidInput("chunk_overlap must be positive".to_string()));
    }
    if chunk_overlap >= chunk_size {
        return Err(RagError::InvalidInput(format!(
            "chunk_overlap ({}) must be smaller than chunk_size ({})",
            chunk_overlap, chunk_size
        )));
    }

    let chars: Vec<char> = text.chars().collect();
    // byte offset of every char position, plus the end of the string
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = chars.len();

    if total <= chunk_size {
        return Ok(vec![Chunk {
            index: 0,
            text: text.to_string(),
            start: 0,
            char_len: total,
        }]);
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let hard_end = start + chunk_size;
        let end = if hard_end >= total {
            total
        } else {
            let min_end = start + chunk_overlap.max(chunk_size / 2);
            find_break_point(&chars, min_end, hard_end)
        };

        chunks.push(Chunk {
            index: chunks.len(),
            text: text[offsets[start]..offsets[end]].to_string(),
            start,
            char_len: end - start,
        });

        if end == total {
            break;
        }
        start = end - chunk_overlap;
    }

    Ok(chunks)
}

/// Pick a window end in `(min_end, max_end]`, preferring sentence ends.
fn find_break_point(chars: &[char], min_end: usize, max_end: usize) -> usize {
    let candidates = || (min_end + 1..=max_end).rev();

    for end in candidates() {
        let last = chars[end - 1];
        if SENTENCE_ENDS.contains(&last) {
            return end;
        }
        if last == ' ' && end >= 2 && LATIN_SENTENCE_ENDS.contains(&chars[end - 2]) {
            return end;
        }
    }
    for end in candidates() {
        if chars[end - 1].is_whitespace() {
            return end;
        }
    }
    max_end
}

/// Rebuild the source text from chunks produced with the same overlap.
pub fn reassemble(chunks: &[Chunk], chunk_overlap: usize) -> String {
    let mut out = String::new();
    for chunk in chunks {
        if chunk.index == 0 {
            out.push_str(&chunk.text);
        } else {
            out.extend(chunk.text.chars().skip(chunk_overlap));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_round_trip(text: &str, size: usize, overlap: usize) {
        let chunks = split(text, size, overlap).unwrap();
        assert_eq!(reassemble(&chunks, overlap), text, "size={} overlap={}", size, overlap);
        for c in &chunks {
            assert!(c.char_len <= size);
            assert_eq!(c.text.chars().count(), c.char_len);
        }
        for pair in chunks.windows(2) {
            let tail: String = pair[0]
                .text
                .chars()
                .skip(pair[0].char_len - overlap)
                .collect();
            let head: String = pair[1].text.chars().take(overlap).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn test_quick_brown_fox() {
        let text = "The quick brown fox jumps.";
        let chunks = split(text, 10, 3).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].text, "The quick ");
        assert_eq!(reassemble(&chunks, 3), text);
    }

    #[test]
    fn test_round_trip_various_params() {
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. Sed do eiusmod \
                    tempor incididunt ut labore et dolore magna aliqua.\nUt enim ad minim veniam, \
                    quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea commodo.";
        for (size, overlap) in [(10, 3), (16, 1), (25, 24), (50, 10), (7, 1), (1000, 200)] {
            assert_round_trip(text, size, overlap);
        }
    }

    #[test]
    fn test_round_trip_without_whitespace() {
        let text = "x".repeat(257);
        assert_round_trip(&text, 20, 5);
        let chunks = split(&text, 20, 5).unwrap();
        assert_eq!(chunks[0].char_len, 20);
        assert_eq!(chunks[1].start, 15);
    }

    #[test]
    fn test_japanese_text_chunking() {
        let text = "これはテスト文章です。日本語のマルチバイト文字を含むテキストを正しくチャンクに分割できるかテストします。句読点で分割されることを確認します。";
        let chunks = split(text, 20, 5).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].text, "これはテスト文章です。");
        assert_round_trip(text, 20, 5);
    }

    #[test]
    fn test_mixed_text_chunking() {
        let text = "AI Security Conference 2026 イベントレポート。最新のセキュリティ技術について検討しました。参加者は100名を超えました。";
        assert_round_trip(text, 20, 4);
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split("short", 100, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short");
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn test_empty_text_single_chunk() {
        let chunks = split("", 100, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].char_len, 0);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta. Gamma delta! Epsilon zeta? Eta theta iota kappa lambda mu.";
        let a = split(text, 12, 4).unwrap();
        let b = split(text, 12, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..200).map(|i| format!("word{} ", i)).collect::<String>();
        let chunks = split(&text, 40, 8).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn test_rejects_invalid_params() {
        assert!(matches!(split("abc", 0, 0), Err(RagError::InvalidInput(_))));
        assert!(matches!(split("abc", 10, 10), Err(RagError::InvalidInput(_))));
        assert!(matches!(split("abc", 10, 12), Err(RagError::InvalidInput(_))));
        assert!(matches!(split("abc", 10, 0), Err(RagError::InvalidInput(_))));
    }
}
