//! Shared helpers: wire-id minting and log-safe body previews.

use rand::Rng;

/// Mint a prefixed wire identifier, e.g. `mint_id("msg")` -> `msg_b3f1...`.
///
/// 24 hex chars of randomness keeps the shape in line with the identifiers
/// both protocols hand out without depending on either side's conventions.
pub fn mint_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut suffix = String::with_capacity(24);
    for _ in 0..24 {
        let nibble: u8 = rng.gen_range(0..16);
        suffix.push(char::from_digit(nibble as u32, 16).unwrap());
    }
    format!("{}_{}", prefix, suffix)
}

/// A short, UTF-8-safe prefix of `s` for log lines.
///
/// Truncation backs up to the nearest character boundary so a multi-byte
/// character is never split.
pub fn preview(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_have_prefix_and_are_unique() {
        let a = mint_id("toolu");
        let b = mint_id("toolu");
        assert!(a.starts_with("toolu_"));
        assert_eq!(a.len(), "toolu_".len() + 24);
        assert_ne!(a, b);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("hello world", 5), "hello");
        assert_eq!(preview("short", 64), "short");
        // 3 bytes per character; cutting at 4 backs up to one character.
        assert_eq!(preview("日本語", 4), "日");
    }
}
