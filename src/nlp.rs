//! Lightweight text helpers: a word tokenizer and an AFINN-style sentiment score.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Valence per word, from -5 (very negative) to +5 (very positive).
static LEXICON: Lazy<HashMap<&'static str, i32>> = Lazy::new(|| {
    [
        ("amazing", 4),
        ("awesome", 4),
        ("best", 3),
        ("brilliant", 4),
        ("excellent", 3),
        ("fantastic", 4),
        ("good", 3),
        ("great", 3),
        ("happy", 3),
        ("helpful", 2),
        ("like", 2),
        ("love", 3),
        ("nice", 3),
        ("perfect", 3),
        ("please", 1),
        ("thank", 2),
        ("thanks", 2),
        ("useful", 2),
        ("wonderful", 4),
        ("yes", 1),
        ("angry", -3),
        ("annoying", -2),
        ("awful", -3),
        ("bad", -3),
        ("broken", -1),
        ("bug", -2),
        ("confused", -2),
        ("crash", -2),
        ("error", -2),
        ("fail", -2),
        ("failed", -2),
        ("hate", -3),
        ("horrible", -3),
        ("no", -1),
        ("problem", -2),
        ("sad", -2),
        ("stuck", -2),
        ("terrible", -3),
        ("useless", -2),
        ("worst", -3),
        ("wrong", -2),
    ]
        .into_iter()
        .collect()
});

const NEGATORS: [&str; 6] = ["not", "no", "never", "don't", "doesn't", "isn't"];

/// Lowercased word tokens; apostrophes inside words are kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\'').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Sum of word valences; a negator directly before a scored word flips its sign.
pub fn sentiment_score(text: &str) -> i32 {
    let tokens = tokenize(text);
    let mut score = 0;
    for (i, token) in tokens.iter().enumerate() {
        if let Some(value) = LEXICON.get(token.as_str()) {
            let negated = i > 0 && NEGATORS.contains(&tokens[i - 1].as_str());
            score += if negated { -value } else { *value };
        }
    }
    score
}
