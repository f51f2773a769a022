//! Text normalization and the weighted similarity scorer used for alias
//! matching. Scores are on a 0-100 scale; the floor and margin applied on top
//! live in `config`.

use strsim::jaro_winkler;

/// Normalize a phrase for matching:
/// - lowercase
/// - fold common Spanish diacritics (cuántos -> cuantos)
/// - punctuation and underscores become spaces
/// - whitespace collapsed
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.to_lowercase().chars() {
        let folded = match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            '_' => ' ',
            c if c.is_alphanumeric() => c,
            _ => ' ',
        };
        out.push(folded);
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Weighted similarity between two already-normalized phrases.
///
/// Combines plain Jaro-Winkler with a token-sorted pass (so word order does
/// not dominate) plus a small substring bonus for partial mentions like
/// "revenue" inside "total revenue".
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 100.0;
    }

    let direct = jaro_winkler(a, b);

    let sorted = |s: &str| {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    let token_sorted = jaro_winkler(&sorted(a), &sorted(b));

    let mut score = direct.max(token_sorted) * 100.0;

    if a.contains(b) || b.contains(a) {
        let len_diff = (a.len() as f64 - b.len() as f64).abs();
        let max_len = a.len().max(b.len()) as f64;
        score += (1.0 - len_diff / max_len) * 10.0;
    }

    score.min(100.0)
}
