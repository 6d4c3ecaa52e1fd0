/// Fold a person name for identity matching: lowercase, punctuation dropped (intra-word `-` and
/// `'` kept), whitespace collapsed.
pub fn normalize_name(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let chars: Vec<char> = raw.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            cleaned.extend(c.to_lowercase());
        } else if *c == '-' || *c == '\'' {
            let prev = i > 0 && chars[i - 1].is_alphanumeric();
            let next = chars.get(i + 1).map(|n| n.is_alphanumeric()).unwrap_or(false);
            if prev && next {
                cleaned.push(*c);
            } else {
                cleaned.push(' ');
            }
        } else {
            cleaned.push(' ');
        }
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a free-form list such as `"Alice, Bob and Carol"` into trimmed names.
pub fn split_names(raw: &str) -> Vec<String> {
    raw.split([',', ';', '\n'])
        .flat_map(|part| part.split(" and "))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Similarity in [0, 1] of two normalized names: normalized Levenshtein over chars.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}
