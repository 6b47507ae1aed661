//! Arabic name normalization used for roster matching.
//!
//! Two names refer to the same roster slot exactly when their normalized
//! forms are equal. The key drops diacritics and tatweel and folds the
//! letter variants students commonly type interchangeably.

const TATWEEL: char = '\u{0640}';

fn is_tashkeel(c: char) -> bool {
    matches!(c, '\u{0610}'..='\u{061A}' | '\u{064B}'..='\u{065F}' | '\u{0670}')
}

fn fold(c: char) -> char {
    match c {
        'أ' | 'إ' | 'آ' | 'ٱ' => 'ا',
        'ى' => 'ي',
        'ة' => 'ه',
        'ؤ' => 'و',
        'ئ' => 'ي',
        other => other,
    }
}

/// Canonical matching key for a student name. Idempotent.
pub fn normalize(name: &str) -> String {
    let folded: String = name
        .chars()
        .filter(|c| !is_tashkeel(*c) && *c != TATWEEL)
        .map(fold)
        .collect::<String>()
        .to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity in [0, 1] between the normalized forms of two names.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(a), &normalize(b))
}
