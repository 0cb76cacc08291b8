use strsim::jaro_winkler;

/// Minimum Jaro-Winkler score for two titles to be treated as the same work.
pub const MIN_TITLE_SIMILARITY: f64 = 0.88;

/// True when the title carries at least one Cyrillic letter.
///
/// Free-text sources are only queried for such titles; searching Kinopoisk
/// aggregators with a Latin or CJK title mostly returns unrelated hits.
pub fn has_cyrillic(title: &str) -> bool {
    title
        .chars()
        .any(|c| matches!(c, 'а'..='я' | 'А'..='Я' | 'ё' | 'Ё'))
}

/// Normalized comparison key for titles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleKey {
    normalized: String,
}

impl TitleKey {
    /// Lowercase, fold ё to е, keep only alphanumerics (any script).
    pub fn new(raw: &str) -> Self {
        let normalized = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == 'ё' { 'е' } else { c })
            .filter(|c| c.is_alphanumeric())
            .collect();
        Self { normalized }
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    pub fn similarity(&self, other: &Self) -> f64 {
        if self.is_empty() || other.is_empty() {
            return 0.0;
        }
        jaro_winkler(self.normalized(), other.normalized())
    }
}

/// Best similarity between any wanted title and any offered title.
pub fn best_similarity<'a, W, O>(wanted: W, offered: O) -> f64
where
    W: IntoIterator<Item = &'a str>,
    O: IntoIterator<Item = &'a str> + Clone,
{
    let mut best = 0.0f64;
    for w in wanted {
        let wk = TitleKey::new(w);
        for o in offered.clone() {
            best = best.max(wk.similarity(&TitleKey::new(o)));
        }
    }
    best
}
