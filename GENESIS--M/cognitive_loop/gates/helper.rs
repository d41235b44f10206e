use std::collections::BTreeSet;

/// Phrases that indicate an attempt to manipulate or deceive.
pub const MANIPULATION_MARKERS: &[&str] = &[
    "manipulate",
    "deceive",
    "trick them",
    "trick people",
    "mislead",
    "gaslight",
    "exploit their",
    "without them knowing",
    "pressure them into",
    "fake reviews",
    "astroturf",
];

/// Phrases that ask the loop to stand in for professional judgement.
pub const AUTHORITY_MARKERS: &[&str] = &[
    "diagnose",
    "prescribe",
    "what dosage",
    "medical advice",
    "legal advice",
    "act as my lawyer",
    "act as my doctor",
    "act as my financial advisor",
    "which stock should i buy",
    "should i sue",
    "tax advice",
];

/// Questions that demand a prediction.
pub const PREDICTIVE_MARKERS: &[&str] = &[
    "will this",
    "will it",
    "will we",
    "will the",
    "will our",
    "is it going to",
    "are we going to",
    "predict",
    "forecast",
];

/// Vocabulary that marks a strategic request.
pub const STRATEGIC_MARKERS: &[&str] = &[
    "strategy",
    "strategic",
    "plan ",
    "market entry",
    "enter the market",
    "roadmap",
    "expansion",
    "expand into",
    "positioning",
    "portfolio",
];

/// Demands for a single deterministic future.
pub const SINGLE_FUTURE_MARKERS: &[&str] = &[
    "exactly what will happen",
    "just tell me what will happen",
    "the one outcome",
    "single forecast",
    "only one scenario",
    "one definitive",
    "definitive forecast",
    "precise prediction",
    "no scenarios",
];

/// Absolute language that admits no counterexample.
pub const UNFALSIFIABLE_MARKERS: &[&str] = &[
    "always",
    "guaranteed",
    "guarantee",
    "never fail",
    "cannot fail",
    "can't fail",
    "inevitabl",
    "100%",
    "no matter what",
    "certainly will",
];

/// Unknowns that name nothing.
pub const PLACEHOLDER_UNKNOWNS: &[&str] = &[
    "",
    "unknown",
    "unknowns",
    "tbd",
    "n/a",
    "various",
    "other factors",
    "misc",
    "etc",
    "everything else",
];

const STOPWORDS: &[&str] = &[
    "that", "this", "with", "from", "will", "have", "been", "into", "than", "them", "they",
    "their", "there", "what", "when", "where", "which", "while", "would", "could", "should",
    "about", "after", "before", "holds", "longer", "does", "over", "under", "more", "less",
];

/// First marker found in `text`, compared case-insensitively.
#[must_use]
pub fn find_marker<'a>(text: &str, markers: &[&'a str]) -> Option<&'a str> {
    let lowered = text.to_lowercase();
    markers
        .iter()
        .copied()
        .find(|marker| !marker.is_empty() && lowered.contains(marker))
}

/// Content words of at least four letters.
#[must_use]
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 4 && !STOPWORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Whether two texts share a content word.
#[must_use]
pub fn overlaps(left: &str, right: &str) -> bool {
    let left = keywords(left);
    keywords(right).iter().any(|word| left.contains(word))
}

/// Whether an unknown names nothing concrete.
#[must_use]
pub fn is_placeholder(statement: &str) -> bool {
    let normalized = statement.trim().trim_end_matches('.').to_lowercase();
    PLACEHOLDER_UNKNOWNS.contains(&normalized.as_str())
}

/// Statements introduced by `assume` in the request text.
#[must_use]
pub fn assume_clauses(text: &str) -> Vec<String> {
    let lowered = text.to_ascii_lowercase();
    let bytes = lowered.as_bytes();
    let mut clauses = Vec::new();
    let mut cursor = 0;
    while let Some(found) = lowered[cursor..].find("assume") {
        let start = cursor + found;
        cursor = start + "assume".len();
        let boundary_before = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let rest = &lowered[cursor..];
        let skip = if rest.starts_with("s ") {
            2
        } else if rest.starts_with(' ') || rest.starts_with(':') {
            1
        } else {
            continue;
        };
        if !boundary_before {
            continue;
        }
        let clause_start = cursor + skip;
        let clause_end = lowered[clause_start..]
            .find([',', ';', '.', '\n'])
            .map_or(lowered.len(), |offset| clause_start + offset);
        let mut clause = text[clause_start..clause_end].trim();
        if let Some(stripped) = clause.strip_prefix("that ") {
            clause = stripped.trim();
        }
        if let Some(stripped) = clause.strip_suffix(" and") {
            clause = stripped.trim();
        }
        if !clause.is_empty() {
            clauses.push(clause.to_string());
        }
        cursor = clause_end;
    }
    clauses
}

/// Splits a `key: a, b; c` value into trimmed items.
#[must_use]
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_assume_clauses() {
        let clauses = assume_clauses(
            "Plan market entry for H2, assume funding secured, assume no new competitor",
        );
        assert_eq!(clauses, vec!["funding secured", "no new competitor"]);
        assert_eq!(
            assume_clauses("Assuming nothing; we assume that churn stays flat."),
            vec!["churn stays flat"]
        );
        assert!(assume_clauses("presume success").is_empty());
    }

    #[test]
    fn keywords_drop_short_and_stop_words() {
        let words = keywords("Funding is secured for the expansion");
        assert!(words.contains("funding"));
        assert!(words.contains("secured"));
        assert!(!words.contains("the"));
        assert!(overlaps("funding secured", "bridge funding withdrawn"));
        assert!(!overlaps("funding secured", "competitor launches"));
    }

    #[test]
    fn markers_match_case_insensitively() {
        assert_eq!(
            find_marker("Will this product succeed?", PREDICTIVE_MARKERS),
            Some("will this")
        );
        assert!(is_placeholder("TBD."));
        assert!(!is_placeholder("regulator timeline"));
    }
}
