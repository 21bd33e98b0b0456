/// Text heuristics: category classification, answer word count and the
/// follow-up decision. Pure functions, no controller state.
use tracing::debug;
use unicode_segmentation::UnicodeSegmentation;

use crate::models::{Category, ConversationState};

/// Checked in this order; the first group with a hit wins. Market and
/// technical come first so "competitor features" or "technical design"
/// land in the narrower category.
const KEYWORD_GROUPS: &[(Category, &[&str])] = &[
    (
        Category::Market,
        &[
            "market", "competitor", "business model", "monetization", "monetize",
            "revenue", "pricing", "competition", "industry", "sector",
        ],
    ),
    (
        Category::Technical,
        &[
            "technical", "technology", "stack", "performance", "architecture",
            "framework", "database", "backend", "frontend", "infrastructure",
            "security", "scalability", "integration", "api",
        ],
    ),
    (
        Category::Functionality,
        &[
            "functionality", "feature", "does", "purpose", "capability",
            "function", "what will", "main goal", "core feature",
        ],
    ),
    (
        Category::Users,
        &[
            "user", "audience", "who will", "target", "persona", "customer",
            "end user", "client", "segment", "who is", "who are",
        ],
    ),
    (
        Category::Demographics,
        &[
            "age", "demographic", "location", "geographic", "region", "gender",
            "income", "education", "occupation",
        ],
    ),
    (
        Category::Design,
        &[
            "design", "style", "color", "colour", "ui", "ux", "interface", "visual",
            "aesthetic", "look", "feel", "theme", "layout",
        ],
    ),
];

const VAGUE_PHRASES: &[&str] = &[
    "i don't know",
    "i dont know",
    "not sure",
    "maybe",
    "possibly",
    "whatever",
    "anything",
    "doesn't matter",
];

/// Lower-cased words joined by single spaces and padded, so terms can be
/// matched on word boundaries with a plain `contains`.
fn normalize(text: &str) -> String {
    let words: Vec<String> = text.unicode_words().map(|w| w.to_lowercase()).collect();
    format!(" {} ", words.join(" "))
}

fn contains_term(haystack: &str, term: &str) -> bool {
    let term = normalize(term);
    let bare = term.trim_end();
    haystack.contains(&term) || haystack.contains(&format!("{}s ", bare))
}

/// Map free text to the investigation topic it is about, if any.
pub fn classify(text: &str) -> Option<Category> {
    let haystack = normalize(text);
    for (category, keywords) in KEYWORD_GROUPS {
        if let Some(hit) = keywords.iter().find(|kw| contains_term(&haystack, kw)) {
            debug!("Classified as {} (matched '{}')", category, hit);
            return Some(*category);
        }
    }
    None
}

pub fn word_count(text: &str) -> usize {
    text.unicode_words().count()
}

pub fn is_vague(answer: &str) -> bool {
    let haystack = normalize(answer);
    VAGUE_PHRASES.iter().any(|p| haystack.contains(&normalize(p)))
}

/// Why an answer earned a follow-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowupReason {
    TooShort { words: usize, threshold: usize },
    Vague,
}

/// Word count is a weak proxy for completeness and is kept as a named,
/// configurable threshold. Nothing follows up in REVIEW.
pub fn followup_reason(
    answer: &str,
    state: ConversationState,
    threshold: usize,
    check_vague: bool,
) -> Option<FollowupReason> {
    if !matches!(state, ConversationState::Category(_)) {
        return None;
    }

    let words = word_count(answer);
    if words < threshold {
        return Some(FollowupReason::TooShort { words, threshold });
    }
    if check_vague && is_vague(answer) {
        return Some(FollowupReason::Vague);
    }
    None
}
