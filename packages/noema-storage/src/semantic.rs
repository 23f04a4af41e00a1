/// Deterministic pattern-based semantic classification
///
/// Tags learned concepts with a coarse semantic type. No ML models and no
/// fallbacks: classification is pure regex matching, so the same content
/// always receives the same tag. The tag is opaque to storage.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Semantic type assigned to a concept by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    Entity,
    Event,
    Rule,
    Causal,
    Temporal,
    Quantitative,
    Definitional,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Event => "event",
            Self::Rule => "rule",
            Self::Causal => "causal",
            Self::Temporal => "temporal",
            Self::Quantitative => "quantitative",
            Self::Definitional => "definitional",
        }
    }
}

struct ClassifierPatterns {
    rule_modal: Regex,
    causal_direct: Regex,
    temporal_marker: Regex,
    quantitative: Regex,
    definitional: Regex,
    event_marker: Regex,
}

static PATTERNS: Lazy<ClassifierPatterns> = Lazy::new(|| ClassifierPatterns {
    rule_modal: Regex::new(r"(?i)\b(must|shall|should|required|mandatory|never|always)\b").unwrap(),
    causal_direct: Regex::new(r"(?i)\b(causes?|leads? to|results? in|triggers?|produces?|prevents?)\b")
        .unwrap(),
    temporal_marker: Regex::new(
        r"(?i)\b(before|after|during|while|until|since|in \d{4}|on (monday|tuesday|wednesday|thursday|friday|saturday|sunday))\b",
    )
    .unwrap(),
    quantitative: Regex::new(r"\b\d+(\.\d+)?\s*(%|percent|kg|km|meters?|miles?|years?|USD|EUR)\b")
        .unwrap(),
    definitional: Regex::new(r"(?i)\b(is a|is an|is the|are the|means|refers to|defined as)\b")
        .unwrap(),
    event_marker: Regex::new(r"(?i)\b(occurred|happened|took place|was held|will occur|launched)\b")
        .unwrap(),
});

/// Classify text into a semantic type. Ordering encodes precedence: the most
/// specific signals win over the definitional catch-all.
pub fn classify(text: &str) -> SemanticType {
    let p = &*PATTERNS;

    if p.rule_modal.is_match(text) {
        SemanticType::Rule
    } else if p.causal_direct.is_match(text) {
        SemanticType::Causal
    } else if p.event_marker.is_match(text) {
        SemanticType::Event
    } else if p.temporal_marker.is_match(text) {
        SemanticType::Temporal
    } else if p.quantitative.is_match(text) {
        SemanticType::Quantitative
    } else if p.definitional.is_match(text) {
        SemanticType::Definitional
    } else {
        SemanticType::Entity
    }
}
