/// Pattern-based association extraction
///
/// Extracts (subject, relation, object, confidence) tuples from learned text
/// using fixed regex patterns. Subjects and objects are later hashed to
/// concept ids and stored as forward references; their concept records may
/// not exist yet.
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::AssociationType;

#[derive(Debug, Clone)]
pub struct ExtractedAssociation {
    pub subject: String,
    pub object: String,
    pub assoc_type: AssociationType,
    pub confidence: f32,
}

struct ExtractionPattern {
    regex: Regex,
    assoc_type: AssociationType,
    confidence: f32,
}

static PATTERNS: Lazy<Vec<ExtractionPattern>> = Lazy::new(|| {
    let pattern = |re: &str, assoc_type, confidence| ExtractionPattern {
        regex: Regex::new(re).unwrap(),
        assoc_type,
        confidence,
    };

    vec![
        // Causal
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+causes\s+([A-Za-z][\w\- ]+)",
            AssociationType::Causal,
            0.8,
        ),
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+leads to\s+([A-Za-z][\w\- ]+)",
            AssociationType::Causal,
            0.75,
        ),
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+results in\s+([A-Za-z][\w\- ]+)",
            AssociationType::Causal,
            0.75,
        ),
        // Hierarchical
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+is an?\s+([A-Za-z][\w\- ]+)",
            AssociationType::Hierarchical,
            0.85,
        ),
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+is a type of\s+([A-Za-z][\w\- ]+)",
            AssociationType::Hierarchical,
            0.8,
        ),
        // Temporal
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+before\s+([A-Za-z][\w\- ]+)",
            AssociationType::Temporal,
            0.7,
        ),
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+after\s+([A-Za-z][\w\- ]+)",
            AssociationType::Temporal,
            0.7,
        ),
        // Compositional
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+is part of\s+([A-Za-z][\w\- ]+)",
            AssociationType::Compositional,
            0.8,
        ),
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+contains\s+([A-Za-z][\w\- ]+)",
            AssociationType::Compositional,
            0.75,
        ),
        // Semantic (weak relatedness)
        pattern(
            r"(?i)([A-Za-z][\w\- ]+?)\s+is related to\s+([A-Za-z][\w\- ]+)",
            AssociationType::Semantic,
            0.6,
        ),
    ]
});

/// Extract association tuples from content.
///
/// Tuples below `min_confidence` are discarded; at most `max_associations`
/// are returned. Duplicates by (subject, object, type) collapse to one.
pub fn extract(
    content: &str,
    min_confidence: f32,
    max_associations: usize,
) -> Vec<ExtractedAssociation> {
    let text = content.trim();
    let mut results: Vec<ExtractedAssociation> = Vec::new();

    for pat in PATTERNS.iter() {
        if pat.confidence < min_confidence {
            continue;
        }

        for caps in pat.regex.captures_iter(text) {
            let (Some(subject), Some(object)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let subject = subject.as_str().trim().to_string();
            let object = object.as_str().trim().to_string();
            if subject.is_empty() || object.is_empty() {
                continue;
            }

            results.push(ExtractedAssociation {
                subject,
                object,
                assoc_type: pat.assoc_type,
                confidence: pat.confidence,
            });
        }
    }

    results.sort_by(|a, b| {
        (&a.subject, &a.object, a.assoc_type as u8).cmp(&(&b.subject, &b.object, b.assoc_type as u8))
    });
    results.dedup_by(|a, b| {
        a.subject == b.subject && a.object == b.object && a.assoc_type == b.assoc_type
    });

    // Highest-confidence tuples win the cap
    results.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    results.truncate(max_associations);

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_causal_pair() {
        let results = extract("Smoking causes cancer", 0.5, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].subject, "Smoking");
        assert_eq!(results[0].object, "cancer");
        assert_eq!(results[0].assoc_type, AssociationType::Causal);
    }

    #[test]
    fn test_extracts_hierarchical() {
        let results = extract("A sparrow is a bird", 0.5, 10);
        assert!(results
            .iter()
            .any(|r| r.assoc_type == AssociationType::Hierarchical));
    }

    #[test]
    fn test_min_confidence_filters() {
        // The semantic pattern carries 0.6 confidence and is filtered out
        let results = extract("Rust is related to safety", 0.7, 10);
        assert!(results.is_empty());
    }

    #[test]
    fn test_max_cap_applied() {
        let text = "A causes B. C causes D. E causes F. G causes H.";
        let results = extract(text, 0.5, 2);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_no_match_yields_empty() {
        assert!(extract("plain words only", 0.5, 10).is_empty());
    }
}
