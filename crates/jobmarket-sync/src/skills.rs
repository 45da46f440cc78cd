use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use jobmarket_core::SkillToken;

use crate::rules::SkillRulesFile;

#[derive(Debug, Clone)]
struct VocabularyTerm {
    /// Lower-case surface form (the name itself or an alias).
    needle: String,
    canonical: String,
    category: String,
}

impl VocabularyTerm {
    fn is_alias(&self) -> bool {
        self.needle != self.canonical
    }
}

/// Derives skill tokens from the skills text, title and description of a listing.
#[derive(Debug, Clone)]
pub struct SkillExtractor {
    /// Longest needle first, so "power bi" claims its span before "bi" could.
    terms: Vec<VocabularyTerm>,
    exact: HashMap<String, usize>,
    stopwords: HashSet<String>,
}

impl SkillExtractor {
    pub fn new(rules: &SkillRulesFile) -> Self {
        let mut terms = Vec::new();
        for rule in &rules.skills {
            let canonical = fold(&rule.name);
            if canonical.is_empty() {
                continue;
            }
            for surface in std::iter::once(&rule.name).chain(rule.aliases.iter()) {
                let needle = fold(surface);
                if !needle.is_empty() {
                    terms.push(VocabularyTerm {
                        needle,
                        canonical: canonical.clone(),
                        category: rule.category.clone(),
                    });
                }
            }
        }
        // A needle shared by several rules goes to the rule it names, then to
        // the lowest canonical name, whatever order the file lists them in.
        terms.sort_by(|a, b| {
            b.needle
                .len()
                .cmp(&a.needle.len())
                .then_with(|| a.needle.cmp(&b.needle))
                .then_with(|| a.is_alias().cmp(&b.is_alias()))
                .then_with(|| a.canonical.cmp(&b.canonical))
                .then_with(|| a.category.cmp(&b.category))
        });
        terms.dedup_by(|later, kept| later.needle == kept.needle);

        let exact = terms
            .iter()
            .enumerate()
            .map(|(i, term)| (term.needle.clone(), i))
            .collect();
        let stopwords = rules.title_stopwords.iter().map(|w| fold(w)).collect();

        Self {
            terms,
            exact,
            stopwords,
        }
    }

    /// Vocabulary matches from both texts plus free-form tokens: skill tags
    /// with no vocabulary match, and title words outside matched spans that
    /// are not stopwords. Sorted by name; the vocabulary entry wins a tie.
    pub fn extract(&self, skills_text: Option<&str>, title: Option<&str>) -> Vec<SkillToken> {
        self.extract_with_description(skills_text, title, None)
    }

    /// As [`Self::extract`], plus vocabulary skills named in the description.
    /// Free text never yields overflow tokens.
    pub fn extract_with_description(
        &self,
        skills_text: Option<&str>,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Vec<SkillToken> {
        let mut found: BTreeMap<String, Option<String>> = BTreeMap::new();

        if let Some(text) = skills_text {
            for tag in text.split([',', '|', '•', ';', '\n']) {
                let tag = fold(tag.trim_matches(|c: char| !c.is_alphanumeric() && c != '+' && c != '#'));
                if tag.is_empty() {
                    continue;
                }
                if let Some(&i) = self.exact.get(&tag) {
                    self.record(&mut found, &self.terms[i]);
                    continue;
                }
                let (matches, _) = self.vocabulary_matches(&tag);
                if matches.is_empty() {
                    found.entry(tag).or_insert(None);
                } else {
                    for term in matches {
                        self.record(&mut found, term);
                    }
                }
            }
        }

        if let Some(title) = title {
            let folded = fold(title);
            let (matches, claimed) = self.vocabulary_matches(&folded);
            for term in matches {
                self.record(&mut found, term);
            }
            for (range, word) in words(&folded) {
                let overlaps = claimed.iter().any(|c| c.start < range.end && range.start < c.end);
                if overlaps
                    || word.len() < 2
                    || word.chars().all(|c| c.is_ascii_digit())
                    || self.stopwords.contains(word)
                {
                    continue;
                }
                found.entry(word.to_string()).or_insert(None);
            }
        }

        if let Some(description) = description {
            for term in self.vocabulary_matches(&fold(description)).0 {
                self.record(&mut found, term);
            }
        }

        found
            .into_iter()
            .map(|(name, category)| SkillToken { name, category })
            .collect()
    }

    fn record(&self, found: &mut BTreeMap<String, Option<String>>, term: &VocabularyTerm) {
        found.insert(term.canonical.clone(), Some(term.category.clone()));
    }

    /// Terms found in `text` at token boundaries, and the byte spans they claimed.
    fn vocabulary_matches(&self, text: &str) -> (Vec<&VocabularyTerm>, Vec<Range<usize>>) {
        let mut matched = Vec::new();
        let mut claimed: Vec<Range<usize>> = Vec::new();
        for term in &self.terms {
            let mut hit = false;
            for range in bounded_occurrences(text, &term.needle) {
                if claimed.iter().any(|c| c.start < range.end && range.start < c.end) {
                    continue;
                }
                claimed.push(range);
                hit = true;
            }
            if hit {
                matched.push(term);
            }
        }
        (matched, claimed)
    }
}

fn fold(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn bounded_occurrences(haystack: &str, needle: &str) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        if !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric) {
            out.push(start..end);
        }
        from = start + needle.chars().next().map_or(1, char::len_utf8);
    }
    out
}

/// Alphanumeric runs with their byte ranges.
fn words(text: &str) -> Vec<(Range<usize>, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_alphanumeric(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                out.push((s..i, &text[s..i]));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s..text.len(), &text[s..]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{RuleSet, SkillRule};
    use crate::test_support::workspace_rules;

    fn extractor() -> SkillExtractor {
        SkillExtractor::new(&RuleSet::load(&workspace_rules()).expect("load rules").skills)
    }

    fn names(tokens: &[SkillToken]) -> Vec<&str> {
        tokens.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn vocabulary_match_is_case_insensitive_and_bounded() {
        let tokens = extractor().extract(Some("MySQL, PowerBI, GitHub"), None);
        assert_eq!(names(&tokens), vec!["github", "mysql", "power bi"]);
        assert!(tokens.iter().all(|t| t.category.is_some()));
    }

    #[test]
    fn tags_without_vocabulary_become_overflow_tokens() {
        let tokens = extractor().extract(
            Some("Python, SQL, Power BI, Stakeholder  Management"),
            Some("Data Analyst"),
        );
        assert_eq!(
            tokens,
            vec![
                SkillToken::vocabulary("power bi", "Visualization"),
                SkillToken::vocabulary("python", "Programming Language"),
                SkillToken::vocabulary("sql", "Programming Language"),
                SkillToken::overflow("stakeholder management"),
            ]
        );
    }

    #[test]
    fn title_keywords_skip_stopwords_and_matched_spans() {
        let tokens = extractor().extract(None, Some("Senior Business Intelligence Analyst - Supply Chain"));
        assert_eq!(names(&tokens), vec!["business intelligence", "chain", "supply"]);
        assert_eq!(tokens[0].category.as_deref(), Some("Other"));
        assert!(tokens[1].category.is_none());
    }

    #[test]
    fn aliases_resolve_to_canonical_names() {
        let tokens = extractor().extract(Some("Advanced Excel | PySpark • sklearn"), None);
        assert_eq!(names(&tokens), vec!["excel", "scikit-learn", "spark"]);
    }

    #[test]
    fn description_adds_vocabulary_skills_only() {
        let tokens = extractor().extract_with_description(
            Some("SQL"),
            Some("Data Analyst"),
            Some("You will build Tableau dashboards, automate reports in Python and mentor interns."),
        );
        assert_eq!(names(&tokens), vec!["dashboard", "python", "sql", "tableau"]);
        assert!(tokens.iter().all(|t| t.category.is_some()));
        assert_eq!(
            extractor().extract_with_description(Some("SQL"), Some("Data Analyst"), None),
            extractor().extract(Some("SQL"), Some("Data Analyst"))
        );
    }

    #[test]
    fn absent_text_yields_nothing() {
        assert!(extractor().extract(None, None).is_empty());
        assert!(extractor().extract(Some(" , ; "), Some("  ")).is_empty());
    }

    #[test]
    fn output_does_not_depend_on_vocabulary_order() {
        let rules = SkillRulesFile {
            skills: vec![
                SkillRule { name: "sql".into(), category: "Programming Language".into(), aliases: vec![] },
                SkillRule { name: "mysql".into(), category: "Database".into(), aliases: vec![] },
                SkillRule { name: "power bi".into(), category: "Visualization".into(), aliases: vec![] },
            ],
            title_stopwords: vec!["analyst".into()],
        };
        let mut reversed = rules.clone();
        reversed.skills.reverse();

        let text = Some("MySQL and SQL with Power BI");
        let title = Some("SQL Analyst");
        assert_eq!(
            SkillExtractor::new(&rules).extract(text, title),
            SkillExtractor::new(&reversed).extract(text, title)
        );
    }

    #[test]
    fn shared_alias_resolves_the_same_in_any_order() {
        let rules = SkillRulesFile {
            skills: vec![
                SkillRule { name: "power bi".into(), category: "Visualization".into(), aliases: vec!["bi".into()] },
                SkillRule {
                    name: "business intelligence".into(),
                    category: "Other".into(),
                    aliases: vec!["bi".into()],
                },
            ],
            title_stopwords: vec![],
        };
        let mut reversed = rules.clone();
        reversed.skills.reverse();

        let forward = SkillExtractor::new(&rules).extract(Some("BI"), None);
        assert_eq!(forward, SkillExtractor::new(&reversed).extract(Some("BI"), None));
        assert_eq!(forward, vec![SkillToken::vocabulary("business intelligence", "Other")]);
    }

    #[test]
    fn a_skill_name_beats_another_rules_alias() {
        let rules = SkillRulesFile {
            skills: vec![
                SkillRule { name: "spark".into(), category: "ML/AI Tool".into(), aliases: vec!["pyspark".into()] },
                SkillRule { name: "pyspark".into(), category: "Programming Language".into(), aliases: vec![] },
            ],
            title_stopwords: vec![],
        };
        let tokens = SkillExtractor::new(&rules).extract(Some("PySpark"), None);
        assert_eq!(tokens, vec![SkillToken::vocabulary("pyspark", "Programming Language")]);
    }
}
