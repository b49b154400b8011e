//! Canonicalization of section and subject identifiers.
//!
//! Producers (manual entry, timetable import, recognition pipeline) disagree
//! on how classes are named: "Java Programming (AIML-B)", "AIML-B", or a
//! department and section stored separately; subjects arrive as display
//! names, short forms or internal codes. Resolution is total: anything that
//! cannot be placed passes through as its own literal key.

use crate::types::StudentInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Canonical (department, section) pair.
///
/// `department` is `None` when the raw identifier named only a section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionKey {
    pub department: Option<String>,
    pub section: String,
}

impl SectionKey {
    pub fn new(department: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            department: Some(department.into()),
            section: section.into(),
        }
    }

    pub fn section_only(section: impl Into<String>) -> Self {
        Self {
            department: None,
            section: section.into(),
        }
    }

    /// Nothing usable could be extracted from the raw identifier.
    pub fn is_unresolved(&self) -> bool {
        self.department.is_none() && self.section.is_empty()
    }

    /// Stored form: `DEPT-SEC`, or just `SEC` without a department.
    pub fn code(&self) -> String {
        match &self.department {
            Some(dept) => format!("{dept}-{}", self.section),
            None => self.section.clone(),
        }
    }

    /// Whether a fact stored under `other` belongs to this (possibly partial) key.
    ///
    /// A key without a department matches any department with the same section.
    pub fn covers(&self, other: &SectionKey) -> bool {
        if !self.section.eq_ignore_ascii_case(&other.section) {
            return false;
        }
        match (&self.department, &other.department) {
            (None, _) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Canonical subject identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectKey(pub String);

impl SubjectKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which fallback produced a subject key, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// Configured name/alias/code table.
    ExactMap,
    /// Case-insensitive equality with a subject already in the ledger.
    CaseInsensitiveMap,
    /// A known subject contains the input or is contained by it.
    SubstringContainment,
    /// Nothing matched; the input is its own key.
    Literal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: SubjectKey,
    pub strategy: ResolveStrategy,
}

/// One configured subject: display name, internal code and extra aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectMapping {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl SubjectMapping {
    pub fn new(name: &str, code: &str, aliases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            code: code.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Subject table used when no mapping file is configured.
pub fn default_subject_mappings() -> Vec<SubjectMapping> {
    vec![
        SubjectMapping::new("Design and Analysis of Algorithms", "daa122", &["DAA"]),
        SubjectMapping::new("Computer Science", "cs101", &["CS"]),
        SubjectMapping::new("Computer Science Lab", "cs102", &[]),
        SubjectMapping::new("Discrete Math", "dm101", &["DM"]),
    ]
}

/// Normalizes section and subject identifiers to canonical keys.
#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    /// name / alias / code → code
    to_code: HashMap<String, String>,
    /// code → display name
    to_name: HashMap<String, String>,
}

impl EntityResolver {
    pub fn new(mappings: &[SubjectMapping]) -> Self {
        let mut resolver = Self::default();
        for m in mappings {
            resolver.to_code.insert(m.code.clone(), m.code.clone());
            resolver.to_code.insert(m.name.clone(), m.code.clone());
            for alias in &m.aliases {
                resolver.to_code.insert(alias.clone(), m.code.clone());
            }
            resolver.to_name.insert(m.code.clone(), m.name.clone());
        }
        resolver
    }

    /// Resolve a raw class/section string.
    ///
    /// 1. A parenthesized segment, if present, is the effective code.
    /// 2. A hyphenated code splits on its first hyphen into department and section.
    /// 3. Anything else is a bare section.
    pub fn resolve_section(&self, raw: &str) -> SectionKey {
        let code = parenthesized(raw).unwrap_or(raw).trim();

        match code.split_once('-') {
            Some((dept, sec)) => {
                let dept = dept.trim();
                SectionKey {
                    department: (!dept.is_empty()).then(|| dept.to_string()),
                    section: sec.trim().to_string(),
                }
            }
            None => SectionKey::section_only(code),
        }
    }

    /// Resolve a raw subject string against the mapping table and the
    /// subjects already present in the ledger.
    ///
    /// `known` is scanned in iteration order, so callers should pass a
    /// sorted set to keep substring matches reproducible.
    pub fn resolve_subject<'a, I>(&self, raw: &str, known: I) -> Resolution
    where
        I: IntoIterator<Item = &'a SubjectKey>,
        I::IntoIter: Clone,
    {
        let input = raw.trim();

        if let Some(code) = self.to_code.get(input) {
            return Resolution {
                key: SubjectKey::new(code.as_str()),
                strategy: ResolveStrategy::ExactMap,
            };
        }

        let known = known.into_iter();
        if let Some(hit) = known.clone().find(|k| k.0.eq_ignore_ascii_case(input)) {
            return Resolution {
                key: hit.clone(),
                strategy: ResolveStrategy::CaseInsensitiveMap,
            };
        }

        let lowered = input.to_lowercase();
        if !lowered.is_empty() {
            let hit = known.clone().find(|k| {
                let candidate = k.0.to_lowercase();
                !candidate.is_empty()
                    && (lowered.contains(&candidate) || candidate.contains(&lowered))
            });
            if let Some(hit) = hit {
                return Resolution {
                    key: hit.clone(),
                    strategy: ResolveStrategy::SubstringContainment,
                };
            }
        }

        tracing::warn!(subject = input, "unresolved subject; using literal key");
        Resolution {
            key: SubjectKey::new(input),
            strategy: ResolveStrategy::Literal,
        }
    }

    /// Display name for a subject code, falling back to the key itself.
    pub fn display_name<'a>(&'a self, key: &'a SubjectKey) -> &'a str {
        self.to_name.get(key.as_str()).map(String::as_str).unwrap_or(key.as_str())
    }

    /// Person ids of the students belonging to `key`, ordered by id.
    ///
    /// Tries the exact (department, section) pair, then a case-insensitive
    /// department prefix, then students whose stored section is the whole
    /// code (e.g. section "AIML-B"). An empty result means no roster.
    pub fn roster(&self, key: &SectionKey, students: &[StudentInfo]) -> BTreeSet<String> {
        if key.is_unresolved() {
            return BTreeSet::new();
        }

        let Some(dept) = &key.department else {
            return ids_where(students, |s| s.section == key.section);
        };

        let exact = ids_where(students, |s| s.department == *dept && s.section == key.section);
        if !exact.is_empty() {
            return exact;
        }

        let dept_lower = dept.to_lowercase();
        let prefix = ids_where(students, |s| {
            s.section == key.section && s.department.to_lowercase().starts_with(&dept_lower)
        });
        if !prefix.is_empty() {
            return prefix;
        }

        let code = key.code();
        let whole = ids_where(students, |s| s.section == code);
        if whole.is_empty() {
            tracing::debug!(section = %key, "no students found for section");
        }
        whole
    }
}

fn ids_where(students: &[StudentInfo], pred: impl Fn(&StudentInfo) -> bool) -> BTreeSet<String> {
    students
        .iter()
        .filter(|s| pred(s))
        .map(|s| s.person_id.clone())
        .collect()
}

fn parenthesized(raw: &str) -> Option<&str> {
    let open = raw.find('(')?;
    let rest = &raw[open + 1..];
    let close = rest.find(')')?;
    Some(&rest[..close])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: &str, dept: &str, sec: &str) -> StudentInfo {
        StudentInfo {
            person_id: id.into(),
            display_name: id.into(),
            department: dept.into(),
            section: sec.into(),
        }
    }

    fn keys(names: &[&str]) -> BTreeSet<SubjectKey> {
        names.iter().map(|n| SubjectKey::new(*n)).collect()
    }

    #[test]
    fn test_section_from_parenthesized_code() {
        let r = EntityResolver::default();
        assert_eq!(r.resolve_section("Java Programming (AIML-B)"), SectionKey::new("AIML", "B"));
    }

    #[test]
    fn test_section_bare() {
        let r = EntityResolver::default();
        let key = r.resolve_section("B");
        assert_eq!(key, SectionKey::section_only("B"));
        assert_eq!(key.code(), "B");
    }

    #[test]
    fn test_section_hyphen_splits_on_first_and_trims() {
        let r = EntityResolver::default();
        assert_eq!(r.resolve_section(" AIML - B-2 "), SectionKey::new("AIML", "B-2"));
        assert_eq!(r.resolve_section("-B"), SectionKey::section_only("B"));
    }

    #[test]
    fn test_section_is_total() {
        let r = EntityResolver::default();
        for raw in ["", "()", "(", ")", "((-))", "Lab (", "   ", "-", "DS (CSE-A) (ECE-B)"] {
            let a = r.resolve_section(raw);
            let b = r.resolve_section(raw);
            assert_eq!(a, b);
        }
        assert!(r.resolve_section("").is_unresolved());
        assert!(r.resolve_section("Seminar ()").is_unresolved());
        assert_eq!(r.resolve_section("DS (CSE-A) (ECE-B)"), SectionKey::new("CSE", "A"));
    }

    #[test]
    fn test_section_covers() {
        let full = SectionKey::new("AIML", "B");
        assert!(SectionKey::section_only("B").covers(&full));
        assert!(full.covers(&SectionKey::new("aiml", "b")));
        assert!(!full.covers(&SectionKey::new("CSE", "B")));
        assert!(!full.covers(&SectionKey::section_only("B")));
    }

    #[test]
    fn test_subject_exact_map_both_directions() {
        let r = EntityResolver::new(&default_subject_mappings());
        let none = keys(&[]);
        for raw in ["Design and Analysis of Algorithms", "DAA", "daa122"] {
            let res = r.resolve_subject(raw, &none);
            assert_eq!(res.key, SubjectKey::new("daa122"));
            assert_eq!(res.strategy, ResolveStrategy::ExactMap);
        }
        assert_eq!(r.display_name(&SubjectKey::new("cs101")), "Computer Science");
        assert_eq!(r.display_name(&SubjectKey::new("physics")), "physics");
    }

    #[test]
    fn test_subject_case_insensitive_known() {
        let r = EntityResolver::default();
        let known = keys(&["Java", "Java Programming"]);
        let res = r.resolve_subject("java programming", &known);
        assert_eq!(res.key, SubjectKey::new("Java Programming"));
        assert_eq!(res.strategy, ResolveStrategy::CaseInsensitiveMap);
    }

    #[test]
    fn test_subject_substring_first_in_order() {
        let r = EntityResolver::default();
        let known = keys(&["Java", "Programming"]);
        let res = r.resolve_subject("Java Programming Lab", &known);
        assert_eq!(res.key, SubjectKey::new("Java"));
        assert_eq!(res.strategy, ResolveStrategy::SubstringContainment);

        let res = r.resolve_subject("prog", &known);
        assert_eq!(res.key, SubjectKey::new("Programming"));
    }

    #[test]
    fn test_subject_literal_fallback() {
        let r = EntityResolver::new(&default_subject_mappings());
        let res = r.resolve_subject("  Technical Training ", &keys(&["Java"]));
        assert_eq!(res.key, SubjectKey::new("Technical Training"));
        assert_eq!(res.strategy, ResolveStrategy::Literal);
    }

    #[test]
    fn test_subject_map_wins_over_known() {
        let r = EntityResolver::new(&default_subject_mappings());
        let res = r.resolve_subject("CS", &keys(&["CS", "Computer Science Lab"]));
        assert_eq!(res.key, SubjectKey::new("cs101"));
    }

    #[test]
    fn test_roster_exact_then_prefix_then_whole_code() {
        let r = EntityResolver::default();
        let students = vec![
            student("3", "AIML", "B"),
            student("1", "AIML", "B"),
            student("2", "AIML", "A"),
            student("4", "aiml-ds", "C"),
            student("5", "CSE", "ECE-D"),
        ];
        let exact = r.roster(&SectionKey::new("AIML", "B"), &students);
        assert_eq!(exact.into_iter().collect::<Vec<_>>(), vec!["1", "3"]);

        let prefix = r.roster(&SectionKey::new("AIML", "C"), &students);
        assert_eq!(prefix.into_iter().collect::<Vec<_>>(), vec!["4"]);

        let whole = r.roster(&SectionKey::new("ECE", "D"), &students);
        assert_eq!(whole.into_iter().collect::<Vec<_>>(), vec!["5"]);

        let bare = r.roster(&SectionKey::section_only("A"), &students);
        assert_eq!(bare.into_iter().collect::<Vec<_>>(), vec!["2"]);

        assert!(r.roster(&SectionKey::new("MECH", "Z"), &students).is_empty());
        assert!(r.roster(&r.resolve_section(""), &students).is_empty());
    }
}
