//! Cohort resolution
//!
//! Turns either a cohort expression (`1&2~3`) or a cohort tag name into the
//! deduplicated set of subject ids it denotes.
//!
//! Expression grammar:
//!
//! ```text
//! expr  := group ('~' group)*
//! group := id ('&' id)*
//! ```
//!
//! `~` unions groups, `&` intersects the cohorts inside one group.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Numeric cohort identifier in the cohort catalog
pub type CohortId = i64;

/// Opaque subject identifier, kept as a string for uniform hashing
pub type SubjectId = String;

const COHORT_OP_AND: char = '&';
const COHORT_OP_OR: char = '~';

static COHORT_EXPRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+[&~])*[0-9]+$").expect("cohort expression pattern compiles")
});

/// Returns true when `input` matches the cohort expression grammar
pub fn is_cohort_expression(input: &str) -> bool {
    COHORT_EXPRESSION.is_match(input)
}

/// Parsed cohort expression: a union of intersection groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortExpression {
    groups: Vec<Vec<CohortId>>,
}

impl CohortExpression {
    /// Validate `input` against the grammar and split it into groups
    pub fn parse(input: &str) -> Result<Self> {
        if !is_cohort_expression(input) {
            return Err(Error::InvalidExpression(input.to_string()));
        }

        let groups = input
            .split(COHORT_OP_OR)
            .map(|group| {
                group
                    .split(COHORT_OP_AND)
                    .map(|id| {
                        id.parse::<CohortId>()
                            .map_err(|_| Error::InvalidExpression(input.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { groups })
    }

    /// `~`-separated groups, each a list of `&`-joined cohort ids
    pub fn groups(&self) -> &[Vec<CohortId>] {
        &self.groups
    }

    /// Every cohort id referenced by the expression, in order of appearance
    pub fn cohort_ids(&self) -> impl Iterator<Item = CohortId> + '_ {
        self.groups.iter().flatten().copied()
    }
}

impl FromStr for CohortExpression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CohortExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", COHORT_OP_OR)?;
            }
            for (j, id) in group.iter().enumerate() {
                if j > 0 {
                    write!(f, "{}", COHORT_OP_AND)?;
                }
                write!(f, "{}", id)?;
            }
        }
        Ok(())
    }
}

/// Deduplicated set of subject ids; ordering carries no meaning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectIdSet(BTreeSet<SubjectId>);

impl SubjectIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn insert(&mut self, id: SubjectId) -> bool {
        self.0.insert(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubjectId> {
        self.0.iter()
    }

    /// Consume the set into a list sorted by id
    pub fn into_vec(self) -> Vec<SubjectId> {
        self.0.into_iter().collect()
    }
}

impl FromIterator<SubjectId> for SubjectIdSet {
    fn from_iter<I: IntoIterator<Item = SubjectId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<SubjectId> for SubjectIdSet {
    fn extend<I: IntoIterator<Item = SubjectId>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

impl IntoIterator for SubjectIdSet {
    type Item = SubjectId;
    type IntoIter = std::collections::btree_set::IntoIter<SubjectId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Cohort catalog collaborator
///
/// Maps tag names to cohort ids and cohort ids to their member subjects.
#[async_trait]
pub trait MemberLookup: Send + Sync {
    /// Look up the numeric id of a cohort tag, `None` when the tag is unknown
    async fn resolve_tag(&self, name: &str) -> Result<Option<CohortId>>;

    /// All subjects currently in the cohort
    async fn members_of(&self, id: CohortId) -> Result<Vec<SubjectId>>;

    /// When the cohort membership was last refreshed, if recorded
    async fn refreshed_at(&self, _id: CohortId) -> Result<Option<NaiveDateTime>> {
        Ok(None)
    }
}

#[async_trait]
impl<T: MemberLookup + ?Sized> MemberLookup for Arc<T> {
    async fn resolve_tag(&self, name: &str) -> Result<Option<CohortId>> {
        (**self).resolve_tag(name).await
    }

    async fn members_of(&self, id: CohortId) -> Result<Vec<SubjectId>> {
        (**self).members_of(id).await
    }

    async fn refreshed_at(&self, id: CohortId) -> Result<Option<NaiveDateTime>> {
        (**self).refreshed_at(id).await
    }
}

/// Where a resolved subject set came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CohortSource {
    Expression(CohortExpression),
    Tag { name: String, id: CohortId },
}

/// Outcome of a resolution together with its source
#[derive(Debug, Clone)]
pub struct Resolution {
    pub source: CohortSource,
    pub subjects: SubjectIdSet,
}

/// Resolves cohort expressions and tag names through a [`MemberLookup`]
pub struct CohortResolver<L> {
    lookup: L,
}

impl<L: MemberLookup> CohortResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    pub fn lookup(&self) -> &L {
        &self.lookup
    }

    /// Resolve an expression or, when the input is not an expression, a tag name
    pub async fn resolve(&self, expression_or_tag: &str) -> Result<SubjectIdSet> {
        Ok(self.resolve_with_source(expression_or_tag).await?.subjects)
    }

    /// Like [`resolve`](Self::resolve) but also reports which path was taken
    pub async fn resolve_with_source(&self, expression_or_tag: &str) -> Result<Resolution> {
        if is_cohort_expression(expression_or_tag) {
            info!("Processing cohort by expression: {}", expression_or_tag);
            let expression = CohortExpression::parse(expression_or_tag)?;
            let subjects = self.evaluate(&expression).await?;
            return Ok(Resolution {
                source: CohortSource::Expression(expression),
                subjects,
            });
        }

        info!("Processing cohort by tag name: {}", expression_or_tag);
        let name = expression_or_tag.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("empty cohort tag name".to_string()));
        }

        let id = self
            .lookup
            .resolve_tag(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cohort tag '{}'", name)))?;

        let subjects = self.lookup.members_of(id).await?.into_iter().collect();
        Ok(Resolution {
            source: CohortSource::Tag {
                name: name.to_string(),
                id,
            },
            subjects,
        })
    }

    /// Evaluate a parsed expression: union over groups of per-group intersections
    pub async fn evaluate(&self, expression: &CohortExpression) -> Result<SubjectIdSet> {
        let mut subjects = SubjectIdSet::new();
        for group in expression.groups() {
            subjects.extend(self.intersect_group(group).await?);
        }
        debug!(
            "Cohort expression {} resolved to {} subjects",
            expression,
            subjects.len()
        );
        Ok(subjects)
    }

    /// A single-id group yields the full member set. Larger groups keep a
    /// subject when it appears in more than one of the member sets.
    async fn intersect_group(&self, group: &[CohortId]) -> Result<SubjectIdSet> {
        if let [only] = group {
            return Ok(self.lookup.members_of(*only).await?.into_iter().collect());
        }

        let mut votes: HashMap<SubjectId, usize> = HashMap::new();
        for id in group {
            // Deduplicate per cohort so each cohort votes at most once per subject
            let members: SubjectIdSet = self.lookup.members_of(*id).await?.into_iter().collect();
            for member in members {
                *votes.entry(member).or_insert(0) += 1;
            }
        }

        Ok(votes
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(member, _)| member)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory cohort catalog
    #[derive(Default)]
    struct FakeCatalog {
        tags: HashMap<String, CohortId>,
        members: HashMap<CohortId, Vec<SubjectId>>,
        member_calls: AtomicUsize,
    }

    impl FakeCatalog {
        fn with_cohort(mut self, id: CohortId, members: &[&str]) -> Self {
            self.members
                .insert(id, members.iter().map(|m| m.to_string()).collect());
            self
        }

        fn with_tag(mut self, name: &str, id: CohortId) -> Self {
            self.tags.insert(name.to_string(), id);
            self
        }
    }

    #[async_trait]
    impl MemberLookup for FakeCatalog {
        async fn resolve_tag(&self, name: &str) -> Result<Option<CohortId>> {
            Ok(self.tags.get(name).copied())
        }

        async fn members_of(&self, id: CohortId) -> Result<Vec<SubjectId>> {
            self.member_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.members.get(&id).cloned().unwrap_or_default())
        }
    }

    fn catalog() -> FakeCatalog {
        FakeCatalog::default()
            .with_cohort(1, &["a", "b", "c"])
            .with_cohort(2, &["b", "c", "d"])
            .with_cohort(3, &["e", "a"])
            .with_cohort(4, &["x"])
            .with_tag("pilot", 2)
    }

    fn ids(items: &[&str]) -> SubjectIdSet {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_grammar_accepts_valid_expressions() {
        for expr in ["1", "1&2", "1~2", "1&2~3", "10&20&30~4~5&6"] {
            assert!(is_cohort_expression(expr), "{} should be valid", expr);
        }
    }

    #[test]
    fn test_grammar_rejects_invalid_expressions() {
        for expr in ["", "&1", "1&", "1~~2", "1&&2", "a&b", "1 & 2", "1|2", "~"] {
            assert!(!is_cohort_expression(expr), "{:?} should be invalid", expr);
            assert!(matches!(
                CohortExpression::parse(expr),
                Err(Error::InvalidExpression(_))
            ));
        }
    }

    #[test]
    fn test_parse_groups() {
        let expr = CohortExpression::parse("1&2~3").unwrap();
        assert_eq!(expr.groups(), &[vec![1, 2], vec![3]]);
        assert_eq!(expr.cohort_ids().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(expr.to_string(), "1&2~3");
    }

    #[test]
    fn test_parse_rejects_overflowing_id() {
        let result = CohortExpression::parse("99999999999999999999");
        assert!(matches!(result, Err(Error::InvalidExpression(_))));
    }

    #[tokio::test]
    async fn test_single_cohort_returns_full_member_set() {
        let resolver = CohortResolver::new(catalog());
        let subjects = resolver.resolve("1").await.unwrap();
        assert_eq!(subjects, ids(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_intersection_then_union() {
        let resolver = CohortResolver::new(catalog());
        // (1 ∩ 2) ∪ 3 = {b, c} ∪ {e, a}
        let subjects = resolver.resolve("1&2~3").await.unwrap();
        assert_eq!(subjects, ids(&["a", "b", "c", "e"]));
    }

    #[tokio::test]
    async fn test_three_way_group_uses_vote_count() {
        let resolver = CohortResolver::new(catalog());
        // a: 1,3  b: 1,2  c: 1,2  d: 2  e: 3
        let subjects = resolver.resolve("1&2&3").await.unwrap();
        assert_eq!(subjects, ids(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_duplicate_members_do_not_inflate_votes() {
        let lookup = FakeCatalog::default()
            .with_cohort(1, &["a", "a", "b"])
            .with_cohort(2, &["b"]);
        let resolver = CohortResolver::new(lookup);
        let subjects = resolver.resolve("1&2").await.unwrap();
        assert_eq!(subjects, ids(&["b"]));
    }

    #[tokio::test]
    async fn test_disjoint_intersection_is_empty() {
        let resolver = CohortResolver::new(catalog());
        let subjects = resolver.resolve("1&4").await.unwrap();
        assert!(subjects.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let resolver = CohortResolver::new(catalog());
        let first = resolver.resolve("1&2~3~4").await.unwrap();
        let second = resolver.resolve("1&2~3~4").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_result_only_contains_referenced_members() {
        let resolver = CohortResolver::new(catalog());
        let subjects = resolver.resolve("1~2").await.unwrap();
        assert!(!subjects.contains("x"));
        assert!(!subjects.contains("e"));
    }

    #[tokio::test]
    async fn test_tag_name_resolves_through_catalog() {
        let resolver = CohortResolver::new(catalog());
        let resolution = resolver.resolve_with_source("pilot").await.unwrap();
        assert_eq!(
            resolution.source,
            CohortSource::Tag {
                name: "pilot".to_string(),
                id: 2
            }
        );
        assert_eq!(resolution.subjects, ids(&["b", "c", "d"]));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_not_found() {
        let resolver = CohortResolver::new(catalog());
        let result = resolver.resolve("no-such-cohort").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_tag_is_invalid_input() {
        let resolver = CohortResolver::new(catalog());
        let result = resolver.resolve("  ").await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_each_cohort_queried_once_per_group() {
        let resolver = CohortResolver::new(catalog());
        resolver.resolve("1&2&3").await.unwrap();
        assert_eq!(resolver.lookup().member_calls.load(Ordering::SeqCst), 3);
    }
}
