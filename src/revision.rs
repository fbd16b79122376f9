//! Property inheritance across post revisions.
//!
//! A revision only carries the properties that changed since the state implied by the
//! revisions before it. The value of a property "as of" a revision is therefore the value in
//! the newest revision, at or before it, that defines the property. A gap never means the
//! value was cleared: clearing the tag list is written as an explicit empty list.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::models::Rating;

/// Resolved values of a post's tracked properties. `None` means no revision defines it yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostState {
    pub tags: Option<BTreeSet<String>>,
    pub rating: Option<Rating>,
    pub source: Option<String>,
}

/// The properties a single revision defines explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevisionChanges {
    /// `Some(empty)` is the explicit "tags cleared" marker.
    pub tags: Option<BTreeSet<String>>,
    pub rating: Option<Rating>,
    pub source: Option<String>,
}

/// First explicit value, walking revisions newest first.
pub fn resolve<'a, T: 'a>(newest_first: impl IntoIterator<Item = Option<&'a T>>) -> Option<&'a T> {
    newest_first.into_iter().flatten().next()
}

impl PostState {
    /// Fold a post's revisions (newest first) into the state they imply.
    pub fn from_revisions<'a>(newest_first: impl IntoIterator<Item = &'a RevisionChanges> + Clone) -> Self {
        let revs = newest_first;
        PostState {
            tags: resolve(revs.clone().into_iter().map(|r| r.tags.as_ref())).cloned(),
            rating: resolve(revs.clone().into_iter().map(|r| r.rating.as_ref())).copied(),
            source: resolve(revs.into_iter().map(|r| r.source.as_ref())).cloned(),
        }
    }
}

impl RevisionChanges {
    /// Properties of `observed` that differ from `current`. Properties the observation does
    /// not define are left out and stay inherited.
    pub fn between(current: &PostState, observed: &PostState) -> Self {
        fn changed<T: Clone + PartialEq>(current: &Option<T>, observed: &Option<T>) -> Option<T> {
            match observed {
                Some(v) if current.as_ref() != Some(v) => Some(v.clone()),
                _ => None,
            }
        }
        RevisionChanges {
            tags: changed(&current.tags, &observed.tags),
            rating: changed(&current.rating, &observed.rating),
            source: changed(&current.source, &observed.source),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.rating.is_none() && self.source.is_none()
    }

    /// Names of the changed properties, for logging.
    pub fn changed_properties(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.tags.is_some() { out.push("tags"); }
        if self.rating.is_some() { out.push("rating"); }
        if self.source.is_some() { out.push("source"); }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unchanged_tags_are_inherited() {
        let t1 = RevisionChanges { tags: Some(tags(&["a", "b"])), rating: Some(Rating::General), ..Default::default() };
        let t2 = RevisionChanges::default();
        let state = PostState::from_revisions([&t2, &t1]);
        assert_eq!(state.tags, Some(tags(&["a", "b"])));
        assert_eq!(state.rating, Some(Rating::General));
        assert_eq!(state.source, None);
    }

    #[test]
    fn explicit_empty_list_clears() {
        let t1 = RevisionChanges { tags: Some(tags(&["a"])), ..Default::default() };
        let t2 = RevisionChanges { tags: Some(BTreeSet::new()), ..Default::default() };
        let t3 = RevisionChanges::default();
        let state = PostState::from_revisions([&t3, &t2, &t1]);
        assert_eq!(state.tags, Some(BTreeSet::new()));
    }

    #[test]
    fn only_differences_are_written() {
        let current = PostState { tags: Some(tags(&["a", "b"])), rating: Some(Rating::Sensitive), source: Some("x".into()) };
        let observed = PostState { tags: Some(tags(&["b", "a"])), rating: Some(Rating::Explicit), source: Some("x".into()) };
        let changes = RevisionChanges::between(&current, &observed);
        assert_eq!(changes, RevisionChanges { rating: Some(Rating::Explicit), ..Default::default() });
        assert_eq!(changes.changed_properties(), vec!["rating"]);

        assert!(RevisionChanges::between(&current, &current).is_empty());
    }

    #[test]
    fn first_observation_defines_everything() {
        let observed = PostState { tags: Some(BTreeSet::new()), rating: None, source: Some(String::new()) };
        let changes = RevisionChanges::between(&PostState::default(), &observed);
        // an empty first tag list is still written so later lookups see an explicit value
        assert_eq!(changes.tags, Some(BTreeSet::new()));
        assert_eq!(changes.rating, None);
        assert_eq!(changes.source, Some(String::new()));
    }

    #[test]
    fn observation_without_a_property_keeps_it() {
        let current = PostState { rating: Some(Rating::Questionable), ..Default::default() };
        let observed = PostState { tags: Some(tags(&["a"])), ..Default::default() };
        let changes = RevisionChanges::between(&current, &observed);
        assert_eq!(changes.rating, None);
        assert_eq!(changes.tags, Some(tags(&["a"])));
    }
}
