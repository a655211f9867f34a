//! Topic names, topic filters and the subscription trie.
//!
//! Topics are `/`-separated levels. Filters may use `+` for exactly one
//! level and a trailing `#` for zero or more levels. Topics that begin with
//! `$` are never matched by a leading wildcard.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,
    #[error("topic contains a NUL character")]
    Nul,
    #[error("topic name must not contain wildcards")]
    WildcardInName,
    #[error("`{0}` must occupy an entire topic level")]
    PartialWildcard(char),
    #[error("`#` must be the last level of a filter")]
    MisplacedMultiLevel,
}

/// Validate a topic name used in PUBLISH.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::Nul);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE and UNSUBSCRIBE.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::Nul);
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err(TopicError::PartialWildcard('#'));
            }
            if idx != last {
                return Err(TopicError::MisplacedMultiLevel);
            }
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::PartialWildcard('+'));
        }
    }
    Ok(())
}

pub fn has_wildcard(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Check if an MQTT topic filter matches a topic.
/// - `+` matches a single level
/// - `#` matches zero or more levels (must be last)
pub fn mqtt_topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Topic Trie
// ---------------------------------------------------------------------------

/// Trie of topic filters; each filter level is one edge.
#[derive(Debug, Clone)]
pub struct TopicTrie<T> {
    values: Vec<T>,
    children: HashMap<String, TopicTrie<T>>,
    single_wildcard: Option<Box<TopicTrie<T>>>,
    multi_wildcard_values: Vec<T>,
}

impl<T> Default for TopicTrie<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            children: HashMap::new(),
            single_wildcard: None,
            multi_wildcard_values: Vec::new(),
        }
    }
}

impl<T> TopicTrie<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filter: &str, value: T) {
        let levels: Vec<&str> = filter.split('/').collect();
        self.insert_levels(&levels, value);
    }

    fn insert_levels(&mut self, levels: &[&str], value: T) {
        let Some((first, rest)) = levels.split_first() else {
            self.values.push(value);
            return;
        };
        match *first {
            "#" => self.multi_wildcard_values.push(value),
            "+" => self
                .single_wildcard
                .get_or_insert_with(Box::default)
                .insert_levels(rest, value),
            level => self
                .children
                .entry(level.to_string())
                .or_default()
                .insert_levels(rest, value),
        }
    }

    /// Remove every value under `filter` accepted by `predicate`; empty
    /// branches are pruned. Returns the number of values removed.
    pub fn remove<F>(&mut self, filter: &str, predicate: F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let levels: Vec<&str> = filter.split('/').collect();
        self.remove_levels(&levels, &predicate)
    }

    fn remove_levels<F>(&mut self, levels: &[&str], predicate: &F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let Some((first, rest)) = levels.split_first() else {
            let before = self.values.len();
            self.values.retain(|v| !predicate(v));
            return before - self.values.len();
        };
        match *first {
            "#" => {
                let before = self.multi_wildcard_values.len();
                self.multi_wildcard_values.retain(|v| !predicate(v));
                before - self.multi_wildcard_values.len()
            }
            "+" => {
                let Some(child) = self.single_wildcard.as_mut() else {
                    return 0;
                };
                let removed = child.remove_levels(rest, predicate);
                if child.is_empty() {
                    self.single_wildcard = None;
                }
                removed
            }
            level => {
                let Some(child) = self.children.get_mut(level) else {
                    return 0;
                };
                let removed = child.remove_levels(rest, predicate);
                if child.is_empty() {
                    self.children.remove(level);
                }
                removed
            }
        }
    }

    /// Every value whose filter matches `topic`.
    pub fn find(&self, topic: &str) -> Vec<&T> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut results = Vec::new();
        let system = topic.starts_with('$');
        self.find_levels(&levels, system, &mut results);
        results
    }

    fn find_levels<'a>(&'a self, levels: &[&str], skip_wildcards: bool, out: &mut Vec<&'a T>) {
        if !skip_wildcards {
            out.extend(self.multi_wildcard_values.iter());
        }
        let Some((first, rest)) = levels.split_first() else {
            out.extend(self.values.iter());
            return;
        };
        if let Some(child) = self.children.get(*first) {
            child.find_levels(rest, false, out);
        }
        if !skip_wildcards {
            if let Some(child) = self.single_wildcard.as_ref() {
                child.find_levels(rest, false, out);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
            + self.multi_wildcard_values.len()
            + self.children.values().map(TopicTrie::len).sum::<usize>()
            + self.single_wildcard.as_ref().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.multi_wildcard_values.is_empty()
            && self.children.is_empty()
            && self.single_wildcard.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matching() {
        assert!(mqtt_topic_matches("owntracks/alice/phone", "owntracks/alice/phone"));
        assert!(!mqtt_topic_matches("owntracks/alice/phone", "owntracks/alice/tablet"));
        assert!(mqtt_topic_matches("owntracks/+/phone", "owntracks/alice/phone"));
        assert!(mqtt_topic_matches("owntracks/alice/#", "owntracks/alice/phone/event"));
        assert!(mqtt_topic_matches("owntracks/alice/#", "owntracks/alice"));
        assert!(!mqtt_topic_matches("owntracks/+", "owntracks/alice/phone"));
        assert!(!mqtt_topic_matches("#", "$SYS/uptime"));
        assert!(mqtt_topic_matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn filter_validation() {
        assert!(validate_topic_filter("a/+/b/#").is_ok());
        assert_eq!(
            validate_topic_filter("a/#/b"),
            Err(TopicError::MisplacedMultiLevel)
        );
        assert_eq!(
            validate_topic_filter("a/b+"),
            Err(TopicError::PartialWildcard('+'))
        );
        assert_eq!(validate_topic_name("a/+"), Err(TopicError::WildcardInName));
        assert_eq!(validate_topic_name(""), Err(TopicError::Empty));
    }

    #[test]
    fn trie_find_and_prune() {
        let mut trie = TopicTrie::<&str>::new();
        trie.insert("owntracks/alice/phone", "exact");
        trie.insert("owntracks/+/phone", "single");
        trie.insert("owntracks/#", "multi");

        assert_eq!(trie.find("owntracks/alice/phone").len(), 3);
        assert_eq!(trie.find("owntracks/bob/phone").len(), 2);
        assert_eq!(trie.find("owntracks/bob/phone/event"), vec![&"multi"]);

        assert_eq!(trie.remove("owntracks/+/phone", |v| *v == "single"), 1);
        assert_eq!(trie.remove("owntracks/+/phone", |v| *v == "single"), 0);
        assert_eq!(trie.len(), 2);
        trie.remove("owntracks/alice/phone", |_| true);
        trie.remove("owntracks/#", |_| true);
        assert!(trie.is_empty());
    }
}
