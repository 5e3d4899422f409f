//! Collection keys.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::entity::{Record, scalar_to_string};
use crate::error::ValidationError;

/// Equality filter on record fields.
pub type Filter = BTreeMap<String, String>;

/// Collection name plus optional scope parameters.
///
/// Identifies exactly one cache entry. The scope doubles as the equality
/// filter sent with fetches and change-feed subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionKey {
    collection: String,
    scope: Filter,
}

impl CollectionKey {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            scope: Filter::new(),
        }
    }

    /// Key for `collection` narrowed by a whole filter.
    pub fn with_scope(collection: impl Into<String>, scope: Filter) -> Self {
        Self {
            collection: collection.into(),
            scope,
        }
    }

    /// Narrow the key to records whose `field` equals `value`.
    pub fn scoped(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.scope.insert(field.into(), value.into());
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn scope(&self) -> &Filter {
        &self.scope
    }

    /// Whether a record belongs under this key.
    pub fn matches(&self, record: &Record) -> bool {
        filter_matches(&self.scope, record)
    }
}

/// Whether `record` satisfies every equality in `filter`.
pub(crate) fn filter_matches(filter: &Filter, record: &Record) -> bool {
    filter.iter().all(|(field, expected)| {
        record
            .get(field)
            .and_then(scalar_to_string)
            .is_some_and(|actual| &actual == expected)
    })
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.collection)?;
        for (i, (field, value)) in self.scope.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, field, value)?;
        }
        Ok(())
    }
}

impl FromStr for CollectionKey {
    type Err = ValidationError;

    /// Parse `collection` or `collection?field=value&field=value`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collection, query) = match s.split_once('?') {
            Some((c, q)) => (c, Some(q)),
            None => (s, None),
        };

        if collection.is_empty() {
            return Err(ValidationError::Invalid("collection name is empty".to_string()));
        }

        let mut key = CollectionKey::new(collection);
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (field, value) = pair.split_once('=').ok_or_else(|| {
                ValidationError::Invalid(format!("invalid scope parameter '{}'", pair))
            })?;
            key = key.scoped(field, value);
        }
        Ok(key)
    }
}
