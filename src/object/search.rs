//! Search filters evaluated by metabase `select`

use serde::{Deserialize, Serialize};

use super::header::{Header, ObjectType};
use super::id::{ObjectId, OwnerId, SplitId};

/// How a filter compares the header value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    StringEqual,
    StringNotEqual,
    NotPresent,
    CommonPrefix,
}

/// Header property a filter applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKey {
    ObjectType,
    Owner,
    SplitId,
    FirstId,
    Parent,
    PayloadHash,
    /// Only user-visible (non-split-part) objects
    Root,
    /// Only physically stored objects
    Phy,
    Attribute(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub key: FilterKey,
    pub match_type: MatchType,
    pub value: String,
}

impl SearchFilter {
    /// Header value the filter looks at, `None` if absent
    fn header_value(&self, header: &Header, physical: bool) -> Option<String> {
        match &self.key {
            FilterKey::ObjectType => Some(header.object_type.name().to_string()),
            FilterKey::Owner => Some(header.owner.to_string()),
            FilterKey::SplitId => header.split_id().map(|s| s.to_string()),
            FilterKey::FirstId => header.first_id().map(|s| s.to_string()),
            FilterKey::Parent => header.parent_id().map(|s| s.to_string()),
            FilterKey::PayloadHash => Some(header.payload_hash.to_string()),
            FilterKey::Root => header.is_root().then(String::new),
            FilterKey::Phy => physical.then(String::new),
            FilterKey::Attribute(key) => header.attribute(key).map(str::to_string),
        }
    }

    pub fn matches(&self, header: &Header, physical: bool) -> bool {
        let value = self.header_value(header, physical);
        match (self.match_type, value) {
            (MatchType::NotPresent, v) => v.is_none(),
            (_, None) => false,
            // marker keys match on presence
            (_, Some(_)) if matches!(self.key, FilterKey::Root | FilterKey::Phy) => true,
            (MatchType::StringEqual, Some(v)) => v == self.value,
            (MatchType::StringNotEqual, Some(v)) => v != self.value,
            (MatchType::CommonPrefix, Some(v)) => v.starts_with(&self.value),
        }
    }
}

/// Conjunction of filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters(Vec<SearchFilter>);

impl SearchFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: FilterKey, match_type: MatchType, value: impl Into<String>) {
        self.0.push(SearchFilter {
            key,
            match_type,
            value: value.into(),
        });
    }

    pub fn add_type_filter(&mut self, match_type: MatchType, object_type: ObjectType) {
        self.add(FilterKey::ObjectType, match_type, object_type.name());
    }

    pub fn add_owner_filter(&mut self, match_type: MatchType, owner: &OwnerId) {
        self.add(FilterKey::Owner, match_type, owner.to_string());
    }

    pub fn add_split_id_filter(&mut self, match_type: MatchType, split_id: &SplitId) {
        self.add(FilterKey::SplitId, match_type, split_id.to_string());
    }

    pub fn add_first_split_object_filter(&mut self, match_type: MatchType, first: &ObjectId) {
        self.add(FilterKey::FirstId, match_type, first.to_string());
    }

    pub fn add_parent_filter(&mut self, match_type: MatchType, parent: &ObjectId) {
        self.add(FilterKey::Parent, match_type, parent.to_string());
    }

    pub fn add_attribute_filter(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        match_type: MatchType,
    ) {
        self.add(FilterKey::Attribute(key.into()), match_type, value);
    }

    pub fn add_root_filter(&mut self) {
        self.add(FilterKey::Root, MatchType::StringEqual, "");
    }

    pub fn add_phy_filter(&mut self) {
        self.add(FilterKey::Phy, MatchType::StringEqual, "");
    }

    pub fn iter(&self) -> impl Iterator<Item = &SearchFilter> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, header: &Header, physical: bool) -> bool {
        self.0.iter().all(|f| f.matches(header, physical))
    }
}
