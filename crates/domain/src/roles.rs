//! Role selectors: sets of tokens matched against an entity's role
//! attributes.
//!
//! Token forms:
//! - `@<id>` — a literal entity id
//! - `#<role>` — a role attribute name
//! - `all` — matches every entity
//!
//! A selector also carries a semantic: `all-of` requires the entity to hold
//! every referenced role; `any-of` requires at least one.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Selector semantic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Semantic {
    #[default]
    AllOf,
    AnyOf,
}

/// A role selector split into its constituent parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet {
    /// Role names referenced with `#` (stored without the prefix).
    pub roles: Vec<String>,
    /// Entity ids referenced with `@` (stored without the prefix).
    pub ids: Vec<String>,
    /// The selector contained the universal `all` token.
    pub all: bool,
}

/// Split a raw selector token list into roles, ids, and the `all` marker.
pub fn split_roles_and_ids(tokens: &[String]) -> Result<RoleSet> {
    let mut result = RoleSet::default();
    for token in tokens {
        if token == "all" {
            result.all = true;
        } else if let Some(role) = token.strip_prefix('#') {
            result.roles.push(role.to_string());
        } else if let Some(id) = token.strip_prefix('@') {
            result.ids.push(id.to_string());
        } else {
            return Err(Error::FieldError {
                field: "roles".into(),
                reason: format!("invalid role token {token:?}, expected @id, #role or all"),
            });
        }
    }
    Ok(result)
}

/// Role attributes on entities are bare names; the `#`/`@` prefixes are
/// reserved for selectors.
pub fn validate_role_attributes(attributes: &[String]) -> Result<()> {
    for attr in attributes {
        if attr.starts_with('#') || attr.starts_with('@') {
            return Err(Error::FieldError {
                field: "roleAttributes".into(),
                reason: format!("role attributes may not be prefixed with # or @: {attr:?}"),
            });
        }
    }
    Ok(())
}

/// The policy match predicate: does the entity with `entity_id` and
/// `attributes` fall inside the selector?
pub fn matches(set: &RoleSet, semantic: Semantic, entity_id: &str, attributes: &[String]) -> bool {
    if set.ids.iter().any(|id| id == entity_id) {
        return true;
    }
    if set.all {
        return true;
    }
    if set.roles.is_empty() {
        return false;
    }
    match semantic {
        Semantic::AllOf => set
            .roles
            .iter()
            .all(|role| attributes.iter().any(|a| a == role)),
        Semantic::AnyOf => set
            .roles
            .iter()
            .any(|role| attributes.iter().any(|a| a == role)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn split_classifies_tokens() {
        let set = split_roles_and_ids(&attrs(&["#db", "@svc1", "all", "#web"])).unwrap();
        assert_eq!(set.roles, vec!["db", "web"]);
        assert_eq!(set.ids, vec!["svc1"]);
        assert!(set.all);
    }

    #[test]
    fn split_rejects_bare_tokens() {
        assert!(split_roles_and_ids(&attrs(&["db"])).is_err());
    }

    #[test]
    fn attribute_prefixes_rejected() {
        assert!(validate_role_attributes(&attrs(&["#db"])).is_err());
        assert!(validate_role_attributes(&attrs(&["@x"])).is_err());
        assert!(validate_role_attributes(&attrs(&["db", "web"])).is_ok());
    }

    #[test]
    fn id_literal_always_matches() {
        let set = split_roles_and_ids(&attrs(&["@e1"])).unwrap();
        assert!(matches(&set, Semantic::AllOf, "e1", &[]));
        assert!(!matches(&set, Semantic::AllOf, "e2", &[]));
    }

    #[test]
    fn all_token_matches_everything() {
        let set = split_roles_and_ids(&attrs(&["all"])).unwrap();
        assert!(matches(&set, Semantic::AnyOf, "anything", &[]));
    }

    #[test]
    fn all_of_requires_superset() {
        let set = split_roles_and_ids(&attrs(&["#a", "#b"])).unwrap();
        assert!(matches(&set, Semantic::AllOf, "e", &attrs(&["a", "b", "c"])));
        assert!(!matches(&set, Semantic::AllOf, "e", &attrs(&["a"])));
    }

    #[test]
    fn any_of_requires_intersection() {
        let set = split_roles_and_ids(&attrs(&["#a", "#b"])).unwrap();
        assert!(matches(&set, Semantic::AnyOf, "e", &attrs(&["b"])));
        assert!(!matches(&set, Semantic::AnyOf, "e", &attrs(&["c"])));
    }

    #[test]
    fn empty_roles_never_match_by_attribute() {
        let set = split_roles_and_ids(&attrs(&[])).unwrap();
        assert!(!matches(&set, Semantic::AllOf, "e", &attrs(&["a"])));
        assert!(!matches(&set, Semantic::AnyOf, "e", &attrs(&["a"])));
    }
}
