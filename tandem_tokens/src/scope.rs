use std::collections::btree_set;
use std::collections::BTreeSet;

use aliri_braid::braid;
use serde::{Deserialize, Serialize};

/// An OAuth2 scope
#[braid(serde)]
pub struct Scope;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum ScopesDto {
    String(String),
    Array(Vec<Scope>),
}

impl From<Option<ScopesDto>> for Scopes {
    fn from(dto: Option<ScopesDto>) -> Self {
        let scopes = match dto {
            Some(ScopesDto::String(s)) => s.split_whitespace().map(Scope::from).collect(),
            Some(ScopesDto::Array(arr)) => arr.into_iter().collect(),
            None => BTreeSet::new(),
        };

        Self(scopes)
    }
}

impl From<Scopes> for Vec<Scope> {
    fn from(s: Scopes) -> Self {
        s.0.into_iter().collect()
    }
}

/// An ordered set of scopes
///
/// Iteration is always in sorted order, so two sets holding the same scopes
/// render identically. Deserializes from either a space-delimited string or
/// an array; serializes as an array.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(from = "Option<ScopesDto>", into = "Vec<Scope>")]
pub struct Scopes(BTreeSet<Scope>);

impl Scopes {
    /// Produces an empty scope set
    #[inline]
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Produces a scope set from a space-delimited string
    pub fn from_space_delimited(s: &str) -> Self {
        s.split_whitespace().map(Scope::from).collect()
    }

    /// Adds a scope to the scope set
    #[inline]
    pub fn insert(&mut self, scope: Scope) {
        self.0.insert(scope);
    }

    /// Whether the set holds no scopes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of scopes in the set
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Produces an iterator of the scopes in this set, in sorted order
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ScopeRef> {
        self.into_iter()
    }

    /// Checks to see whether this set of scopes contains all of
    /// the scopes required.
    #[inline]
    pub fn contains_all<I, T>(&self, required_scopes: I) -> bool
    where
        I: IntoIterator<Item = T>,
        T: AsRef<ScopeRef>,
    {
        required_scopes
            .into_iter()
            .all(|v| self.0.contains(v.as_ref()))
    }

    /// Whether every scope in `other` is also in this set
    #[inline]
    pub fn is_superset(&self, other: &Scopes) -> bool {
        self.0.is_superset(&other.0)
    }

    /// The scopes joined by single spaces, in sorted order
    pub fn to_space_delimited(&self) -> String {
        self.iter().map(ScopeRef::as_str).collect::<Vec<_>>().join(" ")
    }
}

impl IntoIterator for Scopes {
    type Item = Scope;
    type IntoIter = btree_set::IntoIter<Scope>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// An iterator over a set of borrowed scopes
#[derive(Clone, Debug)]
pub struct Iter<'a> {
    iter: btree_set::Iter<'a, Scope>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a ScopeRef;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|x| x.as_ref())
    }
}

impl<'a> IntoIterator for &'a Scopes {
    type Item = &'a ScopeRef;
    type IntoIter = Iter<'a>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        Self::IntoIter {
            iter: self.0.iter(),
        }
    }
}

impl Extend<Scope> for Scopes {
    #[inline]
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = Scope>,
    {
        self.0.extend(iter)
    }
}

impl FromIterator<Scope> for Scopes {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for Scopes {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        iter.into_iter().map(Scope::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_render_in_sorted_order() {
        let scopes: Scopes = ["profile", "openid", "email"].into_iter().collect();
        assert_eq!(scopes.to_space_delimited(), "email openid profile");
    }

    #[test]
    fn scopes_deserialize_from_string_or_array() {
        let from_string: Scopes = serde_json::from_str(r#""b a""#).unwrap();
        let from_array: Scopes = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(from_string, from_array);
    }

    #[test]
    fn scopes_serialize_as_sorted_array() {
        let scopes = Scopes::from_space_delimited("write read");
        assert_eq!(serde_json::to_string(&scopes).unwrap(), r#"["read","write"]"#);
    }

    #[test]
    fn superset_check() {
        let granted = Scopes::from_space_delimited("openid read write");
        assert!(granted.is_superset(&Scopes::from_space_delimited("read")));
        assert!(!granted.is_superset(&Scopes::from_space_delimited("admin")));
        assert!(granted.contains_all(["read", "write"].map(Scope::from_static)));
    }
}
