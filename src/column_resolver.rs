//! Column Resolver - maps arbitrary CSV headers to semantic roles
//!
//! Headers such as "Region", "location" or "Area" all play the same part in a
//! question ("average price by region"). The resolver assigns each role at most
//! one column using a priority-ordered synonym table:
//! 1. Roles are visited in declaration order (location, value, size, category, date, count)
//! 2. For each role, synonyms are tried in priority order
//! 3. An exact header match beats a header that merely contains the synonym
//! 4. A column claimed by an earlier role is never reused
//!
//! Resolution never fails; roles without a match are simply absent.

use crate::error::{InsightError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Location,
    Value,
    Size,
    Category,
    Date,
    Count,
}

impl Role {
    /// Declaration order doubles as resolution priority.
    pub const ALL: [Role; 6] = [
        Role::Location,
        Role::Value,
        Role::Size,
        Role::Category,
        Role::Date,
        Role::Count,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Location => "location",
            Role::Value => "value",
            Role::Size => "size",
            Role::Category => "category",
            Role::Date => "date",
            Role::Count => "count",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = InsightError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .iter()
            .copied()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| InsightError::Config(format!("Unknown role '{}'", s)))
    }
}

/// Lowercase, with spaces and hyphens folded to underscores.
pub fn normalize_header(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Immutable role → synonyms table, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynonymTable {
    entries: BTreeMap<Role, Vec<String>>,
}

impl Default for SynonymTable {
    fn default() -> Self {
        let table: [(Role, &[&str]); 6] = [
            (
                Role::Location,
                &["region", "location", "area", "neighborhood", "neighbourhood", "city", "state", "zip"],
            ),
            (
                Role::Value,
                &["price", "listing_price", "sale_price", "value", "amount", "cost", "revenue", "sales"],
            ),
            (
                Role::Size,
                &["sqft", "square_feet", "sq_ft", "square_footage", "size", "lot_size"],
            ),
            (Role::Category, &["category", "type", "class", "segment", "kind", "group"]),
            (Role::Date, &["date", "year", "month", "time", "built"]),
            (
                Role::Count,
                &["count", "bedrooms", "bathrooms", "rooms", "garage", "fireplace", "quantity", "qty", "num"],
            ),
        ];

        Self {
            entries: table
                .iter()
                .map(|(role, words)| (*role, words.iter().map(|w| w.to_string()).collect()))
                .collect(),
        }
    }
}

impl SynonymTable {
    /// Build a table from explicit entries; roles not listed have no synonyms.
    pub fn new(entries: impl IntoIterator<Item = (Role, Vec<String>)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(role, words)| (role, words.iter().map(|w| normalize_header(w)).collect()))
                .collect(),
        }
    }

    /// Load overrides from a JSON object keyed by role name.
    ///
    /// Roles present in the file replace the built-in synonyms; others keep the defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: HashMap<String, Vec<String>> = serde_json::from_str(content)?;
        let mut table = Self::default();
        for (key, words) in raw {
            let role = key.parse::<Role>()?;
            if words.iter().any(|w| w.trim().is_empty()) {
                return Err(InsightError::Config(format!("Empty synonym for role '{}'", role)));
            }
            table
                .entries
                .insert(role, words.iter().map(|w| normalize_header(w)).collect());
        }
        Ok(table)
    }

    pub fn synonyms(&self, role: Role) -> &[String] {
        self.entries.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Role → column name for one dataset. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRoleMap {
    roles: BTreeMap<Role, String>,
}

impl ColumnRoleMap {
    pub fn get(&self, role: Role) -> Option<&str> {
        self.roles.get(&role).map(String::as_str)
    }

    pub fn role_of(&self, column: &str) -> Option<Role> {
        self.roles
            .iter()
            .find(|(_, c)| c.as_str() == column)
            .map(|(r, _)| *r)
    }

    pub fn roles(&self) -> impl Iterator<Item = (Role, &str)> {
        self.roles.iter().map(|(r, c)| (*r, c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl fmt::Display for ColumnRoleMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.roles.is_empty() {
            return f.write_str("(no roles resolved)");
        }
        let lines: Vec<String> = self
            .roles
            .iter()
            .map(|(role, column)| format!("{:<9} -> {}", role.as_str(), column))
            .collect();
        f.write_str(&lines.join("\n"))
    }
}

pub struct ColumnResolver {
    synonyms: Arc<SynonymTable>,
}

impl ColumnResolver {
    pub fn new(synonyms: Arc<SynonymTable>) -> Self {
        Self { synonyms }
    }

    pub fn synonyms(&self) -> &SynonymTable {
        &self.synonyms
    }

    /// Build the role map for a list of headers.
    pub fn resolve(&self, columns: &[String]) -> ColumnRoleMap {
        let normalized: Vec<String> = columns.iter().map(|c| normalize_header(c)).collect();
        let mut claimed: HashSet<usize> = HashSet::new();
        let mut roles = BTreeMap::new();

        for role in Role::ALL {
            for synonym in self.synonyms.synonyms(role) {
                let exact = (0..columns.len())
                    .find(|&i| !claimed.contains(&i) && normalized[i] == *synonym);
                let found = exact.or_else(|| {
                    (0..columns.len()).find(|&i| {
                        !claimed.contains(&i) && normalized[i].contains(synonym.as_str())
                    })
                });

                if let Some(index) = found {
                    debug!("Role {} -> '{}' (synonym '{}')", role, columns[index], synonym);
                    claimed.insert(index);
                    roles.insert(role, columns[index].clone());
                    break;
                }
            }
        }

        ColumnRoleMap { roles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ColumnResolver {
        ColumnResolver::new(Arc::new(SynonymTable::default()))
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_size_variants_map_to_same_role() {
        for header in ["Sq_Ft", "square_feet", "SIZE", "Square Footage", "sq-ft", "SQFT"] {
            let map = resolver().resolve(&cols(&["id", header]));
            assert_eq!(map.get(Role::Size), Some(header), "header {}", header);
        }
    }

    #[test]
    fn test_location_variants() {
        for header in ["Region", "location", "AREA", "Neighborhood", "city"] {
            let map = resolver().resolve(&cols(&[header, "price"]));
            assert_eq!(map.get(Role::Location), Some(header));
            assert_eq!(map.get(Role::Value), Some("price"));
        }
    }

    #[test]
    fn test_exact_match_beats_substring() {
        let map = resolver().resolve(&cols(&["sale_price_adjusted", "price"]));
        assert_eq!(map.get(Role::Value), Some("price"));
    }

    #[test]
    fn test_column_claimed_by_first_role_only() {
        // "area" is a location synonym; the size role must not reuse it
        let map = resolver().resolve(&cols(&["area_size"]));
        assert_eq!(map.get(Role::Location), Some("area_size"));
        assert_eq!(map.get(Role::Size), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_unmatched_roles_are_absent() {
        let map = resolver().resolve(&cols(&["foo", "bar"]));
        assert!(map.is_empty());
        assert_eq!(map.get(Role::Date), None);
    }

    #[test]
    fn test_every_mapped_column_exists() {
        let headers = cols(&["Region", "Price", "Sq_Ft", "Property_Type", "Year_Built", "Bedrooms"]);
        let map = resolver().resolve(&headers);
        for (_, column) in map.roles() {
            assert!(headers.iter().any(|h| h == column));
        }
        assert_eq!(map.get(Role::Category), Some("Property_Type"));
        assert_eq!(map.get(Role::Date), Some("Year_Built"));
        assert_eq!(map.get(Role::Count), Some("Bedrooms"));
        assert_eq!(map.role_of("Price"), Some(Role::Value));
    }

    #[test]
    fn test_json_override_replaces_role() {
        let table = SynonymTable::from_json_str(r#"{"location": ["Territory"]}"#).unwrap();
        assert_eq!(table.synonyms(Role::Location), &["territory".to_string()]);
        assert!(!table.synonyms(Role::Value).is_empty());

        let map = ColumnResolver::new(Arc::new(table)).resolve(&cols(&["region", "territory"]));
        assert_eq!(map.get(Role::Location), Some("territory"));
    }

    #[test]
    fn test_json_override_rejects_unknown_role() {
        let err = SynonymTable::from_json_str(r#"{"colour": ["hue"]}"#).unwrap_err();
        assert!(matches!(err, InsightError::Config(_)));
    }
}
