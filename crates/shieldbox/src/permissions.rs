//! document categories and guardian permission sets
//!
//! permissions are derived from the roles a guardian declared to the owner,
//! through a fixed table. nothing a caller sends can widen them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Health,
    Medical,
    Insurance,
    Financial,
    Bank,
    Investment,
    Tax,
    Legal,
    Will,
    Estate,
    Property,
    Family,
    Children,
    Education,
}

impl Category {
    pub const ALL: [Category; 14] = [
        Category::Health,
        Category::Medical,
        Category::Insurance,
        Category::Financial,
        Category::Bank,
        Category::Investment,
        Category::Tax,
        Category::Legal,
        Category::Will,
        Category::Estate,
        Category::Property,
        Category::Family,
        Category::Children,
        Category::Education,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Health => "health",
            Category::Medical => "medical",
            Category::Insurance => "insurance",
            Category::Financial => "financial",
            Category::Bank => "bank",
            Category::Investment => "investment",
            Category::Tax => "tax",
            Category::Legal => "legal",
            Category::Will => "will",
            Category::Estate => "estate",
            Category::Property => "property",
            Category::Family => "family",
            Category::Children => "children",
            Category::Education => "education",
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown category: {}", s)))
    }
}

/// roles a guardian declared to the owner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianRoles {
    pub can_access_health_docs: bool,
    pub can_access_financial_docs: bool,
    pub is_child_guardian: bool,
    pub is_will_executor: bool,
}

/// set of categories a token may open
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GuardianPermissions(u16);

const HEALTH: [Category; 3] = [Category::Health, Category::Medical, Category::Insurance];
const FINANCIAL: [Category; 4] = [
    Category::Financial,
    Category::Bank,
    Category::Investment,
    Category::Tax,
];
const WILL_EXECUTOR: [Category; 4] = [
    Category::Legal,
    Category::Will,
    Category::Estate,
    Category::Property,
];
const CHILD_GUARDIAN: [Category; 3] = [Category::Family, Category::Children, Category::Education];

impl GuardianPermissions {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_categories(categories: impl IntoIterator<Item = Category>) -> Self {
        categories
            .into_iter()
            .fold(Self::empty(), |acc, c| Self(acc.0 | c.bit()))
    }

    /// static role → category table
    pub fn from_roles(roles: &GuardianRoles) -> Self {
        let mut perms = Self::empty();
        if roles.can_access_health_docs {
            perms = perms.union(Self::from_categories(HEALTH));
        }
        if roles.can_access_financial_docs {
            perms = perms.union(Self::from_categories(FINANCIAL));
        }
        if roles.is_will_executor {
            perms = perms.union(Self::from_categories(WILL_EXECUTOR));
        }
        if roles.is_child_guardian {
            perms = perms.union(Self::from_categories(CHILD_GUARDIAN));
        }
        perms
    }

    pub fn contains(&self, category: Category) -> bool {
        self.0 & category.bit() != 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Category> + '_ {
        Category::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl fmt::Debug for GuardianPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for GuardianPermissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for GuardianPermissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let categories = Vec::<Category>::deserialize(deserializer)?;
        Ok(Self::from_categories(categories))
    }
}
