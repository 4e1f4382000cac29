//! Include/exclude filter state and the pure list transformations used by
//! test selection.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::name::NameRules;

/// Reserved slice name selecting everything outside the named slices.
pub const OTHER_SLICE: &str = "other";

static LISTING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\s+(.*?)(?:\s+\(requires root\))?\s*$").unwrap());

static CHANGED_TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^libvirt/tests/(?:cfg|src)/(.+)\.(?:cfg|py)$").unwrap());

/// Layered include/exclude state.
///
/// `include == None` means no include restriction; `Some(empty)` means run
/// nothing. Excludes are handed to the harness first, includes narrow further.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub exclude: BTreeSet<String>,
    pub include: Option<BTreeSet<String>>,
}

impl Filter {
    pub fn with_excludes<I, S>(excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: excludes.into_iter().map(Into::into).collect(),
            include: None,
        }
    }

    /// Replace the include set.
    pub fn set_include<I: IntoIterator<Item = String>>(&mut self, items: I) {
        self.include = Some(items.into_iter().collect());
    }

    /// Union items into the include set, creating it if absent.
    pub fn include_more<I: IntoIterator<Item = String>>(&mut self, items: I) {
        self.include.get_or_insert_with(BTreeSet::new).extend(items);
    }

    /// Intersect the include set with `items`, or assign it if absent.
    pub fn restrict_to(&mut self, items: BTreeSet<String>) {
        self.include = Some(match self.include.take() {
            Some(current) => current.intersection(&items).cloned().collect(),
            None => items,
        });
    }

    pub fn exclude_more<I: IntoIterator<Item = String>>(&mut self, items: I) {
        self.exclude.extend(items);
    }

    /// True when the include set is explicitly empty.
    pub fn selects_nothing(&self) -> bool {
        self.include.as_ref().is_some_and(BTreeSet::is_empty)
    }

    /// Apply operator slice choices. Returns the names that matched no slice.
    pub fn apply_slices(&mut self, slices: &SliceMap, chosen: &[String]) -> Vec<String> {
        let mut unknown = Vec::new();
        for name in chosen {
            if let Some(groups) = slices.groups(name) {
                self.include_more(groups.iter().cloned());
            } else if name == OTHER_SLICE {
                for groups in slices.all_groups() {
                    self.exclude_more(groups.iter().cloned());
                }
            } else {
                unknown.push(name.clone());
            }
        }
        unknown
    }
}

/// Slice name to test groups, as published by the slice source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceMap {
    slices: BTreeMap<String, Vec<String>>,
}

impl SliceMap {
    /// Parse whitespace-separated `name group1,group2` lines. Blank lines are
    /// ignored; any other line that is not exactly two fields is an error.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut slices = BTreeMap::new();
        for (index, line) in text.lines().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [] => {}
                [name, groups] => {
                    slices.insert((*name).to_string(), split_list(groups));
                }
                _ => {
                    return Err(format!(
                        "slice line {}: expected `name groups`, got {line:?}",
                        index + 1
                    ));
                }
            }
        }
        Ok(Self { slices })
    }

    pub fn groups(&self, name: &str) -> Option<&[String]> {
        self.slices.get(name).map(Vec::as_slice)
    }

    pub fn all_groups(&self) -> impl Iterator<Item = &[String]> {
        self.slices.values().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract test ids from listing output: numbered lines only, with the index
/// and an optional `(requires root)` suffix removed.
pub fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| line.starts_with(|ch: char| ch.is_ascii_digit()))
        .filter_map(|line| LISTING_RE.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Parse a whitelist/blacklist file: one id per line, `#` comments and blank
/// lines ignored.
pub fn parse_id_file(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Keep only the first id of each class, preserving order.
pub fn smoke(ids: Vec<String>, rules: &NameRules) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(rules.split(id).class_name))
        .collect()
}

/// Remove every id literally present in `blacklist`, preserving order.
pub fn remove_listed(ids: Vec<String>, blacklist: &[String]) -> Vec<String> {
    let blocked: HashSet<&str> = blacklist.iter().map(String::as_str).collect();
    ids.into_iter()
        .filter(|id| !blocked.contains(id.as_str()))
        .collect()
}

/// Map a changed provider file to the `.cfg` file (relative to the provider
/// repository) whose first line names its test group.
pub fn changed_config_path(changed: &str) -> Option<String> {
    let caps = CHANGED_TEST_RE.captures(changed.trim())?;
    let name = caps.get(1)?.as_str();
    Some(format!("libvirt/tests/cfg/{name}.cfg"))
}

/// Test group label from the first line of a `.cfg` file (`- virsh.domname:`).
pub fn config_label(first_line: &str) -> String {
    first_line
        .trim()
        .trim_start_matches('-')
        .trim_end_matches(':')
        .trim()
        .to_string()
}
