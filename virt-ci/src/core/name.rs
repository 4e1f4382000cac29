//! Decomposition of harness test ids into report class and case names.
//!
//! Ids look like `type_specific.io-github-autotest-libvirt.virsh.domname.normal_test`.
//! The provider prefix is dropped, a leading package namespace (e.g. `virsh`)
//! is folded into the class, and whatever follows the class is the case.

/// Class/case pair used for reports and smoke-mode grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestName {
    pub class_name: String,
    pub case_name: String,
}

/// Rules for decomposing ids; built once from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRules {
    provider_prefix: String,
    package_namespaces: Vec<String>,
}

impl NameRules {
    pub fn new(provider_prefix: impl Into<String>, package_namespaces: Vec<String>) -> Self {
        Self {
            provider_prefix: provider_prefix.into(),
            package_namespaces,
        }
    }

    /// Split an id into class and case names.
    ///
    /// Pure and idempotent: the same id always yields the same pair.
    pub fn split(&self, id: &str) -> TestName {
        let name = self.strip_provider(id);

        let (package, rest) = match name.split_once('.') {
            Some((first, rest)) if self.is_package(first) => (Some(first), rest),
            _ => (None, name),
        };

        let (class, case) = match rest.split_once('.') {
            Some((class, case)) => (class, case),
            None => (rest, rest),
        };

        let class_name = match package {
            Some(package) => format!("{package}.{class}"),
            None => class.to_string(),
        };
        TestName {
            class_name,
            case_name: case.to_string(),
        }
    }

    fn strip_provider<'a>(&self, id: &'a str) -> &'a str {
        if self.provider_prefix.is_empty() {
            return id;
        }
        id.strip_prefix(self.provider_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(id)
    }

    fn is_package(&self, segment: &str) -> bool {
        self.package_namespaces.iter().any(|ns| ns == segment)
    }
}

/// Id without its first two dotted segments (the provider prefix), as printed
/// in progress lines and `--list` output. Ids with fewer segments are returned
/// unchanged.
pub fn short_name(id: &str) -> &str {
    let mut parts = id.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(_), Some(rest)) => rest,
        _ => id,
    }
}
