use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of access a tool invocation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    Read,
    Write,
    All,
}

impl fmt::Display for PermissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionType::Read => "read",
            PermissionType::Write => "write",
            PermissionType::All => "all",
        };
        f.write_str(s)
    }
}

/// Per-provider set of permission types that run without prompting.
///
/// `All` subsumes `Read` and `Write`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AutoApprovePolicy {
    types: BTreeSet<PermissionType>,
}

impl AutoApprovePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allows(&self, permission: PermissionType) -> bool {
        self.types.contains(&PermissionType::All) || self.types.contains(&permission)
    }

    /// Add a grant. Granting `All` replaces any narrower grants.
    pub fn grant(&mut self, permission: PermissionType) {
        if permission == PermissionType::All {
            self.types.clear();
        }
        self.types.insert(permission);
    }

    pub fn types(&self) -> impl Iterator<Item = PermissionType> + '_ {
        self.types.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl FromIterator<PermissionType> for AutoApprovePolicy {
    fn from_iter<I: IntoIterator<Item = PermissionType>>(iter: I) -> Self {
        let mut policy = Self::new();
        for permission in iter {
            policy.grant(permission);
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_subsumes_read_and_write() {
        let policy: AutoApprovePolicy = [PermissionType::All].into_iter().collect();
        assert!(policy.allows(PermissionType::Read));
        assert!(policy.allows(PermissionType::Write));
    }

    #[test]
    fn granting_all_replaces_narrow_grants() {
        let mut policy: AutoApprovePolicy = [PermissionType::Read, PermissionType::Write]
            .into_iter()
            .collect();
        policy.grant(PermissionType::All);
        assert_eq!(policy.types().collect::<Vec<_>>(), vec![PermissionType::All]);
    }

    #[test]
    fn read_only_policy_rejects_write() {
        let policy: AutoApprovePolicy = [PermissionType::Read].into_iter().collect();
        assert!(policy.allows(PermissionType::Read));
        assert!(!policy.allows(PermissionType::Write));
    }

    #[test]
    fn serializes_as_plain_list() {
        let policy: AutoApprovePolicy = [PermissionType::Write, PermissionType::Read]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"["read","write"]"#);
    }
}
