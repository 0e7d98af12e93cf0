use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const ADMIN_ROLE: &str = "admin";

/// Permission levels on a workspace. Each level implies all lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    View,
    AccessShared,
    RunInstance,
    Write,
    Owner,
}

/// Access-control data attached to a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceAccess {
    #[serde(default)]
    pub users: BTreeMap<String, PermissionLevel>,
    #[serde(default)]
    pub roles: BTreeMap<String, PermissionLevel>,
    /// Granted to every caller, including anonymous ones.
    #[serde(default)]
    pub everyone: Option<PermissionLevel>,
}

/// Identity of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(ADMIN_ROLE)
    }
}

/// Evaluates what a (possibly anonymous) caller may do on a workspace.
#[derive(Debug, Clone, Copy)]
pub struct PermissionEvaluator<'a> {
    caller: Option<&'a Caller>,
}

impl<'a> PermissionEvaluator<'a> {
    pub fn new(caller: Option<&'a Caller>) -> Self {
        Self { caller }
    }

    pub fn level(&self, access: &WorkspaceAccess) -> Option<PermissionLevel> {
        let Some(caller) = self.caller else {
            return access.everyone;
        };
        if caller.is_admin() {
            return Some(PermissionLevel::Owner);
        }

        let by_user = access.users.get(&caller.user_id).copied();
        let by_role = caller
            .roles
            .iter()
            .filter_map(|r| access.roles.get(r).copied())
            .max();
        [access.everyone, by_user, by_role].into_iter().flatten().max()
    }

    pub fn has(&self, access: &WorkspaceAccess, required: PermissionLevel) -> bool {
        self.level(access).is_some_and(|level| level >= required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access() -> WorkspaceAccess {
        let mut a = WorkspaceAccess::default();
        a.users.insert("alice".to_string(), PermissionLevel::Write);
        a.users.insert("carol".to_string(), PermissionLevel::AccessShared);
        a.roles.insert("reviewers".to_string(), PermissionLevel::RunInstance);
        a.everyone = Some(PermissionLevel::View);
        a
    }

    #[test]
    fn levels_are_hierarchical() {
        let alice = Caller::new("alice");
        let eval = PermissionEvaluator::new(Some(&alice));
        assert!(eval.has(&access(), PermissionLevel::RunInstance));
        assert!(eval.has(&access(), PermissionLevel::AccessShared));
        assert!(!eval.has(&access(), PermissionLevel::Owner));
    }

    #[test]
    fn roles_and_everyone_grants_combine() {
        let carol = Caller::new("carol").with_role("reviewers");
        assert_eq!(
            PermissionEvaluator::new(Some(&carol)).level(&access()),
            Some(PermissionLevel::RunInstance)
        );

        let stranger = Caller::new("mallory");
        assert_eq!(
            PermissionEvaluator::new(Some(&stranger)).level(&access()),
            Some(PermissionLevel::View)
        );
        assert!(!PermissionEvaluator::new(None).has(&access(), PermissionLevel::AccessShared));
    }

    #[test]
    fn admins_may_do_everything() {
        let root = Caller::new("root").with_role(ADMIN_ROLE);
        assert!(PermissionEvaluator::new(Some(&root)).has(&WorkspaceAccess::default(), PermissionLevel::Owner));
    }
}
