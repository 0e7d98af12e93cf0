//! Shared vocabulary of the workspace manager: workspace versions, instance
//! owners and names, and the permission model.

pub mod access;
pub mod names;
pub mod owner;
pub mod workspace;

pub use access::{ADMIN_ROLE, Caller, PermissionEvaluator, PermissionLevel, WorkspaceAccess};
pub use names::{InstanceName, InstanceNameGenerator, MAX_NAME_LEN};
pub use owner::InstanceOwner;
pub use workspace::{
    GitRepository, SharedInstanceConfig, WorkspaceConfig, WorkspaceHash, WorkspaceId,
    WorkspaceRef, WorkspaceVersion,
};
