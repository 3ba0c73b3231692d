/// Deterministic provider resource names and tag/cache keys.
///
/// Everything the fleet creates for one (project, slug) pair is addressable from these
/// helpers alone, which is what lets `cleanup()` find orphans from a tag payload.
pub const GROUP_PREFIX: &str = "fleeting_autoscale_";
pub const LAUNCH_CONFIG_PREFIX: &str = "fleeting_launchconfig_";

/// Scheduled action that scales a group to zero when its lifetime ends.
pub const SHUTDOWN_ACTION_NAME: &str = "fleeting_auto_shutdown";

pub fn autoscale_group_name(project: &str, slug: &str) -> String {
    format!("{}{}_{}", GROUP_PREFIX, project, slug)
}

pub fn launch_config_name(project: &str, slug: &str) -> String {
    format!("{}{}_{}", LAUNCH_CONFIG_PREFIX, project, slug)
}

/// Tag key holding the serialized `InstanceRecord`.
pub fn project_tag(project: &str) -> String {
    format!("fleeting:{}", project)
}

/// Tag key holding the ready URL once the application answered its health check.
pub fn ready_tag(project: &str) -> String {
    format!("fleeting:{}:ready", project)
}

pub fn cache_key(project: &str, slug: &str) -> String {
    format!("{}{}", cache_prefix(project), slug)
}

/// Prefix matching every cache entry of `project` and no other project's.
pub fn cache_prefix(project: &str) -> String {
    format!("fleeting:{}:", project)
}

/// Return the slug encoded in a group name, if the group belongs to `project`.
pub fn slug_from_group_name<'a>(project: &str, group_name: &'a str) -> Option<&'a str> {
    group_name
        .strip_prefix(GROUP_PREFIX)?
        .strip_prefix(project)?
        .strip_prefix('_')
        .filter(|slug| !slug.is_empty())
}
