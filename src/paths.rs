use std::path::{Path, PathBuf};
use uuid::Uuid;

#[cfg(unix)]
pub fn default_installations_root() -> PathBuf {
    PathBuf::from("/opt/kraken/Installations")
}

#[cfg(windows)]
pub fn default_installations_root() -> PathBuf {
    PathBuf::from(r"C:\Kraken\Installations")
}

#[cfg(unix)]
pub fn default_artifacts_root() -> PathBuf {
    PathBuf::from("/opt/kraken/Artifacts")
}

#[cfg(windows)]
pub fn default_artifacts_root() -> PathBuf {
    PathBuf::from(r"C:\Kraken\Artifacts")
}

/// Replace any character unsafe for a file name with `_`, collapsing runs
/// so `a b/c` becomes `a_b_c` rather than `a_b__c`.
pub fn sanitize_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sub = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
            out.push(c);
            last_was_sub = false;
        } else if !last_was_sub {
            out.push('_');
            last_was_sub = true;
        }
    }
    out
}

/// `<root>/<agentId>/<sanitizedEnv>/<releaseVersion>/script/<stepOrder>/`
pub fn step_script_dir(
    installations_root: &Path,
    agent_id: Uuid,
    environment: &str,
    release_version: &str,
    step_order: i32,
) -> PathBuf {
    installations_root
        .join(agent_id.to_string())
        .join(sanitize_component(environment))
        .join(release_version)
        .join("script")
        .join(step_order.to_string())
}

/// `<root>/<agentId>/<name>/<version>/`
pub fn artifact_version_dir(
    artifacts_root: &Path,
    agent_id: Uuid,
    name: &str,
    version: &str,
) -> PathBuf {
    artifacts_root
        .join(agent_id.to_string())
        .join(name)
        .join(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_component("Production"), "Production");
        assert_eq!(sanitize_component("QA / West #2"), "QA_West_2");
        assert_eq!(sanitize_component("a  b"), "a_b");
        assert_eq!(sanitize_component("v1.2-rc_3"), "v1.2-rc_3");
    }

    #[test]
    fn step_dir_layout() {
        let agent = Uuid::nil();
        let dir = step_script_dir(Path::new("/opt/kraken/Installations"), agent, "QA 1", "2.0.0", 3);
        assert_eq!(
            dir,
            PathBuf::from(format!("/opt/kraken/Installations/{agent}/QA_1/2.0.0/script/3"))
        );
    }
}
