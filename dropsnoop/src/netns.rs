use anyhow::Context;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Network namespace of pid 1, i.e. `init_net` on a normal host.
const INIT_NETNS: &str = "/proc/1/ns/net";
const SELF_NETNS: &str = "/proc/self/ns/net";

/// Returns the namespace id behind `path`.
///
/// The nsfs inode number of `/proc/<pid>/ns/net` or a bind mount under
/// `/var/run/netns` is the same value the kernel keeps in `net->ns.inum`.
pub fn namespace_inode(path: &Path) -> anyhow::Result<u32> {
    let meta =
        fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    u32::try_from(meta.ino())
        .with_context(|| format!("inode of {} does not fit a namespace id", path.display()))
}

/// Namespace id reported for every drop when the kernel layout does not
/// allow reading it from the skb.
pub fn fallback_namespace() -> anyhow::Result<u32> {
    match namespace_inode(Path::new(INIT_NETNS)) {
        Ok(id) => Ok(id),
        Err(e) => {
            tracing::debug!("{:#}, using {}", e, SELF_NETNS);
            namespace_inode(Path::new(SELF_NETNS))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_of_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let expected = fs::metadata(file.path()).unwrap().ino();
        if let Ok(expected) = u32::try_from(expected) {
            assert_eq!(namespace_inode(file.path()).unwrap(), expected);
        }
    }

    #[test]
    fn test_missing_path_is_error() {
        let err = namespace_inode(Path::new("/var/run/netns/does-not-exist")).unwrap_err();
        assert!(err.to_string().contains("does-not-exist"));
    }

    #[test]
    fn test_own_namespace_matches_fallback_source() {
        if !Path::new(SELF_NETNS).exists() {
            return;
        }
        let own = namespace_inode(Path::new(SELF_NETNS)).unwrap();
        assert_ne!(own, 0);
        assert!(fallback_namespace().is_ok());
    }
}
