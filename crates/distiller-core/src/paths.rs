use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillerPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub credential_path: PathBuf,
    pub logs_dir: PathBuf,
    pub exports_dir: PathBuf,
}

impl DistillerPaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join("config.json"),
            credential_path: root.join("security").join("api_key"),
            logs_dir: root.join("logs"),
            exports_dir: root.join("exports"),
            root,
        }
    }

    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [&self.root, &self.logs_dir] {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        Ok(())
    }
}

/// `$DISTILLER_HOME` when set, else `<data_dir>/distiller`.
pub fn resolve_paths() -> anyhow::Result<DistillerPaths> {
    if let Ok(home) = std::env::var("DISTILLER_HOME") {
        if !home.trim().is_empty() {
            return Ok(DistillerPaths::from_root(home.trim()));
        }
    }
    let base = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Failed to resolve data dir"))?;
    Ok(DistillerPaths::from_root(base.join("distiller")))
}

/// Default export target for a finished document: `<stem>.md` next to the
/// caller's working directory unless a directory is given.
pub fn export_path_for(stem: &str, dir: Option<&Path>) -> PathBuf {
    let stem = stem.trim();
    let name = if stem.is_empty() {
        "distilled.md".to_string()
    } else {
        format!("{stem}.md")
    };
    match dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_root() {
        let paths = DistillerPaths::from_root("/tmp/distiller");
        assert_eq!(paths.config_path, PathBuf::from("/tmp/distiller/config.json"));
        assert_eq!(paths.logs_dir, PathBuf::from("/tmp/distiller/logs"));
        assert!(paths.credential_path.ends_with("security/api_key"));
    }

    #[test]
    fn ensure_creates_root_and_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = DistillerPaths::from_root(temp.path().join("state"));
        paths.ensure().expect("ensure");
        assert!(paths.logs_dir.is_dir());
    }

    #[test]
    fn export_path_uses_artifact_stem() {
        assert_eq!(export_path_for("moby-dick", None), PathBuf::from("moby-dick.md"));
        assert_eq!(
            export_path_for(" ", Some(Path::new("/out"))),
            PathBuf::from("/out/distilled.md")
        );
    }
}
