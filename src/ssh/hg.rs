use std::io::{self, Write as _};
use std::path::Path;
use std::process::Command;

use tempfile::NamedTempFile;

use crate::access::Directory;
use crate::extras::OperationExtras;

/// UI setting sections that may be forwarded into the generated hgrc.
/// Everything else stays server-side.
const ALLOWED_SECTIONS: [&str; 4] = ["phases", "largefiles", "extensions", "experimental"];

/// Runs `hg serve --stdio` against the SSH session. No permission is checked
/// up front: Mercurial's own `pretxnchangegroup`/`preoutgoing` hooks do the
/// real authorization mid-protocol, through the hook registrations written
/// into a per-session hgrc.
pub struct HgTunnel<'a> {
    pub binary: &'a str,
    pub root: &'a Path,
    pub repo_name: &'a str,
    pub directory: &'a Directory,
}

impl HgTunnel<'_> {
    pub fn run(&self, extras: &OperationExtras) -> io::Result<i32> {
        // The temp file must outlive the child; it is removed on drop,
        // success or failure.
        let hgrc = self.write_hgrc()?;
        let repo_path = self.root.join(self.repo_name);
        tracing::debug!(
            "final cmd: {} -R '{}' serve --stdio",
            self.binary,
            repo_path.display()
        );

        let status = Command::new(self.binary)
            .arg("-R")
            .arg(&repo_path)
            .arg("serve")
            .arg("--stdio")
            .current_dir(self.root)
            .env("HGRCPATH", hgrc.path())
            .env(OperationExtras::ENV_VAR, extras.to_json_string())
            .status()?;

        Ok(status.code().unwrap_or(1))
    }

    /// Generates the per-session hgrc: hook registrations plus the active
    /// UI settings from the allow-listed sections.
    fn write_hgrc(&self) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        write!(file, "{}", self.hgrc_content())?;
        file.flush()?;
        tracing::debug!("wrote session hgrc to {}", file.path().display());
        Ok(file)
    }

    fn hgrc_content(&self) -> String {
        let mut content = String::from(
            "[hooks]\n\
             pretxnchangegroup.gateway-auth = vcs-gateway-hook pre_push\n\
             changegroup.gateway = vcs-gateway-hook post_push\n\
             preoutgoing.gateway-auth = vcs-gateway-hook pre_pull\n\
             outgoing.gateway = vcs-gateway-hook post_pull\n",
        );
        for section in ALLOWED_SECTIONS {
            let settings: Vec<_> = self.directory.ui_settings(section).collect();
            if settings.is_empty() {
                continue;
            }
            content.push_str(&format!("\n[{section}]\n"));
            for setting in settings {
                content.push_str(&format!("{} = {}\n", setting.key, setting.value));
            }
        }
        content
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn directory() -> Directory {
        serde_json::from_value(serde_json::json!({
            "ui": [
                { "section": "extensions", "key": "largefiles", "value": "" },
                { "section": "phases", "key": "publish", "value": "False" },
                { "section": "phases", "key": "retired", "value": "x", "active": false },
                { "section": "web", "key": "allow_push", "value": "*" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_hgrc_contains_hooks_and_allowed_sections() {
        let directory = directory();
        let tunnel = HgTunnel {
            binary: "hg",
            root: Path::new("/srv/repos"),
            repo_name: "teams/alpha",
            directory: &directory,
        };
        let content = tunnel.hgrc_content();

        assert!(content.starts_with("[hooks]\n"));
        assert!(content.contains("pretxnchangegroup.gateway-auth = vcs-gateway-hook pre_push\n"));
        assert!(content.contains("preoutgoing.gateway-auth = vcs-gateway-hook pre_pull\n"));

        assert!(content.contains("[extensions]\nlargefiles = \n"));
        assert!(content.contains("[phases]\npublish = False\n"));
        // Inactive settings and non-allow-listed sections are skipped.
        assert!(!content.contains("retired"));
        assert!(!content.contains("[web]"));
    }

    #[test]
    fn test_hgrc_without_ui_settings() {
        let directory = Directory::default();
        let tunnel = HgTunnel {
            binary: "hg",
            root: Path::new("/srv/repos"),
            repo_name: "r",
            directory: &directory,
        };
        let content = tunnel.hgrc_content();
        assert_eq!(content.matches('[').count(), 1); // only [hooks]
    }
}
