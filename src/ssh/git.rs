use std::io;
use std::path::Path;
use std::process::Command;

use crate::extras::OperationExtras;
use crate::ssh::GitMode;

/// Runs the git binary in upload-pack or receive-pack mode with stdio wired
/// straight to the SSH session. Authorization hooks inside the repository
/// reach back through the extras propagated in the environment.
pub struct GitTunnel<'a> {
    pub binary: &'a str,
    pub root: &'a Path,
    pub repo_name: &'a str,
    pub mode: GitMode,
}

impl GitTunnel<'_> {
    pub fn run(&self, extras: &OperationExtras) -> io::Result<i32> {
        let repo_path = self.root.join(self.repo_name);
        tracing::debug!(
            "final cmd: {} {} '{}'",
            self.binary,
            self.mode.as_str(),
            repo_path.display()
        );

        let status = Command::new(self.binary)
            .arg(self.mode.as_str())
            .arg(&repo_path)
            .current_dir(self.root)
            .env(OperationExtras::ENV_VAR, extras.to_json_string())
            .status()?;

        Ok(status.code().unwrap_or(1))
    }
}
