use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use crate::access::PermissionLevel;
use crate::extras::OperationExtras;
use crate::scm::Action;
use crate::ssh::{self, ra_svn};

/// How the tunnel ended: the child's exit code plus the repository name, if
/// the handshake got far enough to reveal one.
#[derive(Debug)]
pub struct Outcome {
    pub exit_code: i32,
    pub repo_name: Option<String>,
}

/// Runs `svnserve -t` against the SSH session.
///
/// The repository name is only present in the client's first protocol
/// message, which arrives after the child has already been spawned (the
/// server speaks first in `ra_svn`). So the tunnel intercepts that message,
/// authorizes, adjusts the hook environment, and only then forwards the
/// greeting and goes transparent.
pub struct SvnTunnel<'a> {
    pub binary: &'a str,
    pub root: &'a Path,
    pub timeout: Duration,
    pub username: &'a str,
    pub permissions: &'a HashMap<String, PermissionLevel>,
}

impl SvnTunnel<'_> {
    pub fn run(
        &self,
        make_extras: impl Fn(&str) -> OperationExtras,
    ) -> io::Result<Outcome> {
        self.run_with(io::stdin(), io::stdout(), make_extras)
    }

    fn run_with(
        &self,
        input: impl Read + Send + 'static,
        mut output: impl Write,
        make_extras: impl Fn(&str) -> OperationExtras,
    ) -> io::Result<Outcome> {
        // Both files are removed on drop, whichever way the tunnel ends.
        let hooks_env = NamedTempFile::new()?;
        let svn_conf = NamedTempFile::new()?;
        std::fs::write(
            svn_conf.path(),
            format!("[general]\nhooks-env = {}\n", hooks_env.path().display()),
        )?;
        std::fs::write(hooks_env.path(), hooks_env_content(true, None))?;

        tracing::debug!(
            "final cmd: {} -t --config-file {} -r {}",
            self.binary,
            svn_conf.path().display(),
            self.root.display()
        );
        let mut child = Command::new(self.binary)
            .arg("-t")
            .arg("--config-file")
            .arg(svn_conf.path())
            .arg("-r")
            .arg(self.root)
            .stdin(Stdio::piped())
            .spawn()?;

        let bytes = spawn_byte_reader(input);
        let deadline = Instant::now() + self.timeout;
        let frame = ra_svn::read_frame(|| {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            bytes.recv_timeout(remaining).ok()
        });

        let Some(handshake) = frame.as_deref().and_then(ra_svn::Handshake::parse) else {
            let message = if frame.is_none() {
                "Exited by timeout"
            } else {
                "Repository name cannot be extracted"
            };
            self.fail(&mut output, &mut child, message)?;
            return Ok(Outcome {
                exit_code: 1,
                repo_name: None,
            });
        };

        let Some(repo_name) = repo_from_url(&handshake.url) else {
            self.fail(&mut output, &mut child, "Repository name cannot be extracted")?;
            return Ok(Outcome {
                exit_code: 1,
                repo_name: None,
            });
        };
        tracing::debug!("handshake addresses repository `{repo_name}`");

        let code = ssh::check_permissions(
            self.permissions,
            self.username,
            &repo_name,
            Action::Pull,
        );
        if code != 0 {
            self.fail(
                &mut output,
                &mut child,
                &format!("Not enough permissions for repository {repo_name}"),
            )?;
            return Ok(Outcome {
                exit_code: code,
                repo_name: Some(repo_name),
            });
        }

        // The hooks see the repository as writable only if the user is.
        let read_only = !self
            .permissions
            .get(repo_name.as_str())
            .copied()
            .unwrap_or_default()
            .allows(Action::Push);
        let extras = make_extras(&repo_name);
        std::fs::write(
            hooks_env.path(),
            hooks_env_content(read_only, Some(&extras)),
        )?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child stdin not piped")
        })?;
        stdin.write_all(handshake.encode().as_bytes())?;
        stdin.flush()?;

        // Go transparent: one byte at a time until the client closes its
        // stream or the child goes away.
        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            match bytes.recv_timeout(Duration::from_millis(100)) {
                Ok(byte) => {
                    if stdin.write_all(&[byte]).is_err() {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(stdin);

        let status = child.wait()?;
        Ok(Outcome {
            exit_code: status.code().unwrap_or(1),
            repo_name: Some(repo_name),
        })
    }

    /// Writes exactly one protocol failure message to the client and kills
    /// the child.
    fn fail(&self, output: &mut impl Write, child: &mut Child, message: &str) -> io::Result<()> {
        tracing::error!("svn tunnel failed: {message}");
        output.write_all(ra_svn::failure(message).as_bytes())?;
        output.flush()?;
        child.kill().ok();
        child.wait().ok();
        Ok(())
    }
}

/// Hook environment handed to svnserve's hook scripts.
fn hooks_env_content(read_only: bool, extras: Option<&OperationExtras>) -> String {
    let mut content = String::from("[default]\nLANG = en_US.UTF-8\n");
    content.push_str(&format!("SSH_READ_ONLY = {}\n", if read_only { 1 } else { 0 }));
    if let Some(extras) = extras {
        content.push_str(&format!(
            "{} = {}\n",
            OperationExtras::ENV_VAR,
            extras.to_json_string()
        ));
    }
    content
}

/// The repository a greeting URL addresses: the path component, without
/// surrounding slashes.
fn repo_from_url(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw).ok()?;
    let repo = url.path().trim_matches('/');
    if repo.is_empty() {
        return None;
    }
    Some(repo.to_owned())
}

/// Feeds the input stream into a channel one byte at a time, so reads can
/// be bounded by a deadline.
fn spawn_byte_reader(mut input: impl Read + Send + 'static) -> mpsc::Receiver<u8> {
    let (tx, rx) = mpsc::sync_channel::<u8>(1);
    thread::Builder::new()
        .name("svn-byte-reader".to_owned())
        .spawn(move || {
            let mut byte = [0u8; 1];
            loop {
                match input.read(&mut byte) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(byte[0]).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .ok();
    rx
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A client that never says anything.
    struct Mute;

    impl Read for Mute {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_secs(60));
            Ok(0)
        }
    }

    fn tunnel<'a>(
        root: &'a Path,
        username: &'a str,
        permissions: &'a HashMap<String, PermissionLevel>,
    ) -> SvnTunnel<'a> {
        SvnTunnel {
            // Stands in for svnserve; it exits on its own, which is all
            // these tests need from the child process.
            binary: "cat",
            root,
            timeout: Duration::from_millis(100),
            username,
            permissions,
        }
    }

    fn greeting(repo: &str) -> String {
        let url = format!("svn+ssh://host/{repo}");
        format!(
            "( 2 ( edit-pipeline svndiff1 ) {}8:SVN/1.14 ( ) ) ",
            ra_svn::svn_string(&url)
        )
    }

    #[test]
    fn test_repo_from_url() {
        assert_eq!(
            repo_from_url("svn+ssh://host/teams/alpha").as_deref(),
            Some("teams/alpha")
        );
        assert_eq!(
            repo_from_url("svn+ssh://host/teams/alpha/").as_deref(),
            Some("teams/alpha")
        );
        assert_eq!(repo_from_url("svn+ssh://host/"), None);
        assert_eq!(repo_from_url("not a url"), None);
    }

    #[test]
    fn test_hooks_env_content() {
        let content = hooks_env_content(true, None);
        assert!(content.contains("SSH_READ_ONLY = 1\n"));

        let extras = OperationExtras::default();
        let content = hooks_env_content(false, Some(&extras));
        assert!(content.contains("SSH_READ_ONLY = 0\n"));
        assert!(content.contains(OperationExtras::ENV_VAR));
    }

    #[test]
    fn test_timeout_emits_one_failure_frame() {
        let root = tempfile::tempdir().unwrap();
        let permissions = HashMap::new();
        let tunnel = tunnel(root.path(), "alice", &permissions);

        let mut output = Vec::new();
        let outcome = tunnel
            .run_with(Mute, &mut output, |_| OperationExtras::default())
            .unwrap();

        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.repo_name, None);
        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.matches("( failure").count(), 1);
        assert!(text.contains("Exited by timeout"));
    }

    #[test]
    fn test_unparsable_greeting_fails() {
        let root = tempfile::tempdir().unwrap();
        let permissions = HashMap::new();
        let tunnel = tunnel(root.path(), "alice", &permissions);

        let mut output = Vec::new();
        let outcome = tunnel
            .run_with("( what is this ) ".as_bytes(), &mut output, |_| {
                OperationExtras::default()
            })
            .unwrap();

        assert_eq!(outcome.exit_code, 1);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Repository name cannot be extracted"));
    }

    #[test]
    fn test_permission_denied_before_forwarding() {
        let root = tempfile::tempdir().unwrap();
        // alice has no permissions at all.
        let permissions = HashMap::new();
        let tunnel = tunnel(root.path(), "alice", &permissions);

        let mut output = Vec::new();
        let outcome = tunnel
            .run_with(
                io::Cursor::new(greeting("teams/alpha").into_bytes()),
                &mut output,
                |_| OperationExtras::default(),
            )
            .unwrap();

        assert_eq!(outcome.exit_code, ssh::EXIT_PERMISSION_DENIED);
        assert_eq!(outcome.repo_name.as_deref(), Some("teams/alpha"));
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Not enough permissions for repository teams/alpha"));
    }
}
