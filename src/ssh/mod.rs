pub mod git;
pub mod hg;
pub mod ra_svn;
pub mod svn;

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::access::PermissionLevel;
use crate::config::Config;
use crate::extras::OperationExtras;
use crate::hooks::{CallbackDaemon, GatewayHooks, Hooks};
use crate::scm::{Action, Vcs};

/// Exit code for commands the wrapper does not recognize.
pub const EXIT_UNRECOGNIZED: i32 = -1;
/// Exit code for recognized commands the user is not allowed to run.
pub const EXIT_PERMISSION_DENIED: i32 = -2;

/// The two smart-transport modes of the git binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitMode {
    UploadPack,
    ReceivePack,
}

impl GitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Self::UploadPack => Action::Pull,
            Self::ReceivePack => Action::Push,
        }
    }
}

/// A recognized SSH command line. SVN carries no repository name here; it
/// only becomes known once the client's first protocol message is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshCommand {
    Hg { repo: String },
    Git { repo: String, mode: GitMode },
    Svn,
}

/// Parses the raw `SSH_ORIGINAL_COMMAND` string into a command descriptor.
///
/// Recognized shapes:
///
/// * `hg -R <path> serve --stdio`
/// * `git-receive-pack '<path>'` / `git-upload-pack '<path>'`, with an
///   optional `.git` suffix on the path
/// * `svnserve -t`
pub fn parse_command(raw: &str) -> Option<SshCommand> {
    let raw = raw.trim();

    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if let ["hg", "-R", path, "serve", "--stdio"] = tokens.as_slice() {
        return Some(SshCommand::Hg {
            repo: path.trim_matches('/').to_owned(),
        });
    }

    for (prefix, mode) in [
        ("git-receive-pack ", GitMode::ReceivePack),
        ("git-upload-pack ", GitMode::UploadPack),
    ] {
        if let Some(arg) = raw.strip_prefix(prefix) {
            let path = arg.trim().strip_prefix('\'')?.strip_suffix('\'')?;
            let path = path.strip_suffix(".git").unwrap_or(path);
            let repo = path.trim_matches('/');
            if repo.is_empty() {
                return None;
            }
            return Some(SshCommand::Git {
                repo: repo.to_owned(),
                mode,
            });
        }
    }

    if raw == "svnserve -t" {
        return Some(SshCommand::Svn);
    }
    None
}

/// The `SSH_CONNECTION` tuple: client address/port, server address/port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
}

impl FromStr for ConnectionInfo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let mut next = || parts.next().ok_or_else(|| format!("malformed SSH_CONNECTION: `{s}`"));
        let info = Self {
            client_ip: next()?.parse().map_err(|e| format!("client ip: {e}"))?,
            client_port: next()?.parse().map_err(|e| format!("client port: {e}"))?,
            server_ip: next()?.parse().map_err(|e| format!("server ip: {e}"))?,
            server_port: next()?.parse().map_err(|e| format!("server port: {e}"))?,
        };
        Ok(info)
    }
}

/// One authenticated SSH session, as handed over by sshd via the forced
/// command's arguments and environment.
#[derive(Debug)]
pub struct Session {
    pub command: String,
    pub username: String,
    pub key_id: u64,
    pub connection: ConnectionInfo,
}

/// The shared permission pre-check: push needs write or admin, pull needs
/// at least read. Returns the tunnel's exit code, zero when allowed.
pub fn check_permissions(
    permissions: &HashMap<String, PermissionLevel>,
    user: &str,
    repo_name: &str,
    action: Action,
) -> i32 {
    let level = permissions.get(repo_name).copied().unwrap_or_default();
    if level.allows(action) {
        tracing::info!("{action} permission for `{user}` on `{repo_name}` granted");
        0
    } else {
        tracing::error!(
            "cannot allow `{user}` on `{repo_name}`: have {level:?}, need {action}"
        );
        EXIT_PERMISSION_DENIED
    }
}

/// Serves one SSH session: parse the command, resolve the user, start the
/// callback daemon, run the matching tunnel backend, and invalidate the
/// repository's caches on the way out. The returned value is the process
/// exit code.
pub fn serve(config: &Config, session: &Session) -> i32 {
    let Some(command) = parse_command(&session.command) else {
        tracing::error!("unhandled command: `{}`, aborting", session.command);
        return EXIT_UNRECOGNIZED;
    };
    tracing::debug!("command parsed as {command:?}");

    let directory = &config.directory;
    directory.record_key_access(session.key_id);

    let Some(user) = directory.user(&session.username).filter(|u| u.active) else {
        tracing::error!("user `{}` unknown or inactive", session.username);
        return EXIT_PERMISSION_DENIED;
    };
    let permissions = directory.permissions_for(&user.name);

    let hooks: Arc<dyn Hooks> = Arc::new(GatewayHooks {
        directory: directory.clone(),
    });
    let daemon = match CallbackDaemon::start(hooks) {
        Ok(daemon) => daemon,
        Err(err) => {
            tracing::error!("failed to start callback daemon: {err}");
            return 1;
        }
    };

    let (exit_code, repo_name) = run_tunnel(config, session, &command, &permissions, &daemon);

    // Cleanup runs regardless of how the tunnel went.
    tracing::debug!("running cleanup with cache invalidation");
    if let Some(repo_name) = repo_name {
        directory.mark_for_invalidation(&repo_name);
    }
    drop(daemon);

    exit_code
}

fn run_tunnel(
    config: &Config,
    session: &Session,
    command: &SshCommand,
    permissions: &HashMap<String, PermissionLevel>,
    daemon: &CallbackDaemon,
) -> (i32, Option<String>) {
    let extras = |action: &str, repo: &str, vcs: Vcs| {
        let mut extras = OperationExtras {
            ip: session.connection.client_ip.to_string(),
            username: session.username.clone(),
            action: action.to_owned(),
            repository: repo.to_owned(),
            scm: Some(vcs),
            ssh: true,
            check_locking: true,
            server_url: config.server_url.clone(),
            permission: permissions.get(repo).copied(),
            ..OperationExtras::default()
        };
        extras.hooks_uri = Some(daemon.uri().to_owned());
        extras
    };

    match command {
        SshCommand::Hg { repo } => {
            let tunnel = hg::HgTunnel {
                binary: &config.hg_binary,
                root: &config.repositories_root,
                repo_name: repo,
                directory: &config.directory,
            };
            // Mercurial authorizes mid-protocol via its own hooks.
            let code = tunnel
                .run(&extras("?", repo, Vcs::Hg))
                .unwrap_or_else(|err| {
                    tracing::error!("hg tunnel failed: {err}");
                    EXIT_UNRECOGNIZED
                });
            (code, Some(repo.clone()))
        }
        SshCommand::Git { repo, mode } => {
            let action = mode.action();
            let code = check_permissions(permissions, &session.username, repo, action);
            if code != 0 {
                return (code, None);
            }
            let tunnel = git::GitTunnel {
                binary: &config.git_binary,
                root: &config.repositories_root,
                repo_name: repo,
                mode: *mode,
            };
            let code = tunnel
                .run(&extras(action.as_str(), repo, Vcs::Git))
                .unwrap_or_else(|err| {
                    tracing::error!("git tunnel failed: {err}");
                    EXIT_UNRECOGNIZED
                });
            (code, Some(repo.clone()))
        }
        SshCommand::Svn => {
            let tunnel = svn::SvnTunnel {
                binary: &config.svnserve_binary,
                root: &config.repositories_root,
                timeout: config.svn_handshake_timeout(),
                username: &session.username,
                permissions,
            };
            match tunnel.run(|repo| extras(Action::Pull.as_str(), repo, Vcs::Svn)) {
                Ok(outcome) => (outcome.exit_code, outcome.repo_name),
                Err(err) => {
                    tracing::error!("svn tunnel failed: {err}");
                    (EXIT_UNRECOGNIZED, None)
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_hg_command() {
        assert_eq!(
            parse_command("hg -R /teams/alpha serve --stdio"),
            Some(SshCommand::Hg {
                repo: "teams/alpha".to_owned()
            })
        );
        assert_eq!(parse_command("hg -R teams/alpha serve"), None);
        assert_eq!(parse_command("hg push"), None);
    }

    #[test]
    fn test_parse_git_command() {
        assert_eq!(
            parse_command("git-receive-pack '/teams/alpha'"),
            Some(SshCommand::Git {
                repo: "teams/alpha".to_owned(),
                mode: GitMode::ReceivePack
            })
        );
        assert_eq!(
            parse_command("git-upload-pack 'teams/alpha.git'"),
            Some(SshCommand::Git {
                repo: "teams/alpha".to_owned(),
                mode: GitMode::UploadPack
            })
        );
        // Unquoted paths are not accepted.
        assert_eq!(parse_command("git-upload-pack teams/alpha"), None);
        assert_eq!(parse_command("git-gc 'teams/alpha'"), None);
    }

    #[test]
    fn test_parse_svn_command() {
        assert_eq!(parse_command("svnserve -t"), Some(SshCommand::Svn));
        assert_eq!(parse_command("svnserve -d"), None);
    }

    #[test]
    fn test_parse_garbage() {
        for raw in ["", "rm -rf /", "scp file host:", "git clone x"] {
            assert_eq!(parse_command(raw), None, "{raw:?}");
        }
    }

    #[test]
    fn test_connection_info() {
        let info: ConnectionInfo = "10.0.0.9 52000 192.168.1.1 22".parse().unwrap();
        assert_eq!(info.client_ip, "10.0.0.9".parse::<IpAddr>().unwrap());
        assert_eq!(info.client_port, 52000);
        assert_eq!(info.server_port, 22);

        assert!("10.0.0.9 52000".parse::<ConnectionInfo>().is_err());
        assert!("not an address".parse::<ConnectionInfo>().is_err());
    }

    #[test]
    fn test_check_permissions() {
        let mut permissions = HashMap::new();
        permissions.insert("teams/alpha".to_owned(), PermissionLevel::Read);
        permissions.insert("teams/beta".to_owned(), PermissionLevel::Write);

        assert_eq!(check_permissions(&permissions, "u", "teams/alpha", Action::Pull), 0);
        assert_eq!(
            check_permissions(&permissions, "u", "teams/alpha", Action::Push),
            EXIT_PERMISSION_DENIED
        );
        assert_eq!(check_permissions(&permissions, "u", "teams/beta", Action::Push), 0);
        assert_eq!(
            check_permissions(&permissions, "u", "teams/gamma", Action::Pull),
            EXIT_PERMISSION_DENIED
        );
    }
}
