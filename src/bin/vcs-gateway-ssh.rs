//! SSH entry point, installed as the forced command for gateway-managed
//! authorized keys. sshd hands it the original command line and connection
//! metadata through the environment.

use std::path::PathBuf;
use std::process;

use vcs_gateway::config::Config;
use vcs_gateway::{logger, ssh};

struct Options {
    config: PathBuf,
    user: String,
    key_id: u64,
    shell: bool,
}

fn main() {
    // Stdout belongs to the tunneled protocol; logs go to stderr.
    logger::init_stderr().expect("Global logger hasn't already been set");

    let options = match parse_options() {
        Ok(options) => options,
        Err(err) => {
            tracing::error!("{err}");
            process::exit(ssh::EXIT_UNRECOGNIZED);
        }
    };
    process::exit(run(options));
}

fn run(options: Options) -> i32 {
    let config = match Config::load(&options.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("{err}");
            return 1;
        }
    };

    let command = std::env::var("SSH_ORIGINAL_COMMAND").unwrap_or_default();
    if command.is_empty() {
        if options.shell {
            tracing::info!("dropping to shell, no command given and shell is allowed");
            let err = exec_shell();
            tracing::error!("failed to execute shell: {err}");
            return 1;
        }
        tracing::error!("no command given");
        return ssh::EXIT_UNRECOGNIZED;
    }

    let connection = match std::env::var("SSH_CONNECTION")
        .map_err(|_| "SSH_CONNECTION not set".to_owned())
        .and_then(|raw| raw.parse())
    {
        Ok(connection) => connection,
        Err(err) => {
            tracing::error!("{err}");
            return ssh::EXIT_UNRECOGNIZED;
        }
    };

    let session = ssh::Session {
        command,
        username: options.user,
        key_id: options.key_id,
        connection,
    };
    tracing::debug!(
        "user `{}` key {} command `{}`",
        session.username,
        session.key_id,
        session.command
    );

    ssh::serve(&config, &session)
}

fn exec_shell() -> std::io::Error {
    use std::os::unix::process::CommandExt as _;

    process::Command::new("/bin/bash").arg("-l").exec()
}

fn parse_options() -> anyhow::Result<Options> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut config = None;
    let mut user = None;
    let mut key_id = None;
    let mut shell = false;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("config") | Short('c') => {
                let path: String = parser.value()?.parse()?;
                config = Some(path.into());
            }
            Long("user") => {
                user = Some(parser.value()?.parse()?);
            }
            Long("key-id") => {
                key_id = Some(parser.value()?.parse()?);
            }
            Long("shell") | Short('s') => {
                shell = true;
            }
            Long("help") | Short('h') => {
                println!(
                    "usage: vcs-gateway-ssh --config <path> --user <name> --key-id <id> [--shell]"
                );
                process::exit(0);
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    let missing = |name: &str| anyhow::anyhow!("missing required option `{name}`");
    Ok(Options {
        config: config.ok_or_else(|| missing("--config"))?,
        user: user.ok_or_else(|| missing("--user"))?,
        key_id: key_id.ok_or_else(|| missing("--key-id"))?,
        shell,
    })
}
