use std::num::NonZeroUsize;
use std::process;

use vcs_gateway as gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = parse_options()?;

    gateway::logger::init().expect("Global logger hasn't already been set");
    tracing::info!("version {}", env!("CARGO_PKG_VERSION"));

    match gateway::run(options).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("Fatal: {:#}", err);
            process::exit(1);
        }
    }
    Ok(())
}

/// Parse command-line arguments into gateway options.
fn parse_options() -> anyhow::Result<gateway::Options> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen = None;
    let mut config = None;
    let mut cache = Some(gateway::perms::DEFAULT_CACHE_SIZE);

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                let addr = parser.value()?.parse()?;
                listen = Some(addr);
            }
            Long("config") | Short('c') => {
                let path: String = parser.value()?.parse()?;
                config = Some(path.into());
            }
            Long("cache") => {
                let size = parser.value()?.parse()?;
                cache = NonZeroUsize::new(size);
            }
            Long("help") | Short('h') => {
                println!("usage: vcs-gatewayd --config <path> [--listen <addr>] [--cache <size>]..");
                process::exit(0);
            }
            _ => return Err(arg.unexpected().into()),
        }
    }
    Ok(gateway::Options {
        listen: listen.unwrap_or_else(|| ([0, 0, 0, 0], 8080).into()),
        config: config.ok_or_else(|| anyhow::anyhow!("missing required option `--config`"))?,
        cache,
    })
}
