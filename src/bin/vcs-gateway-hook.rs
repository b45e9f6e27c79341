//! Hook shim registered inside generated VCS configuration (hgrc hooks,
//! svnserve hook scripts). It reads the operation extras from the
//! environment, calls the per-request callback daemon, and turns the
//! daemon's verdict into its own exit code.

use std::process;

use vcs_gateway::extras::OperationExtras;

fn main() {
    let method = match std::env::args().nth(1) {
        Some(method) => method,
        None => {
            eprintln!("usage: vcs-gateway-hook <method>");
            process::exit(1);
        }
    };
    process::exit(run(&method));
}

fn run(method: &str) -> i32 {
    let raw = match std::env::var(OperationExtras::ENV_VAR) {
        Ok(raw) => raw,
        Err(_) => {
            eprintln!("{} not set, refusing operation", OperationExtras::ENV_VAR);
            return 1;
        }
    };
    let extras: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(extras) => extras,
        Err(err) => {
            eprintln!("malformed operation extras: {err}");
            return 1;
        }
    };
    let Some(hooks_uri) = extras.get("hooks_uri").and_then(|v| v.as_str()) else {
        eprintln!("no callback daemon address in operation extras");
        return 1;
    };

    let url = format!("http://{hooks_uri}/");
    let response = ureq::post(&url).send_json(serde_json::json!({
        "method": method,
        "extras": extras,
    }));
    let verdict: serde_json::Value = match response {
        Ok(response) => match response.into_json() {
            Ok(verdict) => verdict,
            Err(err) => {
                eprintln!("malformed hook verdict: {err}");
                return 1;
            }
        },
        Err(err) => {
            eprintln!("hook callback failed: {err}");
            return 1;
        }
    };

    if let Some(output) = verdict.get("output").and_then(|v| v.as_str()) {
        eprintln!("{output}");
    }
    verdict
        .get("status")
        .and_then(|v| v.as_i64())
        .map(|status| status as i32)
        .unwrap_or(1)
}
