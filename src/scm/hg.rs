use axum::http::HeaderMap;

use crate::config::Config;
use crate::extras::OperationExtras;
use crate::scm::{Action, RequestMeta};

/// Maps a Mercurial wire command to the action it performs. Unknown
/// commands are treated as potentially mutating.
fn command_action(cmd: &str) -> Option<Action> {
    let action = match cmd {
        "changegroup" | "changegroupsubset" | "getbundle" | "stream_out" | "listkeys"
        | "between" | "branchmap" | "branches" | "clonebundles" | "capabilities"
        | "debugwireargs" | "heads" | "lookup" | "hello" | "known" => Action::Pull,

        // largefiles
        "getlfile" | "statlfile" | "lheads" => Action::Pull,
        "putlfile" => Action::Push,

        // evolve
        "evoext_obshashrange_v1" | "evoext_obshash" | "evoext_obshash1" => Action::Pull,

        "unbundle" | "pushkey" => Action::Push,

        _ => return None,
    };
    Some(action)
}

/// Repository name addressed by a Mercurial URL: the path with the leading
/// slash and any trailing slashes removed.
pub fn repo_name(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).trim_end_matches('/').to_owned()
}

/// Collects the batch sub-commands spread over `X-HgArg-N` headers.
///
/// The headers are URL-encoded chunks that concatenate to
/// `cmds=<cmd> <args>;<cmd> <args>;...`.
fn batch_commands(headers: &HeaderMap) -> Vec<String> {
    let mut joined = String::new();
    for i in 1.. {
        let Some(value) = headers
            .get(format!("X-HgArg-{i}"))
            .and_then(|h| h.to_str().ok())
        else {
            break;
        };
        // The chunks are urlencoded; `+` stands for a space.
        let decoded: String = url::form_urlencoded::parse(format!("x={value}").as_bytes())
            .next()
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        joined.push_str(&decoded);
    }
    let joined = joined.strip_prefix("cmds=").unwrap_or(&joined);
    joined
        .split(';')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_owned())
        .collect()
}

/// Classification of `cmd=batch`: every `key args` pair is mapped through
/// the command table; a single push-classified sub-command makes the whole
/// batch a push. Malformed or empty batches count as push.
fn batch_action(headers: &HeaderMap) -> Action {
    let mut actions = Vec::new();
    for pair in batch_commands(headers) {
        let Some((cmd, _args)) = pair.split_once(' ') else {
            continue;
        };
        actions.push(command_action(cmd).unwrap_or(Action::Push));
    }
    if actions.is_empty() {
        return Action::Push;
    }
    if actions.contains(&Action::Push) {
        Action::Push
    } else {
        Action::Pull
    }
}

/// Maps a Mercurial request to a pull or push. Unknown or missing `cmd`
/// values default to push.
pub fn action(meta: &RequestMeta) -> Action {
    let Some(cmd) = meta.query_param("cmd") else {
        return Action::Push;
    };
    if cmd == "batch" {
        return batch_action(meta.headers);
    }
    command_action(&cmd).unwrap_or(Action::Push)
}

/// Mercurial hooks see every sub-transaction of a push (bookmarks, phases,
/// obsolescence markers); locking must not be enforced on key listing.
pub fn check_locking(query: &str) -> bool {
    query != "cmd=listkeys"
}

pub fn create_config(extras: &mut OperationExtras, _config: &Config) {
    // The execution service reads everything it needs from the extras.
    extras.set("hg_web_push_ssl", false);
}

#[cfg(test)]
mod test {
    use axum::http::{HeaderMap, Method};
    use pretty_assertions::assert_eq;

    use super::*;

    fn classify(query: &str, headers: &HeaderMap) -> Action {
        let method = Method::GET;
        action(&RequestMeta {
            method: &method,
            path: "/project",
            query,
            headers,
        })
    }

    #[test]
    fn test_plain_commands() {
        let headers = HeaderMap::new();
        assert_eq!(classify("cmd=getbundle", &headers), Action::Pull);
        assert_eq!(classify("cmd=listkeys", &headers), Action::Pull);
        assert_eq!(classify("cmd=unbundle", &headers), Action::Push);
        assert_eq!(classify("cmd=pushkey", &headers), Action::Push);
        // Unknown commands fall closed.
        assert_eq!(classify("cmd=fancynewthing", &headers), Action::Push);
        assert_eq!(classify("", &headers), Action::Push);
    }

    #[test]
    fn test_batch_all_pulls() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-HgArg-1",
            "cmds=heads+%3Bknown+nodes%3D".parse().unwrap(),
        );
        assert_eq!(classify("cmd=batch", &headers), Action::Pull);
    }

    #[test]
    fn test_batch_with_push_subcommand() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-HgArg-1",
            "cmds=heads+%3Bpushkey+namespace%3Dbookmarks".parse().unwrap(),
        );
        assert_eq!(classify("cmd=batch", &headers), Action::Push);
    }

    #[test]
    fn test_batch_split_across_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-HgArg-1", "cmds=known+nodes%3Dabc".parse().unwrap());
        headers.insert("X-HgArg-2", "%3Bheads+".parse().unwrap());
        assert_eq!(classify("cmd=batch", &headers), Action::Pull);
    }

    #[test]
    fn test_batch_empty_or_malformed_defaults_to_push() {
        let headers = HeaderMap::new();
        assert_eq!(classify("cmd=batch", &headers), Action::Push);

        let mut garbled = HeaderMap::new();
        garbled.insert("X-HgArg-1", "nonsense-without-separator".parse().unwrap());
        assert_eq!(classify("cmd=batch", &garbled), Action::Push);
    }

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name("/teams/alpha/"), "teams/alpha");
        assert_eq!(repo_name("/alpha"), "alpha");
    }

    #[test]
    fn test_check_locking() {
        assert!(!check_locking("cmd=listkeys"));
        assert!(check_locking("cmd=unbundle"));
    }
}
