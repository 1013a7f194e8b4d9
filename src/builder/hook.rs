// Post-receive hook endpoint: a process-local TCP listener that takes
// newline-terminated `account/repo/branch` keys and queues a build for
// each. The git hook side is a one-line netcat.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::Builder;

pub async fn listen(host: &str, port: u16, builder: Arc<Builder>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "updates listener ready");

    loop {
        let (socket, peer) = listener.accept().await?;
        let builder = Arc::clone(&builder);
        tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_key(&line) {
                        Some((account, repo, branch)) => {
                            debug!(%peer, account, repo, branch, "hook notification");
                            builder.request(account, repo, branch);
                        }
                        None => warn!(%peer, line, "malformed hook notification"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%peer, %err, "hook connection error");
                        break;
                    }
                }
            }
        });
    }
}

fn parse_key(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.trim().splitn(3, '/');
    let account = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts.next().filter(|s| !s.is_empty())?;
    let branch = parts.next().filter(|s| !s.is_empty())?;
    Some((account, repo, branch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_keys() {
        assert_eq!(parse_key("acme/site/master\n"), Some(("acme", "site", "master")));
        assert_eq!(
            parse_key("a/b/feature/nested"),
            Some(("a", "b", "feature/nested"))
        );
        assert_eq!(parse_key("acme/site"), None);
        assert_eq!(parse_key(""), None);
        assert_eq!(parse_key("//"), None);
    }
}
