use crate::host::Host;
use crate::remote::SessionFactory;
use crate::Result;
use tracing::{info, warn};

const KEY_PATH: &str = "/root/.ssh/id_ed25519";

/// Outcome of a bulk trust run.
#[derive(Debug, Default)]
pub struct TrustReport {
    pub pairs_established: usize,
    /// (source, target, reason) for pairs that could not be set up.
    pub failures: Vec<(String, String, String)>,
}

/// Install every hypervisor's public key on every other hypervisor so
/// migrations can push data host-to-host.
///
/// Pairs are processed serially on purpose: at fleet scale this is
/// O(N^2) connection attempts, and running them concurrently would hit
/// every host with simultaneous sessions. Slow and steady is the
/// intended backpressure here; do not parallelize this loop.
pub async fn establish_fleet_trust(
    sessions: &dyn SessionFactory,
    hosts: &[Host],
) -> Result<TrustReport> {
    let mut report = TrustReport::default();

    for source in hosts {
        let source_session = match sessions.connect(source).await {
            Ok(session) => session,
            Err(e) => {
                warn!(host = %source.name, error = %e, "skipping unreachable source");
                for target in hosts.iter().filter(|t| t.name != source.name) {
                    report
                        .failures
                        .push((source.name.clone(), target.name.clone(), e.to_string()));
                }
                continue;
            }
        };

        let pubkey = match source_session
            .exec(&format!(
                "test -f {key} || ssh-keygen -t ed25519 -N '' -f {key} -q; cat {key}.pub",
                key = KEY_PATH
            ))
            .await
        {
            Ok(output) => output.trim().to_string(),
            Err(e) => {
                warn!(host = %source.name, error = %e, "cannot obtain public key");
                let _ = source_session.disconnect().await;
                for target in hosts.iter().filter(|t| t.name != source.name) {
                    report
                        .failures
                        .push((source.name.clone(), target.name.clone(), e.to_string()));
                }
                continue;
            }
        };
        let _ = source_session.disconnect().await;

        for target in hosts.iter().filter(|t| t.name != source.name) {
            match install_key(sessions, target, &pubkey).await {
                Ok(()) => {
                    info!(source = %source.name, target = %target.name, "trust established");
                    report.pairs_established += 1;
                }
                Err(e) => {
                    warn!(source = %source.name, target = %target.name, error = %e, "trust setup failed");
                    report
                        .failures
                        .push((source.name.clone(), target.name.clone(), e.to_string()));
                }
            }
        }
    }
    Ok(report)
}

async fn install_key(
    sessions: &dyn SessionFactory,
    target: &Host,
    pubkey: &str,
) -> Result<()> {
    let session = sessions.connect(target).await?;
    let result = session
        .exec(&format!(
            "mkdir -p ~/.ssh && chmod 700 ~/.ssh && \
             grep -qxF '{key}' ~/.ssh/authorized_keys 2>/dev/null || \
             (echo '{key}' >> ~/.ssh/authorized_keys && chmod 600 ~/.ssh/authorized_keys)",
            key = pubkey
        ))
        .await
        .map(|_| ());
    let _ = session.disconnect().await;
    result
}
