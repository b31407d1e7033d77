use crate::{cli::globals::GlobalArgs, vault};
use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};
use secrecy::SecretString;
use std::future::Future;
use tokio::{
    sync::mpsc,
    time::{Duration, sleep},
};
use tracing::{debug, error, info, instrument, warn};

const ATTEMPTS: u32 = 3;

/// Keep renewing with `renew` until it fails `ATTEMPTS` times in a row, then
/// signal shutdown through `tx`.
async fn renew_loop<F, Fut>(what: &'static str, tx: mpsc::UnboundedSender<()>, mut renew: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let mut rng = StdRng::from_entropy();

    loop {
        let mut next = Duration::default();

        for attempt in 1..=ATTEMPTS {
            let backoff_time = 2u64.pow(attempt - 1);

            if attempt > 1 {
                warn!("Backing off for {} seconds", backoff_time);
                sleep(Duration::from_secs(backoff_time)).await;
            }

            match renew().await {
                Ok(lease_duration) => {
                    let factor = rng.gen_range(70..90);
                    next = Duration::from_secs(lease_duration * factor / 100);
                    info!(
                        lease_duration,
                        next_renew_seconds = next.as_secs(),
                        "Vault {what} renewed"
                    );
                    break;
                }
                Err(e) => {
                    error!("Failed to renew {what}: {e}");

                    if attempt == ATTEMPTS {
                        error!("Failed to renew {what} after {ATTEMPTS} attempts: {e}");
                        let _ = tx.send(());
                        return;
                    }
                }
            }
        }

        debug!("Will renew {what} in {} seconds", next.as_secs());
        sleep(next).await;
    }
}

/// Spawn the Vault token and database lease renewal tasks.
/// # Errors
/// Currently infallible; kept fallible for callers composing startup steps.
#[instrument(skip(globals, tx))]
pub async fn try_renew(globals: &GlobalArgs, tx: mpsc::UnboundedSender<()>) -> Result<()> {
    tokio::spawn({
        let url = globals.vault_url.clone();
        let token: SecretString = globals.vault_token.clone();
        let tx = tx.clone();

        async move {
            renew_loop("token", tx, || vault::renew_token(&url, &token, None)).await;
        }
    });

    if globals.vault_db_lease_id.is_empty() {
        debug!("no database lease to renew");
        return Ok(());
    }

    tokio::spawn({
        let url = globals.vault_url.clone();
        let token = globals.vault_token.clone();
        let lease_id = globals.vault_db_lease_id.clone();
        let lease_duration = globals.vault_db_lease_duration;

        async move {
            renew_loop("DB lease", tx, || {
                vault::renew_db_token(&url, &token, &lease_id, lease_duration)
            })
            .await;
        }
    });

    Ok(())
}
