use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::Result;

/// Desktop browser UA; the playurl API rejects obviously scripted clients.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared client used for API calls and media downloads.
///
/// Only the connect phase is bounded: media bodies can legitimately take
/// longer than any fixed request timeout.
pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(4)
        .build()?;
    Ok(client)
}
