use crate::concurrency::CancellationToken;
use crate::secrets::redact;
use crate::CoreError;
use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// An expanded ready condition: what to poll and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyTarget {
    pub dns: Option<String>,
    pub url: Option<String>,
    pub wait: Duration,
    /// Values masked wherever the target is logged or reported.
    pub secrets: Vec<String>,
}

impl ReadyTarget {
    fn label(&self) -> String {
        let label = match (&self.dns, &self.url) {
            (Some(d), Some(u)) => format!("{d} / {u}"),
            (Some(d), None) => d.clone(),
            (None, Some(u)) => u.clone(),
            (None, None) => "ready condition".to_owned(),
        };
        redact(&label, &self.secrets)
    }
}

fn dns_resolves(name: &str) -> bool {
    let target = if name.contains(':') {
        name.to_owned()
    } else {
        format!("{name}:0")
    };
    target
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

/// Any HTTP status in [100, 500) counts as ready.
fn url_responds(agent: &ureq::Agent, url: &str) -> bool {
    match agent.get(url).call() {
        Ok(resp) => (100..500).contains(&resp.status().as_u16()),
        Err(ureq::Error::StatusCode(code)) => (100..500).contains(&code),
        Err(e) => {
            debug!("{url} not responding: {e}");
            false
        }
    }
}

/// Poll `target` every `interval` until each configured check passes.
///
/// Fails with [`CoreError::ReadyTimeout`] once the wait budget is spent and
/// with [`CoreError::Cancelled`] when `token` is cancelled while waiting.
pub fn wait_ready(
    target: &ReadyTarget,
    interval: Duration,
    token: &CancellationToken,
) -> Result<(), CoreError> {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(interval.max(Duration::from_secs(1))))
        .build();
    let agent = ureq::Agent::new_with_config(config);
    let started = Instant::now();
    let deadline = started + target.wait;
    let mut dns_ok = target.dns.is_none();
    let mut url_ok = target.url.is_none();

    info!("waiting for {}", target.label());
    loop {
        if !dns_ok {
            dns_ok = target.dns.as_deref().is_some_and(dns_resolves);
        }
        if dns_ok && !url_ok {
            url_ok = target
                .url
                .as_deref()
                .is_some_and(|u| url_responds(&agent, u));
        }
        if dns_ok && url_ok {
            debug!("{} ready after {:?}", target.label(), started.elapsed());
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(CoreError::ReadyTimeout {
                target: target.label(),
                waited_secs: target.wait.as_secs(),
            });
        }
        if token.wait_timeout(interval.min(deadline - now)) {
            return Err(CoreError::Cancelled);
        }
    }
}
