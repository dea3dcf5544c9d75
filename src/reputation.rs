use anyhow::{anyhow, Result};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Sender reputation, 0 (worst) to 255 (best).
#[allow(async_fn_in_trait)]
pub trait Reputation {
    async fn reputation(&self, ip: Ipv4Addr) -> Result<u8>;
}

/// DNS name queried for `ip`: octets reversed under `domain`.
pub fn lookup_name(ip: Ipv4Addr, domain: &str) -> String {
    let octets = ip.octets();
    format!(
        "{}.{}.{}.{}.{}",
        octets[3],
        octets[2],
        octets[1],
        octets[0],
        domain.trim_matches('.')
    )
}

/// Score carried in the answers: last octet of the last IPv4 answer.
pub fn score_from_answers<I: IntoIterator<Item = IpAddr>>(answers: I) -> Option<u8> {
    answers
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4.octets()[3]),
            IpAddr::V6(_) => None,
        })
        .last()
}

/// Sender Score style lookup through the system resolver.
pub struct SenderScoreResolver {
    resolver: TokioAsyncResolver,
    domain: String,
    timeout: Duration,
}

impl SenderScoreResolver {
    pub fn from_system_conf(domain: &str, timeout: Duration) -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self {
            resolver,
            domain: domain.to_string(),
            timeout,
        })
    }
}

impl Reputation for SenderScoreResolver {
    async fn reputation(&self, ip: Ipv4Addr) -> Result<u8> {
        let name = lookup_name(ip, &self.domain);
        log::debug!("Reputation lookup: {name}");

        let answers = match tokio::time::timeout(self.timeout, self.resolver.lookup_ip(name.as_str()))
            .await
        {
            Ok(Ok(answers)) => answers,
            Ok(Err(e)) => return Err(anyhow!("DNS query for {name} failed: {e}")),
            Err(_) => return Err(anyhow!("DNS query for {name} timed out")),
        };

        let score = score_from_answers(answers.iter())
            .ok_or_else(|| anyhow!("DNS query for {name} returned no IPv4 address"))?;
        log::debug!("Reputation for {ip} is {score}");
        Ok(score)
    }
}
