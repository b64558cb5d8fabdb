//! Minimal concrete implementation of the admission callback contract the
//! acceptor depends on. Real deployments are expected to swap this for a
//! dedicated transport-level allow/block system; this gives the acceptor
//! something real to call so it runs standalone.

use std::net::IpAddr;

use anyhow::{Context, Result};
use ipnet::IpNet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionList {
    allow: Vec<IpNet>,
    block: Vec<IpNet>,
}

impl AdmissionList {
    pub fn parse(
        allowlist: &[String],
        blocklist: &[String],
    ) -> Result<Self> {
        let allow = allowlist
            .iter()
            .map(|cidr| parse_cidr(cidr))
            .collect::<Result<Vec<_>>>()
            .context("failed to parse ip_allowlist")?;
        let block = blocklist
            .iter()
            .map(|cidr| parse_cidr(cidr))
            .collect::<Result<Vec<_>>>()
            .context("failed to parse ip_blocklist")?;
        Ok(Self { allow, block })
    }

    /// Block takes precedence over allow. An empty allowlist means "allow
    /// unless blocked".
    pub fn check(
        &self,
        ip: IpAddr,
    ) -> Verdict {
        if self.block.iter().any(|net| net.contains(&ip)) {
            return Verdict::Deny;
        }
        if self.allow.is_empty() || self.allow.iter().any(|net| net.contains(&ip)) {
            return Verdict::Allow;
        }
        Verdict::Deny
    }
}

fn parse_cidr(raw: &str) -> Result<IpNet> {
    let trimmed = raw.trim();
    if trimmed.contains('/') {
        trimmed.parse::<IpNet>().with_context(|| format!("invalid CIDR: {trimmed}"))
    } else {
        let ip: IpAddr =
            trimmed.parse().with_context(|| format!("invalid IP: {trimmed}"))?;
        Ok(IpNet::from(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lists_allow_everyone() {
        let list = AdmissionList::parse(&[], &[]).unwrap();
        assert_eq!(list.check("1.2.3.4".parse().unwrap()), Verdict::Allow);
    }

    #[test]
    fn block_takes_precedence_over_allow() {
        let list = AdmissionList::parse(
            &["10.0.0.0/8".to_string()],
            &["10.0.0.5".to_string()],
        )
        .unwrap();
        assert_eq!(list.check("10.0.0.5".parse().unwrap()), Verdict::Deny);
        assert_eq!(list.check("10.0.0.6".parse().unwrap()), Verdict::Allow);
    }

    #[test]
    fn nonempty_allowlist_denies_unlisted() {
        let list = AdmissionList::parse(&["192.168.1.0/24".to_string()], &[]).unwrap();
        assert_eq!(list.check("192.168.1.10".parse().unwrap()), Verdict::Allow);
        assert_eq!(list.check("8.8.8.8".parse().unwrap()), Verdict::Deny);
    }
}
