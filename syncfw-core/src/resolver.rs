use crate::types::ThreatKind;
use anyhow::Context;
use hickory_resolver::config::LookupIpStrategy;
use hickory_resolver::TokioResolver;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tokio::runtime::Handle;

/// Forward and reverse lookups for threat identifiers. Implementations must be safe to
/// call from many pool threads at once.
pub trait Resolver: Send + Sync {
  /// Addresses a domain resolves to.
  fn forward(&self, domain: &str) -> anyhow::Result<Vec<String>>;

  /// Host names an address maps back to.
  fn reverse(&self, ip: &str) -> anyhow::Result<Vec<String>>;
}

/// Resolves one identifier the way its kind calls for. Lookup errors are not errors for
/// the cycle: the identifier simply ends up with no related addresses.
pub fn resolve(resolver: &dyn Resolver, identifier: &str) -> Vec<String> {
  let kind = ThreatKind::classify(identifier);
  let looked_up = match kind {
    ThreatKind::Domain => resolver.forward(identifier),
    ThreatKind::Ip => resolver.reverse(identifier),
  };

  match looked_up {
    Ok(found) => found
      .into_iter()
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect(),
    Err(e) => {
      tracing::debug!(identifier = %identifier, kind = %kind, error = %e, "lookup failed");
      Vec::new()
    }
  }
}

/// System resolver backed by hickory. Lookups are driven on the worker pool's runtime
/// from its blocking threads, so the resolver's connections live as long as the pool.
pub struct DnsResolver {
  handle: Handle,
  inner: TokioResolver,
}

impl DnsResolver {
  pub fn from_system_conf(handle: Handle) -> anyhow::Result<Self> {
    let inner = {
      let _guard = handle.enter();
      let mut builder = TokioResolver::builder_tokio().context("read system resolver config")?;
      builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
      builder.build()
    };

    Ok(Self { handle, inner })
  }
}

impl Resolver for DnsResolver {
  fn forward(&self, domain: &str) -> anyhow::Result<Vec<String>> {
    let lookup = self
      .handle
      .block_on(self.inner.lookup_ip(domain))
      .with_context(|| format!("resolve {domain}"))?;
    Ok(lookup.iter().map(|ip| ip.to_string()).collect())
  }

  fn reverse(&self, ip: &str) -> anyhow::Result<Vec<String>> {
    let addr: IpAddr = ip.parse().with_context(|| format!("parse address {ip}"))?;
    let lookup = self
      .handle
      .block_on(self.inner.reverse_lookup(addr))
      .with_context(|| format!("reverse lookup {ip}"))?;
    Ok(
      lookup
        .iter()
        .map(|name| name.to_string().trim_end_matches('.').to_string())
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::ScriptedResolver;

  #[test]
  fn domains_go_forward_and_ips_go_reverse() {
    let resolver = ScriptedResolver::default()
      .answer("bad.example", &["1.2.3.4"])
      .answer("5.6.7.8", &["host.example"]);

    assert_eq!(resolve(&resolver, "bad.example"), vec!["1.2.3.4".to_string()]);
    assert_eq!(resolve(&resolver, "5.6.7.8"), vec!["host.example".to_string()]);
    assert_eq!(resolver.forward_calls(), vec!["bad.example".to_string()]);
    assert_eq!(resolver.reverse_calls(), vec!["5.6.7.8".to_string()]);
  }

  #[test]
  fn answers_are_sorted_and_deduplicated() {
    let resolver =
      ScriptedResolver::default().answer("multi.example", &["9.9.9.9", "1.1.1.1", "9.9.9.9"]);
    assert_eq!(
      resolve(&resolver, "multi.example"),
      vec!["1.1.1.1".to_string(), "9.9.9.9".to_string()]
    );
  }

  #[test]
  fn lookup_failure_yields_no_addresses() {
    let resolver = ScriptedResolver::default();
    assert!(resolve(&resolver, "unknown.example").is_empty());
  }
}
