//! PUSH_REPLY parsing
//!
//! A reply is a comma-separated list of options following the literal
//! `PUSH_REPLY`. Servers split long replies across messages, every message
//! but the last carries `push-continuation 2`.

use crate::config::{Cipher, CompressionAlgorithm, CompressionFraming, Digest};
use crate::error::{Result, VpnError};
use ipnet::{Ipv4Net, Ipv6Net};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

const PREFIX: &str = "PUSH_REPLY";
const CONTINUATION: &str = "push-continuation";
const HOST_MASK: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Tunnel address and default gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSettings<N, A> {
    pub subnet: N,
    pub default_gateway: Option<A>,
}

pub type Ipv4Settings = IpSettings<Ipv4Net, Ipv4Addr>;
pub type Ipv6Settings = IpSettings<Ipv6Net, Ipv6Addr>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<N, A> {
    pub destination: N,
    pub gateway: A,
}

pub type Route4 = Route<Ipv4Net, Ipv4Addr>;
pub type Route6 = Route<Ipv6Net, Ipv6Addr>;

/// Traffic redirected through the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoutingPolicy {
    Ipv4,
    Ipv6,
    BlockLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

/// Options pushed by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOptions {
    pub cipher: Option<Cipher>,
    pub digest: Option<Digest>,
    pub compression_framing: Option<CompressionFraming>,
    pub compression_algorithm: Option<CompressionAlgorithm>,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub renegotiates_after: Option<Duration>,
    pub auth_token: Option<String>,
    pub peer_id: Option<u32>,
    pub ipv4: Option<Ipv4Settings>,
    pub ipv6: Option<Ipv6Settings>,
    pub routes4: Vec<Route4>,
    pub routes6: Vec<Route6>,
    pub dns_servers: Vec<IpAddr>,
    pub dns_domain: Option<String>,
    pub search_domains: Vec<String>,
    pub http_proxy: Option<ProxyEndpoint>,
    pub https_proxy: Option<ProxyEndpoint>,
    pub proxy_auto_config_url: Option<String>,
    pub proxy_bypass_domains: Vec<String>,
    pub routing_policies: Option<Vec<RoutingPolicy>>,
    /// `route-nopull`: ignore pushed routes, DNS and proxy
    pub no_pull: bool,
}

/// A parsed PUSH_REPLY
#[derive(Clone, PartialEq, Eq)]
pub struct PushReply {
    pub original: String,
    pub options: PushOptions,
}

/// Remove the continuation marker, leaving a message that can be joined
/// with the next fragment
pub fn strip_continuation(message: &str) -> String {
    message
        .split(',')
        .filter(|item| !item.trim_start().starts_with(CONTINUATION))
        .collect::<Vec<_>>()
        .join(",")
}

/// Append a fragment to the message collected so far
pub fn join_fragments(previous: &str, fragment: &str) -> String {
    let fragment = fragment
        .strip_prefix(PREFIX)
        .map(|rest| rest.trim_start_matches(','))
        .unwrap_or(fragment);
    format!("{previous},{fragment}")
}

fn malformed(message: impl Into<String>) -> VpnError {
    VpnError::MalformedOption(message.into())
}

fn parse_addr<T: std::str::FromStr>(value: &str, option: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| malformed(format!("{option}: invalid address {value}")))
}

fn subnet4(address: &str, mask: &str, option: &str) -> Result<Ipv4Net> {
    let address: Ipv4Addr = parse_addr(address, option)?;
    let mask: Ipv4Addr = parse_addr(mask, option)?;
    let prefix = ipnet::ipv4_mask_to_prefix(mask)
        .map_err(|_| malformed(format!("{option}: invalid netmask {mask}")))?;
    Ipv4Net::new(address, prefix).map_err(|_| malformed(format!("{option}: invalid prefix")))
}

fn subnet6(value: &str, option: &str) -> Result<Ipv6Net> {
    let (address, prefix) = value
        .split_once('/')
        .ok_or_else(|| malformed(format!("{option}: address must have a /prefix")))?;
    let address: Ipv6Addr = parse_addr(address, option)?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| malformed(format!("{option}: prefix must be an 8-bit number")))?;
    Ipv6Net::new(address, prefix).map_err(|_| malformed(format!("{option}: invalid prefix")))
}

fn seconds(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_secs)
}

/// Option arguments collected before the routing settings are resolved
#[derive(Default)]
struct Pending {
    topology: Option<String>,
    ifconfig4: Option<Vec<String>>,
    ifconfig6: Option<Vec<String>>,
    gateway4: Option<Vec<String>>,
    routes4: Vec<(String, String, Option<String>)>,
    routes6: Vec<(String, Option<String>)>,
    redirect_gateway: Option<Vec<String>>,
}

fn gateway(argument: Option<&String>) -> Option<String> {
    argument.filter(|g| g.as_str() != "vpn_gateway").cloned()
}

impl PushReply {
    /// Parse a complete reply, `None` if the message is not a PUSH_REPLY
    ///
    /// Fails with [`VpnError::ContinuationPushReply`] when more fragments
    /// are expected.
    pub fn parse(message: &str) -> Result<Option<Self>> {
        let Some(body) = message.strip_prefix(PREFIX) else {
            return Ok(None);
        };

        let mut options = PushOptions::default();
        let mut pending = Pending::default();
        for item in body.split(',') {
            let components: Vec<&str> = item.split_whitespace().collect();
            let Some((&name, args)) = components.split_first() else {
                continue;
            };
            Self::put_option(&mut options, &mut pending, name, args)?;
        }
        Self::resolve_routing(&mut options, pending)?;

        Ok(Some(Self {
            original: message.to_string(),
            options,
        }))
    }

    fn put_option(options: &mut PushOptions, pending: &mut Pending, name: &str, args: &[&str]) -> Result<()> {
        let owned = || args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        match (name, args) {
            (CONTINUATION, [marker]) if *marker == "2" => return Err(VpnError::ContinuationPushReply),
            ("cipher", [value]) => options.cipher = value.parse().ok(),
            ("auth", [value]) => {
                options.digest = Some(value.parse().map_err(|_| malformed(format!("auth {value}")))?)
            }
            ("comp-lzo", _) => {
                options.compression_framing = Some(CompressionFraming::CompLzo);
                options.compression_algorithm = Some(if args.last() == Some(&"no") {
                    CompressionAlgorithm::Disabled
                } else {
                    CompressionAlgorithm::Lzo
                });
            }
            ("compress", _) => {
                options.compression_framing = Some(CompressionFraming::Compress);
                options.compression_algorithm = Some(match args {
                    ["lzo"] => CompressionAlgorithm::Lzo,
                    ["stub"] | [] => CompressionAlgorithm::Disabled,
                    ["stub-v2"] => {
                        options.compression_framing = Some(CompressionFraming::CompressV2);
                        CompressionAlgorithm::Disabled
                    }
                    [_] => CompressionAlgorithm::Other,
                    _ => CompressionAlgorithm::Disabled,
                });
            }
            ("ping", [value]) => options.keep_alive_interval = seconds(value),
            ("ping-restart", [value]) => options.keep_alive_timeout = seconds(value),
            ("keepalive", [ping, restart]) => {
                options.keep_alive_interval = seconds(ping);
                options.keep_alive_timeout = seconds(restart);
            }
            ("reneg-sec", [value]) => options.renegotiates_after = seconds(value),
            ("auth-token", [value]) => options.auth_token = Some(value.to_string()),
            ("peer-id", [value]) => options.peer_id = value.parse().ok(),
            ("topology", [value]) => pending.topology = Some(value.to_string()),
            ("ifconfig", [_, ..]) => pending.ifconfig4 = Some(owned()),
            ("ifconfig-ipv6", [_, ..]) => pending.ifconfig6 = Some(owned()),
            ("route-gateway", _) => pending.gateway4 = Some(owned()),
            ("route", [address, rest @ ..]) => pending.routes4.push((
                address.to_string(),
                rest.first().map_or_else(|| HOST_MASK.to_string(), |m| m.to_string()),
                gateway(owned().get(2)),
            )),
            ("route-ipv6", [destination, rest @ ..]) => {
                pending.routes6.push((destination.to_string(), gateway(rest.first().map(|g| g.to_string()).as_ref())))
            }
            ("dhcp-option", ["DNS" | "DNS6", server]) => {
                options.dns_servers.push(parse_addr(server, "dhcp-option DNS")?)
            }
            ("dhcp-option", ["DOMAIN", domain]) => options.dns_domain = Some(domain.to_string()),
            ("dhcp-option", ["DOMAIN-SEARCH", domain]) => options.search_domains.push(domain.to_string()),
            ("dhcp-option", ["PROXY_AUTO_CONFIG_URL", url]) => {
                options.proxy_auto_config_url = Some(url.to_string())
            }
            ("dhcp-option", [kind @ ("PROXY_HTTP" | "PROXY_HTTPS"), host, port]) => {
                let port = port
                    .parse()
                    .map_err(|_| malformed(format!("dhcp-option {kind}: invalid port")))?;
                let proxy = Some(ProxyEndpoint {
                    host: host.to_string(),
                    port,
                });
                if *kind == "PROXY_HTTP" {
                    options.http_proxy = proxy;
                } else {
                    options.https_proxy = proxy;
                }
            }
            ("dhcp-option", ["PROXY_BYPASS", domains @ ..]) => {
                options.proxy_bypass_domains = domains.iter().map(|d| d.to_string()).collect()
            }
            ("redirect-gateway", _) => pending.redirect_gateway = Some(owned()),
            ("route-nopull", _) => options.no_pull = true,
            _ => {}
        }
        Ok(())
    }

    fn resolve_routing(options: &mut PushOptions, pending: Pending) -> Result<()> {
        let mut default_gateway4 = None;
        if let Some(args) = &pending.ifconfig4 {
            let [address, second] = args.as_slice() else {
                return Err(malformed("ifconfig takes 2 arguments"));
            };
            let (subnet, gateway) = match pending.topology.as_deref() {
                Some("subnet") => {
                    let Some([gateway]) = pending.gateway4.as_deref() else {
                        return Err(malformed("route-gateway takes 1 argument"));
                    };
                    (subnet4(address, second, "ifconfig")?, gateway.clone())
                }
                // net30 and p2p: the second argument is the remote endpoint
                _ => (subnet4(address, &HOST_MASK.to_string(), "ifconfig")?, second.clone()),
            };
            default_gateway4 = gateway.parse::<Ipv4Addr>().ok();
            options.ipv4 = Some(IpSettings {
                subnet,
                default_gateway: default_gateway4,
            });
        }

        for (address, mask, gateway) in &pending.routes4 {
            let destination = subnet4(address, mask, "route")?;
            let gateway = match gateway {
                Some(gateway) => Some(parse_addr(gateway, "route")?),
                None => default_gateway4,
            };
            if let Some(gateway) = gateway {
                options.routes4.push(Route {
                    destination,
                    gateway,
                });
            }
        }

        let mut default_gateway6 = None;
        if let Some(args) = &pending.ifconfig6 {
            let [address, gateway] = args.as_slice() else {
                return Err(malformed("ifconfig-ipv6 takes 2 arguments"));
            };
            default_gateway6 = gateway.parse::<Ipv6Addr>().ok();
            options.ipv6 = Some(IpSettings {
                subnet: subnet6(address, "ifconfig-ipv6")?,
                default_gateway: default_gateway6,
            });
        }

        for (destination, gateway) in &pending.routes6 {
            let destination = subnet6(destination, "route-ipv6")?;
            let gateway = match gateway {
                Some(gateway) => Some(parse_addr(gateway, "route-ipv6")?),
                None => default_gateway6,
            };
            if let Some(gateway) = gateway {
                options.routes6.push(Route {
                    destination,
                    gateway,
                });
            }
        }

        if let Some(flags) = pending.redirect_gateway {
            let mut policies = vec![RoutingPolicy::Ipv4];
            for flag in &flags {
                let policy = match flag.as_str() {
                    "ipv6" => RoutingPolicy::Ipv6,
                    "block-local" => RoutingPolicy::BlockLocal,
                    _ => continue,
                };
                if !policies.contains(&policy) {
                    policies.push(policy);
                }
            }
            if flags.iter().any(|f| f == "!ipv4") {
                policies.retain(|p| *p != RoutingPolicy::Ipv4);
            }
            policies.sort();
            options.routing_policies = Some(policies);
        }
        Ok(())
    }
}

impl fmt::Display for PushReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted: Vec<&str> = self
            .original
            .split(',')
            .map(|item| {
                if item.starts_with("auth-token") {
                    "auth-token <redacted>"
                } else {
                    item
                }
            })
            .collect();
        f.write_str(&redacted.join(","))
    }
}

impl fmt::Debug for PushReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PushReply(\"{self}\")")
    }
}
