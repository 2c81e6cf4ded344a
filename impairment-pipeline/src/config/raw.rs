//! The configuration as it appears on disk, before validation

use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::net::IpAddr;

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawConfig {
    pub left: RawInterface,
    pub right: RawInterface,
    pub bandwidth: RawBandwidth,
    pub buffer_bloat: RawBufferBloat,
    pub cutoff: RawCutoff,
    #[serde(rename = "DNSPoison")]
    pub dns_poison: RawDnsPoison,
    #[serde(rename = "DPI")]
    pub dpi: RawDpi,
    pub fake_traceroute: RawFakeTraceroute,
    #[serde(rename = "IPFirewall")]
    pub ip_firewall: RawIpFirewall,
    pub latency: RawLatency,
    pub loss: RawLoss,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawInterface {
    pub device_name: String,
    pub hardware_addr: String,
    #[serde(rename = "IPv4")]
    pub ipv4: String,
    #[serde(rename = "IPv6")]
    pub ipv6: String,
}

/// A normal distribution; both fields are in seconds when used for durations
#[derive(Deserialize, Debug, Default, Clone, Copy)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawGauss {
    pub mean: f64,
    pub stdev: f64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawBandwidth {
    pub enabled: bool,
    pub left_to_right_mbps: f64,
    pub right_to_left_mbps: f64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawBufferBloat {
    pub enabled: bool,
    pub left_to_right_packets: u32,
    pub right_to_left_packets: u32,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawCutoff {
    pub enabled: bool,
    pub left_to_right_loss: f64,
    pub left_to_right_on: RawGauss,
    pub left_to_right_off: RawGauss,
    pub right_to_left_loss: f64,
    pub right_to_left_on: RawGauss,
    pub right_to_left_off: RawGauss,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawDnsPoison {
    pub enabled: bool,
    pub rules: Vec<RawDnsPoisonRule>,
}

#[serde_as]
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawDnsPoisonRule {
    pub zone: String,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub addr: Vec<IpAddr>,
    #[serde(rename = "TTL")]
    pub ttl: u32,
    #[serde(rename = "DropUDP")]
    pub drop_udp: bool,
    #[serde(rename = "ResetTCP")]
    pub reset_tcp: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawDpi {
    pub enabled: bool,
    pub rules: Vec<RawDpiRule>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawDpiRule {
    pub ports: Vec<u16>,
    pub keyword: String,
    #[serde(rename = "BlockWholeIP")]
    pub block_whole_ip: bool,
    pub left_to_right_loss: f64,
    pub right_to_left_loss: f64,
    #[serde(rename = "ResetTCP")]
    pub reset_tcp: bool,
    /// Seconds
    pub cooldown_time: f64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawFakeTraceroute {
    pub enabled: bool,
    pub rules: Vec<RawFakeTracerouteRule>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawFakeTracerouteRule {
    pub address: String,
    pub hops: Vec<RawHop>,
    pub unreachable: bool,
    pub blackhole: bool,
}

#[serde_as]
#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub(crate) struct RawHop {
    #[serde_as(as = "DisplayFromStr")]
    pub address: IpAddr,
    /// Seconds
    #[serde(rename = "RTT", default)]
    pub rtt: f64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawIpFirewall {
    pub enabled: bool,
    pub rules: Vec<RawIpFirewallRule>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawIpFirewallRule {
    pub address: String,
    #[serde(rename = "L4Protocols")]
    pub l4_protocols: Vec<u16>,
    pub ports: Vec<u16>,
    pub left_to_right_loss: f64,
    pub right_to_left_loss: f64,
    pub source_to_dest_loss: f64,
    pub dest_to_source_loss: f64,
    #[serde(rename = "ResetTCP")]
    pub reset_tcp: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawLatency {
    pub enabled: bool,
    pub max_buffer_size: u32,
    pub left_to_right: RawGauss,
    pub right_to_left: RawGauss,
    pub simulate_tunnel: bool,
    #[serde(rename = "ExcludeICMP")]
    pub exclude_icmp: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub(crate) struct RawLoss {
    pub enabled: bool,
    pub left_to_right: f64,
    pub right_to_left: f64,
    #[serde(rename = "ExcludeICMP")]
    pub exclude_icmp: bool,
}
