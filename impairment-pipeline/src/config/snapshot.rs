use std::net::IpAddr;
use std::time::Duration;

use super::error::ConfigError;
use super::ip::{HardwareAddr, IpCidr};
use super::raw::{
    RawBandwidth, RawBufferBloat, RawConfig, RawCutoff, RawDnsPoison, RawDpi, RawFakeTraceroute,
    RawGauss, RawInterface, RawIpFirewall, RawLatency, RawLoss,
};
use crate::direction::PerDirection;
use crate::sampling::GaussianParam;

/// Frames the latency queue holds when `MaxBufferSize` is left at zero
pub const DEFAULT_LATENCY_BUFFER: usize = 1000;

/// Extra one-way delay added when `SimulateTunnel` is set
pub const TUNNEL_OVERHEAD: Duration = Duration::from_millis(5);

/// A fully validated configuration
///
/// Snapshots are immutable once published. The version is assigned by the
/// [`ConfigStore`](super::ConfigStore) when the snapshot is swapped in.
#[derive(Clone, Debug, Default)]
pub struct ConfigSnapshot {
    pub(crate) version: u64,
    pub left: InterfaceSpec,
    pub right: InterfaceSpec,
    pub bandwidth: BandwidthConfig,
    pub buffer_bloat: BufferBloatConfig,
    pub cutoff: CutoffConfig,
    pub dns_poison: DnsPoisonConfig,
    pub dpi: DpiConfig,
    pub fake_traceroute: FakeTracerouteConfig,
    pub ip_firewall: IpFirewallConfig,
    pub latency: LatencyConfig,
    pub loss: LossConfig,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InterfaceSpec {
    pub device_name: String,
    pub hardware_addr: Option<HardwareAddr>,
    pub ipv4: Option<IpCidr>,
    pub ipv6: Option<IpCidr>,
}

#[derive(Clone, Debug, Default)]
pub struct BandwidthConfig {
    pub enabled: bool,
    pub mbps: PerDirection<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct BufferBloatConfig {
    pub enabled: bool,
    pub packets: PerDirection<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct CutoffConfig {
    pub enabled: bool,
    pub loss: PerDirection<f64>,
    pub on: PerDirection<GaussianParam>,
    pub off: PerDirection<GaussianParam>,
}

#[derive(Clone, Debug, Default)]
pub struct DnsPoisonConfig {
    pub enabled: bool,
    pub rules: Vec<DnsPoisonRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DnsPoisonRule {
    /// Lowercase, without trailing dot; empty matches every name
    pub zone: String,
    pub addresses: Vec<IpAddr>,
    pub ttl: u32,
    pub drop_udp: bool,
    pub reset_tcp: bool,
}

#[derive(Clone, Debug, Default)]
pub struct DpiConfig {
    pub enabled: bool,
    pub rules: Vec<DpiRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DpiRule {
    pub ports: Vec<u16>,
    pub keyword: Vec<u8>,
    pub block_whole_ip: bool,
    pub loss: PerDirection<f64>,
    pub reset_tcp: bool,
    pub cooldown: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct FakeTracerouteConfig {
    pub enabled: bool,
    pub rules: Vec<FakeTracerouteRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FakeTracerouteRule {
    pub destination: IpCidr,
    /// Indexed by the probe's TTL
    pub hops: Vec<Hop>,
    pub unreachable: bool,
    pub blackhole: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hop {
    pub address: IpAddr,
    pub rtt: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct IpFirewallConfig {
    pub enabled: bool,
    pub rules: Vec<IpFirewallRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IpFirewallRule {
    pub address: IpCidr,
    pub l4_protocols: Vec<u8>,
    pub ports: Vec<u16>,
    pub loss: PerDirection<f64>,
    /// Applies to frames travelling toward `address`
    pub source_to_dest_loss: f64,
    /// Applies to frames coming from `address`
    pub dest_to_source_loss: f64,
    pub reset_tcp: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LatencyConfig {
    pub enabled: bool,
    pub max_buffer_size: usize,
    pub delay: PerDirection<GaussianParam>,
    pub simulate_tunnel: bool,
    pub exclude_icmp: bool,
}

impl LatencyConfig {
    /// The number of frames the delay queue may hold
    pub fn capacity(&self) -> usize {
        if self.max_buffer_size == 0 {
            DEFAULT_LATENCY_BUFFER
        } else {
            self.max_buffer_size
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LossConfig {
    pub enabled: bool,
    pub probability: PerDirection<f64>,
    pub exclude_icmp: bool,
}

impl ConfigSnapshot {
    /// The version assigned at publication (zero for snapshots that were never published)
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether `ip` is the host address of one of the tunnel's own interfaces
    pub fn is_local_address(&self, ip: IpAddr) -> bool {
        [&self.left, &self.right].into_iter().any(|side| {
            [side.ipv4, side.ipv6]
                .into_iter()
                .flatten()
                .any(|cidr| cidr.address() == ip)
        })
    }

    pub fn has_local_addresses(&self) -> bool {
        [&self.left, &self.right]
            .into_iter()
            .any(|side| side.ipv4.is_some() || side.ipv6.is_some())
    }

    pub(crate) fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            version: 0,
            left: interface("Left", raw.left)?,
            right: interface("Right", raw.right)?,
            bandwidth: bandwidth(raw.bandwidth)?,
            buffer_bloat: buffer_bloat(raw.buffer_bloat),
            cutoff: cutoff(raw.cutoff)?,
            dns_poison: dns_poison(raw.dns_poison),
            dpi: dpi(raw.dpi)?,
            fake_traceroute: fake_traceroute(raw.fake_traceroute)?,
            ip_firewall: ip_firewall(raw.ip_firewall)?,
            latency: latency(raw.latency)?,
            loss: loss(raw.loss)?,
        })
    }
}

fn interface(side: &str, raw: RawInterface) -> Result<InterfaceSpec, ConfigError> {
    let hardware_addr = if raw.hardware_addr.is_empty() {
        None
    } else {
        let parsed =
            raw.hardware_addr
                .parse()
                .map_err(|source| ConfigError::HardwareAddr {
                    field: format!("{side}.HardwareAddr"),
                    value: raw.hardware_addr.clone(),
                    source,
                })?;
        Some(parsed)
    };

    Ok(InterfaceSpec {
        device_name: raw.device_name,
        hardware_addr,
        ipv4: interface_cidr(&format!("{side}.IPv4"), &raw.ipv4, "IPv4", true)?,
        ipv6: interface_cidr(&format!("{side}.IPv6"), &raw.ipv6, "IPv6", false)?,
    })
}

fn interface_cidr(
    field: &str,
    value: &str,
    family: &'static str,
    expect_v4: bool,
) -> Result<Option<IpCidr>, ConfigError> {
    if value.is_empty() {
        return Ok(None);
    }

    let parsed = cidr(field, value)?;
    if parsed.is_ipv4() != expect_v4 {
        return Err(ConfigError::AddressFamily {
            family,
            value: value.to_string(),
        });
    }

    Ok(Some(parsed))
}

fn cidr(field: &str, value: &str) -> Result<IpCidr, ConfigError> {
    value.parse().map_err(|source| ConfigError::Cidr {
        field: field.to_string(),
        value: value.to_string(),
        source,
    })
}

fn probability(field: &str, value: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::invalid(
            field,
            format!("probability {value} is outside [0, 1]"),
        ))
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        ConfigError::invalid(
            field,
            format!("{value} is not a finite, non-negative number of seconds"),
        )
    })
}

fn gaussian(field: &str, raw: RawGauss) -> Result<GaussianParam, ConfigError> {
    seconds(&format!("{field}.Mean"), raw.mean)?;
    seconds(&format!("{field}.Stdev"), raw.stdev)?;
    Ok(GaussianParam {
        mean: raw.mean,
        stdev: raw.stdev,
    })
}

fn bandwidth(raw: RawBandwidth) -> Result<BandwidthConfig, ConfigError> {
    let rate = |field: &str, value: f64| {
        if value.is_finite() && value >= 0.0 {
            Ok(value)
        } else {
            Err(ConfigError::invalid(
                field,
                format!("{value} is not a non-negative rate"),
            ))
        }
    };

    Ok(BandwidthConfig {
        enabled: raw.enabled,
        mbps: PerDirection::new(
            rate("Bandwidth.LeftToRightMbps", raw.left_to_right_mbps)?,
            rate("Bandwidth.RightToLeftMbps", raw.right_to_left_mbps)?,
        ),
    })
}

fn buffer_bloat(raw: RawBufferBloat) -> BufferBloatConfig {
    BufferBloatConfig {
        enabled: raw.enabled,
        packets: PerDirection::new(raw.left_to_right_packets, raw.right_to_left_packets),
    }
}

fn cutoff(raw: RawCutoff) -> Result<CutoffConfig, ConfigError> {
    Ok(CutoffConfig {
        enabled: raw.enabled,
        loss: PerDirection::new(
            probability("Cutoff.LeftToRightLoss", raw.left_to_right_loss)?,
            probability("Cutoff.RightToLeftLoss", raw.right_to_left_loss)?,
        ),
        on: PerDirection::new(
            gaussian("Cutoff.LeftToRightOn", raw.left_to_right_on)?,
            gaussian("Cutoff.RightToLeftOn", raw.right_to_left_on)?,
        ),
        off: PerDirection::new(
            gaussian("Cutoff.LeftToRightOff", raw.left_to_right_off)?,
            gaussian("Cutoff.RightToLeftOff", raw.right_to_left_off)?,
        ),
    })
}

fn dns_poison(raw: RawDnsPoison) -> DnsPoisonConfig {
    let rules = raw
        .rules
        .into_iter()
        .map(|rule| DnsPoisonRule {
            zone: rule.zone.trim_end_matches('.').to_ascii_lowercase(),
            addresses: rule.addr,
            ttl: rule.ttl,
            drop_udp: rule.drop_udp,
            reset_tcp: rule.reset_tcp,
        })
        .collect();

    DnsPoisonConfig {
        enabled: raw.enabled,
        rules,
    }
}

fn dpi(raw: RawDpi) -> Result<DpiConfig, ConfigError> {
    let mut rules = Vec::with_capacity(raw.rules.len());
    for (i, rule) in raw.rules.into_iter().enumerate() {
        let field = format!("DPI.Rules[{i}]");
        if rule.keyword.is_empty() {
            return Err(ConfigError::invalid(
                format!("{field}.Keyword"),
                "keyword cannot be empty",
            ));
        }

        rules.push(DpiRule {
            ports: rule.ports,
            keyword: rule.keyword.into_bytes(),
            block_whole_ip: rule.block_whole_ip,
            loss: PerDirection::new(
                probability(&format!("{field}.LeftToRightLoss"), rule.left_to_right_loss)?,
                probability(&format!("{field}.RightToLeftLoss"), rule.right_to_left_loss)?,
            ),
            reset_tcp: rule.reset_tcp,
            cooldown: seconds(&format!("{field}.CooldownTime"), rule.cooldown_time)?,
        });
    }

    Ok(DpiConfig {
        enabled: raw.enabled,
        rules,
    })
}

fn fake_traceroute(raw: RawFakeTraceroute) -> Result<FakeTracerouteConfig, ConfigError> {
    let mut rules = Vec::with_capacity(raw.rules.len());
    for (i, rule) in raw.rules.into_iter().enumerate() {
        let field = format!("FakeTraceroute.Rules[{i}]");
        if rule.unreachable && rule.blackhole {
            return Err(ConfigError::invalid(
                field,
                "a rule cannot be both Unreachable and Blackhole",
            ));
        }

        let hops = rule
            .hops
            .into_iter()
            .enumerate()
            .map(|(j, hop)| {
                Ok(Hop {
                    address: hop.address,
                    rtt: seconds(&format!("{field}.Hops[{j}].RTT"), hop.rtt)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        rules.push(FakeTracerouteRule {
            destination: cidr(&format!("{field}.Address"), &rule.address)?,
            hops,
            unreachable: rule.unreachable,
            blackhole: rule.blackhole,
        });
    }

    Ok(FakeTracerouteConfig {
        enabled: raw.enabled,
        rules,
    })
}

fn ip_firewall(raw: RawIpFirewall) -> Result<IpFirewallConfig, ConfigError> {
    let mut rules = Vec::with_capacity(raw.rules.len());
    for (i, rule) in raw.rules.into_iter().enumerate() {
        let field = format!("IPFirewall.Rules[{i}]");
        let l4_protocols = rule
            .l4_protocols
            .iter()
            .map(|&protocol| {
                u8::try_from(protocol).map_err(|_| {
                    ConfigError::invalid(
                        format!("{field}.L4Protocols"),
                        format!("{protocol} is not an IP protocol number"),
                    )
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        rules.push(IpFirewallRule {
            address: cidr(&format!("{field}.Address"), &rule.address)?,
            l4_protocols,
            ports: rule.ports,
            loss: PerDirection::new(
                probability(&format!("{field}.LeftToRightLoss"), rule.left_to_right_loss)?,
                probability(&format!("{field}.RightToLeftLoss"), rule.right_to_left_loss)?,
            ),
            source_to_dest_loss: probability(
                &format!("{field}.SourceToDestLoss"),
                rule.source_to_dest_loss,
            )?,
            dest_to_source_loss: probability(
                &format!("{field}.DestToSourceLoss"),
                rule.dest_to_source_loss,
            )?,
            reset_tcp: rule.reset_tcp,
        });
    }

    Ok(IpFirewallConfig {
        enabled: raw.enabled,
        rules,
    })
}

fn latency(raw: RawLatency) -> Result<LatencyConfig, ConfigError> {
    Ok(LatencyConfig {
        enabled: raw.enabled,
        max_buffer_size: raw.max_buffer_size as usize,
        delay: PerDirection::new(
            gaussian("Latency.LeftToRight", raw.left_to_right)?,
            gaussian("Latency.RightToLeft", raw.right_to_left)?,
        ),
        simulate_tunnel: raw.simulate_tunnel,
        exclude_icmp: raw.exclude_icmp,
    })
}

fn loss(raw: RawLoss) -> Result<LossConfig, ConfigError> {
    Ok(LossConfig {
        enabled: raw.enabled,
        probability: PerDirection::new(
            probability("Loss.LeftToRight", raw.left_to_right)?,
            probability("Loss.RightToLeft", raw.right_to_left)?,
        ),
        exclude_icmp: raw.exclude_icmp,
    })
}
