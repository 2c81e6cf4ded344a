use fastrand::Rng;
use tracing::{debug, trace};

use super::{Outcome, StageContext};
use crate::config::IpFirewallRule;
use crate::frame::Frame;
use crate::packet::{FrameInfo, Transport, craft};
use crate::sampling::Sampler;

/// Address, protocol and port based filtering with probabilistic loss
pub(crate) struct IpFirewall {
    rng: Rng,
}

impl IpFirewall {
    pub(crate) fn new(rng: Rng) -> Self {
        Self { rng }
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        FrameInfo::parse(frame.as_bytes())
            .and_then(|info| self.filter(&info, cx))
            .unwrap_or(Outcome::Pass(frame))
    }

    fn filter(&mut self, info: &FrameInfo<'_>, cx: &mut StageContext<'_>) -> Option<Outcome> {
        let snapshot = cx.snapshot;
        let (index, rule) = snapshot
            .ip_firewall
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule_matches(rule, info))?;

        if let Transport::Tcp(tcp) = info.transport {
            if rule.reset_tcp && !tcp.is_reset() {
                let reset = craft::tcp_reset_to_source(info, &tcp)?;
                debug!(
                    direction = %cx.direction,
                    rule = index,
                    source = %info.ip.source,
                    destination = %info.ip.destination,
                    "ip firewall: reset connection"
                );
                cx.reply(reset);
                return Some(Outcome::Drop);
            }
        }

        let mut keep = 1.0 - *rule.loss.get(cx.direction);
        if rule.address.contains(info.ip.destination) {
            keep *= 1.0 - rule.source_to_dest_loss;
        }
        if rule.address.contains(info.ip.source) {
            keep *= 1.0 - rule.dest_to_source_loss;
        }

        if self.rng.chance(1.0 - keep) {
            trace!(direction = %cx.direction, rule = index, "ip firewall: dropped frame");
            return Some(Outcome::Drop);
        }

        None
    }
}

fn rule_matches(rule: &IpFirewallRule, info: &FrameInfo<'_>) -> bool {
    let address_matches =
        rule.address.contains(info.ip.source) || rule.address.contains(info.ip.destination);
    let protocol_matches =
        rule.l4_protocols.is_empty() || rule.l4_protocols.contains(&info.ip.protocol);
    let port_matches = rule.ports.is_empty()
        || info.ports().is_some_and(|(source, destination)| {
            rule.ports.contains(&source) || rule.ports.contains(&destination)
        });

    address_matches && protocol_matches && port_matches
}
