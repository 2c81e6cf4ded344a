use tracing::debug;

use super::{Outcome, StageContext};
use crate::config::DnsPoisonRule;
use crate::frame::Frame;
use crate::packet::dns::{self, DNS_PORT, DnsQuery};
use crate::packet::{FrameInfo, Transport, craft};

/// Answers DNS queries for the configured zones with forged records
pub(crate) struct DnsPoison;

impl DnsPoison {
    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        FrameInfo::parse(frame.as_bytes())
            .and_then(|info| poison(&info, cx))
            .unwrap_or(Outcome::Pass(frame))
    }
}

/// Handles a query for a poisoned zone; `None` lets the frame through untouched
fn poison(info: &FrameInfo<'_>, cx: &mut StageContext<'_>) -> Option<Outcome> {
    let rules = &cx.snapshot.dns_poison.rules;
    match info.transport {
        Transport::Udp(udp) if udp.destination_port == DNS_PORT => {
            let (query, rule) = matching_rule(rules, info.payload())?;
            if rule.drop_udp {
                debug!(name = %query.name, "dns poison: dropped udp query");
                return Some(Outcome::Drop);
            }

            let answer = query.answer(&rule.addresses, rule.ttl);
            let reply = craft::udp_reply(info, &udp, &answer)?;
            debug!(name = %query.name, "dns poison: answered udp query");
            cx.reply(reply);
            Some(Outcome::Drop)
        }
        Transport::Tcp(tcp) if tcp.destination_port == DNS_PORT => {
            // DNS over TCP prefixes each message with its length
            let payload = info.payload();
            let len = usize::from(u16::from_be_bytes([*payload.first()?, *payload.get(1)?]));
            let (query, rule) = matching_rule(rules, payload.get(2..2 + len)?)?;

            if rule.reset_tcp {
                let back = craft::tcp_reset_to_source(info, &tcp)?;
                let forward = craft::tcp_reset_to_destination(info, &tcp)?;
                debug!(name = %query.name, "dns poison: reset tcp query");
                cx.reply(back);
                return Some(Outcome::Pass(forward));
            }

            let answer = query.answer(&rule.addresses, rule.ttl);
            let mut framed = Vec::with_capacity(answer.len() + 2);
            framed.extend_from_slice(&(answer.len() as u16).to_be_bytes());
            framed.extend_from_slice(&answer);
            let reply = craft::tcp_data_reply(info, &tcp, &framed)?;
            debug!(name = %query.name, "dns poison: answered tcp query");
            cx.reply(reply);
            Some(Outcome::Drop)
        }
        _ => None,
    }
}

fn matching_rule<'a, 'r>(
    rules: &'r [DnsPoisonRule],
    message: &'a [u8],
) -> Option<(DnsQuery<'a>, &'r DnsPoisonRule)> {
    let query = DnsQuery::parse(message)?;
    let rule = rules
        .iter()
        .find(|rule| dns::zone_matches(&rule.zone, &query.name))?;
    Some((query, rule))
}
