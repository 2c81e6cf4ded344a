use impairment_pipeline::config::InterfaceSpec;
use impairment_pipeline::{ConfigSnapshot, Direction, PipelineStats, StageKind};

pub fn print_snapshot(snapshot: &ConfigSnapshot) {
    println!("--- Interfaces ---");
    for (side, spec) in [("Left", &snapshot.left), ("Right", &snapshot.right)] {
        println!("* {side}: {}", describe_interface(spec));
    }

    println!("--- Modules ---");
    for kind in StageKind::PIPELINE_ORDER {
        let status = if kind.is_enabled(snapshot) {
            "enabled"
        } else {
            "disabled"
        };
        match rule_count(snapshot, kind) {
            Some(rules) => println!("* {kind}: {status} ({rules} rules)"),
            None => println!("* {kind}: {status}"),
        }
    }
}

fn describe_interface(spec: &InterfaceSpec) -> String {
    let mut description = if spec.device_name.is_empty() {
        "<no device>".to_string()
    } else {
        spec.device_name.clone()
    };

    if let Some(hardware_addr) = spec.hardware_addr {
        description.push_str(&format!(", {hardware_addr}"));
    }
    for cidr in [spec.ipv4, spec.ipv6].into_iter().flatten() {
        description.push_str(&format!(", {cidr}"));
    }

    description
}

fn rule_count(snapshot: &ConfigSnapshot, kind: StageKind) -> Option<usize> {
    match kind {
        StageKind::DnsPoison => Some(snapshot.dns_poison.rules.len()),
        StageKind::Dpi => Some(snapshot.dpi.rules.len()),
        StageKind::FakeTraceroute => Some(snapshot.fake_traceroute.rules.len()),
        StageKind::IpFirewall => Some(snapshot.ip_firewall.rules.len()),
        _ => None,
    }
}

pub fn print_stats(stats: &PipelineStats) {
    for direction in Direction::BOTH {
        let ingress = stats.ingress.get(direction);
        let egress = stats.egress.get(direction);

        println!("--- {direction} ---");
        println!(
            "* Entered: {} packets ({} bytes)",
            ingress.packets, ingress.bytes
        );
        println!("* Left: {} packets ({} bytes)", egress.packets, egress.bytes);
        for (kind, stage) in stats.stages.get(direction) {
            if stage.dropped.packets == 0 && stage.replied.packets == 0 {
                continue;
            }

            println!("  * {kind}");
            println!(
                "    | {} packets dropped ({} bytes)",
                stage.dropped.packets, stage.dropped.bytes
            );
            println!(
                "    | {} replies synthesized ({} bytes)",
                stage.replied.packets, stage.replied.bytes
            );
        }
    }
}
