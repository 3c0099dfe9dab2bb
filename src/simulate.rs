use crate::audit::{AuditHandle, AuditStore};
use crate::config::Config;
use crate::log_mode::LogMode;
use crate::models::{tcp_flags, FinalizedFlow, FlowKey, FlowRecord, PacketInfo, PacketType};
use crate::service::FluxgardeService;
use anyhow::Result;
use log::info;
use rand::rngs::ThreadRng;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Rejoue un trafic synthétique dans le pipeline complet.
///
/// Le pipeline est le vrai : classifieurs, vote, journal d'audit. Seuls
/// les privilèges sont coupés, les règles de blocage sont donc consignées
/// sans jamais toucher au pare-feu de la machine.
pub async fn run_simulation(mut config: Config, flows: usize, attack_ratio: f64) -> Result<()> {
    // Tout reste en mémoire, la simulation ne laisse aucune trace
    config.log_mode = LogMode::SystemdJournal;
    config.api_listen = None;

    let audit = AuditHandle::spawn(AuditStore::open_in_memory()?, config.audit_queue_size);
    let service = Arc::new(FluxgardeService::with_audit(config, audit, false));

    info!(
        "Simulation de {} flux (proportion d'attaques {:.0}%)",
        flows,
        attack_ratio * 100.0
    );

    let mut rng = rand::rng();
    for _ in 0..flows {
        let flow = if rng.random_bool(attack_ratio.clamp(0.0, 1.0)) {
            attack_flow(&mut rng)
        } else {
            benign_flow(&mut rng)
        };
        service.process_flow(flow).await;
    }

    // Laisser la tâche d'écriture drainer la file d'audit
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = service.stats_snapshot();
    let rules = service.audit().recent_rules(flows.max(1)).await?;

    println!("=== Résultats de la simulation ===");
    println!("Flux traités: {}", snapshot.flows_finalized);
    println!("Décisions ACCEPT: {}", snapshot.decisions_accept);
    println!("Décisions DROP: {}", snapshot.decisions_drop);
    println!("Règles de blocage consignées: {}", rules.len());
    Ok(())
}

// Conversation TCP ordinaire : requête courte, réponse, acquittements
fn benign_flow(rng: &mut ThreadRng) -> FinalizedFlow {
    let client = IpAddr::V4(Ipv4Addr::new(192, 0, 2, rng.random_range(1..255)));
    let server = IpAddr::V4(Ipv4Addr::new(198, 51, 100, rng.random_range(1..255)));
    let client_port = rng.random_range(30000..60000);
    let server_port = [80u16, 443, 53, 8080][rng.random_range(0..4)];

    let start = SystemTime::now();
    let mut packets = Vec::new();
    let fwd_count = rng.random_range(2..8);
    let bwd_count = rng.random_range(2..8);

    for i in 0..fwd_count {
        packets.push(
            PacketInfo::new(
                client,
                server,
                Some(client_port),
                Some(server_port),
                PacketType::Tcp,
                rng.random_range(80..600),
            )
            .with_timestamp(start + Duration::from_millis(20 * i as u64))
            .with_tcp_flags(tcp_flags::PSH | tcp_flags::ACK),
        );
    }
    for i in 0..bwd_count {
        packets.push(
            PacketInfo::new(
                server,
                client,
                Some(server_port),
                Some(client_port),
                PacketType::Tcp,
                rng.random_range(100..1400),
            )
            .with_timestamp(start + Duration::from_millis(10 + 20 * i as u64))
            .with_tcp_flags(tcp_flags::ACK),
        );
    }

    build_flow(packets)
}

// Rafale de SYN sans une seule réponse, signature d'un balayage hostile
fn attack_flow(rng: &mut ThreadRng) -> FinalizedFlow {
    let attacker = IpAddr::V4(Ipv4Addr::new(203, 0, 113, rng.random_range(1..255)));
    let victim = IpAddr::V4(Ipv4Addr::new(198, 51, 100, rng.random_range(1..255)));
    let source_port = rng.random_range(1024..65535);
    let target_port = rng.random_range(1..1024);

    let start = SystemTime::now();
    let count = rng.random_range(5..40);
    let packets: Vec<PacketInfo> = (0..count)
        .map(|i| {
            PacketInfo::new(
                attacker,
                victim,
                Some(source_port),
                Some(target_port),
                PacketType::Tcp,
                40,
            )
            .with_timestamp(start + Duration::from_millis(i as u64))
            .with_tcp_flags(tcp_flags::SYN)
        })
        .collect();

    build_flow(packets)
}

fn build_flow(packets: Vec<PacketInfo>) -> FinalizedFlow {
    let key = FlowKey::canonical(&packets[0]);
    let mut record = FlowRecord::new(&packets[0]);
    for packet in &packets[1..] {
        record.absorb(packet);
    }
    FinalizedFlow { key, record }
}
