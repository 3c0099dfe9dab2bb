use crate::api;
use crate::audit::{AuditHandle, AuditStore};
use crate::backend::build_backends;
use crate::capture;
use crate::classifier::build_classifiers;
use crate::config::Config;
use crate::decision::DecisionEngine;
use crate::features;
use crate::flow::FlowTable;
use crate::logger::Logger;
use crate::mitigation::{process_is_privileged, MitigationController};
use crate::models::{FinalLabel, FinalizedFlow, GlobalStats, PacketInfo, StatsSnapshot};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Mutex};

/// Service principal : relie la capture, la table des flux, l'extraction de
/// caractéristiques, le vote des classifieurs et la mitigation.
///
/// Le pipeline est entièrement asynchrone et borné : chaque étage consomme
/// une file de taille fixe, et un étage saturé ralentit celui d'amont au
/// lieu de perdre des événements.
pub struct FluxgardeService {
    config: Config,
    logger: Arc<Logger>,
    flow_table: Arc<FlowTable>,
    engine: Arc<DecisionEngine>,
    controller: Arc<MitigationController>,
    audit: AuditHandle,
    stats: Arc<GlobalStats>,
}

impl FluxgardeService {
    /// Assemble le service de production : base d'audit sur disque,
    /// backends pare-feu réels, privilèges du processus courant.
    pub fn new(config: Config) -> Result<Self> {
        let store = AuditStore::open(Path::new(&config.db_path))?;
        let audit = AuditHandle::spawn(store, config.audit_queue_size);

        let privileged = process_is_privileged();
        if !privileged {
            warn!("Processus sans privilèges: les règles de blocage seront consignées sans être posées");
        }

        Ok(Self::with_audit(config, audit, privileged))
    }

    /// Assemble le service autour d'un journal d'audit déjà ouvert.
    ///
    /// Utilisé par [`Self::new`], par le simulateur et par les tests, qui
    /// fournissent une base en mémoire et désactivent les privilèges.
    pub fn with_audit(config: Config, audit: AuditHandle, privileged: bool) -> Self {
        let logger = Arc::new(Logger::new_with_mode(config.log_file.clone(), config.log_mode));

        let classifiers = build_classifiers(&config.classifiers);
        if classifiers.is_empty() {
            warn!("Aucun classifieur actif: tous les flux seront acceptés");
        }
        let engine = Arc::new(DecisionEngine::new(
            classifiers,
            Duration::from_millis(config.classifier_timeout_ms),
        ));

        let backends = build_backends(
            &config.backends,
            Duration::from_millis(config.command_timeout_ms),
        );

        let whitelist: Vec<IpAddr> = config
            .whitelist
            .iter()
            .filter_map(|raw| match raw.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Adresse en liste blanche illisible, ignorée: {}", raw);
                    None
                }
            })
            .collect();

        let controller = Arc::new(MitigationController::new(
            backends,
            whitelist,
            privileged,
            audit.clone(),
            logger.clone(),
        ));

        let flow_table = Arc::new(FlowTable::new(Duration::from_secs(config.flow_timeout_secs)));

        Self {
            config,
            logger,
            flow_table,
            engine,
            controller,
            audit,
            stats: Arc::new(GlobalStats::default()),
        }
    }

    /// Démarre toutes les tâches du pipeline puis rend la main.
    ///
    /// L'appelant garde le processus en vie (attente d'un signal) ; les
    /// tâches tournent en arrière-plan jusqu'à la fermeture des canaux.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(
            "FluxGarde {} démarre ({} classifieur(s), {} backend(s) pare-feu)",
            self.config.version,
            self.engine.classifier_count(),
            self.config.backends.len(),
        );

        let (packet_tx, packet_rx) = mpsc::channel::<PacketInfo>(self.config.packet_queue_size);
        let (flow_tx, flow_rx) = mpsc::channel::<FinalizedFlow>(self.config.flow_queue_size);

        self.spawn_flow_table_task(packet_rx, flow_tx.clone());
        self.spawn_sweep_task(flow_tx);
        self.spawn_workers(flow_rx);
        self.spawn_stats_task();

        if let Some(listen) = self.config.api_listen.clone() {
            api::spawn_api_server(listen, self.api_state());
        }

        capture::start_packet_capture(&self.config.interfaces, packet_tx);

        info!(
            "Pipeline de détection démarré ({} tâche(s) de traitement des flux)",
            self.config.worker_threads.max(1)
        );
        Ok(())
    }

    // Consomme les paquets capturés et alimente la table des flux
    fn spawn_flow_table_task(
        self: &Arc<Self>,
        mut packet_rx: mpsc::Receiver<PacketInfo>,
        flow_tx: mpsc::Sender<FinalizedFlow>,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                service.stats.record_packet(packet.size);
                if let Some(flow) = service.flow_table.observe(&packet) {
                    // File des flux pleine : on attend, la lecture des
                    // paquets ralentit d'autant
                    if flow_tx.send(flow).await.is_err() {
                        error!("File des flux fermée, arrêt de la table des flux");
                        break;
                    }
                }
            }
            debug!("Tâche de la table des flux terminée");
        });
    }

    // Clôt périodiquement les flux muets que plus aucun paquet ne visite
    fn spawn_sweep_task(self: &Arc<Self>, flow_tx: mpsc::Sender<FinalizedFlow>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(service.config.sweep_interval_secs.max(1));
            loop {
                tokio::time::sleep(interval).await;
                let stale = service.flow_table.sweep(SystemTime::now());
                if stale.is_empty() {
                    continue;
                }
                debug!("Balayage: {} flux muet(s) clôturé(s)", stale.len());
                for flow in stale {
                    if flow_tx.send(flow).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    // Résume périodiquement l'activité du moteur dans le journal
    fn spawn_stats_task(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                let snapshot = service.stats.snapshot();
                info!(
                    "Activité: {} paquets ({} octets), {} flux finalisés, {} ACCEPT, {} DROP, {} blocage(s) actif(s)",
                    snapshot.total_packets,
                    snapshot.total_bytes,
                    snapshot.flows_finalized,
                    snapshot.decisions_accept,
                    snapshot.decisions_drop,
                    service.controller.active_count(),
                );
            }
        });
    }

    // Tâches de traitement des flux finalisés, partageant la même file
    fn spawn_workers(self: &Arc<Self>, flow_rx: mpsc::Receiver<FinalizedFlow>) {
        let flow_rx = Arc::new(Mutex::new(flow_rx));
        for worker_id in 0..self.config.worker_threads.max(1) {
            let service = Arc::clone(self);
            let flow_rx = Arc::clone(&flow_rx);
            tokio::spawn(async move {
                debug!("Analyseur de flux {} démarré", worker_id);
                loop {
                    let flow = { flow_rx.lock().await.recv().await };
                    match flow {
                        Some(flow) => service.process_flow(flow).await,
                        None => break,
                    }
                }
                debug!("Analyseur de flux {} terminé", worker_id);
            });
        }
    }

    /// Traite un flux finalisé de bout en bout : journal, caractéristiques,
    /// vote, audit, et blocage de l'initiateur si le verdict est DROP.
    pub async fn process_flow(&self, flow: FinalizedFlow) {
        self.stats.flows_finalized.fetch_add(1, Ordering::Relaxed);
        self.logger.log_flow(&flow);

        let features = features::extract(&flow);
        let key = flow.key;
        let originator = flow.record.originator_ip;
        self.audit.append_flow(flow).await;

        let decision = self.engine.decide(key, &features).await;
        self.stats.record_decision(decision.label);
        self.logger.log_decision(&decision);

        let is_drop = decision.label == FinalLabel::Drop;
        if is_drop {
            warn!(
                "Flux {} jugé hostile (score {:.2}), blocage de {}",
                key, decision.score, originator
            );
        }
        self.audit.append_decision(decision).await;

        if is_drop {
            let ttl = Duration::from_secs(self.config.block_ttl_secs);
            self.controller
                .block(originator, Some(ttl), "détection par vote pondéré")
                .await;
        }
    }

    fn api_state(&self) -> api::ApiState {
        api::ApiState {
            controller: Arc::clone(&self.controller),
            audit: self.audit.clone(),
            stats: Arc::clone(&self.stats),
            block_ttl: Duration::from_secs(self.config.block_ttl_secs),
        }
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn controller(&self) -> &Arc<MitigationController> {
        &self.controller
    }

    pub fn audit(&self) -> &AuditHandle {
        &self.audit
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_mode::LogMode;
    use crate::models::{tcp_flags, FlagCounts, FlowKey, FlowRecord, PacketType};
    use std::time::UNIX_EPOCH;

    fn test_config() -> Config {
        let mut config = Config::default();
        // Pas d'écritures fichier ni d'API dans les tests
        config.log_mode = LogMode::SystemdJournal;
        config.api_listen = None;
        config
    }

    fn test_service() -> Arc<FluxgardeService> {
        let audit = AuditHandle::spawn(AuditStore::open_in_memory().unwrap(), 64);
        Arc::new(FluxgardeService::with_audit(test_config(), audit, false))
    }

    // Flux synthétique : `fwd` paquets de l'initiateur, `bwd` réponses
    fn make_flow(fwd: usize, bwd: usize, syn_only: bool) -> FinalizedFlow {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut forward_flags = FlagCounts::default();
        if syn_only {
            for _ in 0..fwd {
                forward_flags.absorb(tcp_flags::SYN);
            }
        }
        let timestamps: Vec<SystemTime> = (0..fwd + bwd)
            .map(|i| start + Duration::from_millis(10 * i as u64))
            .collect();

        FinalizedFlow {
            key: FlowKey {
                addr_a: "10.0.0.1".parse().unwrap(),
                port_a: 40000,
                addr_b: "10.0.0.2".parse().unwrap(),
                port_b: 80,
                protocol: PacketType::Tcp,
            },
            record: FlowRecord {
                originator_ip: "10.0.0.1".parse().unwrap(),
                originator_port: 40000,
                responder_ip: "10.0.0.2".parse().unwrap(),
                responder_port: 80,
                start_time: start,
                forward_lengths: vec![60; fwd],
                backward_lengths: vec![120; bwd],
                timestamps,
                forward_flags,
                backward_flags: FlagCounts::default(),
            },
        }
    }

    async fn wait_decisions(service: &Arc<FluxgardeService>, count: usize) -> Vec<crate::audit::DecisionRow> {
        for _ in 0..100 {
            let rows = service.audit.recent_decisions(50).await.unwrap();
            if rows.len() >= count {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.audit.recent_decisions(50).await.unwrap()
    }

    #[tokio::test]
    async fn test_benign_flow_is_accepted_and_audited() {
        let service = test_service();
        service.process_flow(make_flow(2, 2, false)).await;

        let decisions = wait_decisions(&service, 1).await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].label, "ACCEPT");

        let flows = service.audit.recent_flows(10).await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].src_ip, "10.0.0.1");
        assert!(!service.controller.is_blocked("10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_hostile_flow_drops_and_records_rule() {
        let service = test_service();
        // SYN sans aucune réponse : le classifieur de seuils vote attaque
        service.process_flow(make_flow(8, 0, true)).await;

        let decisions = wait_decisions(&service, 1).await;
        assert_eq!(decisions[0].label, "DROP");

        // Sans privilèges, la règle voulue est consignée au lieu d'être posée
        let mut rules = Vec::new();
        for _ in 0..100 {
            rules = service.audit.recent_rules(10).await.unwrap();
            if !rules.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].src_ip, "10.0.0.1");
        assert_eq!(rules[0].outcome, "permission_denied");
    }

    #[tokio::test]
    async fn test_stats_follow_processed_flows() {
        let service = test_service();
        service.process_flow(make_flow(2, 2, false)).await;
        service.process_flow(make_flow(3, 1, false)).await;

        let snapshot = service.stats_snapshot();
        assert_eq!(snapshot.flows_finalized, 2);
        assert_eq!(snapshot.decisions_accept + snapshot.decisions_drop, 2);
    }
}
