use crate::models::{Decision, FinalizedFlow, MitigationRule};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{error, info};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, Mutex};

/// Formate un horodatage pour les colonnes TEXT de la base.
///
/// Précision fixe en UTC : les comparaisons lexicographiques faites en SQL
/// sur ces colonnes suivent l'ordre chronologique.
fn iso(ts: SystemTime) -> String {
    DateTime::<Utc>::from(ts).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Journal d'audit durable : décisions, résumés de flux et règles de
/// mitigation, dans une base SQLite locale.
///
/// Les méthodes sont synchrones ; le service ne les appelle jamais
/// directement sur le chemin des paquets, les écritures passent par
/// [`AuditHandle`] et sa tâche d'écriture dédiée.
pub struct AuditStore {
    conn: Connection,
}

impl AuditStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("création du répertoire {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("ouverture de la base {}", db_path.display()))?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Base en mémoire, pour les tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("ouverture de la base en mémoire")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS decisions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    addr_a TEXT NOT NULL,
                    port_a INTEGER NOT NULL,
                    addr_b TEXT NOT NULL,
                    port_b INTEGER NOT NULL,
                    protocol TEXT NOT NULL,
                    verdicts TEXT NOT NULL,
                    score REAL NOT NULL,
                    label TEXT NOT NULL,
                    notes TEXT
                );
                CREATE TABLE IF NOT EXISTS flows (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    src_ip TEXT NOT NULL,
                    dst_ip TEXT NOT NULL,
                    src_port INTEGER NOT NULL,
                    dst_port INTEGER NOT NULL,
                    protocol TEXT NOT NULL,
                    fwd_packets INTEGER NOT NULL,
                    bwd_packets INTEGER NOT NULL,
                    total_bytes INTEGER NOT NULL,
                    duration_secs REAL NOT NULL
                );
                CREATE TABLE IF NOT EXISTS mitigation_rules (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    added_at TEXT NOT NULL,
                    src_ip TEXT NOT NULL,
                    action TEXT NOT NULL,
                    expiry TEXT,
                    reason TEXT,
                    outcome TEXT NOT NULL
                );",
            )
            .context("initialisation du schéma d'audit")?;
        Ok(())
    }

    pub fn insert_decision(&self, decision: &Decision) -> Result<()> {
        let verdicts = serde_json::to_string(&decision.verdicts)?;
        self.conn
            .execute(
                "INSERT INTO decisions (timestamp, addr_a, port_a, addr_b, port_b, protocol,
                                        verdicts, score, label, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    iso(decision.timestamp),
                    decision.key.addr_a.to_string(),
                    decision.key.port_a,
                    decision.key.addr_b.to_string(),
                    decision.key.port_b,
                    decision.key.protocol.to_string(),
                    verdicts,
                    decision.score,
                    decision.label.to_string(),
                    decision.notes,
                ],
            )
            .context("insertion d'une décision")?;
        Ok(())
    }

    pub fn insert_flow(&self, flow: &FinalizedFlow) -> Result<()> {
        let record = &flow.record;
        self.conn
            .execute(
                "INSERT INTO flows (timestamp, src_ip, dst_ip, src_port, dst_port, protocol,
                                    fwd_packets, bwd_packets, total_bytes, duration_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    iso(record.start_time),
                    record.originator_ip.to_string(),
                    record.responder_ip.to_string(),
                    record.originator_port,
                    record.responder_port,
                    flow.key.protocol.to_string(),
                    record.forward_lengths.len() as i64,
                    record.backward_lengths.len() as i64,
                    record.total_bytes() as i64,
                    record.duration().as_secs_f64(),
                ],
            )
            .context("insertion d'un résumé de flux")?;
        Ok(())
    }

    pub fn insert_rule(&self, rule: &MitigationRule) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO mitigation_rules (added_at, src_ip, action, expiry, reason, outcome)
                 VALUES (?1, ?2, 'DROP', ?3, ?4, ?5)",
                params![
                    iso(rule.created_at),
                    rule.address.to_string(),
                    rule.expiry.map(iso),
                    rule.reason,
                    rule.outcome.as_str(),
                ],
            )
            .context("insertion d'une règle de mitigation")?;
        Ok(())
    }

    /// Clôt les règles encore ouvertes pour une adresse en posant leur
    /// expiration à l'instant donné. Les règles déjà expirées restent
    /// intactes, l'historique n'est jamais réécrit.
    pub fn close_rule_expiry(&self, address: IpAddr, at: SystemTime) -> Result<usize> {
        let now = iso(at);
        let updated = self
            .conn
            .execute(
                "UPDATE mitigation_rules SET expiry = ?1
                 WHERE src_ip = ?2 AND (expiry IS NULL OR expiry > ?1)",
                params![now, address.to_string()],
            )
            .context("clôture des règles de mitigation")?;
        Ok(updated)
    }

    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, addr_a, port_a, addr_b, port_b, protocol, verdicts, score, label, notes
             FROM decisions ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(DecisionRow {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    addr_a: row.get(2)?,
                    port_a: row.get(3)?,
                    addr_b: row.get(4)?,
                    port_b: row.get(5)?,
                    protocol: row.get(6)?,
                    verdicts: row.get(7)?,
                    score: row.get(8)?,
                    label: row.get(9)?,
                    notes: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_flows(&self, limit: usize) -> Result<Vec<FlowRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, src_ip, dst_ip, src_port, dst_port, protocol,
                    fwd_packets, bwd_packets, total_bytes, duration_secs
             FROM flows ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(FlowRow {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    src_ip: row.get(2)?,
                    dst_ip: row.get(3)?,
                    src_port: row.get(4)?,
                    dst_port: row.get(5)?,
                    protocol: row.get(6)?,
                    fwd_packets: row.get(7)?,
                    bwd_packets: row.get(8)?,
                    total_bytes: row.get(9)?,
                    duration_secs: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Effectifs des trois tables, pour l'affichage d'état.
    pub fn table_counts(&self) -> Result<TableCounts> {
        let decisions = self
            .conn
            .query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))
            .context("comptage des décisions")?;
        let flows = self
            .conn
            .query_row("SELECT COUNT(*) FROM flows", [], |row| row.get(0))
            .context("comptage des flux")?;
        let rules = self
            .conn
            .query_row("SELECT COUNT(*) FROM mitigation_rules", [], |row| row.get(0))
            .context("comptage des règles")?;
        Ok(TableCounts {
            decisions,
            flows,
            rules,
        })
    }

    pub fn recent_rules(&self, limit: usize) -> Result<Vec<RuleRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, added_at, src_ip, action, expiry, reason, outcome
             FROM mitigation_rules ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RuleRow {
                    id: row.get(0)?,
                    added_at: row.get(1)?,
                    src_ip: row.get(2)?,
                    action: row.get(3)?,
                    expiry: row.get(4)?,
                    reason: row.get(5)?,
                    outcome: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Ligne de la table des décisions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRow {
    pub id: i64,
    pub timestamp: String,
    pub addr_a: String,
    pub port_a: u16,
    pub addr_b: String,
    pub port_b: u16,
    pub protocol: String,
    pub verdicts: String,
    pub score: f64,
    pub label: String,
    pub notes: Option<String>,
}

/// Ligne de la table des flux
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRow {
    pub id: i64,
    pub timestamp: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub fwd_packets: i64,
    pub bwd_packets: i64,
    pub total_bytes: i64,
    pub duration_secs: f64,
}

/// Effectifs des tables du journal d'audit
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TableCounts {
    pub decisions: i64,
    pub flows: i64,
    pub rules: i64,
}

/// Ligne de la table des règles de mitigation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRow {
    pub id: i64,
    pub added_at: String,
    pub src_ip: String,
    pub action: String,
    pub expiry: Option<String>,
    pub reason: Option<String>,
    pub outcome: String,
}

/// Événement à consigner dans le journal d'audit
#[derive(Debug)]
enum AuditEvent {
    Decision(Decision),
    Flow(FinalizedFlow),
    Rule(MitigationRule),
    RuleExpiry { address: IpAddr, at: SystemTime },
}

/// Poignée d'accès au journal d'audit.
///
/// Les écritures partent dans une file bornée drainée par une tâche
/// dédiée : quand la file est pleine, le producteur attend (politique
/// producteur-bloqué, annoncée au démarrage) ; un échec d'écriture est
/// journalisé puis ignoré, jamais remonté au pipeline.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEvent>,
    store: Arc<Mutex<AuditStore>>,
}

impl AuditHandle {
    /// Démarre la tâche d'écriture et retourne la poignée partagée.
    pub fn spawn(store: AuditStore, queue_size: usize) -> Self {
        let store = Arc::new(Mutex::new(store));
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(queue_size);
        info!(
            "Journal d'audit démarré (file de {} écritures, producteur bloqué quand pleine)",
            queue_size
        );

        let writer_store = Arc::clone(&store);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let store = writer_store.lock().await;
                let result = match &event {
                    AuditEvent::Decision(decision) => store.insert_decision(decision),
                    AuditEvent::Flow(flow) => store.insert_flow(flow),
                    AuditEvent::Rule(rule) => store.insert_rule(rule),
                    AuditEvent::RuleExpiry { address, at } => {
                        store.close_rule_expiry(*address, *at).map(|_| ())
                    }
                };
                if let Err(e) = result {
                    // Échec de persistance : consigné localement, le
                    // traitement des flux suivants continue.
                    error!("Écriture d'audit perdue: {:#}", e);
                }
            }
        });

        Self { tx, store }
    }

    pub async fn append_decision(&self, decision: Decision) {
        self.send(AuditEvent::Decision(decision)).await;
    }

    pub async fn append_flow(&self, flow: FinalizedFlow) {
        self.send(AuditEvent::Flow(flow)).await;
    }

    pub async fn append_rule(&self, rule: MitigationRule) {
        self.send(AuditEvent::Rule(rule)).await;
    }

    pub async fn update_rule_expiry(&self, address: IpAddr, at: SystemTime) {
        self.send(AuditEvent::RuleExpiry { address, at }).await;
    }

    async fn send(&self, event: AuditEvent) {
        if self.tx.send(event).await.is_err() {
            error!("Tâche d'audit arrêtée, événement perdu");
        }
    }

    pub async fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionRow>> {
        self.store.lock().await.recent_decisions(limit)
    }

    pub async fn recent_flows(&self, limit: usize) -> Result<Vec<FlowRow>> {
        self.store.lock().await.recent_flows(limit)
    }

    pub async fn recent_rules(&self, limit: usize) -> Result<Vec<RuleRow>> {
        self.store.lock().await.recent_rules(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        FinalLabel, FlagCounts, FlowKey, FlowRecord, ModelVerdict, PacketType, RuleOutcome, Verdict,
    };
    use std::time::{Duration, UNIX_EPOCH};

    fn sample_key() -> FlowKey {
        FlowKey {
            addr_a: "10.0.0.1".parse().unwrap(),
            port_a: 1000,
            addr_b: "10.0.0.2".parse().unwrap(),
            port_b: 80,
            protocol: PacketType::Tcp,
        }
    }

    fn sample_decision(label: FinalLabel) -> Decision {
        Decision {
            key: sample_key(),
            verdicts: vec![ModelVerdict {
                model: "heuristique".to_string(),
                weight: 1.0,
                verdict: Verdict::Label(1),
            }],
            score: 1.0,
            label,
            timestamp: SystemTime::now(),
            notes: None,
        }
    }

    fn sample_flow() -> FinalizedFlow {
        FinalizedFlow {
            key: sample_key(),
            record: FlowRecord {
                originator_ip: "10.0.0.1".parse().unwrap(),
                originator_port: 1000,
                responder_ip: "10.0.0.2".parse().unwrap(),
                responder_port: 80,
                start_time: UNIX_EPOCH,
                forward_lengths: vec![60],
                backward_lengths: vec![40],
                timestamps: vec![UNIX_EPOCH, UNIX_EPOCH + Duration::from_secs(11)],
                forward_flags: FlagCounts::default(),
                backward_flags: FlagCounts::default(),
            },
        }
    }

    #[test]
    fn test_decision_roundtrip() {
        let store = AuditStore::open_in_memory().unwrap();
        store.insert_decision(&sample_decision(FinalLabel::Drop)).unwrap();

        let rows = store.recent_decisions(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "DROP");
        assert_eq!(rows[0].addr_a, "10.0.0.1");
        assert_eq!(rows[0].port_b, 80);
        // Les verdicts sont conservés en JSON
        assert!(rows[0].verdicts.contains("heuristique"));
    }

    #[test]
    fn test_recent_decisions_most_recent_first() {
        let store = AuditStore::open_in_memory().unwrap();
        store.insert_decision(&sample_decision(FinalLabel::Accept)).unwrap();
        store.insert_decision(&sample_decision(FinalLabel::Drop)).unwrap();
        store.insert_decision(&sample_decision(FinalLabel::Accept)).unwrap();

        let rows = store.recent_decisions(2).unwrap();
        assert_eq!(rows.len(), 2);
        // La dernière insérée sort en premier
        assert!(rows[0].id > rows[1].id);
        assert_eq!(rows[0].label, "ACCEPT");
        assert_eq!(rows[1].label, "DROP");
    }

    #[test]
    fn test_flow_summary_roundtrip() {
        let store = AuditStore::open_in_memory().unwrap();
        store.insert_flow(&sample_flow()).unwrap();

        let rows = store.recent_flows(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].src_ip, "10.0.0.1");
        assert_eq!(rows[0].fwd_packets, 1);
        assert_eq!(rows[0].bwd_packets, 1);
        assert_eq!(rows[0].total_bytes, 100);
        assert!((rows[0].duration_secs - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_rule_expiry_targets_open_rules() {
        let store = AuditStore::open_in_memory().unwrap();
        let addr: IpAddr = "10.0.0.1".parse().unwrap();

        // Une règle permanente et une règle à échéance lointaine
        let permanent = MitigationRule::new(addr, None, "test".to_string(), RuleOutcome::Applied);
        let timed = MitigationRule::new(
            addr,
            Some(Duration::from_secs(600)),
            "test".to_string(),
            RuleOutcome::Applied,
        );
        store.insert_rule(&permanent).unwrap();
        store.insert_rule(&timed).unwrap();

        let updated = store.close_rule_expiry(addr, SystemTime::now()).unwrap();
        assert_eq!(updated, 2);

        // Une seconde clôture ne touche plus rien : les règles sont closes
        let updated = store.close_rule_expiry(addr, SystemTime::now()).unwrap();
        assert_eq!(updated, 0);
    }

    #[test]
    fn test_close_rule_expiry_ignores_other_addresses() {
        let store = AuditStore::open_in_memory().unwrap();
        let rule = MitigationRule::new(
            "10.0.0.1".parse().unwrap(),
            None,
            "test".to_string(),
            RuleOutcome::Applied,
        );
        store.insert_rule(&rule).unwrap();

        let updated = store
            .close_rule_expiry("10.0.0.9".parse().unwrap(), SystemTime::now())
            .unwrap();
        assert_eq!(updated, 0);
    }

    #[test]
    fn test_rule_outcome_recorded() {
        let store = AuditStore::open_in_memory().unwrap();
        let rule = MitigationRule::new(
            "203.0.113.7".parse().unwrap(),
            Some(Duration::from_secs(600)),
            "détection automatique".to_string(),
            RuleOutcome::PermissionDenied,
        );
        store.insert_rule(&rule).unwrap();

        let rows = store.recent_rules(10).unwrap();
        assert_eq!(rows[0].outcome, "permission_denied");
        assert!(rows[0].expiry.is_some());
    }

    #[test]
    fn test_table_counts_follow_inserts() {
        let store = AuditStore::open_in_memory().unwrap();
        store.insert_decision(&sample_decision(FinalLabel::Accept)).unwrap();
        store.insert_decision(&sample_decision(FinalLabel::Drop)).unwrap();
        store.insert_flow(&sample_flow()).unwrap();

        let counts = store.table_counts().unwrap();
        assert_eq!(counts.decisions, 2);
        assert_eq!(counts.flows, 1);
        assert_eq!(counts.rules, 0);
    }

    #[tokio::test]
    async fn test_handle_writes_through_queue() {
        let handle = AuditHandle::spawn(AuditStore::open_in_memory().unwrap(), 16);
        handle.append_decision(sample_decision(FinalLabel::Drop)).await;

        // La tâche d'écriture draine la file de façon asynchrone
        let mut rows = Vec::new();
        for _ in 0..50 {
            rows = handle.recent_decisions(10).await.unwrap();
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "DROP");
    }
}
