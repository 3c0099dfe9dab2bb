use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Bits des drapeaux de contrôle TCP, tels que portés par l'en-tête.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Protocole de transport d'un paquet capturé
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PacketType {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketType::Tcp => "TCP",
            PacketType::Udp => "UDP",
            PacketType::Icmp => "ICMP",
            PacketType::Other => "OTHER",
        };
        write!(f, "{}", s)
    }
}

/// Informations sur un paquet réseau, telles que fournies par la capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketInfo {
    pub timestamp: SystemTime,
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub source_port: Option<u16>,
    pub dest_port: Option<u16>,
    pub protocol: PacketType,
    pub size: usize,
    /// Bits de drapeaux TCP bruts (voir [`tcp_flags`]), None hors TCP
    pub tcp_flags: Option<u8>,
}

impl PacketInfo {
    pub fn new(
        source_ip: IpAddr,
        dest_ip: IpAddr,
        source_port: Option<u16>,
        dest_port: Option<u16>,
        protocol: PacketType,
        size: usize,
    ) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_ip,
            dest_ip,
            source_port,
            dest_port,
            protocol,
            size,
            tcp_flags: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tcp_flags(mut self, flags: u8) -> Self {
        self.tcp_flags = Some(flags);
        self
    }
}

/// Clé canonique d'un flux bidirectionnel.
///
/// Les deux sens d'une même conversation produisent la même clé : les
/// extrémités sont ordonnées de façon déterministe, et c'est l'enregistrement
/// de flux qui retient quelle extrémité a initié la conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub addr_a: IpAddr,
    pub port_a: u16,
    pub addr_b: IpAddr,
    pub port_b: u16,
    pub protocol: PacketType,
}

impl FlowKey {
    /// Construit la clé canonique pour un paquet, quel que soit son sens.
    pub fn canonical(packet: &PacketInfo) -> Self {
        let src_port = packet.source_port.unwrap_or(0);
        let dst_port = packet.dest_port.unwrap_or(0);
        if (packet.source_ip, src_port) <= (packet.dest_ip, dst_port) {
            Self {
                addr_a: packet.source_ip,
                port_a: src_port,
                addr_b: packet.dest_ip,
                port_b: dst_port,
                protocol: packet.protocol,
            }
        } else {
            Self {
                addr_a: packet.dest_ip,
                port_a: dst_port,
                addr_b: packet.source_ip,
                port_b: src_port,
                protocol: packet.protocol,
            }
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{} [{}]",
            self.addr_a, self.port_a, self.addr_b, self.port_b, self.protocol
        )
    }
}

/// Compteurs d'occurrences des six drapeaux TCP surveillés
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagCounts {
    pub fin: u32,
    pub syn: u32,
    pub rst: u32,
    pub psh: u32,
    pub ack: u32,
    pub urg: u32,
}

impl FlagCounts {
    /// Incrémente les compteurs correspondant aux bits actifs du paquet.
    pub fn absorb(&mut self, bits: u8) {
        if bits & tcp_flags::FIN != 0 {
            self.fin += 1;
        }
        if bits & tcp_flags::SYN != 0 {
            self.syn += 1;
        }
        if bits & tcp_flags::RST != 0 {
            self.rst += 1;
        }
        if bits & tcp_flags::PSH != 0 {
            self.psh += 1;
        }
        if bits & tcp_flags::ACK != 0 {
            self.ack += 1;
        }
        if bits & tcp_flags::URG != 0 {
            self.urg += 1;
        }
    }
}

/// Enregistrement d'un flux en cours, possédé par la table des flux.
///
/// `start_time` est posé à la création et jamais modifié ; les séquences de
/// longueurs et d'horodatages ne font que croître jusqu'à la finalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub originator_ip: IpAddr,
    pub originator_port: u16,
    pub responder_ip: IpAddr,
    pub responder_port: u16,
    pub start_time: SystemTime,
    pub forward_lengths: Vec<u32>,
    pub backward_lengths: Vec<u32>,
    pub timestamps: Vec<SystemTime>,
    pub forward_flags: FlagCounts,
    pub backward_flags: FlagCounts,
}

impl FlowRecord {
    /// Crée l'enregistrement à partir du premier paquet du flux, qui définit
    /// le sens « avant » de la conversation.
    pub fn new(packet: &PacketInfo) -> Self {
        let mut record = Self {
            originator_ip: packet.source_ip,
            originator_port: packet.source_port.unwrap_or(0),
            responder_ip: packet.dest_ip,
            responder_port: packet.dest_port.unwrap_or(0),
            start_time: packet.timestamp,
            forward_lengths: Vec::new(),
            backward_lengths: Vec::new(),
            timestamps: Vec::new(),
            forward_flags: FlagCounts::default(),
            backward_flags: FlagCounts::default(),
        };
        record.absorb(packet);
        record
    }

    /// Un paquet est « avant » s'il partage (adresse source, port source)
    /// avec l'initiateur du flux.
    pub fn is_forward(&self, packet: &PacketInfo) -> bool {
        packet.source_ip == self.originator_ip
            && packet.source_port.unwrap_or(0) == self.originator_port
    }

    /// Ajoute un paquet à l'enregistrement : longueur, horodatage, drapeaux.
    pub fn absorb(&mut self, packet: &PacketInfo) {
        self.timestamps.push(packet.timestamp);
        if self.is_forward(packet) {
            self.forward_lengths.push(packet.size as u32);
            if let Some(bits) = packet.tcp_flags {
                self.forward_flags.absorb(bits);
            }
        } else {
            self.backward_lengths.push(packet.size as u32);
            if let Some(bits) = packet.tcp_flags {
                self.backward_flags.absorb(bits);
            }
        }
    }

    /// Durée du flux, du premier paquet au dernier observé.
    pub fn duration(&self) -> Duration {
        match self.timestamps.last() {
            Some(last) => last
                .duration_since(self.start_time)
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    pub fn total_packets(&self) -> usize {
        self.forward_lengths.len() + self.backward_lengths.len()
    }

    pub fn total_bytes(&self) -> u64 {
        let fwd: u64 = self.forward_lengths.iter().map(|&l| l as u64).sum();
        let bwd: u64 = self.backward_lengths.iter().map(|&l| l as u64).sum();
        fwd + bwd
    }
}

/// Flux clôturé, retiré de la table et prêt pour l'extraction
#[derive(Debug, Clone)]
pub struct FinalizedFlow {
    pub key: FlowKey,
    pub record: FlowRecord,
}

/// Sortie d'un classifieur pour un flux donné
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Verdict {
    /// Étiquette entière : 0 bénin, toute autre valeur attaque
    Label(i64),
    /// Échec d'invocation, exclu du vote
    Failed(String),
}

impl Verdict {
    pub fn is_attack(&self) -> bool {
        matches!(self, Verdict::Label(l) if *l != 0)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Failed(_))
    }
}

/// Verdict d'un classifieur nommé
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub model: String,
    pub weight: f64,
    pub verdict: Verdict,
}

/// Étiquette finale d'une décision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalLabel {
    Accept,
    Drop,
}

impl fmt::Display for FinalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalLabel::Accept => write!(f, "ACCEPT"),
            FinalLabel::Drop => write!(f, "DROP"),
        }
    }
}

/// Décision agrégée pour un flux finalisé, écrite une seule fois dans
/// le journal d'audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub key: FlowKey,
    pub verdicts: Vec<ModelVerdict>,
    pub score: f64,
    pub label: FinalLabel,
    pub timestamp: SystemTime,
    pub notes: Option<String>,
}

/// Résultat d'une tentative de blocage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOutcome {
    /// Règle posée dans le pare-feu
    Applied,
    /// Adresse déjà sous règle active, aucun changement
    AlreadyActive,
    /// Tous les backends ont échoué, règle enregistrée mais non posée
    BackendFailure,
    /// Privilèges insuffisants, règle enregistrée pour pose manuelle
    PermissionDenied,
    /// Adresse en liste blanche, jamais bloquée
    Whitelisted,
}

impl RuleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOutcome::Applied => "applied",
            RuleOutcome::AlreadyActive => "already_active",
            RuleOutcome::BackendFailure => "backend_failure",
            RuleOutcome::PermissionDenied => "permission_denied",
            RuleOutcome::Whitelisted => "whitelisted",
        }
    }

    /// Vrai si la règle est effectivement active dans le pare-feu.
    pub fn is_active(&self) -> bool {
        matches!(self, RuleOutcome::Applied | RuleOutcome::AlreadyActive)
    }
}

/// Règle de mitigation, active ou historique
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MitigationRule {
    pub address: IpAddr,
    pub created_at: SystemTime,
    pub expiry: Option<SystemTime>,
    pub reason: String,
    pub outcome: RuleOutcome,
}

impl MitigationRule {
    pub fn new(address: IpAddr, ttl: Option<Duration>, reason: String, outcome: RuleOutcome) -> Self {
        let created_at = SystemTime::now();
        Self {
            address,
            created_at,
            expiry: ttl.map(|d| created_at + d),
            reason,
            outcome,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => SystemTime::now() >= expiry,
            None => false,
        }
    }
}

/// Compteurs globaux du moteur, incrémentés par les tâches de traitement
#[derive(Debug)]
pub struct GlobalStats {
    pub total_packets: AtomicU64,
    pub total_bytes: AtomicU64,
    pub flows_finalized: AtomicU64,
    pub decisions_accept: AtomicU64,
    pub decisions_drop: AtomicU64,
    pub start_time: SystemTime,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            flows_finalized: AtomicU64::new(0),
            decisions_accept: AtomicU64::new(0),
            decisions_drop: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }
}

impl GlobalStats {
    pub fn record_packet(&self, size: usize) {
        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_decision(&self, label: FinalLabel) {
        match label {
            FinalLabel::Accept => self.decisions_accept.fetch_add(1, Ordering::Relaxed),
            FinalLabel::Drop => self.decisions_drop.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_packets: self.total_packets.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            flows_finalized: self.flows_finalized.load(Ordering::Relaxed),
            decisions_accept: self.decisions_accept.load(Ordering::Relaxed),
            decisions_drop: self.decisions_drop.load(Ordering::Relaxed),
            uptime_secs: SystemTime::now()
                .duration_since(self.start_time)
                .unwrap_or(Duration::ZERO)
                .as_secs(),
        }
    }
}

/// Vue sérialisable des compteurs globaux
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub flows_finalized: u64,
    pub decisions_accept: u64,
    pub decisions_drop: u64,
    pub uptime_secs: u64,
}
