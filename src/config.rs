use crate::log_mode::LogMode;
use log::warn;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "/etc/fluxgarde/config.json";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Version actuelle du logiciel
    pub version: String,

    /// Interfaces réseau à surveiller
    pub interfaces: Vec<String>,

    /// Durée d'inactivité (en secondes) au-delà de laquelle un flux est clôturé
    pub flow_timeout_secs: u64,

    /// Intervalle (en secondes) du balayage périodique des flux muets
    pub sweep_interval_secs: u64,

    /// Durée de vie (en secondes) des règles de blocage automatiques
    pub block_ttl_secs: u64,

    /// Chemin vers le fichier de log
    pub log_file: String,

    /// Niveau de log
    pub log_level: String,

    /// Mode de journalisation (fichier ou systemd-journal)
    pub log_mode: LogMode,

    /// Liste d'IPs en liste blanche (jamais bloquées)
    pub whitelist: Vec<String>,

    /// Nombre de tâches de traitement des flux finalisés
    pub worker_threads: usize,

    /// Taille de la file des paquets entre capture et table des flux
    pub packet_queue_size: usize,

    /// Taille de la file des flux finalisés vers les tâches de traitement
    pub flow_queue_size: usize,

    /// Taille de la file des écritures vers le journal d'audit
    pub audit_queue_size: usize,

    /// Délai maximal (en millisecondes) accordé à un classifieur
    pub classifier_timeout_ms: u64,

    /// Délai maximal (en millisecondes) accordé à une commande pare-feu
    pub command_timeout_ms: u64,

    /// Classifieurs enregistrés et leurs poids de vote
    pub classifiers: Vec<ClassifierConfig>,

    /// Backends pare-feu, par ordre de préférence
    pub backends: Vec<BackendKind>,

    /// Chemin de la base d'audit SQLite
    pub db_path: String,

    /// Adresse d'écoute de l'API de contrôle (None pour la désactiver)
    pub api_listen: Option<String>,
}

/// Déclaration d'un classifieur dans la configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClassifierConfig {
    /// Nom du classifieur, repris dans les verdicts et le journal d'audit
    pub name: String,

    /// Famille d'implémentation
    pub kind: ClassifierKind,

    /// Poids dans le vote pondéré
    pub weight: f64,

    /// Un classifieur désactivé ne vote pas
    pub enabled: bool,

    /// Chemin du fichier de modèle (requis pour `linear`)
    pub model_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Threshold,
    Linear,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Iptables,
    Nftables,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: env!("CARGO_PKG_VERSION").to_string(),
            interfaces: vec!["eth0".to_string()],
            flow_timeout_secs: 10,
            sweep_interval_secs: 5,
            block_ttl_secs: 600,
            log_file: "/var/log/fluxgarde/fluxgarde.log".to_string(),
            log_level: "info".to_string(),
            log_mode: LogMode::File,
            whitelist: vec!["127.0.0.1".to_string(), "::1".to_string()],

            // Dimensionnement des files et des tâches
            worker_threads: num_cpus::get(),
            packet_queue_size: 10000,
            flow_queue_size: 1000,
            audit_queue_size: 1024,

            // Bornes de temps sur les opérations externes
            classifier_timeout_ms: 2000,
            command_timeout_ms: 5000,

            classifiers: vec![ClassifierConfig {
                name: "heuristique".to_string(),
                kind: ClassifierKind::Threshold,
                weight: 1.0,
                enabled: true,
                model_path: None,
            }],
            backends: vec![BackendKind::Iptables, BackendKind::Nftables],
            db_path: "/var/lib/fluxgarde/fluxgarde.db".to_string(),
            api_listen: Some("127.0.0.1:8787".to_string()),
        }
    }
}

impl Config {
    /// Charge la configuration depuis le fichier par défaut
    pub fn load() -> Result<Self, Box<dyn Error>> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Charge la configuration depuis un chemin donné.
    ///
    /// Si le fichier n'existe pas, la configuration par défaut est retournée
    /// et on tente de l'écrire sur disque pour les exécutions suivantes.
    pub fn load_from(path: &Path) -> Result<Self, Box<dyn Error>> {
        if !path.exists() {
            let default_config = Config::default();
            if let Err(e) = default_config.save_to(path) {
                // Sans privilèges, /etc peut être hors d'atteinte ; on
                // continue avec les valeurs par défaut.
                warn!("Impossible d'écrire la configuration par défaut dans {}: {}", path.display(), e);
            }
            return Ok(default_config);
        }

        let config_content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_content)?;

        Ok(config)
    }

    /// Sauvegarde la configuration dans le fichier par défaut
    pub fn save(&self) -> Result<(), Box<dyn Error>> {
        self.save_to(Path::new(CONFIG_FILE))
    }

    /// Sauvegarde la configuration dans un chemin donné
    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn Error>> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let config_json = serde_json::to_string_pretty(self)?;
        fs::write(path, config_json)?;

        Ok(())
    }

    /// Classifieurs actifs, dans l'ordre de déclaration
    pub fn active_classifiers(&self) -> impl Iterator<Item = &ClassifierConfig> {
        self.classifiers.iter().filter(|c| c.enabled)
    }
}
