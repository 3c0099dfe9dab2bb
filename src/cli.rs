use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Interface en ligne de commande de FluxGarde
#[derive(Parser)]
#[command(
    name = "fluxgarde",
    version,
    about = "Détection et mitigation d'intrusions réseau par analyse de flux",
    long_about = None
)]
pub struct Cli {
    /// Chemin d'un fichier de configuration alternatif
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Démarre le service de détection
    Start {
        /// Lance le service en arrière-plan
        #[arg(short, long)]
        daemon: bool,
    },

    /// Affiche l'état du service et de la configuration
    Status,

    /// Bloque une adresse IP dans le pare-feu
    Block {
        /// Adresse IP à bloquer
        ip: String,

        /// Durée du blocage en secondes (permanent si absent)
        #[arg(short, long)]
        ttl: Option<u64>,

        /// Motif consigné dans le journal d'audit
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Retire le blocage d'une adresse IP
    Unblock {
        /// Adresse IP à débloquer
        ip: String,
    },

    /// Liste les dernières règles de mitigation consignées
    Rules {
        /// Nombre de règles à afficher
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Liste les dernières décisions du vote des classifieurs
    Decisions {
        /// Nombre de décisions à afficher
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Liste les derniers flux clôturés
    Flows {
        /// Nombre de flux à afficher
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Rejoue un trafic synthétique dans le pipeline de détection
    Simulate {
        /// Nombre de flux à générer
        #[arg(short, long, default_value_t = 100)]
        flows: usize,

        /// Proportion de flux hostiles, entre 0 et 1
        #[arg(short, long, default_value_t = 0.2)]
        attack_ratio: f64,
    },
}
