//! Bibliothèque FluxGarde pour la détection d'intrusions par analyse de flux
//!
//! Cette bibliothèque reconstruit les flux réseau à partir des paquets capturés,
//! en extrait des caractéristiques statistiques et soumet chaque flux clôturé
//! à un ensemble de classifieurs à vote pondéré.
//!
//! Les flux jugés hostiles sont bloqués au pare-feu avec une durée de vie,
//! et chaque décision est consignée dans un journal d'audit SQLite.

// Modules principaux
pub mod models;   // Structures de données partagées
pub mod config;   // Configuration du système
pub mod logger;   // Journalisation des événements
pub mod log_mode; // Modes de journalisation

// Chaîne de traitement des flux
pub mod capture;  // Capture et décodage des paquets
pub mod flow;     // Table des flux en cours
pub mod features; // Extraction des caractéristiques statistiques

// Détection et mitigation
pub mod classifier; // Classifieurs de l'ensemble
pub mod decision;   // Vote pondéré et verdict final
pub mod backend;    // Backends pare-feu (iptables, nftables)
pub mod mitigation; // Pose et expiration des règles de blocage

// Journal d'audit et services
pub mod audit;    // Journal d'audit SQLite
pub mod service;  // Orchestration du pipeline complet
pub mod api;      // API HTTP de contrôle
pub mod simulate; // Génération de trafic synthétique
pub mod cli;      // Interface en ligne de commande

// Re-export des structures principales pour faciliter l'utilisation
pub use config::Config;
pub use log_mode::LogMode;
pub use models::{Decision, FinalizedFlow, FlowKey, GlobalStats, PacketInfo, Verdict};
pub use service::FluxgardeService;
