use clap::Parser;
use fluxgarde::audit::{AuditHandle, AuditStore};
use fluxgarde::backend::build_backends;
use fluxgarde::cli::{Cli, Command};
use fluxgarde::config::Config;
use fluxgarde::log_mode::LogMode;
use fluxgarde::logger::Logger;
use fluxgarde::mitigation::{process_is_privileged, MitigationController};
use fluxgarde::models::RuleOutcome;
use fluxgarde::service::FluxgardeService;
use fluxgarde::simulate;
use log::{error, info};
use std::path::Path;
use std::process::{exit, Command as ProcessCommand};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Charger la configuration pour déterminer le mode de log
    let config = match &cli.config {
        Some(path) => Config::load_from(path).unwrap_or_else(|e| {
            eprintln!(
                "Configuration {} illisible ({}), valeurs par défaut utilisées",
                path.display(),
                e
            );
            Config::default()
        }),
        None => Config::load().unwrap_or_else(|_| Config::default()),
    };
    init_logging(&config);

    match cli.command {
        Command::Start { daemon } => {
            if daemon {
                launch_daemon(cli.config.as_deref());
            } else {
                run_service(config).await?;
            }
        }
        Command::Status => show_status(&config),
        Command::Block { ip, ttl, reason } => handle_block(&config, &ip, ttl, reason).await?,
        Command::Unblock { ip } => handle_unblock(&config, &ip).await?,
        Command::Rules { limit } => print_rules(&config, limit)?,
        Command::Decisions { limit } => print_decisions(&config, limit)?,
        Command::Flows { limit } => print_flows(&config, limit)?,
        Command::Simulate {
            flows,
            attack_ratio,
        } => simulate::run_simulation(config, flows, attack_ratio).await?,
    }

    Ok(())
}

fn init_logging(config: &Config) {
    match config.log_mode {
        LogMode::File => {
            env_logger::init_from_env(
                env_logger::Env::default().default_filter_or(&config.log_level),
            );
        }
        LogMode::SystemdJournal => {
            #[cfg(feature = "systemd")]
            {
                use systemd_journal_logger::JournalLog;

                let log_level = match config.log_level.to_lowercase().as_str() {
                    "trace" => log::LevelFilter::Trace,
                    "debug" => log::LevelFilter::Debug,
                    "info" => log::LevelFilter::Info,
                    "warn" => log::LevelFilter::Warn,
                    "error" => log::LevelFilter::Error,
                    _ => log::LevelFilter::Info,
                };

                match JournalLog::new() {
                    Ok(logger) => {
                        if let Err(e) = logger
                            .with_syslog_identifier("fluxgarde".to_string())
                            .install()
                        {
                            eprintln!("Erreur lors de l'installation du logger systemd: {}", e);
                            env_logger::init_from_env(
                                env_logger::Env::default().default_filter_or(&config.log_level),
                            );
                        } else {
                            log::set_max_level(log_level);
                            info!("Logger systemd initialisé avec niveau: {}", config.log_level);
                        }
                    }
                    Err(e) => {
                        eprintln!("Erreur lors de l'initialisation du logger systemd: {}", e);
                        env_logger::init_from_env(
                            env_logger::Env::default().default_filter_or(&config.log_level),
                        );
                    }
                }
            }

            #[cfg(not(feature = "systemd"))]
            {
                eprintln!("AVERTISSEMENT: Le mode SystemdJournal n'est pas disponible (feature 'systemd' non activée). Utilisation du logger standard à la place.");
                env_logger::init_from_env(
                    env_logger::Env::default().default_filter_or(&config.log_level),
                );
            }
        }
    }
}

async fn run_service(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let service = Arc::new(FluxgardeService::new(config)?);
    service.run().await?;

    // Le pipeline tourne en tâches de fond, on attend le signal d'arrêt
    tokio::signal::ctrl_c().await?;
    info!("Signal d'arrêt reçu, fermeture de FluxGarde");
    Ok(())
}

// Contrôleur autonome pour les commandes manuelles, sans pipeline
fn standalone_controller(
    config: &Config,
) -> Result<Arc<MitigationController>, Box<dyn std::error::Error>> {
    let store = AuditStore::open(Path::new(&config.db_path))?;
    let audit = AuditHandle::spawn(store, config.audit_queue_size);
    let logger = Arc::new(Logger::new_with_mode(config.log_file.clone(), config.log_mode));
    let backends = build_backends(
        &config.backends,
        Duration::from_millis(config.command_timeout_ms),
    );
    let whitelist = config
        .whitelist
        .iter()
        .filter_map(|raw| raw.parse().ok())
        .collect();

    Ok(Arc::new(MitigationController::new(
        backends,
        whitelist,
        process_is_privileged(),
        audit,
        logger,
    )))
}

async fn handle_block(
    config: &Config,
    ip: &str,
    ttl: Option<u64>,
    reason: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let controller = standalone_controller(config)?;
    let ttl = ttl.map(Duration::from_secs);
    let reason = reason.unwrap_or_else(|| "blocage manuel".to_string());

    let outcome = controller.block_address(ip, ttl, &reason).await?;
    // Laisser la tâche d'écriture drainer la file d'audit avant de quitter
    tokio::time::sleep(Duration::from_millis(100)).await;

    match outcome {
        RuleOutcome::Applied => {
            println!("IP {} bloquée", ip);
            if ttl.is_some() {
                println!("Remarque: le déblocage automatique n'est honoré que par le service en cours d'exécution");
            }
        }
        RuleOutcome::AlreadyActive => println!("IP {} déjà bloquée", ip),
        RuleOutcome::Whitelisted => {
            println!("IP {} en liste blanche, blocage refusé", ip);
            exit(1);
        }
        RuleOutcome::PermissionDenied => {
            println!("Privilèges insuffisants: règle consignée pour {}", ip);
            exit(1);
        }
        RuleOutcome::BackendFailure => {
            println!("Échec: aucun backend n'a pu bloquer {}", ip);
            exit(1);
        }
    }
    Ok(())
}

async fn handle_unblock(config: &Config, ip: &str) -> Result<(), Box<dyn std::error::Error>> {
    let controller = standalone_controller(config)?;
    controller.unblock_address(ip).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("IP {} débloquée", ip);
    Ok(())
}

fn show_status(config: &Config) {
    println!("=== Statut de FluxGarde ===");
    println!("Version: {}", config.version);
    println!("Interfaces surveillées: {}", config.interfaces.join(", "));
    println!("Timeout d'inactivité des flux: {} secondes", config.flow_timeout_secs);
    println!("TTL des blocages automatiques: {} secondes", config.block_ttl_secs);
    println!(
        "Privilèges pare-feu: {}",
        if process_is_privileged() { "oui" } else { "non" }
    );
    println!("Base d'audit: {}", config.db_path);
    match &config.api_listen {
        Some(listen) => println!("API de contrôle: {}", listen),
        None => println!("API de contrôle: désactivée"),
    }

    println!("\n=== Classifieurs ===");
    for classifier in &config.classifiers {
        println!(
            "  {} ({:?}), poids {}, {}",
            classifier.name,
            classifier.kind,
            classifier.weight,
            if classifier.enabled { "actif" } else { "désactivé" }
        );
    }

    println!("\n=== Journal d'audit ===");
    match AuditStore::open(Path::new(&config.db_path)) {
        Ok(store) => match store.table_counts() {
            Ok(counts) => {
                println!("Décisions enregistrées: {}", counts.decisions);
                println!("Flux enregistrés: {}", counts.flows);
                println!("Règles de mitigation consignées: {}", counts.rules);
            }
            Err(e) => println!("Lecture impossible: {:#}", e),
        },
        Err(e) => println!("Base inaccessible: {:#}", e),
    }
}

fn print_rules(config: &Config, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let store = AuditStore::open(Path::new(&config.db_path))?;
    let rows = store.recent_rules(limit)?;
    if rows.is_empty() {
        println!("Aucune règle consignée");
        return Ok(());
    }

    println!("=== Dernières règles de mitigation ===");
    for row in rows {
        println!(
            "[{}] {} {} ({}), expire: {}, motif: {}",
            row.added_at,
            row.action,
            row.src_ip,
            row.outcome,
            row.expiry.as_deref().unwrap_or("jamais"),
            row.reason.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn print_decisions(config: &Config, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let store = AuditStore::open(Path::new(&config.db_path))?;
    let rows = store.recent_decisions(limit)?;
    if rows.is_empty() {
        println!("Aucune décision enregistrée");
        return Ok(());
    }

    println!("=== Dernières décisions ===");
    for row in rows {
        let notes = row.notes.map(|n| format!(" ({})", n)).unwrap_or_default();
        println!(
            "[{}] {}:{} <-> {}:{} [{}] {} score {:.2}{}",
            row.timestamp,
            row.addr_a,
            row.port_a,
            row.addr_b,
            row.port_b,
            row.protocol,
            row.label,
            row.score,
            notes,
        );
    }
    Ok(())
}

fn print_flows(config: &Config, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let store = AuditStore::open(Path::new(&config.db_path))?;
    let rows = store.recent_flows(limit)?;
    if rows.is_empty() {
        println!("Aucun flux enregistré");
        return Ok(());
    }

    println!("=== Derniers flux clôturés ===");
    for row in rows {
        println!(
            "[{}] {}:{} -> {}:{} [{}] {} pqts avant, {} pqts arrière, {} octets, {:.3}s",
            row.timestamp,
            row.src_ip,
            row.src_port,
            row.dst_ip,
            row.dst_port,
            row.protocol,
            row.fwd_packets,
            row.bwd_packets,
            row.total_bytes,
            row.duration_secs,
        );
    }
    Ok(())
}

// Relance l'exécutable en arrière-plan puis quitte le processus parent
fn launch_daemon(config_path: Option<&Path>) {
    let args = std::env::args().collect::<Vec<String>>();
    let executable = &args[0];

    let mut command = ProcessCommand::new(executable);
    command.arg("start");
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }

    let status = command
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();

    match status {
        Ok(_) => {
            info!("FluxGarde démarré en arrière-plan");

            // Attendre un court instant pour que le processus enfant démarre
            std::thread::sleep(Duration::from_millis(500));
            exit(0);
        }
        Err(e) => {
            error!("Erreur lors du démarrage en arrière-plan: {}", e);
            exit(1);
        }
    }
}
