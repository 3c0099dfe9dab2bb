use crate::log_mode::LogMode;
use crate::models::{Decision, FinalLabel, FinalizedFlow, RuleOutcome};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

/// Journal des événements du moteur, en miroir du journal d'audit.
///
/// Selon le mode, les entrées partent dans un fichier plat ou vers
/// systemd-journal via la façade `log`.
pub struct Logger {
    log_file: Mutex<Option<File>>,
    log_path: String,
    log_mode: LogMode,
}

impl Logger {
    pub fn new(log_path: String) -> Self {
        Self::new_with_mode(log_path, LogMode::File)
    }

    pub fn new_with_mode(log_path: String, log_mode: LogMode) -> Self {
        // En mode fichier, ouvrir le fichier de log dès la construction
        let file = if log_mode == LogMode::File {
            if let Some(parent) = Path::new(&log_path).parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Erreur lors de la création du répertoire de logs: {}", e);
                }
            }

            match OpenOptions::new().create(true).append(true).open(&log_path) {
                Ok(file) => Some(file),
                Err(e) => {
                    error!("Erreur lors de l'ouverture du fichier de log {}: {}", log_path, e);
                    None
                }
            }
        } else {
            // En mode systemd-journal, pas besoin de fichier
            None
        };

        Self {
            log_file: Mutex::new(file),
            log_path,
            log_mode,
        }
    }

    /// Trace un flux clôturé avec ses volumes par direction.
    pub fn log_flow(&self, flow: &FinalizedFlow) {
        let log_entry = format!(
            "[{}] [FLOW] {} | {} pqts avant, {} pqts arrière, {} octets, durée {:.3}s",
            format_now(),
            flow.key,
            flow.record.forward_lengths.len(),
            flow.record.backward_lengths.len(),
            flow.record.total_bytes(),
            flow.record.duration().as_secs_f64(),
        );

        match self.log_mode {
            LogMode::File => self.write_to_log(&format!("{}\n", log_entry)),
            LogMode::SystemdJournal => debug!("{}", log_entry),
        }
    }

    /// Trace une décision d'ensemble avec son score et ses verdicts.
    pub fn log_decision(&self, decision: &Decision) {
        let verdicts: Vec<String> = decision
            .verdicts
            .iter()
            .map(|v| format!("{}={:?}", v.model, v.verdict))
            .collect();

        let log_entry = format!(
            "[{}] [DECISION] {} | {} (score {:.2}) | {}",
            format_now(),
            decision.key,
            decision.label,
            decision.score,
            verdicts.join(", "),
        );

        match self.log_mode {
            LogMode::File => self.write_to_log(&format!("{}\n", log_entry)),
            LogMode::SystemdJournal => match decision.label {
                FinalLabel::Drop => warn!("{}", log_entry),
                FinalLabel::Accept => info!("{}", log_entry),
            },
        }
    }

    pub fn log_block(&self, ip: IpAddr, ttl_secs: Option<u64>, outcome: RuleOutcome) {
        let duration = match ttl_secs {
            Some(secs) => format!("{} secondes", secs),
            None => "durée indéterminée".to_string(),
        };
        let log_entry = format!(
            "[{}] [BLOCK] IP {} bloquée pour {} ({})",
            format_now(),
            ip,
            duration,
            outcome.as_str(),
        );

        match self.log_mode {
            LogMode::File => self.write_to_log(&format!("{}\n", log_entry)),
            LogMode::SystemdJournal => warn!("{}", log_entry),
        }
    }

    pub fn log_unblock(&self, ip: IpAddr) {
        let log_entry = format!("[{}] [UNBLOCK] IP {} débloquée", format_now(), ip);

        match self.log_mode {
            LogMode::File => self.write_to_log(&format!("{}\n", log_entry)),
            LogMode::SystemdJournal => info!("{}", log_entry),
        }
    }

    fn write_to_log(&self, message: &str) {
        if self.log_mode == LogMode::SystemdJournal {
            return;
        }

        let mut log_file_guard = match self.log_file.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("Erreur lors de l'acquisition du verrou pour le fichier de log: {}", e);
                return;
            }
        };

        if let Some(file) = log_file_guard.as_mut() {
            if let Err(e) = file.write_all(message.as_bytes()) {
                error!("Erreur lors de l'écriture dans le fichier de log: {}", e);

                // Essayer de réouvrir le fichier
                *log_file_guard = match OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log_path)
                {
                    Ok(file) => Some(file),
                    Err(e) => {
                        error!("Erreur lors de la réouverture du fichier de log: {}", e);
                        None
                    }
                };
            }
        }
    }
}

fn format_now() -> String {
    let timestamp: DateTime<Local> = SystemTime::now().into();
    timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
