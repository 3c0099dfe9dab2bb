use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Mode de journalisation des événements du moteur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Journal dans un fichier local
    File,
    /// Journal via systemd-journal
    SystemdJournal,
}

impl Default for LogMode {
    fn default() -> Self {
        LogMode::File
    }
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMode::File => write!(f, "file"),
            LogMode::SystemdJournal => write!(f, "systemd_journal"),
        }
    }
}

impl FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(LogMode::File),
            "systemd_journal" | "journal" => Ok(LogMode::SystemdJournal),
            other => Err(format!("mode de journalisation inconnu: {}", other)),
        }
    }
}
