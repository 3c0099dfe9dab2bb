use crate::audit::AuditHandle;
use crate::backend::FirewallBackend;
use crate::logger::Logger;
use crate::models::{MitigationRule, RuleOutcome};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Adresse rejetée par la surface de contrôle manuelle.
///
/// Seule erreur remontée telle quelle à l'appelant : tout le reste du
/// chemin de mitigation dégrade en résultat distinguable sans jamais
/// interrompre le traitement des flux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adresse IP invalide: {}", self.0)
    }
}

impl std::error::Error for InvalidAddress {}

/// Valide une adresse textuelle avant toute construction de commande.
pub fn parse_address(raw: &str) -> Result<IpAddr, InvalidAddress> {
    raw.trim()
        .parse::<IpAddr>()
        .map_err(|_| InvalidAddress(raw.to_string()))
}

/// Vrai si le processus tourne avec les privilèges nécessaires pour
/// modifier le pare-feu. Évalué une seule fois.
static PRIVILEGED: Lazy<bool> = Lazy::new(|| {
    std::process::Command::new("id")
        .arg("-u")
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "0")
        .unwrap_or(false)
});

pub fn process_is_privileged() -> bool {
    *PRIVILEGED
}

/// Contrôleur de mitigation : traduit les décisions DROP en règles de
/// blocage bornées dans le temps, et les retire à l'échéance ou sur demande.
///
/// Chaque appel de blocage porteur d'un TTL programme sa propre tâche de
/// déblocage différé ; un re-blocage ne remet aucun compteur à zéro et le
/// premier déblocage à se déclencher l'emporte, les suivants tombant sur le
/// chemin idempotent. Toute tentative, aboutie ou non, laisse une trace
/// dans le journal d'audit.
pub struct MitigationController {
    backends: Vec<Arc<dyn FirewallBackend>>,
    active: DashMap<IpAddr, MitigationRule>,
    whitelist: Vec<IpAddr>,
    privileged: bool,
    audit: AuditHandle,
    logger: Arc<Logger>,
}

impl MitigationController {
    pub fn new(
        backends: Vec<Arc<dyn FirewallBackend>>,
        whitelist: Vec<IpAddr>,
        privileged: bool,
        audit: AuditHandle,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            backends,
            active: DashMap::new(),
            whitelist,
            privileged,
            audit,
            logger,
        }
    }

    /// Bloque une adresse source, avec déblocage automatique après `ttl`.
    ///
    /// Idempotent : une adresse déjà sous règle active retourne
    /// [`RuleOutcome::AlreadyActive`] sans toucher au pare-feu, mais un TTL
    /// fourni programme tout de même son déblocage.
    pub async fn block(
        self: &Arc<Self>,
        ip: IpAddr,
        ttl: Option<Duration>,
        reason: &str,
    ) -> RuleOutcome {
        debug!("Tentative de blocage de l'IP {}", ip);

        if self.whitelist.contains(&ip) {
            warn!("Tentative de blocage d'une IP en liste blanche ignorée: {}", ip);
            let rule = MitigationRule::new(ip, ttl, reason.to_string(), RuleOutcome::Whitelisted);
            self.audit.append_rule(rule).await;
            return RuleOutcome::Whitelisted;
        }

        if self.active.contains_key(&ip) {
            debug!("IP {} déjà bloquée, aucun changement", ip);
            if let Some(ttl) = ttl {
                // Chaque appel garde son propre minuteur : le premier à
                // expirer lève la règle, les autres déblocages sont des
                // non-opérations.
                self.schedule_unblock(ip, ttl);
            }
            return RuleOutcome::AlreadyActive;
        }

        if !self.privileged {
            // Sans privilèges on consigne la règle voulue pour une pose
            // manuelle ultérieure.
            warn!("Blocage de {} impossible sans privilèges, règle consignée", ip);
            let rule = MitigationRule::new(
                ip,
                ttl,
                format!("{} (sans privilèges)", reason),
                RuleOutcome::PermissionDenied,
            );
            self.audit.append_rule(rule).await;
            return RuleOutcome::PermissionDenied;
        }

        let mut last_error = None;
        for backend in &self.backends {
            match backend.apply_drop_rule(ip).await {
                Ok(()) => {
                    info!("IP {} bloquée via {}", ip, backend.name());
                    let rule = MitigationRule::new(ip, ttl, reason.to_string(), RuleOutcome::Applied);
                    self.active.insert(ip, rule.clone());
                    self.audit.append_rule(rule).await;
                    self.logger.log_block(ip, ttl.map(|d| d.as_secs()), RuleOutcome::Applied);

                    if let Some(ttl) = ttl {
                        self.schedule_unblock(ip, ttl);
                    }
                    return RuleOutcome::Applied;
                }
                Err(e) => {
                    warn!("Backend {} en échec pour {}: {:#}", backend.name(), ip, e);
                    last_error = Some(e);
                }
            }
        }

        // Tous les backends ont refusé : la tentative reste tracée
        error!(
            "Aucun backend n'a pu bloquer {}: {}",
            ip,
            last_error.map(|e| format!("{:#}", e)).unwrap_or_else(|| "aucun backend configuré".to_string())
        );
        let rule = MitigationRule::new(ip, ttl, reason.to_string(), RuleOutcome::BackendFailure);
        self.audit.append_rule(rule).await;
        self.logger.log_block(ip, ttl.map(|d| d.as_secs()), RuleOutcome::BackendFailure);
        RuleOutcome::BackendFailure
    }

    /// Variante de [`Self::block`] pour la surface manuelle : l'adresse
    /// textuelle est validée avant toute chose.
    pub async fn block_address(
        self: &Arc<Self>,
        raw: &str,
        ttl: Option<Duration>,
        reason: &str,
    ) -> Result<RuleOutcome, InvalidAddress> {
        let ip = parse_address(raw)?;
        Ok(self.block(ip, ttl, reason).await)
    }

    /// Retire la règle d'une adresse, quel que soit le backend qui la porte.
    ///
    /// Une règle absente est un succès : le retrait concourt avec les
    /// minuteurs et les demandes manuelles, et l'idempotence tient lieu de
    /// verrou.
    pub async fn unblock(&self, ip: IpAddr) -> bool {
        debug!("Tentative de déblocage de l'IP {}", ip);
        let was_active = self.active.remove(&ip).is_some();

        if self.privileged {
            // Retrait sur tous les backends : après un redémarrage, la
            // règle peut exister sans figurer dans l'état en mémoire.
            for backend in &self.backends {
                if let Err(e) = backend.remove_drop_rule(ip).await {
                    warn!("Retrait via {} impossible pour {}: {:#}", backend.name(), ip, e);
                }
            }
        } else {
            debug!("Déblocage de {} sans privilèges: pare-feu non modifié", ip);
        }

        self.audit.update_rule_expiry(ip, SystemTime::now()).await;
        if was_active {
            info!("IP {} débloquée", ip);
            self.logger.log_unblock(ip);
        }
        true
    }

    /// Variante de [`Self::unblock`] pour la surface manuelle.
    pub async fn unblock_address(&self, raw: &str) -> Result<bool, InvalidAddress> {
        let ip = parse_address(raw)?;
        Ok(self.unblock(ip).await)
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.active.contains_key(&ip)
    }

    /// Règles actuellement actives, pour les surfaces de consultation.
    pub fn active_rules(&self) -> Vec<MitigationRule> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn schedule_unblock(self: &Arc<Self>, ip: IpAddr, ttl: Duration) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            debug!("Expiration du blocage de {}", ip);
            controller.unblock(ip).await;
        });
    }
}
