use crate::config::BackendKind;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Résultat structuré d'une commande externe
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Exécute une commande sous délai borné et retourne sa sortie structurée.
///
/// Les arguments sont passés tels quels au processus, jamais via un shell ;
/// les adresses sont typées `IpAddr` en amont, il n'y a donc rien à
/// échapper. Le dépassement de délai est une erreur comme une autre pour
/// l'appelant.
pub async fn run_command(program: &str, args: &[String], timeout: Duration) -> Result<CmdOutput> {
    let output = tokio::time::timeout(timeout, Command::new(program).args(args).output())
        .await
        .map_err(|_| anyhow!("commande {} hors délai après {:?}", program, timeout))?
        .with_context(|| format!("lancement de {}", program))?;

    Ok(CmdOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Backend de pare-feu : pose et retire des règles DROP par adresse source.
///
/// La pose échoue bruyamment (l'appelant bascule sur le backend suivant) ;
/// le retrait est de son côté tolérant, une règle absente n'est pas une
/// erreur.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn apply_drop_rule(&self, addr: IpAddr) -> Result<()>;

    async fn remove_drop_rule(&self, addr: IpAddr) -> Result<()>;
}

/// Backend iptables (ip6tables pour les adresses IPv6).
///
/// La règle ne cible que les nouvelles connexions, les sessions établies
/// avant le blocage s'éteignent d'elles-mêmes.
pub struct IptablesBackend {
    command_timeout: Duration,
}

impl IptablesBackend {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    fn binary(addr: IpAddr) -> &'static str {
        if addr.is_ipv6() {
            "ip6tables"
        } else {
            "iptables"
        }
    }

    fn rule_args(verb: &str, addr: IpAddr) -> Vec<String> {
        vec![
            verb.to_string(),
            "INPUT".to_string(),
            "-s".to_string(),
            addr.to_string(),
            "-m".to_string(),
            "conntrack".to_string(),
            "--ctstate".to_string(),
            "NEW".to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &str {
        "iptables"
    }

    async fn apply_drop_rule(&self, addr: IpAddr) -> Result<()> {
        let binary = Self::binary(addr);
        let output = run_command(binary, &Self::rule_args("-I", addr), self.command_timeout).await?;
        if !output.success() {
            return Err(anyhow!("{} a refusé la règle: {}", binary, output.stderr));
        }
        debug!("Règle DROP posée via {} pour {}", binary, addr);
        Ok(())
    }

    async fn remove_drop_rule(&self, addr: IpAddr) -> Result<()> {
        let binary = Self::binary(addr);
        // La règle peut avoir été posée plusieurs fois : on supprime tant
        // que la suppression aboutit, avec une borne dure.
        for _ in 0..5 {
            let output = run_command(binary, &Self::rule_args("-D", addr), self.command_timeout).await?;
            if !output.success() {
                break;
            }
            debug!("Règle DROP retirée via {} pour {}", binary, addr);
        }
        Ok(())
    }
}

/// Backend nftables, utilisé en secours quand iptables échoue.
pub struct NftablesBackend {
    command_timeout: Duration,
}

impl NftablesBackend {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    fn rule_args(verb: &str, addr: IpAddr) -> Vec<String> {
        let family = if addr.is_ipv6() { "ip6" } else { "ip" };
        vec![
            verb.to_string(),
            "rule".to_string(),
            "inet".to_string(),
            "filter".to_string(),
            "input".to_string(),
            family.to_string(),
            "saddr".to_string(),
            addr.to_string(),
            "drop".to_string(),
        ]
    }
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &str {
        "nftables"
    }

    async fn apply_drop_rule(&self, addr: IpAddr) -> Result<()> {
        let output = run_command("nft", &Self::rule_args("add", addr), self.command_timeout).await?;
        if !output.success() {
            return Err(anyhow!("nft a refusé la règle: {}", output.stderr));
        }
        debug!("Règle DROP posée via nftables pour {}", addr);
        Ok(())
    }

    async fn remove_drop_rule(&self, addr: IpAddr) -> Result<()> {
        let output = run_command("nft", &Self::rule_args("delete", addr), self.command_timeout).await?;
        if !output.success() {
            // Règle absente ou table inexistante : rien à retirer
            warn!("nft n'a pas retiré de règle pour {}: {}", addr, output.stderr);
        }
        Ok(())
    }
}

/// Construit la chaîne de backends dans l'ordre de préférence configuré.
pub fn build_backends(kinds: &[BackendKind], command_timeout: Duration) -> Vec<Arc<dyn FirewallBackend>> {
    kinds
        .iter()
        .map(|kind| match kind {
            BackendKind::Iptables => {
                Arc::new(IptablesBackend::new(command_timeout)) as Arc<dyn FirewallBackend>
            }
            BackendKind::Nftables => {
                Arc::new(NftablesBackend::new(command_timeout)) as Arc<dyn FirewallBackend>
            }
        })
        .collect()
}
