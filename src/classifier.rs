use crate::config::{ClassifierConfig, ClassifierKind};
use crate::features::{FeatureVector, FEATURE_DIM};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Capacité de classification : prédit une étiquette entière pour un vecteur
/// de caractéristiques (0 bénin, autre valeur attaque).
///
/// Les implémentations sont enregistrées avec un nom et un poids de vote ;
/// le moteur de décision les invoque indépendamment et convertit toute
/// erreur en verdict d'échec sans interrompre le vote des autres.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn predict(&self, features: &FeatureVector) -> Result<i64>;
}

/// Classifieur enregistré auprès du moteur de décision
#[derive(Clone)]
pub struct RegisteredClassifier {
    pub weight: f64,
    pub classifier: Arc<dyn Classifier>,
}

/// Classifieur à seuils sur les caractéristiques du flux.
///
/// Règles volontairement simples : débit de paquets anormal, SYN répétés
/// sans aucune réponse, rafale unilatérale de petits paquets.
pub struct ThresholdClassifier {
    name: String,
    /// Débit (paquets/s) au-delà duquel le flux est jugé hostile
    pub max_packets_per_second: f64,
    /// Part de SYN dans les paquets avant au-delà de laquelle on suspecte un flood
    pub max_syn_ratio: f64,
    /// Nombre minimal de paquets avant pour que les ratios aient un sens
    pub min_packets_for_ratio: f64,
}

impl ThresholdClassifier {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_packets_per_second: 100.0,
            max_syn_ratio: 0.8,
            min_packets_for_ratio: 3.0,
        }
    }
}

#[async_trait]
impl Classifier for ThresholdClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, features: &FeatureVector) -> Result<i64> {
        let duration = features[1].max(1.0);
        let fwd_packets = features[2];
        let bwd_packets = features[3];
        let fwd_syn = features[43];

        // Débit de paquets sur la durée du flux
        let pps = features[14] / duration;
        if pps > self.max_packets_per_second {
            return Ok(1);
        }

        // SYN flood : majorité de SYN côté avant et aucune réponse
        if fwd_packets >= self.min_packets_for_ratio && bwd_packets == 0.0 {
            let syn_ratio = fwd_syn / fwd_packets;
            if syn_ratio > self.max_syn_ratio {
                return Ok(1);
            }
        }

        // Rafale unilatérale de petits paquets (balayage)
        if fwd_packets >= 20.0 && bwd_packets == 0.0 && features[8] < 64.0 {
            return Ok(1);
        }

        Ok(0)
    }
}

/// Paramètres d'un modèle logistique sérialisé en JSON
#[derive(Debug, Deserialize)]
struct LinearModelFile {
    weights: Vec<f64>,
    bias: f64,
}

/// Classifieur logistique dont les poids sont chargés depuis un fichier.
///
/// L'étiquette vaut 1 quand la sigmoïde du produit scalaire dépasse 0,5.
pub struct LinearClassifier {
    name: String,
    weights: Vec<f64>,
    bias: f64,
}

impl LinearClassifier {
    pub fn new(name: &str, weights: Vec<f64>, bias: f64) -> Self {
        Self {
            name: name.to_string(),
            weights,
            bias,
        }
    }

    pub fn from_file(name: &str, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("lecture du modèle {}", path.display()))?;
        let model: LinearModelFile = serde_json::from_str(&content)
            .with_context(|| format!("analyse du modèle {}", path.display()))?;
        Ok(Self::new(name, model.weights, model.bias))
    }
}

#[async_trait]
impl Classifier for LinearClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, features: &FeatureVector) -> Result<i64> {
        if self.weights.len() != FEATURE_DIM {
            return Err(anyhow!(
                "dimension du modèle incompatible: {} poids pour {} caractéristiques",
                self.weights.len(),
                FEATURE_DIM
            ));
        }

        let z: f64 = self
            .weights
            .iter()
            .zip(features.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;
        let probability = 1.0 / (1.0 + (-z).exp());

        Ok(if probability >= 0.5 { 1 } else { 0 })
    }
}

/// Construit la liste des classifieurs actifs depuis la configuration.
///
/// Un classifieur dont le modèle ne se charge pas est écarté avec un
/// avertissement ; le moteur continue avec les autres (et tranche en
/// ACCEPT si plus aucun ne vote).
pub fn build_classifiers(configs: &[ClassifierConfig]) -> Vec<RegisteredClassifier> {
    let mut registered = Vec::new();

    for config in configs.iter().filter(|c| c.enabled) {
        let classifier: Option<Arc<dyn Classifier>> = match config.kind {
            ClassifierKind::Threshold => Some(Arc::new(ThresholdClassifier::new(&config.name))),
            ClassifierKind::Linear => match &config.model_path {
                Some(path) => match LinearClassifier::from_file(&config.name, Path::new(path)) {
                    Ok(c) => Some(Arc::new(c)),
                    Err(e) => {
                        warn!("Classifieur {} écarté: {:#}", config.name, e);
                        None
                    }
                },
                None => {
                    warn!("Classifieur {} écarté: aucun chemin de modèle configuré", config.name);
                    None
                }
            },
        };

        if let Some(classifier) = classifier {
            info!("Classifieur {} enregistré (poids {})", config.name, config.weight);
            registered.push(RegisteredClassifier {
                weight: config.weight,
                classifier,
            });
        }
    }

    registered
}
