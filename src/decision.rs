use crate::classifier::RegisteredClassifier;
use crate::features::FeatureVector;
use crate::models::{Decision, FinalLabel, FlowKey, ModelVerdict, Verdict};
use futures::future::join_all;
use log::{debug, warn};
use std::time::{Duration, SystemTime};

/// Seuil du vote pondéré : DROP dès que le score l'atteint.
const DROP_THRESHOLD: f64 = 0.5;

/// Moteur de décision : combine les verdicts des classifieurs enregistrés
/// en une étiquette ACCEPT/DROP par vote pondéré.
///
/// Chaque classifieur vote indépendamment sous un délai borné ; un échec ou
/// un dépassement de délai retire son poids du vote au lieu d'interrompre la
/// décision. Si plus aucun poids ne vote, le moteur tranche en ACCEPT
/// (jamais de blocage sur silence des classifieurs).
pub struct DecisionEngine {
    classifiers: Vec<RegisteredClassifier>,
    classifier_timeout: Duration,
}

impl DecisionEngine {
    pub fn new(classifiers: Vec<RegisteredClassifier>, classifier_timeout: Duration) -> Self {
        Self {
            classifiers,
            classifier_timeout,
        }
    }

    pub fn classifier_count(&self) -> usize {
        self.classifiers.len()
    }

    /// Décide du sort d'un flux à partir de son vecteur de caractéristiques.
    pub async fn decide(&self, key: FlowKey, features: &FeatureVector) -> Decision {
        // Les classifieurs votent en parallèle, chacun sous son propre délai
        let invocations = self.classifiers.iter().map(|registered| async move {
            let name = registered.classifier.name().to_string();
            let verdict = match tokio::time::timeout(
                self.classifier_timeout,
                registered.classifier.predict(features),
            )
            .await
            {
                Err(_) => {
                    warn!("Classifieur {} hors délai, verdict écarté", name);
                    Verdict::Failed("délai dépassé".to_string())
                }
                Ok(Err(e)) => {
                    warn!("Classifieur {} en échec: {:#}", name, e);
                    Verdict::Failed(e.to_string())
                }
                Ok(Ok(label)) => Verdict::Label(label),
            };
            ModelVerdict {
                model: name,
                weight: registered.weight,
                verdict,
            }
        });
        let verdicts: Vec<ModelVerdict> = join_all(invocations).await;

        let mut active_weight = 0.0;
        let mut attack_weight = 0.0;
        for model_verdict in &verdicts {
            if let Verdict::Label(label) = &model_verdict.verdict {
                active_weight += model_verdict.weight;
                if *label != 0 {
                    attack_weight += model_verdict.weight;
                }
            }
        }

        let (score, label, notes) = if active_weight > 0.0 {
            let score = attack_weight / active_weight;
            let label = if score >= DROP_THRESHOLD {
                FinalLabel::Drop
            } else {
                FinalLabel::Accept
            };
            (score, label, None)
        } else {
            // Aucun vote exploitable : on laisse passer et on le consigne
            let notes = if self.classifiers.is_empty() {
                "aucun classifieur enregistré"
            } else {
                "tous les classifieurs ont échoué"
            };
            warn!("Décision sans vote pour {}: {}", key, notes);
            (0.0, FinalLabel::Accept, Some(notes.to_string()))
        };

        debug!("Décision {} pour {} (score {:.2})", label, key, score);

        Decision {
            key,
            verdicts,
            score,
            label,
            timestamp: SystemTime::now(),
            notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::features::FEATURE_DIM;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::Arc;

    struct FixedClassifier {
        name: String,
        label: i64,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        fn name(&self) -> &str {
            &self.name
        }

        async fn predict(&self, _features: &FeatureVector) -> Result<i64> {
            Ok(self.label)
        }
    }

    struct FailingClassifier {
        name: String,
    }

    #[async_trait]
    impl Classifier for FailingClassifier {
        fn name(&self) -> &str {
            &self.name
        }

        async fn predict(&self, _features: &FeatureVector) -> Result<i64> {
            Err(anyhow!("modèle indisponible"))
        }
    }

    struct SlowClassifier {
        name: String,
    }

    #[async_trait]
    impl Classifier for SlowClassifier {
        fn name(&self) -> &str {
            &self.name
        }

        async fn predict(&self, _features: &FeatureVector) -> Result<i64> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(1)
        }
    }

    fn fixed(name: &str, label: i64, weight: f64) -> RegisteredClassifier {
        RegisteredClassifier {
            weight,
            classifier: Arc::new(FixedClassifier {
                name: name.to_string(),
                label,
            }),
        }
    }

    fn failing(name: &str, weight: f64) -> RegisteredClassifier {
        RegisteredClassifier {
            weight,
            classifier: Arc::new(FailingClassifier {
                name: name.to_string(),
            }),
        }
    }

    fn test_key() -> FlowKey {
        FlowKey {
            addr_a: "10.0.0.1".parse::<IpAddr>().unwrap(),
            port_a: 1000,
            addr_b: "10.0.0.2".parse::<IpAddr>().unwrap(),
            port_b: 80,
            protocol: crate::models::PacketType::Tcp,
        }
    }

    fn features() -> FeatureVector {
        [0.0; FEATURE_DIM]
    }

    #[tokio::test]
    async fn test_all_benign_yields_accept() {
        let engine = DecisionEngine::new(
            vec![fixed("a", 0, 1.0), fixed("b", 0, 1.0), fixed("c", 0, 1.0)],
            Duration::from_secs(1),
        );

        let decision = engine.decide(test_key(), &features()).await;
        assert_eq!(decision.label, FinalLabel::Accept);
        assert_eq!(decision.score, 0.0);
        assert!(decision.notes.is_none());
    }

    #[tokio::test]
    async fn test_unanimous_attack_yields_drop() {
        let engine = DecisionEngine::new(vec![fixed("a", 1, 1.0), fixed("b", 1, 1.0)], Duration::from_secs(1));

        let decision = engine.decide(test_key(), &features()).await;
        assert_eq!(decision.label, FinalLabel::Drop);
        assert_eq!(decision.score, 1.0);
    }

    #[tokio::test]
    async fn test_half_weight_attack_tips_to_drop() {
        // Deux poids égaux, un seul vote attaque : score exactement 0,5
        let engine = DecisionEngine::new(vec![fixed("a", 1, 1.0), fixed("b", 0, 1.0)], Duration::from_secs(1));

        let decision = engine.decide(test_key(), &features()).await;
        assert_eq!(decision.score, 0.5);
        assert_eq!(decision.label, FinalLabel::Drop);
    }

    #[tokio::test]
    async fn test_minority_weight_attack_accepts() {
        // Poids 3 bénin contre poids 1 attaque : score 0,25
        let engine = DecisionEngine::new(vec![fixed("a", 0, 3.0), fixed("b", 1, 1.0)], Duration::from_secs(1));

        let decision = engine.decide(test_key(), &features()).await;
        assert_eq!(decision.score, 0.25);
        assert_eq!(decision.label, FinalLabel::Accept);
    }

    #[tokio::test]
    async fn test_heavy_single_classifier_dominates() {
        // Un classifieur de poids 3 suffit à emporter la décision
        let engine = DecisionEngine::new(
            vec![fixed("fort", 1, 3.0), fixed("a", 0, 1.0), fixed("b", 0, 1.0)],
            Duration::from_secs(1),
        );

        let decision = engine.decide(test_key(), &features()).await;
        assert_eq!(decision.score, 0.6);
        assert_eq!(decision.label, FinalLabel::Drop);
    }

    #[tokio::test]
    async fn test_failure_excluded_from_both_sums() {
        // L'échec du poids 5 ne pèse ni au numérateur ni au dénominateur
        let engine = DecisionEngine::new(vec![failing("hs", 5.0), fixed("a", 1, 1.0)], Duration::from_secs(1));

        let decision = engine.decide(test_key(), &features()).await;
        assert_eq!(decision.score, 1.0);
        assert_eq!(decision.label, FinalLabel::Drop);
        assert!(decision.verdicts[0].verdict.is_failure());
    }

    #[tokio::test]
    async fn test_all_failed_fails_open() {
        let engine = DecisionEngine::new(vec![failing("a", 1.0), failing("b", 2.0)], Duration::from_secs(1));

        let decision = engine.decide(test_key(), &features()).await;
        assert_eq!(decision.label, FinalLabel::Accept);
        assert!(decision.verdicts.iter().all(|v| v.verdict.is_failure()));
        assert_eq!(decision.notes.as_deref(), Some("tous les classifieurs ont échoué"));
    }

    #[tokio::test]
    async fn test_no_classifiers_fails_open() {
        let engine = DecisionEngine::new(vec![], Duration::from_secs(1));

        let decision = engine.decide(test_key(), &features()).await;
        assert_eq!(decision.label, FinalLabel::Accept);
        assert!(decision.verdicts.is_empty());
        assert_eq!(decision.notes.as_deref(), Some("aucun classifieur enregistré"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let slow = RegisteredClassifier {
            weight: 1.0,
            classifier: Arc::new(SlowClassifier {
                name: "lent".to_string(),
            }),
        };
        let engine = DecisionEngine::new(vec![slow, fixed("a", 0, 1.0)], Duration::from_millis(20));

        let decision = engine.decide(test_key(), &features()).await;
        assert!(decision.verdicts[0].verdict.is_failure());
        assert_eq!(decision.label, FinalLabel::Accept);
        assert_eq!(decision.score, 0.0);
    }
}
