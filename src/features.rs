use crate::models::{FinalizedFlow, FlagCounts};
use std::time::SystemTime;

/// Dimension du vecteur de caractéristiques attendu par les classifieurs.
pub const FEATURE_DIM: usize = 78;

/// Valeur plancher des statistiques sur séquences vides.
///
/// Un flux unidirectionnel n'a aucune longueur dans l'un des deux sens ;
/// retourner zéro y produirait des variances dégénérées et des NaN chez
/// certains classifieurs. Convention de stabilité numérique, pas une valeur
/// sémantique.
pub const STAT_EPSILON: f64 = 1e-6;

pub type FeatureVector = [f64; FEATURE_DIM];

/// Transforme un flux clôturé en vecteur de caractéristiques à positions
/// fixes. Le schéma est partagé par tous les classifieurs enregistrés :
///
/// | positions | contenu |
/// |-----------|---------|
/// | 0         | port du répondeur |
/// | 1         | durée du flux (secondes) |
/// | 2, 3      | nombre de paquets avant / arrière |
/// | 4, 5      | octets cumulés avant / arrière |
/// | 6..=9     | longueurs avant : max, min, moyenne, écart-type |
/// | 10..=13   | longueurs arrière : max, min, moyenne, écart-type |
/// | 14, 15    | totaux combinés : paquets, octets |
/// | 16..=19   | inter-arrivées : moyenne, écart-type, max, min |
/// | 42..=47   | drapeaux avant : FIN, SYN, RST, PSH, ACK, URG |
/// | 48..=53   | drapeaux arrière : FIN, SYN, RST, PSH, ACK, URG |
/// | autres    | 0 (réservés : statistiques d'en-têtes non suivies) |
pub fn extract(flow: &FinalizedFlow) -> FeatureVector {
    let record = &flow.record;
    let mut features = [0.0f64; FEATURE_DIM];

    let fwd_count = record.forward_lengths.len() as f64;
    let bwd_count = record.backward_lengths.len() as f64;
    let fwd_sum: f64 = record.forward_lengths.iter().map(|&l| l as f64).sum();
    let bwd_sum: f64 = record.backward_lengths.iter().map(|&l| l as f64).sum();

    features[0] = record.responder_port as f64;
    features[1] = record.duration().as_secs_f64();
    features[2] = fwd_count;
    features[3] = bwd_count;
    features[4] = fwd_sum;
    features[5] = bwd_sum;

    let (max, min, mean, std) = safe_stats(&record.forward_lengths);
    features[6] = max;
    features[7] = min;
    features[8] = mean;
    features[9] = std;

    let (max, min, mean, std) = safe_stats(&record.backward_lengths);
    features[10] = max;
    features[11] = min;
    features[12] = mean;
    features[13] = std;

    features[14] = fwd_count + bwd_count;
    features[15] = fwd_sum + bwd_sum;

    let (mean, std, max, min) = iat_stats(&record.timestamps);
    features[16] = mean;
    features[17] = std;
    features[18] = max;
    features[19] = min;

    fill_flags(&mut features, 42, &record.forward_flags);
    fill_flags(&mut features, 48, &record.backward_flags);

    features
}

fn fill_flags(features: &mut FeatureVector, base: usize, flags: &FlagCounts) {
    features[base] = flags.fin as f64;
    features[base + 1] = flags.syn as f64;
    features[base + 2] = flags.rst as f64;
    features[base + 3] = flags.psh as f64;
    features[base + 4] = flags.ack as f64;
    features[base + 5] = flags.urg as f64;
}

/// Statistiques (max, min, moyenne, écart-type) d'une séquence de longueurs.
/// Une séquence vide retourne [`STAT_EPSILON`] partout.
fn safe_stats(values: &[u32]) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (STAT_EPSILON, STAT_EPSILON, STAT_EPSILON, STAT_EPSILON);
    }

    let mut max = f64::MIN;
    let mut min = f64::MAX;
    let mut sum = 0.0;
    for &v in values {
        let v = v as f64;
        if v > max {
            max = v;
        }
        if v < min {
            min = v;
        }
        sum += v;
    }
    let mean = sum / values.len() as f64;
    let variance = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;

    (max, min, mean, variance.sqrt())
}

/// Statistiques (moyenne, écart-type, max, min) des inter-arrivées.
/// Moins de deux horodatages : tout à zéro.
fn iat_stats(timestamps: &[SystemTime]) -> (f64, f64, f64, f64) {
    if timestamps.len() < 2 {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let deltas: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| {
            pair[1]
                .duration_since(pair[0])
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        })
        .collect();

    let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
    let variance = deltas.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / deltas.len() as f64;
    let max = deltas.iter().cloned().fold(f64::MIN, f64::max);
    let min = deltas.iter().cloned().fold(f64::MAX, f64::min);

    (mean, variance.sqrt(), max, min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{tcp_flags, FlowKey, FlowRecord, PacketInfo, PacketType};
    use std::net::IpAddr;
    use std::time::{Duration, UNIX_EPOCH};

    fn packet_at(
        secs: u64,
        src: &str,
        src_port: u16,
        dst: &str,
        dst_port: u16,
        size: usize,
        flags: Option<u8>,
    ) -> PacketInfo {
        let src: IpAddr = src.parse().unwrap();
        let dst: IpAddr = dst.parse().unwrap();
        let mut packet = PacketInfo::new(src, dst, Some(src_port), Some(dst_port), PacketType::Tcp, size)
            .with_timestamp(UNIX_EPOCH + Duration::from_secs(secs));
        packet.tcp_flags = flags;
        packet
    }

    fn finalized(packets: &[PacketInfo]) -> FinalizedFlow {
        let mut record = FlowRecord::new(&packets[0]);
        for packet in &packets[1..] {
            record.absorb(packet);
        }
        FinalizedFlow {
            key: FlowKey::canonical(&packets[0]),
            record,
        }
    }

    #[test]
    fn test_two_packet_flow_layout() {
        // Scénario de référence : SYN avant à t=0, ACK arrière à t=11
        let flow = finalized(&[
            packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, Some(tcp_flags::SYN)),
            packet_at(11, "10.0.0.2", 80, "10.0.0.1", 1000, 40, Some(tcp_flags::ACK)),
        ]);
        let features = extract(&flow);

        assert_eq!(features[0], 80.0); // port du répondeur
        assert_eq!(features[1], 11.0); // durée
        assert_eq!(features[2], 1.0); // paquets avant
        assert_eq!(features[3], 1.0); // paquets arrière
        assert_eq!(features[4], 60.0);
        assert_eq!(features[5], 40.0);
        assert_eq!(features[14], 2.0); // total paquets
        assert_eq!(features[15], 100.0); // total octets
        assert_eq!(features[43], 1.0); // SYN avant
        assert_eq!(features[52], 1.0); // ACK arrière
        assert_eq!(features[42], 0.0);
        assert_eq!(features[49], 0.0);
    }

    #[test]
    fn test_directional_stats() {
        let flow = finalized(&[
            packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 100, None),
            packet_at(1, "10.0.0.1", 1000, "10.0.0.2", 80, 300, None),
            packet_at(2, "10.0.0.2", 80, "10.0.0.1", 1000, 50, None),
        ]);
        let features = extract(&flow);

        // Longueurs avant [100, 300] : max 300, min 100, moyenne 200, écart 100
        assert_eq!(features[6], 300.0);
        assert_eq!(features[7], 100.0);
        assert_eq!(features[8], 200.0);
        assert_eq!(features[9], 100.0);
        // Longueurs arrière [50]
        assert_eq!(features[10], 50.0);
        assert_eq!(features[11], 50.0);
        assert_eq!(features[12], 50.0);
        assert_eq!(features[13], 0.0);
    }

    #[test]
    fn test_iat_stats() {
        let flow = finalized(&[
            packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None),
            packet_at(2, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None),
            packet_at(6, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None),
        ]);
        let features = extract(&flow);

        // Inter-arrivées [2, 4] : moyenne 3, max 4, min 2
        assert_eq!(features[16], 3.0);
        assert_eq!(features[18], 4.0);
        assert_eq!(features[19], 2.0);
        assert!((features[17] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_one_sided_flow_has_no_nan() {
        // Aucun paquet arrière : les statistiques arrière valent epsilon
        let flow = finalized(&[packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, Some(tcp_flags::SYN))]);
        let features = extract(&flow);

        assert!(features.iter().all(|v| v.is_finite()));
        assert_eq!(features[3], 0.0);
        assert_eq!(features[5], 0.0);
        assert_eq!(features[10], STAT_EPSILON);
        assert_eq!(features[11], STAT_EPSILON);
        assert_eq!(features[12], STAT_EPSILON);
        assert_eq!(features[13], STAT_EPSILON);
    }

    #[test]
    fn test_single_timestamp_yields_zero_iat() {
        let flow = finalized(&[packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None)]);
        let features = extract(&flow);

        assert_eq!(features[16], 0.0);
        assert_eq!(features[17], 0.0);
        assert_eq!(features[18], 0.0);
        assert_eq!(features[19], 0.0);
    }

    #[test]
    fn test_reserved_slots_stay_zero() {
        let flow = finalized(&[
            packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, Some(tcp_flags::SYN | tcp_flags::URG)),
            packet_at(1, "10.0.0.2", 80, "10.0.0.1", 1000, 40, Some(tcp_flags::ACK)),
        ]);
        let features = extract(&flow);

        for idx in [20, 30, 41, 54, 60, 77] {
            assert_eq!(features[idx], 0.0, "position réservée {} non nulle", idx);
        }
    }

    #[test]
    fn test_extract_is_deterministic() {
        let flow = finalized(&[
            packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, Some(tcp_flags::SYN)),
            packet_at(3, "10.0.0.2", 80, "10.0.0.1", 1000, 40, Some(tcp_flags::ACK)),
        ]);

        assert_eq!(extract(&flow), extract(&flow));
    }
}
