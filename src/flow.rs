use crate::models::{FinalizedFlow, FlowKey, FlowRecord, PacketInfo};
use dashmap::DashMap;
use log::debug;
use std::time::{Duration, SystemTime};

/// Table des flux en cours.
///
/// Chaque paquet observé étend ou crée l'enregistrement de son flux ; quand
/// l'écart entre un paquet et le début du flux dépasse le délai configuré,
/// l'enregistrement est retiré de la table et remis à l'appelant pour
/// extraction. Les flux devenus muets sont rattrapés par le balayage
/// périodique, faute de quoi leurs enregistrements resteraient ouverts
/// indéfiniment.
pub struct FlowTable {
    flows: DashMap<FlowKey, FlowRecord>,
    timeout: Duration,
}

impl FlowTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            flows: DashMap::new(),
            timeout,
        }
    }

    /// Absorbe un paquet et clôture son flux si le délai est dépassé.
    ///
    /// Le paquet déclencheur fait partie du flux clôturé et n'ouvre pas de
    /// nouvel enregistrement ; au plus une clôture par appel.
    pub fn observe(&self, packet: &PacketInfo) -> Option<FinalizedFlow> {
        let key = FlowKey::canonical(packet);

        match self.flows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.absorb(packet);

                let age = packet
                    .timestamp
                    .duration_since(record.start_time)
                    .unwrap_or(Duration::ZERO);
                if age > self.timeout {
                    let record = entry.remove();
                    debug!("Flux clôturé après {:.3}s: {}", age.as_secs_f64(), key);
                    return Some(FinalizedFlow { key, record });
                }
                None
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(FlowRecord::new(packet));
                None
            }
        }
    }

    /// Clôture tous les flux dont le début remonte à plus du délai configuré.
    ///
    /// Appelé périodiquement par le service pour rattraper les flux sans
    /// trafic récent, que `observe` seul ne clôturerait jamais.
    pub fn sweep(&self, now: SystemTime) -> Vec<FinalizedFlow> {
        let stale: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|entry| {
                now.duration_since(entry.value().start_time)
                    .map(|age| age > self.timeout)
                    .unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut finalized = Vec::with_capacity(stale.len());
        for key in stale {
            // remove_if revérifie l'âge : un flux recréé entre-temps par
            // observe garde son nouvel enregistrement.
            if let Some((key, record)) = self.flows.remove_if(&key, |_, record| {
                now.duration_since(record.start_time)
                    .map(|age| age > self.timeout)
                    .unwrap_or(false)
            }) {
                finalized.push(FinalizedFlow { key, record });
            }
        }

        if !finalized.is_empty() {
            debug!("Balayage: {} flux muets clôturés", finalized.len());
        }
        finalized
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{tcp_flags, PacketType};
    use std::net::IpAddr;
    use std::time::UNIX_EPOCH;

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

    #[test]
    fn test_first_packet_creates_flow() {
        let table = FlowTable::new(Duration::from_secs(10));
        let packet = packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, Some(tcp_flags::SYN));

        assert!(table.observe(&packet).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_both_directions_share_one_flow() {
        let table = FlowTable::new(Duration::from_secs(10));
        let forward = packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, Some(tcp_flags::SYN));
        let backward = packet_at(1, "10.0.0.2", 80, "10.0.0.1", 1000, 40, Some(tcp_flags::ACK));

        table.observe(&forward);
        table.observe(&backward);

        // Les deux sens alimentent le même enregistrement
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_packet_within_timeout_does_not_finalize() {
        let table = FlowTable::new(Duration::from_secs(10));
        table.observe(&packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None));

        // À 5 s du début, le flux reste ouvert
        assert!(table
            .observe(&packet_at(5, "10.0.0.1", 1000, "10.0.0.2", 80, 100, None))
            .is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_exact_timeout_boundary_does_not_finalize() {
        let table = FlowTable::new(Duration::from_secs(10));
        table.observe(&packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None));

        // À exactement start + 10 s, le délai n'est pas dépassé
        assert!(table
            .observe(&packet_at(10, "10.0.0.1", 1000, "10.0.0.2", 80, 100, None))
            .is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_timeout_finalizes_flow_with_trigger_included() {
        let table = FlowTable::new(Duration::from_secs(10));
        table.observe(&packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, Some(tcp_flags::SYN)));

        let finalized = table
            .observe(&packet_at(11, "10.0.0.2", 80, "10.0.0.1", 1000, 40, Some(tcp_flags::ACK)))
            .expect("le flux doit être clôturé à 11 s");

        // Le paquet déclencheur appartient au flux clôturé
        assert_eq!(finalized.record.forward_lengths, vec![60]);
        assert_eq!(finalized.record.backward_lengths, vec![40]);
        assert_eq!(finalized.record.forward_flags.syn, 1);
        assert_eq!(finalized.record.backward_flags.ack, 1);
        // Et n'ouvre pas de nouveau flux
        assert!(table.is_empty());
    }

    #[test]
    fn test_direction_tracked_from_originator() {
        let table = FlowTable::new(Duration::from_secs(10));
        table.observe(&packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None));
        table.observe(&packet_at(1, "10.0.0.2", 80, "10.0.0.1", 1000, 1200, None));
        table.observe(&packet_at(2, "10.0.0.1", 1000, "10.0.0.2", 80, 52, None));

        let finalized = table
            .observe(&packet_at(12, "10.0.0.2", 80, "10.0.0.1", 1000, 300, None))
            .unwrap();

        assert_eq!(finalized.record.originator_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(finalized.record.forward_lengths, vec![60, 52]);
        assert_eq!(finalized.record.backward_lengths, vec![1200, 300]);
        assert_eq!(finalized.record.timestamps.len(), 4);
    }

    #[test]
    fn test_at_most_one_finalization_per_window() {
        let table = FlowTable::new(Duration::from_secs(10));
        table.observe(&packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None));

        let first = table.observe(&packet_at(11, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None));
        assert!(first.is_some());

        // Le paquet suivant repart d'un flux neuf : pas de clôture avant
        // que sa propre fenêtre de 10 s soit dépassée.
        assert!(table
            .observe(&packet_at(12, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None))
            .is_none());
        assert!(table
            .observe(&packet_at(21, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None))
            .is_none());
        assert!(table
            .observe(&packet_at(23, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None))
            .is_some());
    }

    #[test]
    fn test_sweep_finalizes_stale_flows() {
        let table = FlowTable::new(Duration::from_secs(10));
        table.observe(&packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None));
        table.observe(&packet_at(3, "192.168.1.5", 5353, "192.168.1.1", 53, 80, None));

        // À t=11, seul le flux commencé à t=0 est périmé
        let finalized = table.sweep(UNIX_EPOCH + Duration::from_secs(11));
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].record.forward_lengths, vec![60]);
        assert_eq!(table.len(), 1);

        // À t=20, le second tombe aussi
        let finalized = table.sweep(UNIX_EPOCH + Duration::from_secs(20));
        assert_eq!(finalized.len(), 1);
        assert!(table.is_empty());

        // Plus rien à balayer ensuite
        assert!(table.sweep(UNIX_EPOCH + Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn test_distinct_keys_distinct_flows() {
        let table = FlowTable::new(Duration::from_secs(10));
        table.observe(&packet_at(0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, None));
        table.observe(&packet_at(0, "10.0.0.1", 1001, "10.0.0.2", 80, 60, None));

        // Un port source différent forme une conversation distincte
        assert_eq!(table.len(), 2);
    }
}
