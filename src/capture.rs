use crate::models::{PacketInfo, PacketType};
use log::{error, info};
use pcap::{Capture, Device};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use std::net::IpAddr;
use std::thread;
use std::time::SystemTime;
use tokio::sync::mpsc;

/// Démarre la capture de paquets sur les interfaces configurées.
///
/// Chaque interface reçoit son propre thread : la bibliothèque pcap
/// bloque, et c'est ce thread qui porte la contre-pression quand la file
/// des paquets est pleine.
pub fn start_packet_capture(interfaces: &[String], packet_tx: mpsc::Sender<PacketInfo>) {
    for interface_name in interfaces {
        spawn_capture_thread(interface_name.clone(), packet_tx.clone());
    }
    info!("Capture de paquets démarrée sur {} interface(s)", interfaces.len());
}

// Thread de capture pour une seule interface
fn spawn_capture_thread(interface_name: String, packet_tx: mpsc::Sender<PacketInfo>) {
    thread::spawn(move || {
        let devices = match Device::list() {
            Ok(devices) => devices,
            Err(e) => {
                error!("Erreur lors de la liste des interfaces: {}", e);
                return;
            }
        };

        let device = match devices.into_iter().find(|d| d.name == interface_name) {
            Some(device) => device,
            None => {
                error!("Interface {} non trouvée", interface_name);
                return;
            }
        };

        info!("Démarrage de la capture sur l'interface {}", interface_name);

        let inactive = match Capture::from_device(device) {
            Ok(capture) => capture.promisc(true).snaplen(65535).timeout(1000),
            Err(e) => {
                error!("Erreur lors de la préparation de l'interface {}: {}", interface_name, e);
                return;
            }
        };

        match inactive.open() {
            Ok(mut capture) => loop {
                match capture.next_packet() {
                    Ok(packet) => {
                        if let Some(packet_info) = parse_packet(packet.data) {
                            // File pleine : on attend ici, la capture est le
                            // producteur bloqué
                            if packet_tx.blocking_send(packet_info).is_err() {
                                info!(
                                    "Canal des paquets fermé, arrêt de la capture sur {}",
                                    interface_name
                                );
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        // Ignorer les erreurs de timeout
                        if !e.to_string().contains("timed out") {
                            error!("Erreur lors de la capture de paquet: {}", e);
                            break;
                        }
                    }
                }
            },
            Err(e) => {
                error!("Erreur lors de l'ouverture de l'interface {}: {}", interface_name, e);
            }
        }
    });
}

/// Analyse un paquet réseau brut et retourne une structure PacketInfo.
///
/// Les trames non IP sont ignorées et ne produisent rien.
pub fn parse_packet(packet_data: &[u8]) -> Option<PacketInfo> {
    if let Some(ethernet) = EthernetPacket::new(packet_data) {
        match ethernet.get_ethertype() {
            EtherTypes::Ipv4 => {
                if let Some(ipv4) = Ipv4Packet::new(ethernet.payload()) {
                    return parse_ip_packet(
                        IpAddr::V4(ipv4.get_source()),
                        IpAddr::V4(ipv4.get_destination()),
                        ipv4.get_next_level_protocol(),
                        ipv4.payload(),
                    );
                }
            }
            EtherTypes::Ipv6 => {
                if let Some(ipv6) = Ipv6Packet::new(ethernet.payload()) {
                    return parse_ip_packet(
                        IpAddr::V6(ipv6.get_source()),
                        IpAddr::V6(ipv6.get_destination()),
                        ipv6.get_next_header(),
                        ipv6.payload(),
                    );
                }
            }
            _ => {
                // Trame non IP, hors du périmètre des flux
            }
        }
    }
    None
}

/// Analyse la couche transport d'un paquet IP et extrait ports et drapeaux.
fn parse_ip_packet(
    source_ip: IpAddr,
    dest_ip: IpAddr,
    protocol: IpNextHeaderProtocol,
    payload: &[u8],
) -> Option<PacketInfo> {
    let size = payload.len();
    let (protocol_type, source_port, dest_port, tcp_flags) = match protocol {
        IpNextHeaderProtocols::Tcp => {
            if let Some(tcp) = TcpPacket::new(payload) {
                (
                    PacketType::Tcp,
                    Some(tcp.get_source()),
                    Some(tcp.get_destination()),
                    // pnet expose neuf bits de drapeaux, seuls les huit
                    // classiques nous intéressent
                    Some((tcp.get_flags() & 0xff) as u8),
                )
            } else {
                (PacketType::Tcp, None, None, None)
            }
        }
        IpNextHeaderProtocols::Udp => {
            if let Some(udp) = UdpPacket::new(payload) {
                (
                    PacketType::Udp,
                    Some(udp.get_source()),
                    Some(udp.get_destination()),
                    None,
                )
            } else {
                (PacketType::Udp, None, None, None)
            }
        }
        IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => {
            (PacketType::Icmp, None, None, None)
        }
        _ => (PacketType::Other, None, None, None),
    };

    Some(PacketInfo {
        timestamp: SystemTime::now(),
        source_ip,
        dest_ip,
        source_port,
        dest_port,
        protocol: protocol_type,
        size,
        tcp_flags,
    })
}
