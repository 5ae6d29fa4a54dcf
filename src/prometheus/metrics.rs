use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref EVENTS_EXECUTED: IntCounterVec = register_int_counter_vec!(
        "vnet_events_executed",
        "scheduled events executed",
        &["kind"]
    )
    .unwrap();
    pub static ref PACKETS_SCHEDULED: IntCounter =
        register_int_counter!("vnet_packets_scheduled", "packets handed to the scheduler").unwrap();
    pub static ref PACKETS_DROPPED: IntCounterVec = register_int_counter_vec!(
        "vnet_packets_dropped",
        "packets dropped before delivery",
        &["reason"]
    )
    .unwrap();
    pub static ref RETRANSMITS: IntCounter =
        register_int_counter!("vnet_retransmits", "segments sent again").unwrap();
    pub static ref FRAMES_TX: IntCounter =
        register_int_counter!("vnet_frames_tx", "deliveries sent to other workers").unwrap();
    pub static ref FRAMES_RX: IntCounter =
        register_int_counter!("vnet_frames_rx", "deliveries received from other workers").unwrap();
    pub static ref NOTIFICATIONS: IntCounter =
        register_int_counter!("vnet_notifications", "readiness notifications delivered").unwrap();
    pub static ref TCP_CONNS: IntGauge =
        register_int_gauge!("vnet_tcp_conns", "established tcp connections").unwrap();
    pub static ref TCP_TX_BYTES: IntCounter =
        register_int_counter!("vnet_tcp_tx_bytes", "tcp payload bytes written").unwrap();
    pub static ref TCP_RX_BYTES: IntCounter =
        register_int_counter!("vnet_tcp_rx_bytes", "tcp payload bytes read").unwrap();
    pub static ref UDP_TX_PACKETS: IntCounter =
        register_int_counter!("vnet_udp_tx_packets", "udp datagrams sent").unwrap();
    pub static ref UDP_RX_PACKETS: IntCounter =
        register_int_counter!("vnet_udp_rx_packets", "udp datagrams received").unwrap();
}
