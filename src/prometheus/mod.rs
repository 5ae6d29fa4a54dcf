use log::error;
use prometheus::{Encoder, TextEncoder};

pub mod metrics;

/// Renders every registered metric in the text exposition format.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text() {
        metrics::RETRANSMITS.inc();
        let text = gather_text();
        assert!(text.contains("vnet_retransmits"));
    }
}
