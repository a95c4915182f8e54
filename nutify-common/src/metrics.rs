//! Metrics tie-ins

use std::net::UdpSocket;

use cadence::{
    BufferedUdpMetricSink, CountedExt, MetricBuilder, NopMetricSink, QueuingMetricSink,
    StatsdClient,
};

use crate::errors::Result;
use crate::metric_name::MetricName;

/// Create a cadence StatsdClient from the given options
pub fn builder(label: &str, host: &Option<String>, port: u16) -> Result<StatsdClient> {
    let client = if let Some(statsd_host) = host.as_ref() {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let host = (statsd_host.as_str(), port);
        let udp_sink = BufferedUdpMetricSink::from(host, socket)?;
        let sink = QueuingMetricSink::from(udp_sink);
        StatsdClient::builder(label, sink)
    } else {
        StatsdClient::builder(label, NopMetricSink)
    }
    .with_error_handler(|err| error!("Metrics send error: {}", err))
    .build();
    Ok(client)
}

/// Extension trait so call sites can use [MetricName] instead of string
/// literals.
pub trait StatsdClientExt {
    fn incr_with_tags(&self, metric: MetricName) -> MetricBuilder<'_, '_, cadence::Counter>;
}

impl StatsdClientExt for StatsdClient {
    fn incr_with_tags(&self, metric: MetricName) -> MetricBuilder<'_, '_, cadence::Counter> {
        let metric_name: &'static str = metric.into();
        CountedExt::incr_with_tags(self, metric_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_without_host_uses_nop_sink() {
        let client = builder("nutify", &None, 8125).unwrap();
        // A NopMetricSink client accepts increments without error.
        client.incr("poll.tick.ok").ok();
    }

    #[test]
    fn test_metric_name_serialization() {
        assert_eq!(MetricName::PollTickOk.as_ref(), "poll.tick.ok");
        assert_eq!(MetricName::BusDropped.as_ref(), "bus.dropped");
    }
}
