//! Subscriber setup and the per-exchange access log.

use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::message::Message;

/// Installs the global subscriber. `RUST_LOG` directives win over the level in
/// `config`. Returns false if a subscriber was already installed.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wirecall={}", config.level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

pub(crate) struct AccessRecord<'a> {
    pub session_id: &'a str,
    pub remote_addr: &'a str,
    /// `"CALL"`, `"PUSH"` or `"REPLY"`, from this side's point of view.
    pub kind: &'static str,
    pub input: &'a Message,
    pub output: Option<&'a Message>,
    pub cost: Duration,
}

/// One event per finished exchange. Slow exchanges are raised to `warn`.
pub(crate) fn access(record: AccessRecord<'_>, slow: Option<Duration>, detail: bool) {
    let cost_ms = record.cost.as_secs_f64() * 1000.0;
    let status = match record.output {
        Some(out) => &out.status,
        None => &record.input.status,
    };
    let is_slow = slow.is_some_and(|threshold| record.cost > threshold);

    if is_slow {
        warn!(
            session_id = record.session_id,
            remote_addr = record.remote_addr,
            kind = record.kind,
            seq = record.input.seq,
            service_method = %record.input.service_method,
            status_code = status.code(),
            cost_ms,
            slow = true,
            "slow exchange"
        );
    } else if detail {
        info!(
            session_id = record.session_id,
            remote_addr = record.remote_addr,
            kind = record.kind,
            seq = record.input.seq,
            service_method = %record.input.service_method,
            status_code = status.code(),
            cost_ms,
            input_meta = %record.input.meta.encode(),
            input_size = record.input.size,
            output_meta = %record.output.map(|o| o.meta.encode()).unwrap_or_default(),
            output_size = record.output.map(|o| o.size).unwrap_or_default(),
            "exchange"
        );
    } else {
        debug!(
            session_id = record.session_id,
            kind = record.kind,
            seq = record.input.seq,
            service_method = %record.input.service_method,
            status_code = status.code(),
            cost_ms,
            "exchange"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn test_init_only_once() {
        let config = LoggingConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }

    #[test]
    fn test_access_accepts_every_level() {
        let input = Message::new(MessageType::Call, "/a", 1);
        let output = Message::new(MessageType::Reply, "/a", 1);
        for (slow, detail) in [(Some(Duration::ZERO), false), (None, true), (None, false)] {
            access(
                AccessRecord {
                    session_id: "s",
                    remote_addr: "r",
                    kind: "CALL",
                    input: &input,
                    output: Some(&output),
                    cost: Duration::from_millis(1),
                },
                slow,
                detail,
            );
        }
    }
}
