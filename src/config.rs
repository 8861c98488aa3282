//! Gateway-wide configuration surface — see the table in the design spec's
//! External Interfaces section. Per-agent values can be overridden via
//! [`crate::types::AgentTuning`]; these are the defaults that apply when an
//! agent doesn't override a given field.

#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    pub agent_max_in_flight: u32,
    pub agent_failure_threshold: u32,
    pub agent_failure_window_ms: i64,
    pub agent_cooldown_ms: i64,
    pub agent_call_timeout_ms: i64,
    pub push_max_attempts: u32,
    pub push_retry_base_ms: u64,
    pub push_jwt_ttl_seconds: u64,
    pub push_jwt_skew_seconds: u64,
    pub http_pool_size: usize,
    pub subscriber_queue_size: usize,
    /// Number of nodes in the (simulated) cluster, used by the worker
    /// supervisor's `hash(agent.id) mod nodeCount` ownership check. A
    /// single-node deployment should leave this at 1.
    pub node_count: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            agent_max_in_flight: 10,
            agent_failure_threshold: 5,
            agent_failure_window_ms: 30_000,
            agent_cooldown_ms: 30_000,
            agent_call_timeout_ms: 15_000,
            push_max_attempts: 3,
            push_retry_base_ms: 200,
            push_jwt_ttl_seconds: 300,
            push_jwt_skew_seconds: 120,
            http_pool_size: 50,
            subscriber_queue_size: 64,
            node_count: 1,
        }
    }
}

impl GatewayConfig {
    /// Overlay `MESHGATE_*` environment variables onto the defaults. Any
    /// variable that's absent or fails to parse leaves the existing value
    /// untouched (defaults, or whatever was set before this call).
    pub fn from_env(mut self) -> Self {
        macro_rules! overlay {
            ($var:literal, $field:ident) => {
                if let Ok(raw) = std::env::var($var) {
                    if let Ok(parsed) = raw.parse() {
                        self.$field = parsed;
                    }
                }
            };
        }
        overlay!("MESHGATE_AGENT_MAX_IN_FLIGHT", agent_max_in_flight);
        overlay!("MESHGATE_AGENT_FAILURE_THRESHOLD", agent_failure_threshold);
        overlay!("MESHGATE_AGENT_FAILURE_WINDOW_MS", agent_failure_window_ms);
        overlay!("MESHGATE_AGENT_COOLDOWN_MS", agent_cooldown_ms);
        overlay!("MESHGATE_AGENT_CALL_TIMEOUT_MS", agent_call_timeout_ms);
        overlay!("MESHGATE_PUSH_MAX_ATTEMPTS", push_max_attempts);
        overlay!("MESHGATE_PUSH_RETRY_BASE_MS", push_retry_base_ms);
        overlay!("MESHGATE_PUSH_JWT_TTL_SECONDS", push_jwt_ttl_seconds);
        overlay!("MESHGATE_PUSH_JWT_SKEW_SECONDS", push_jwt_skew_seconds);
        overlay!("MESHGATE_HTTP_POOL_SIZE", http_pool_size);
        overlay!("MESHGATE_SUBSCRIBER_QUEUE_SIZE", subscriber_queue_size);
        overlay!("MESHGATE_NODE_COUNT", node_count);
        self
    }

    /// Resolve the effective max-in-flight for an agent, honoring its tuning
    /// override if present.
    pub fn max_in_flight_for(&self, tuning: Option<&crate::types::AgentTuning>) -> u32 {
        tuning
            .and_then(|t| t.max_in_flight)
            .unwrap_or(self.agent_max_in_flight)
    }

    pub fn failure_threshold_for(&self, tuning: Option<&crate::types::AgentTuning>) -> u32 {
        tuning
            .and_then(|t| t.failure_threshold)
            .unwrap_or(self.agent_failure_threshold)
    }

    pub fn failure_window_ms_for(&self, tuning: Option<&crate::types::AgentTuning>) -> i64 {
        tuning
            .and_then(|t| t.failure_window_ms)
            .unwrap_or(self.agent_failure_window_ms)
    }

    pub fn cooldown_ms_for(&self, tuning: Option<&crate::types::AgentTuning>) -> i64 {
        tuning
            .and_then(|t| t.cooldown_ms)
            .unwrap_or(self.agent_cooldown_ms)
    }

    pub fn call_timeout_ms_for(&self, tuning: Option<&crate::types::AgentTuning>) -> i64 {
        tuning
            .and_then(|t| t.call_timeout_ms)
            .unwrap_or(self.agent_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentTuning;

    #[test]
    fn defaults_match_the_configuration_surface_table() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.agent_max_in_flight, 10);
        assert_eq!(cfg.agent_failure_threshold, 5);
        assert_eq!(cfg.agent_failure_window_ms, 30_000);
        assert_eq!(cfg.agent_cooldown_ms, 30_000);
        assert_eq!(cfg.agent_call_timeout_ms, 15_000);
        assert_eq!(cfg.push_max_attempts, 3);
        assert_eq!(cfg.push_retry_base_ms, 200);
        assert_eq!(cfg.push_jwt_ttl_seconds, 300);
        assert_eq!(cfg.push_jwt_skew_seconds, 120);
        assert_eq!(cfg.http_pool_size, 50);
        assert_eq!(cfg.subscriber_queue_size, 64);
    }

    #[test]
    fn per_agent_tuning_overrides_defaults() {
        let cfg = GatewayConfig::default();
        let tuning = AgentTuning {
            max_in_flight: Some(25),
            ..Default::default()
        };
        assert_eq!(cfg.max_in_flight_for(Some(&tuning)), 25);
        assert_eq!(cfg.failure_threshold_for(Some(&tuning)), 5);
        assert_eq!(cfg.max_in_flight_for(None), 10);
    }
}
