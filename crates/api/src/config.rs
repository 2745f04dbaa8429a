//! Application configuration loaded from environment variables.

use std::time::Duration;

use replication::Participant;
use replication::topology::DEFAULT_MAX_DELIVERIES;

const DEFAULT_PARTICIPANTS: &str = "workout,nutrition,notification";

/// Participants that contact users and therefore need the email address.
const EMAIL_PARTICIPANTS: &[&str] = &["notification"];

/// Server and saga configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `MAX_DELIVERIES` — deliveries before dead-lettering (default: `5`)
/// - `WORKERS_PER_QUEUE` — competing consumers per queue (default: `2`)
/// - `SAGA_TIMEOUT_SECS` — how long a saga may stay unfinished (default: `30`)
/// - `SWEEP_INTERVAL_SECS` — reconciliation sweep period (default: `10`)
/// - `PARTICIPANTS` — comma separated participant names
///   (default: `"workout,nutrition,notification"`). `notification`, or any
///   name suffixed with `:email`, keeps the email address.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_deliveries: u32,
    pub workers_per_queue: usize,
    pub saga_timeout: Duration,
    pub sweep_interval: Duration,
    pub participants: Vec<Participant>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let workers_per_queue = parsed("WORKERS_PER_QUEUE")
            .map(|n| n.max(1) as usize)
            .unwrap_or(defaults.workers_per_queue);
        let participants = lookup("PARTICIPANTS")
            .map(|raw| parse_participants(&raw, workers_per_queue))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| parse_participants(DEFAULT_PARTICIPANTS, workers_per_queue));

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            max_deliveries: parsed("MAX_DELIVERIES")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_deliveries),
            workers_per_queue,
            saga_timeout: parsed("SAGA_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.saga_timeout),
            sweep_interval: parsed("SWEEP_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            participants,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            workers_per_queue: 2,
            saga_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            participants: parse_participants(DEFAULT_PARTICIPANTS, 2),
        }
    }
}

/// Parses a comma separated participant list, skipping blanks and duplicates.
pub fn parse_participants(raw: &str, workers: usize) -> Vec<Participant> {
    let mut participants: Vec<Participant> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, wants_email) = match entry.strip_suffix(":email") {
            Some(name) => (name, true),
            None => (entry, EMAIL_PARTICIPANTS.contains(&entry)),
        };
        let participant = if wants_email {
            Participant::with_email(name)
        } else {
            Participant::handle_only(name)
        }
        .workers(workers);

        if !participants.iter().any(|p| p.id == participant.id) {
            participants.push(participant);
        }
    }
    participants
}
