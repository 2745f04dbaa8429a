//! Typed broker topology for the user replication saga.

use broker::{BindingSpec, ExchangeSpec, QueueSpec, Topology};
use common::ParticipantId;

use crate::envelope::UserFact;

/// Default name of the user-lifecycle exchange.
pub const DEFAULT_EXCHANGE: &str = "user.exchange";

/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Routing keys for each user fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKeys {
    pub created: String,
    pub creation_failed: String,
    pub replica_committed: String,
    pub replica_compensated: String,
}

impl Default for RoutingKeys {
    fn default() -> Self {
        Self {
            created: "user.created".to_string(),
            creation_failed: "user.creation.failed".to_string(),
            replica_committed: "user.replica.committed".to_string(),
            replica_compensated: "user.replica.compensated".to_string(),
        }
    }
}

/// Exchange, routing keys and queue naming shared by every service.
///
/// Built once at startup and handed to each component, so no component
/// reaches for global names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaTopology {
    /// Topic exchange carrying all user-lifecycle facts.
    pub exchange: String,
    pub routing_keys: RoutingKeys,
    /// Deliveries per message before it goes to the dead-letter queue.
    pub max_deliveries: u32,
    /// Suffix appended to a queue name to form its dead-letter queue.
    pub dead_letter_suffix: String,
    /// The identity service, which also compensates the canonical record.
    pub identity: ParticipantId,
}

impl Default for SagaTopology {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_keys: RoutingKeys::default(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            dead_letter_suffix: ".dlq".to_string(),
            identity: ParticipantId::new("identity"),
        }
    }
}

impl SagaTopology {
    /// Sets the delivery limit.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Returns the routing key of a fact.
    pub fn routing_key(&self, fact: UserFact) -> &str {
        match fact {
            UserFact::Created => &self.routing_keys.created,
            UserFact::CreationFailed => &self.routing_keys.creation_failed,
            UserFact::ReplicaCommitted => &self.routing_keys.replica_committed,
            UserFact::ReplicaCompensated => &self.routing_keys.replica_compensated,
        }
    }

    /// Maps a routing key back to its fact.
    pub fn fact_for(&self, routing_key: &str) -> Option<UserFact> {
        UserFact::ALL
            .into_iter()
            .find(|fact| self.routing_key(*fact) == routing_key)
    }

    /// Queue through which `owner` receives `fact`, e.g.
    /// `workout.user.created.queue`.
    pub fn queue_name(&self, owner: &ParticipantId, fact: UserFact) -> String {
        format!("{owner}.{}.queue", self.routing_key(fact))
    }

    /// Dead-letter queue of a queue.
    pub fn dead_letter_queue(&self, queue: &str) -> String {
        format!("{queue}{}", self.dead_letter_suffix)
    }

    /// Owner name of the saga tracker's queues.
    pub fn tracker(&self) -> ParticipantId {
        ParticipantId::new(format!("{}-saga", self.identity))
    }

    /// Queues and bindings of a replica participant: one queue for
    /// `created` and one for `creation-failed`, each with a dead-letter queue.
    pub fn participant_topology(&self, participant: &ParticipantId) -> Topology {
        [UserFact::Created, UserFact::CreationFailed]
            .into_iter()
            .fold(self.base_topology(), |topology, fact| {
                self.subscribe(topology, participant, fact)
            })
    }

    /// Queues and bindings of the identity service: its compensator queue
    /// plus the saga tracker's acknowledgement queues.
    pub fn identity_topology(&self) -> Topology {
        let tracker = self.tracker();
        let topology = self.subscribe(self.base_topology(), &self.identity, UserFact::CreationFailed);
        [
            UserFact::ReplicaCommitted,
            UserFact::CreationFailed,
            UserFact::ReplicaCompensated,
        ]
        .into_iter()
        .fold(topology, |topology, fact| {
            self.subscribe(topology, &tracker, fact)
        })
    }

    fn base_topology(&self) -> Topology {
        Topology::new().exchange(ExchangeSpec::topic(&self.exchange))
    }

    fn subscribe(&self, topology: Topology, owner: &ParticipantId, fact: UserFact) -> Topology {
        let queue = self.queue_name(owner, fact);
        let dead_letters = self.dead_letter_queue(&queue);
        topology
            .queue(QueueSpec::durable(&dead_letters))
            .queue(
                QueueSpec::durable(&queue)
                    .max_deliveries(self.max_deliveries)
                    .dead_letter_to(dead_letters),
            )
            .bind(BindingSpec::new(
                queue,
                &self.exchange,
                self.routing_key(fact),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_match_wire_contract() {
        let topology = SagaTopology::default();
        assert_eq!(topology.exchange, "user.exchange");
        assert_eq!(topology.routing_key(UserFact::Created), "user.created");
        assert_eq!(
            topology.routing_key(UserFact::CreationFailed),
            "user.creation.failed"
        );
    }

    #[test]
    fn queue_names_are_participant_specific() {
        let topology = SagaTopology::default();
        let workout = ParticipantId::new("workout");

        assert_eq!(
            topology.queue_name(&workout, UserFact::Created),
            "workout.user.created.queue"
        );
        assert_eq!(
            topology.queue_name(&workout, UserFact::CreationFailed),
            "workout.user.creation.failed.queue"
        );
        assert_eq!(
            topology.dead_letter_queue("workout.user.created.queue"),
            "workout.user.created.queue.dlq"
        );
    }

    #[test]
    fn fact_for_round_trips_routing_keys() {
        let topology = SagaTopology::default();
        for fact in UserFact::ALL {
            assert_eq!(topology.fact_for(topology.routing_key(fact)), Some(fact));
        }
        assert_eq!(topology.fact_for("order.created"), None);
    }

    #[test]
    fn participant_topology_declares_queues_with_dead_letters() {
        let topology = SagaTopology::default().with_max_deliveries(3);
        let declared = topology.participant_topology(&ParticipantId::new("nutrition"));

        assert_eq!(declared.exchanges.len(), 1);
        assert_eq!(declared.queues.len(), 4);
        assert_eq!(declared.bindings.len(), 2);

        let created = declared
            .queues
            .iter()
            .find(|q| q.name == "nutrition.user.created.queue")
            .unwrap();
        assert_eq!(created.max_deliveries, Some(3));
        assert_eq!(
            created.dead_letter_queue.as_deref(),
            Some("nutrition.user.created.queue.dlq")
        );
    }

    #[test]
    fn identity_topology_includes_tracker_queues() {
        let topology = SagaTopology::default();
        let declared = topology.identity_topology();

        let names: Vec<&str> = declared.bindings.iter().map(|b| b.queue.as_str()).collect();
        assert!(names.contains(&"identity.user.creation.failed.queue"));
        assert!(names.contains(&"identity-saga.user.replica.committed.queue"));
        assert!(names.contains(&"identity-saga.user.creation.failed.queue"));
        assert!(names.contains(&"identity-saga.user.replica.compensated.queue"));
    }
}
