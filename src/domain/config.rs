//! Configuration objects: flow schemas and priority levels.
//!
//! These mirror the objects a host keeps in its config store. They are read
//! through the `ConfigSource` port and only their status is ever written back.

use crate::domain::shuffle::Dealer;
use serde::{Deserialize, Serialize};

/// Name of the mandatory exempt priority level and flow schema.
pub const EXEMPT: &str = "exempt";
/// Name of the mandatory catch-all priority level and flow schema.
pub const CATCH_ALL: &str = "catch-all";
/// Group whose members are classified as exempt by the mandatory schema.
pub const MASTERS_GROUP: &str = "system:masters";
/// Condition type the controller maintains on every flow schema.
pub const DANGLING_CONDITION: &str = "Dangling";

/// Matches any name, verb, group, resource, namespace or URL.
pub const WILDCARD: &str = "*";

/// Lowest (highest priority) allowed matching precedence.
pub const MIN_MATCHING_PRECEDENCE: u32 = 1;
/// Highest allowed matching precedence; the catch-all schema sits here.
pub const MAX_MATCHING_PRECEDENCE: u32 = 10_000;

/// Error returned when a configuration object fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A flow schema is malformed
    #[error("invalid flow schema {name:?}: {reason}")]
    InvalidFlowSchema { name: String, reason: String },
    /// A priority level is malformed
    #[error("invalid priority level {name:?}: {reason}")]
    InvalidPriorityLevel { name: String, reason: String },
    /// A numeric setting that must be positive was zero
    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),
}

/// How requests matched by a flow schema are split into flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistinguisherMethod {
    /// One flow per requesting user
    ByUser,
    /// One flow per namespace
    ByNamespace,
}

/// Who a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Subject {
    /// A user by name, `*` for everyone
    User { name: String },
    /// A group by name, `*` for every group
    Group { name: String },
    /// A service account; `name` may be `*`
    ServiceAccount { namespace: String, name: String },
}

/// Rule over resource requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    pub verbs: Vec<String>,
    pub api_groups: Vec<String>,
    /// Resource names, or `resource/subresource`
    pub resources: Vec<String>,
    /// Whether cluster-scoped requests match
    #[serde(default)]
    pub cluster_scope: bool,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Rule over non-resource requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonResourceRule {
    pub verbs: Vec<String>,
    /// Exact paths, `*`, or prefixes ending in `/*`
    pub non_resource_urls: Vec<String>,
}

/// A set of subjects together with the requests they may make.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRulesWithSubjects {
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub resource_rules: Vec<ResourceRule>,
    #[serde(default)]
    pub non_resource_rules: Vec<NonResourceRule>,
}

fn all() -> Vec<String> {
    vec![WILDCARD.to_string()]
}

impl PolicyRulesWithSubjects {
    /// Rules matching every request from the given subjects.
    pub fn everything_for(subjects: Vec<Subject>) -> Self {
        Self {
            subjects,
            resource_rules: vec![ResourceRule {
                verbs: all(),
                api_groups: all(),
                resources: all(),
                cluster_scope: true,
                namespaces: all(),
            }],
            non_resource_rules: vec![NonResourceRule {
                verbs: all(),
                non_resource_urls: all(),
            }],
        }
    }

    /// Rules matching every request from every user.
    pub fn everything() -> Self {
        Self::everything_for(vec![Subject::Group {
            name: WILDCARD.to_string(),
        }])
    }
}

/// Status of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A status condition on a flow schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowSchemaCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

/// Observed state of a flow schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowSchemaStatus {
    #[serde(default)]
    pub conditions: Vec<FlowSchemaCondition>,
}

impl FlowSchemaStatus {
    /// Look up a condition by type.
    pub fn condition(&self, kind: &str) -> Option<&FlowSchemaCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Insert or replace a condition of the same type.
    pub fn set_condition(&mut self, condition: FlowSchemaCondition) {
        match self.conditions.iter_mut().find(|c| c.kind == condition.kind) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

/// Maps matching requests to a priority level and a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSchema {
    pub name: String,
    /// Lower values are consulted first
    pub matching_precedence: u32,
    pub priority_level: String,
    #[serde(default)]
    pub distinguisher_method: Option<DistinguisherMethod>,
    #[serde(default)]
    pub rules: Vec<PolicyRulesWithSubjects>,
    #[serde(default)]
    pub status: FlowSchemaStatus,
    /// Store version, used for optimistic status writes
    #[serde(default)]
    pub resource_version: u64,
}

impl FlowSchema {
    /// Create a schema with no rules.
    pub fn new(name: &str, matching_precedence: u32, priority_level: &str) -> Self {
        Self {
            name: name.to_string(),
            matching_precedence,
            priority_level: priority_level.to_string(),
            distinguisher_method: None,
            rules: Vec::new(),
            status: FlowSchemaStatus::default(),
            resource_version: 0,
        }
    }

    /// Add a rule.
    pub fn with_rule(mut self, rule: PolicyRulesWithSubjects) -> Self {
        self.rules.push(rule);
        self
    }

    /// Set the distinguisher method.
    pub fn with_distinguisher(mut self, method: DistinguisherMethod) -> Self {
        self.distinguisher_method = Some(method);
        self
    }

    /// Check the schema for structural errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidFlowSchema {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !(MIN_MATCHING_PRECEDENCE..=MAX_MATCHING_PRECEDENCE).contains(&self.matching_precedence)
        {
            return Err(invalid("matchingPrecedence must be between 1 and 10000"));
        }
        if self.priority_level.is_empty() {
            return Err(invalid("priorityLevel must not be empty"));
        }
        for rule in &self.rules {
            if rule.subjects.is_empty() {
                return Err(invalid("every rule needs at least one subject"));
            }
            if rule.resource_rules.is_empty() && rule.non_resource_rules.is_empty() {
                return Err(invalid(
                    "every rule needs at least one resource or non-resource rule",
                ));
            }
        }
        Ok(())
    }

    /// Whether the dangling condition currently reads `True`.
    pub fn is_marked_dangling(&self) -> bool {
        self.status
            .condition(DANGLING_CONDITION)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

/// Queuing parameters of a limited priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuingConfig {
    /// Number of shuffle-shard queues
    pub queues: u32,
    /// Maximum waiting requests per queue
    pub queue_length_limit: u32,
    /// Number of candidate queues dealt to each flow
    pub hand_size: u32,
}

impl Default for QueuingConfig {
    fn default() -> Self {
        Self {
            queues: 64,
            queue_length_limit: 50,
            hand_size: 8,
        }
    }
}

/// What a limited level does with requests that cannot run immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LimitResponse {
    /// Hold them in fair queues
    Queue(QueuingConfig),
    /// Reject them at once
    Reject,
}

/// Concurrency parameters of a limited priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitedSpec {
    /// Relative claim on the server's seats
    pub nominal_concurrency_shares: u32,
    /// Percentage of nominal seats other levels may borrow
    #[serde(default)]
    pub lendable_percent: u32,
    /// Percentage of nominal seats this level may borrow; `None` is unbounded
    #[serde(default)]
    pub borrowing_limit_percent: Option<u32>,
    pub limit_response: LimitResponse,
}

/// Either exempt from limits or limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PriorityLevelSpec {
    Exempt,
    Limited(LimitedSpec),
}

/// A named class of requests with its own budget and queuing policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityLevelConfiguration {
    pub name: String,
    pub spec: PriorityLevelSpec,
    #[serde(default)]
    pub resource_version: u64,
}

impl PriorityLevelConfiguration {
    /// An exempt level.
    pub fn exempt(name: &str) -> Self {
        Self {
            name: name.to_string(),
            spec: PriorityLevelSpec::Exempt,
            resource_version: 0,
        }
    }

    /// A limited level that queues excess requests.
    pub fn limited(name: &str, shares: u32, queuing: QueuingConfig) -> Self {
        Self::with_limited_spec(
            name,
            LimitedSpec {
                nominal_concurrency_shares: shares,
                lendable_percent: 0,
                borrowing_limit_percent: None,
                limit_response: LimitResponse::Queue(queuing),
            },
        )
    }

    /// A limited level that rejects excess requests.
    pub fn rejecting(name: &str, shares: u32) -> Self {
        Self::with_limited_spec(
            name,
            LimitedSpec {
                nominal_concurrency_shares: shares,
                lendable_percent: 0,
                borrowing_limit_percent: None,
                limit_response: LimitResponse::Reject,
            },
        )
    }

    /// A limited level with an explicit spec.
    pub fn with_limited_spec(name: &str, spec: LimitedSpec) -> Self {
        Self {
            name: name.to_string(),
            spec: PriorityLevelSpec::Limited(spec),
            resource_version: 0,
        }
    }

    /// Whether requests at this level bypass all limits.
    pub fn is_exempt(&self) -> bool {
        matches!(self.spec, PriorityLevelSpec::Exempt)
    }

    /// The limited spec, if any.
    pub fn limited_spec(&self) -> Option<&LimitedSpec> {
        match &self.spec {
            PriorityLevelSpec::Exempt => None,
            PriorityLevelSpec::Limited(spec) => Some(spec),
        }
    }

    /// Check the level for structural errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPriorityLevel {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        let Some(spec) = self.limited_spec() else {
            return Ok(());
        };
        if spec.nominal_concurrency_shares == 0 {
            return Err(invalid(
                "nominalConcurrencyShares must be greater than 0".to_string(),
            ));
        }
        if spec.lendable_percent > 100 {
            return Err(invalid("lendablePercent must be at most 100".to_string()));
        }
        if let LimitResponse::Queue(queuing) = spec.limit_response {
            if queuing.queue_length_limit == 0 {
                return Err(invalid("queueLengthLimit must be greater than 0".to_string()));
            }
            Dealer::new(queuing.queues, queuing.hand_size)
                .map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }
}

/// Priority levels that always exist.
pub fn mandatory_priority_levels() -> Vec<PriorityLevelConfiguration> {
    vec![
        PriorityLevelConfiguration::exempt(EXEMPT),
        PriorityLevelConfiguration::rejecting(CATCH_ALL, 5),
    ]
}

/// Flow schemas that always exist.
pub fn mandatory_flow_schemas() -> Vec<FlowSchema> {
    vec![
        FlowSchema::new(EXEMPT, MIN_MATCHING_PRECEDENCE, EXEMPT).with_rule(
            PolicyRulesWithSubjects::everything_for(vec![Subject::Group {
                name: MASTERS_GROUP.to_string(),
            }]),
        ),
        FlowSchema::new(CATCH_ALL, MAX_MATCHING_PRECEDENCE, CATCH_ALL)
            .with_rule(PolicyRulesWithSubjects::everything())
            .with_distinguisher(DistinguisherMethod::ByUser),
    ]
}

/// Terminal fallback used when every configured match dangles.
pub(crate) fn fallback_schema() -> FlowSchema {
    FlowSchema::new(CATCH_ALL, MAX_MATCHING_PRECEDENCE, EXEMPT)
        .with_rule(PolicyRulesWithSubjects::everything())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_objects_validate() {
        for pl in mandatory_priority_levels() {
            assert!(pl.validate().is_ok(), "{}", pl.name);
        }
        for fs in mandatory_flow_schemas() {
            assert!(fs.validate().is_ok(), "{}", fs.name);
        }
    }

    #[test]
    fn test_flow_schema_precedence_bounds() {
        let fs = FlowSchema::new("x", 0, "workload").with_rule(PolicyRulesWithSubjects::everything());
        assert!(matches!(
            fs.validate(),
            Err(ConfigError::InvalidFlowSchema { .. })
        ));

        let fs = FlowSchema::new("x", 10_001, "workload");
        assert!(fs.validate().is_err());
    }

    #[test]
    fn test_rule_without_subjects_rejected() {
        let mut rule = PolicyRulesWithSubjects::everything();
        rule.subjects.clear();
        let fs = FlowSchema::new("x", 100, "workload").with_rule(rule);
        assert!(fs.validate().is_err());
    }

    #[test]
    fn test_priority_level_validation() {
        let zero_shares = PriorityLevelConfiguration::limited("a", 0, QueuingConfig::default());
        assert!(zero_shares.validate().is_err());

        let oversized_hand = PriorityLevelConfiguration::limited(
            "b",
            10,
            QueuingConfig {
                queues: 4,
                queue_length_limit: 10,
                hand_size: 5,
            },
        );
        assert!(oversized_hand.validate().is_err());

        let zero_length = PriorityLevelConfiguration::limited(
            "c",
            10,
            QueuingConfig {
                queues: 4,
                queue_length_limit: 0,
                hand_size: 2,
            },
        );
        assert!(zero_length.validate().is_err());

        let ok = PriorityLevelConfiguration::limited("d", 10, QueuingConfig::default());
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut status = FlowSchemaStatus::default();
        let mut condition = FlowSchemaCondition {
            kind: DANGLING_CONDITION.to_string(),
            status: ConditionStatus::True,
            reason: "NotFound".to_string(),
            message: String::new(),
        };
        status.set_condition(condition.clone());
        condition.status = ConditionStatus::False;
        status.set_condition(condition);

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.condition(DANGLING_CONDITION).map(|c| c.status),
            Some(ConditionStatus::False)
        );
    }

    #[test]
    fn test_deserialize_priority_level_from_json() {
        let json = r#"{
            "name": "workload-low",
            "spec": {
                "type": "Limited",
                "nominalConcurrencyShares": 100,
                "lendablePercent": 90,
                "limitResponse": {
                    "type": "Queue",
                    "queues": 128,
                    "queueLengthLimit": 50,
                    "handSize": 6
                }
            }
        }"#;

        let pl: PriorityLevelConfiguration = serde_json::from_str(json).unwrap();
        let spec = pl.limited_spec().unwrap();
        assert_eq!(spec.nominal_concurrency_shares, 100);
        assert_eq!(spec.lendable_percent, 90);
        assert_eq!(spec.borrowing_limit_percent, None);
        assert!(pl.validate().is_ok());
    }
}
