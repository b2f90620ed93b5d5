//! Request classification.
//!
//! A `Classifier` is built once per configuration snapshot and never mutated.
//! Schemas that reference a missing priority level are dropped from the
//! match table when it is built and listed as dangling, so a request they
//! would have matched falls through to the next-best schema.

use crate::domain::config::{fallback_schema, FlowSchema, PriorityLevelConfiguration, EXEMPT};
use crate::domain::digest::RequestDigest;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Where a request belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub flow_schema: Arc<FlowSchema>,
    pub priority_level: Arc<PriorityLevelConfiguration>,
    pub flow_distinguisher: String,
}

impl Classification {
    pub fn is_exempt(&self) -> bool {
        self.priority_level.is_exempt()
    }
}

/// Immutable match table over flow schemas.
#[derive(Debug, Clone)]
pub struct Classifier {
    /// Non-dangling schemas by (precedence, name)
    schemas: Vec<Arc<FlowSchema>>,
    levels: BTreeMap<String, Arc<PriorityLevelConfiguration>>,
    dangling: BTreeSet<String>,
    fallback_schema: Arc<FlowSchema>,
    fallback_level: Arc<PriorityLevelConfiguration>,
}

impl Classifier {
    /// Build a match table. Later duplicates of a name are ignored.
    pub fn new(
        schemas: impl IntoIterator<Item = FlowSchema>,
        levels: impl IntoIterator<Item = PriorityLevelConfiguration>,
    ) -> Self {
        let mut by_name: BTreeMap<String, Arc<PriorityLevelConfiguration>> = BTreeMap::new();
        for level in levels {
            by_name.entry(level.name.clone()).or_insert_with(|| Arc::new(level));
        }

        let mut seen = BTreeSet::new();
        let mut dangling = BTreeSet::new();
        let mut table = Vec::new();
        for schema in schemas {
            if !seen.insert(schema.name.clone()) {
                continue;
            }
            if by_name.contains_key(&schema.priority_level) {
                table.push(Arc::new(schema));
            } else {
                dangling.insert(schema.name);
            }
        }
        table.sort_by(|a, b| {
            a.matching_precedence
                .cmp(&b.matching_precedence)
                .then_with(|| a.name.cmp(&b.name))
        });

        let fallback_level = by_name
            .get(EXEMPT)
            .filter(|pl| pl.is_exempt())
            .cloned()
            .unwrap_or_else(|| Arc::new(PriorityLevelConfiguration::exempt(EXEMPT)));

        Self {
            schemas: table,
            levels: by_name,
            dangling,
            fallback_schema: Arc::new(fallback_schema()),
            fallback_level,
        }
    }

    /// Classify a request. Always returns a result.
    pub fn classify(&self, digest: &RequestDigest) -> Classification {
        for schema in &self.schemas {
            if !schema.matches(digest) {
                continue;
            }
            if let Some(level) = self.levels.get(&schema.priority_level) {
                return Classification {
                    flow_distinguisher: schema.flow_distinguisher(digest),
                    flow_schema: Arc::clone(schema),
                    priority_level: Arc::clone(level),
                };
            }
        }
        Classification {
            flow_distinguisher: self.fallback_schema.flow_distinguisher(digest),
            flow_schema: Arc::clone(&self.fallback_schema),
            priority_level: Arc::clone(&self.fallback_level),
        }
    }

    /// Schemas in match order.
    pub fn flow_schemas(&self) -> &[Arc<FlowSchema>] {
        &self.schemas
    }

    pub fn priority_levels(&self) -> impl Iterator<Item = &Arc<PriorityLevelConfiguration>> {
        self.levels.values()
    }

    pub fn priority_level(&self, name: &str) -> Option<&Arc<PriorityLevelConfiguration>> {
        self.levels.get(name)
    }

    /// Names of schemas whose priority level does not exist.
    pub fn dangling(&self) -> &BTreeSet<String> {
        &self.dangling
    }

    pub fn is_dangling(&self, schema: &str) -> bool {
        self.dangling.contains(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::{
        mandatory_flow_schemas, mandatory_priority_levels, PolicyRulesWithSubjects, QueuingConfig,
        Subject, CATCH_ALL,
    };
    use crate::domain::config::DistinguisherMethod;
    use crate::domain::digest::UserInfo;

    fn user_rule(name: &str) -> PolicyRulesWithSubjects {
        PolicyRulesWithSubjects::everything_for(vec![Subject::User {
            name: name.to_string(),
        }])
    }

    fn standard(extra_schemas: Vec<FlowSchema>, extra_levels: Vec<PriorityLevelConfiguration>) -> Classifier {
        let mut schemas = mandatory_flow_schemas();
        schemas.extend(extra_schemas);
        let mut levels = mandatory_priority_levels();
        levels.extend(extra_levels);
        Classifier::new(schemas, levels)
    }

    fn get_pods(user: UserInfo) -> RequestDigest {
        RequestDigest::resource("get", "", "pods", "default", user)
    }

    #[test]
    fn test_masters_are_exempt() {
        let classifier = standard(vec![], vec![]);
        let c = classifier.classify(&get_pods(UserInfo::new("root", &["system:masters"])));
        assert_eq!(c.flow_schema.name, EXEMPT);
        assert!(c.is_exempt());
    }

    #[test]
    fn test_everyone_else_hits_catch_all() {
        let classifier = standard(vec![], vec![]);
        let c = classifier.classify(&get_pods(UserInfo::new("alice", &[])));
        assert_eq!(c.flow_schema.name, CATCH_ALL);
        assert_eq!(c.priority_level.name, CATCH_ALL);
        assert_eq!(c.flow_distinguisher, "alice");
    }

    #[test]
    fn test_lowest_precedence_then_name_wins() {
        let classifier = standard(
            vec![
                FlowSchema::new("zeta", 100, "workload").with_rule(user_rule("alice")),
                FlowSchema::new("alpha", 100, "workload").with_rule(user_rule("alice")),
                FlowSchema::new("first", 50, "workload").with_rule(user_rule("bob")),
            ],
            vec![PriorityLevelConfiguration::limited("workload", 30, QueuingConfig::default())],
        );
        let c = classifier.classify(&get_pods(UserInfo::new("alice", &[])));
        assert_eq!(c.flow_schema.name, "alpha");
    }

    #[test]
    fn test_dangling_schema_falls_through() {
        let classifier = standard(
            vec![
                FlowSchema::new("broken", 10, "missing").with_rule(user_rule("alice")),
                FlowSchema::new("ok", 20, "workload")
                    .with_rule(user_rule("alice"))
                    .with_distinguisher(DistinguisherMethod::ByNamespace),
            ],
            vec![PriorityLevelConfiguration::limited("workload", 30, QueuingConfig::default())],
        );
        assert!(classifier.is_dangling("broken"));
        assert!(!classifier.is_dangling("ok"));

        let c = classifier.classify(&get_pods(UserInfo::new("alice", &[])));
        assert_eq!(c.flow_schema.name, "ok");
        assert_eq!(c.flow_distinguisher, "default");
    }

    #[test]
    fn test_terminal_fallback_is_exempt() {
        // Nothing but a dangling schema: the built-in fallback takes over.
        let classifier = Classifier::new(
            vec![FlowSchema::new("broken", 10, "missing").with_rule(PolicyRulesWithSubjects::everything())],
            vec![],
        );
        let c = classifier.classify(&get_pods(UserInfo::new("alice", &[])));
        assert_eq!(c.flow_schema.name, CATCH_ALL);
        assert!(c.is_exempt());
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = standard(
            vec![FlowSchema::new("web", 500, "workload")
                .with_rule(PolicyRulesWithSubjects::everything())
                .with_distinguisher(DistinguisherMethod::ByUser)],
            vec![PriorityLevelConfiguration::limited("workload", 30, QueuingConfig::default())],
        );
        let digest = RequestDigest::non_resource("get", "/healthz", UserInfo::new("carol", &["dev"]));
        let first = classifier.classify(&digest);
        for _ in 0..10 {
            assert_eq!(classifier.classify(&digest), first);
        }
    }
}
