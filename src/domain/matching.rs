//! Matching request digests against flow schema rules.

use crate::domain::config::{
    DistinguisherMethod, FlowSchema, NonResourceRule, PolicyRulesWithSubjects, ResourceRule,
    Subject, WILDCARD,
};
use crate::domain::digest::{RequestDigest, UserInfo};

const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

impl FlowSchema {
    /// Whether any of this schema's rules matches the request.
    pub fn matches(&self, digest: &RequestDigest) -> bool {
        self.rules.iter().any(|rule| rule.matches(digest))
    }

    /// The flow distinguisher for a request matched by this schema.
    pub fn flow_distinguisher(&self, digest: &RequestDigest) -> String {
        match self.distinguisher_method {
            Some(DistinguisherMethod::ByUser) => digest.user.name.clone(),
            Some(DistinguisherMethod::ByNamespace) => digest.namespace.clone(),
            None => String::new(),
        }
    }
}

impl PolicyRulesWithSubjects {
    /// Whether a subject matches the requester and a rule matches the request.
    pub fn matches(&self, digest: &RequestDigest) -> bool {
        if !self.subjects.iter().any(|s| s.matches(&digest.user)) {
            return false;
        }
        if digest.is_resource_request {
            self.resource_rules.iter().any(|r| r.matches(digest))
        } else {
            self.non_resource_rules.iter().any(|r| r.matches(digest))
        }
    }
}

impl Subject {
    /// Whether this subject names the given user.
    pub fn matches(&self, user: &UserInfo) -> bool {
        match self {
            Subject::User { name } => name == WILDCARD || *name == user.name,
            Subject::Group { name } => name == WILDCARD || user.in_group(name),
            Subject::ServiceAccount { namespace, name } => {
                let Some(rest) = user.name.strip_prefix(SERVICE_ACCOUNT_PREFIX) else {
                    return false;
                };
                let Some((sa_namespace, sa_name)) = rest.split_once(':') else {
                    return false;
                };
                sa_namespace == namespace && (name == WILDCARD || sa_name == name)
            }
        }
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| p == WILDCARD || p == value)
}

impl ResourceRule {
    /// Whether this rule covers a resource request.
    pub fn matches(&self, digest: &RequestDigest) -> bool {
        if !matches_any(&self.verbs, &digest.verb) || !matches_any(&self.api_groups, &digest.api_group)
        {
            return false;
        }
        let resource_ok = self.resources.iter().any(|r| {
            if r == WILDCARD {
                return true;
            }
            if digest.subresource.is_empty() {
                *r == digest.resource
            } else {
                r.split_once('/')
                    .is_some_and(|(res, sub)| res == digest.resource && sub == digest.subresource)
            }
        });
        if !resource_ok {
            return false;
        }
        if digest.namespace.is_empty() {
            self.cluster_scope
        } else {
            matches_any(&self.namespaces, &digest.namespace)
        }
    }
}

impl NonResourceRule {
    /// Whether this rule covers a non-resource request.
    pub fn matches(&self, digest: &RequestDigest) -> bool {
        if !matches_any(&self.verbs, &digest.verb) {
            return false;
        }
        self.non_resource_urls.iter().any(|pattern| {
            if pattern == WILDCARD || *pattern == digest.path {
                return true;
            }
            pattern
                .strip_suffix('*')
                .is_some_and(|prefix| prefix.ends_with('/') && digest.path.starts_with(prefix))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn pods_rule() -> PolicyRulesWithSubjects {
        PolicyRulesWithSubjects {
            subjects: vec![Subject::User {
                name: "alice".to_string(),
            }],
            resource_rules: vec![ResourceRule {
                verbs: strings(&["get", "list"]),
                api_groups: strings(&[""]),
                resources: strings(&["pods", "pods/log"]),
                cluster_scope: false,
                namespaces: strings(&["team-a"]),
            }],
            non_resource_rules: vec![],
        }
    }

    #[test]
    fn test_resource_rule_matching() {
        let alice = UserInfo::new("alice", &[]);
        let rule = pods_rule();

        let get_pods = RequestDigest::resource("get", "", "pods", "team-a", alice.clone());
        assert!(rule.matches(&get_pods));

        let other_ns = RequestDigest::resource("get", "", "pods", "team-b", alice.clone());
        assert!(!rule.matches(&other_ns));

        let delete = RequestDigest::resource("delete", "", "pods", "team-a", alice.clone());
        assert!(!rule.matches(&delete));

        let logs = RequestDigest::resource("get", "", "pods", "team-a", alice.clone())
            .with_subresource("log");
        assert!(rule.matches(&logs));

        let exec = RequestDigest::resource("get", "", "pods", "team-a", alice)
            .with_subresource("exec");
        assert!(!rule.matches(&exec));
    }

    #[test]
    fn test_cluster_scope_required_for_cluster_requests() {
        let rule = pods_rule();
        let cluster = RequestDigest::resource("list", "", "pods", "", UserInfo::new("alice", &[]));
        assert!(!rule.matches(&cluster));
    }

    #[test]
    fn test_subject_matching() {
        let user = UserInfo::new("system:serviceaccount:kube-system:job-controller", &["system:serviceaccounts"]);

        assert!(Subject::ServiceAccount {
            namespace: "kube-system".to_string(),
            name: "*".to_string(),
        }
        .matches(&user));
        assert!(!Subject::ServiceAccount {
            namespace: "default".to_string(),
            name: "job-controller".to_string(),
        }
        .matches(&user));
        assert!(Subject::Group {
            name: "system:serviceaccounts".to_string(),
        }
        .matches(&user));
        assert!(!Subject::User {
            name: "alice".to_string(),
        }
        .matches(&user));
    }

    #[test]
    fn test_non_resource_prefix_matching() {
        let rule = NonResourceRule {
            verbs: strings(&["get"]),
            non_resource_urls: strings(&["/healthz", "/metrics/*"]),
        };
        let anyone = UserInfo::new("anyone", &[]);

        assert!(rule.matches(&RequestDigest::non_resource("get", "/healthz", anyone.clone())));
        assert!(rule.matches(&RequestDigest::non_resource("get", "/metrics/cadvisor", anyone.clone())));
        assert!(!rule.matches(&RequestDigest::non_resource("get", "/metricsx", anyone.clone())));
        assert!(!rule.matches(&RequestDigest::non_resource("post", "/healthz", anyone)));
    }

    #[test]
    fn test_flow_distinguisher() {
        let digest = RequestDigest::resource("get", "", "pods", "team-a", UserInfo::new("alice", &[]));

        let by_user = FlowSchema::new("fs", 100, "pl").with_distinguisher(DistinguisherMethod::ByUser);
        assert_eq!(by_user.flow_distinguisher(&digest), "alice");

        let by_ns = FlowSchema::new("fs", 100, "pl").with_distinguisher(DistinguisherMethod::ByNamespace);
        assert_eq!(by_ns.flow_distinguisher(&digest), "team-a");

        assert_eq!(FlowSchema::new("fs", 100, "pl").flow_distinguisher(&digest), "");
    }
}
