//! Resolution of the guardrails a request runs from policies and their attachments.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use auth::Principal;
use config::{GuardrailPolicyConfig, GuardrailsConfig, PolicyAttachmentConfig};
use mini_moka::sync::Cache;

/// Attachment classes in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AttachmentClass {
    Global,
    Team,
    Key,
    Model,
    Tag,
}

struct Attachment {
    class: AttachmentClass,
    policy: String,
    team: Option<String>,
    key: Option<String>,
    model: Option<String>,
    tag: Option<String>,
}

impl Attachment {
    fn new(config: &PolicyAttachmentConfig) -> Self {
        let class = if config.scope.as_deref() == Some("global") {
            AttachmentClass::Global
        } else if config.team.is_some() {
            AttachmentClass::Team
        } else if config.key.is_some() {
            AttachmentClass::Key
        } else if config.model.is_some() {
            AttachmentClass::Model
        } else if config.tag.is_some() {
            AttachmentClass::Tag
        } else {
            log::warn!(
                "Attachment of policy '{}' names no scope, team, key, model or tag and applies globally",
                config.policy
            );
            AttachmentClass::Global
        };

        Self {
            class,
            policy: config.policy.clone(),
            team: config.team.clone(),
            key: config.key.clone(),
            model: config.model.clone(),
            tag: config.tag.clone(),
        }
    }

    /// Every dimension the attachment names must match.
    fn matches(&self, model: &str, principal: &Principal, tags: &[String]) -> bool {
        if self.class == AttachmentClass::Global {
            return true;
        }

        let team = self.team.as_deref().is_none_or(|team| team == principal.team_id());

        let key = self.key.as_deref().is_none_or(|key| {
            key == principal.fingerprint || principal.info.key_alias.as_deref() == Some(key)
        });

        let model = self.model.as_deref().is_none_or(|attached| attached == model);
        let tag = self.tag.as_deref().is_none_or(|tag| tags.iter().any(|t| t == tag));

        team && key && model && tag
    }
}

type CacheKey = (String, String, String);

/// Resolves the ordered guardrail names for a request.
pub(crate) struct PolicyResolver {
    policies: BTreeMap<String, Vec<String>>,
    attachments: Vec<Attachment>,
    cache: Cache<CacheKey, Arc<Vec<String>>>,
}

impl PolicyResolver {
    pub fn new(config: &GuardrailsConfig) -> Self {
        let policies = config
            .policies
            .keys()
            .map(|name| {
                let mut stack = Vec::new();
                (name.clone(), effective(name, &config.policies, &mut stack))
            })
            .collect();

        let mut attachments: Vec<Attachment> = config.attachments.iter().map(Attachment::new).collect();

        // stable, so declaration order holds within a class
        attachments.sort_by_key(|attachment| attachment.class);

        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_idle(Duration::from_secs(3600))
            .build();

        Self {
            policies,
            attachments,
            cache,
        }
    }

    /// Effective guardrail list of a named policy.
    pub fn policy(&self, name: &str) -> Option<&[String]> {
        self.policies.get(name).map(Vec::as_slice)
    }

    /// Guardrails for a request: attached policies, then the principal's policies, then its
    /// extra guardrails, duplicates dropped.
    pub fn resolve(&self, model: &str, principal: &Principal) -> Arc<Vec<String>> {
        let tags = &principal.info.tags;

        if !tags.is_empty() {
            return Arc::new(self.compute(model, principal, tags));
        }

        let key = (
            model.to_string(),
            principal.team_id().to_string(),
            principal.fingerprint.clone(),
        );

        if let Some(names) = self.cache.get(&key) {
            return names;
        }

        let names = Arc::new(self.compute(model, principal, tags));
        self.cache.insert(key, names.clone());

        names
    }

    fn compute(&self, model: &str, principal: &Principal, tags: &[String]) -> Vec<String> {
        let attached = self
            .attachments
            .iter()
            .filter(|attachment| attachment.matches(model, principal, tags))
            .map(|attachment| attachment.policy.as_str());

        let own = principal.info.policies.iter().map(String::as_str);

        let mut names: Vec<String> = Vec::new();

        for policy in attached.chain(own) {
            match self.policies.get(policy) {
                Some(guardrails) => extend_unique(&mut names, guardrails),
                None => log::warn!("Guardrail policy '{policy}' is not defined, skipping"),
            }
        }

        extend_unique(&mut names, &principal.info.guardrails);

        names
    }
}

/// Parent list, own guardrails, additions, minus removals. Cycles end the chain.
fn effective<'a>(
    name: &'a str,
    policies: &'a BTreeMap<String, GuardrailPolicyConfig>,
    stack: &mut Vec<&'a str>,
) -> Vec<String> {
    let Some(policy) = policies.get(name) else {
        return Vec::new();
    };

    if stack.contains(&name) {
        log::warn!("Guardrail policy '{name}' inherits from itself");
        return Vec::new();
    }

    stack.push(name);

    let mut names = match policy.inherit.as_deref() {
        Some(parent) => effective(parent, policies, stack),
        None => Vec::new(),
    };

    stack.pop();

    extend_unique(&mut names, &policy.guardrails);
    extend_unique(&mut names, &policy.add);
    names.retain(|name| !policy.remove.contains(name));

    names
}

fn extend_unique(names: &mut Vec<String>, extra: &[String]) {
    for name in extra {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
}
