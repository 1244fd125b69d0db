//! Permission evaluation over the grant graph
//!
//! A check walks Token → Rule → Action for type-level requests and
//! Token → Rule → Field → Action for attribute-level ones. The two levels
//! never stand in for each other: a Rule-attached action does not answer an
//! attribute query, and a Field-attached one does not answer a type query.
//!
//! Evaluation is existential and read-only. Rules that fail to resolve or
//! whose lookups fail are skipped rather than failing the whole check.

use crate::model::{Rule, Target, Token, Verb};
use crate::registry::{TypeDescriptor, TypeRegistry};
use crate::store::{GrantStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Clone)]
pub struct PermissionEngine {
    store: Arc<dyn GrantStore>,
    registry: Arc<dyn TypeRegistry>,
}

impl PermissionEngine {
    pub fn new(store: Arc<dyn GrantStore>, registry: Arc<dyn TypeRegistry>) -> Self {
        Self { store, registry }
    }

    /// Does any grant on `token` allow `verb` on `resource_type`
    /// (or on its `attribute`, when given)?
    ///
    /// Liveness of the token is the caller's concern; see
    /// [`AccessGuard`](crate::AccessGuard).
    pub fn can(
        &self,
        token: &Token,
        verb: Verb,
        resource_type: &str,
        attribute: Option<&str>,
    ) -> bool {
        let rules = match self.store.rules_for_token(token.id) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(token = %token.id, error = %e, "failed to load rules, denying");
                return false;
            }
        };

        // Resolve each distinct type name once per check
        let mut resolved: HashMap<&str, Option<Arc<TypeDescriptor>>> = HashMap::new();

        for rule in &rules {
            let descriptor = resolved
                .entry(rule.resource_type.as_str())
                .or_insert_with(|| match self.registry.resolve(&rule.resource_type) {
                    Ok(descriptor) => Some(descriptor),
                    Err(e) => {
                        warn!(rule = %rule.id, error = %e, "skipping rule with unresolvable type");
                        None
                    }
                })
                .clone();

            let Some(descriptor) = descriptor else {
                continue;
            };
            if descriptor.name != resource_type {
                continue;
            }

            let granted = match attribute {
                None => self.rule_grants(rule, verb),
                Some(attribute) => self.field_grants(rule, attribute, verb),
            };

            match granted {
                Ok(true) => {
                    debug!(
                        token = %token.id,
                        rule = %rule.id,
                        %verb,
                        resource_type,
                        attribute,
                        "grant matched"
                    );
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "skipping rule after failed lookup");
                }
            }
        }

        trace!(token = %token.id, %verb, resource_type, attribute, "no grant matched");
        false
    }

    pub fn can_create(&self, token: &Token, resource_type: &str) -> bool {
        self.can(token, Verb::Create, resource_type, None)
    }

    pub fn can_read(&self, token: &Token, resource_type: &str, attribute: Option<&str>) -> bool {
        self.can(token, Verb::Read, resource_type, attribute)
    }

    pub fn can_update(&self, token: &Token, resource_type: &str, attribute: Option<&str>) -> bool {
        self.can(token, Verb::Update, resource_type, attribute)
    }

    pub fn can_delete(&self, token: &Token, resource_type: &str) -> bool {
        self.can(token, Verb::Delete, resource_type, None)
    }

    fn rule_grants(&self, rule: &Rule, verb: Verb) -> Result<bool, StoreError> {
        Ok(self
            .store
            .actions_for_target(Target::Rule(rule.id))?
            .iter()
            .any(|a| a.verb == verb))
    }

    fn field_grants(&self, rule: &Rule, attribute: &str, verb: Verb) -> Result<bool, StoreError> {
        for field in self.store.fields_for_rule(rule.id, Some(attribute))? {
            let granted = self
                .store
                .actions_for_target(Target::Field(field.id))?
                .iter()
                .any(|a| a.verb == verb);
            if granted {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
