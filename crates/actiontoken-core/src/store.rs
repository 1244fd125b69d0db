//! Grant storage
//!
//! [`GrantStore`] is the read surface the permission engine needs.
//! [`MemoryGrantStore`] is the in-process implementation, including the
//! validating save path and cascading deletes.

use crate::lifecycle::TokenLifecycle;
use crate::model::{Action, ActionId, Field, FieldId, ModelError, Rule, RuleId, Target, Token, TokenId};
use crate::registry::TypeRegistry;
use actiontoken_crypto::{secrets_match, SecretError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Invalid(#[from] ModelError),

    #[error("Token not found: {0}")]
    TokenNotFound(TokenId),

    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),

    #[error("Field not found: {0}")]
    FieldNotFound(FieldId),

    #[error("Rule {rule} belongs to token {token}")]
    RuleOwnerChanged { rule: RuleId, token: TokenId },

    #[error("Secret generation failed: {0}")]
    Secret(#[from] SecretError),

    #[error("Store lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Queries the permission engine runs against persisted grants
pub trait GrantStore: Send + Sync {
    /// All Rules owned by `token`
    fn rules_for_token(&self, token: TokenId) -> Result<Vec<Rule>, StoreError>;

    /// Fields owned by `rule`, optionally only those named `name`
    fn fields_for_rule(&self, rule: RuleId, name: Option<&str>) -> Result<Vec<Field>, StoreError>;

    /// Actions attached to `target`
    fn actions_for_target(&self, target: Target) -> Result<Vec<Action>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    tokens: HashMap<TokenId, Token>,
    rules: HashMap<RuleId, Rule>,
    fields: HashMap<FieldId, Field>,
    actions: HashMap<ActionId, Action>,
}

impl Tables {
    fn remove_token(&mut self, id: TokenId) -> bool {
        if self.tokens.remove(&id).is_none() {
            return false;
        }
        let owned: Vec<RuleId> = self
            .rules
            .values()
            .filter(|r| r.token == id)
            .map(|r| r.id)
            .collect();
        for rule in owned {
            self.remove_rule(rule);
        }
        true
    }

    fn remove_rule(&mut self, id: RuleId) -> bool {
        if self.rules.remove(&id).is_none() {
            return false;
        }
        let owned: Vec<FieldId> = self
            .fields
            .values()
            .filter(|f| f.rule == id)
            .map(|f| f.id)
            .collect();
        for field in owned {
            self.remove_field(field);
        }
        self.actions.retain(|_, a| a.rule != Some(id));
        true
    }

    fn remove_field(&mut self, id: FieldId) -> bool {
        if self.fields.remove(&id).is_none() {
            return false;
        }
        self.actions.retain(|_, a| a.field != Some(id));
        true
    }
}

/// Thread-safe in-memory grant store.
///
/// Writes take the table lock exclusively, so the lazy secret fill in
/// [`save_token`](Self::save_token) is serialized per store.
pub struct MemoryGrantStore {
    registry: Arc<dyn TypeRegistry>,
    tables: RwLock<Tables>,
}

impl MemoryGrantStore {
    pub fn new(registry: Arc<dyn TypeRegistry>) -> Self {
        Self {
            registry,
            tables: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Insert or update a token.
    ///
    /// A secret or expiration already stored for this id wins over the
    /// caller's copy; missing values are generated. `token` is updated to
    /// what was stored.
    pub fn save_token(
        &self,
        token: &mut Token,
        lifecycle: &TokenLifecycle,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if let Some(existing) = tables.tokens.get(&token.id) {
            if !existing.secret.is_empty() {
                token.secret = existing.secret.clone();
            }
            if existing.expires.is_some() {
                token.expires = existing.expires;
            }
        }
        lifecycle.ensure_initialized(token)?;
        tables.tokens.insert(token.id, token.clone());
        Ok(())
    }

    pub fn token(&self, id: TokenId) -> Result<Option<Token>, StoreError> {
        Ok(self.read()?.tokens.get(&id).cloned())
    }

    pub fn token_by_secret(&self, secret: &str) -> Result<Option<Token>, StoreError> {
        Ok(self
            .read()?
            .tokens
            .values()
            .find(|t| secrets_match(secret, &t.secret))
            .cloned())
    }

    pub fn tokens(&self) -> Result<Vec<Token>, StoreError> {
        Ok(self.read()?.tokens.values().cloned().collect())
    }

    /// Insert or update a rule.
    ///
    /// A stored rule keeps its token. Changing its type re-checks every
    /// Field it owns against the new type.
    pub fn save_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        rule.validate_type(self.registry.as_ref())?;
        let mut tables = self.write()?;
        if !tables.tokens.contains_key(&rule.token) {
            return Err(StoreError::TokenNotFound(rule.token));
        }
        if let Some(existing) = tables.rules.get(&rule.id) {
            if existing.token != rule.token {
                return Err(StoreError::RuleOwnerChanged {
                    rule: rule.id,
                    token: existing.token,
                });
            }
            for field in tables.fields.values().filter(|f| f.rule == rule.id) {
                field.validate_attribute(rule, self.registry.as_ref())?;
            }
        }
        tables.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    pub fn save_field(&self, field: &Field) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let rule = tables
            .rules
            .get(&field.rule)
            .ok_or(StoreError::RuleNotFound(field.rule))?;
        field.validate_attribute(rule, self.registry.as_ref())?;
        tables.fields.insert(field.id, field.clone());
        Ok(())
    }

    /// Insert or update an action. The single-target check runs on every save,
    /// including when an existing action is moved.
    pub fn save_action(&self, action: &Action) -> Result<(), StoreError> {
        let target = action.target()?;
        let mut tables = self.write()?;
        match target {
            Target::Rule(id) if !tables.rules.contains_key(&id) => {
                return Err(StoreError::RuleNotFound(id));
            }
            Target::Field(id) if !tables.fields.contains_key(&id) => {
                return Err(StoreError::FieldNotFound(id));
            }
            _ => {}
        }
        tables.actions.insert(action.id, action.clone());
        Ok(())
    }

    pub fn action(&self, id: ActionId) -> Result<Option<Action>, StoreError> {
        Ok(self.read()?.actions.get(&id).cloned())
    }

    /// Revokes the token together with its Rules, their Fields and every
    /// Action targeting them.
    pub fn delete_token(&self, id: TokenId) -> Result<bool, StoreError> {
        Ok(self.write()?.remove_token(id))
    }

    pub fn delete_rule(&self, id: RuleId) -> Result<bool, StoreError> {
        Ok(self.write()?.remove_rule(id))
    }

    pub fn delete_field(&self, id: FieldId) -> Result<bool, StoreError> {
        Ok(self.write()?.remove_field(id))
    }

    /// Actions own nothing; only the action itself goes.
    pub fn delete_action(&self, id: ActionId) -> Result<bool, StoreError> {
        Ok(self.write()?.actions.remove(&id).is_some())
    }
}

impl GrantStore for MemoryGrantStore {
    fn rules_for_token(&self, token: TokenId) -> Result<Vec<Rule>, StoreError> {
        Ok(self
            .read()?
            .rules
            .values()
            .filter(|r| r.token == token)
            .cloned()
            .collect())
    }

    fn fields_for_rule(&self, rule: RuleId, name: Option<&str>) -> Result<Vec<Field>, StoreError> {
        Ok(self
            .read()?
            .fields
            .values()
            .filter(|f| f.rule == rule && name.map_or(true, |n| f.name == n))
            .cloned()
            .collect())
    }

    fn actions_for_target(&self, target: Target) -> Result<Vec<Action>, StoreError> {
        Ok(self
            .read()?
            .actions
            .values()
            .filter(|a| a.target().ok() == Some(target))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Verb;
    use crate::registry::{StaticTypeRegistry, TypeDescriptor};

    fn store() -> MemoryGrantStore {
        let registry = StaticTypeRegistry::from_descriptors([
            TypeDescriptor::new("pkg.User", ["username", "email"]),
            TypeDescriptor::new("app.Doc", ["title"]),
            TypeDescriptor::new("app.Account", ["username", "title"]),
        ])
        .unwrap();
        MemoryGrantStore::new(Arc::new(registry))
    }

    fn saved_token(store: &MemoryGrantStore) -> Token {
        let mut token = Token::new();
        store.save_token(&mut token, &TokenLifecycle::default()).unwrap();
        token
    }

    #[test]
    fn test_save_token_fills_and_keeps_secret() {
        let store = store();
        let lifecycle = TokenLifecycle::default();
        let mut token = Token::new();
        store.save_token(&mut token, &lifecycle).unwrap();
        assert!(token.is_initialized());

        // A stale copy with a different secret must not overwrite the stored one
        let mut stale = token.clone().with_secret("other");
        stale.principal = Some("bob".into());
        store.save_token(&mut stale, &lifecycle).unwrap();
        assert_eq!(stale.secret, token.secret);

        let stored = store.token(token.id).unwrap().unwrap();
        assert_eq!(stored.secret, token.secret);
        assert_eq!(stored.principal.as_deref(), Some("bob"));
    }

    #[test]
    fn test_concurrent_first_save_agrees_on_secret() {
        let store = store();
        let lifecycle = TokenLifecycle::default();
        let template = Token::new();

        let secrets: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let mut token = template.clone();
                    let store = &store;
                    let lifecycle = &lifecycle;
                    s.spawn(move || {
                        store.save_token(&mut token, lifecycle).unwrap();
                        token.secret
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(secrets.iter().all(|s| s == &secrets[0]));
    }

    #[test]
    fn test_token_by_secret() {
        let store = store();
        let token = saved_token(&store);
        assert_eq!(store.token_by_secret(&token.secret).unwrap().unwrap().id, token.id);
        assert!(store.token_by_secret("nope").unwrap().is_none());
        assert!(store.token_by_secret("").unwrap().is_none());
    }

    #[test]
    fn test_save_rule_validates_type() {
        let store = store();
        let token = saved_token(&store);

        assert!(store.save_rule(&Rule::new(token.id, "pkg.User")).is_ok());
        assert!(matches!(
            store.save_rule(&Rule::new(token.id, "User")),
            Err(StoreError::Invalid(ModelError::InvalidModelName(_)))
        ));
        assert!(matches!(
            store.save_rule(&Rule::new(TokenId::new(), "pkg.User")),
            Err(StoreError::TokenNotFound(_))
        ));
        assert_eq!(store.rules_for_token(token.id).unwrap().len(), 1);
    }

    #[test]
    fn test_save_field_validates_attribute() {
        let store = store();
        let token = saved_token(&store);
        let rule = Rule::new(token.id, "pkg.User");
        store.save_rule(&rule).unwrap();

        store.save_field(&Field::new(rule.id, "username")).unwrap();
        assert!(matches!(
            store.save_field(&Field::new(rule.id, "password")),
            Err(StoreError::Invalid(ModelError::UnknownAttribute { .. }))
        ));
        assert!(matches!(
            store.save_field(&Field::new(RuleId::new(), "username")),
            Err(StoreError::RuleNotFound(_))
        ));

        assert_eq!(store.fields_for_rule(rule.id, None).unwrap().len(), 1);
        assert_eq!(store.fields_for_rule(rule.id, Some("username")).unwrap().len(), 1);
        assert!(store.fields_for_rule(rule.id, Some("email")).unwrap().is_empty());
    }

    #[test]
    fn test_save_action_rejects_bad_target() {
        let store = store();
        let token = saved_token(&store);
        let rule = Rule::new(token.id, "pkg.User");
        store.save_rule(&rule).unwrap();
        let field = Field::new(rule.id, "username");
        store.save_field(&field).unwrap();

        let mut action = Action::on_field(Verb::Read, field.id);
        store.save_action(&action).unwrap();

        action.rule = Some(rule.id);
        assert!(matches!(
            store.save_action(&action),
            Err(StoreError::Invalid(ModelError::InvalidActionTarget))
        ));
        // Rejected save leaves the stored copy untouched
        assert_eq!(store.action(action.id).unwrap().unwrap().rule, None);

        action.field = None;
        store.save_action(&action).unwrap();
        assert_eq!(store.actions_for_target(Target::Rule(rule.id)).unwrap().len(), 1);
        assert!(store.actions_for_target(Target::Field(field.id)).unwrap().is_empty());

        assert!(store.save_action(&Action::new(Verb::Read)).is_err());
        assert!(matches!(
            store.save_action(&Action::on_rule(Verb::Read, RuleId::new())),
            Err(StoreError::RuleNotFound(_))
        ));
    }

    #[test]
    fn test_delete_token_cascades() {
        let store = store();
        let token = saved_token(&store);
        let rule = Rule::new(token.id, "pkg.User");
        store.save_rule(&rule).unwrap();
        let field = Field::new(rule.id, "username");
        store.save_field(&field).unwrap();
        store.save_action(&Action::on_rule(Verb::Read, rule.id)).unwrap();
        store.save_action(&Action::on_field(Verb::Update, field.id)).unwrap();

        assert!(store.delete_token(token.id).unwrap());
        assert!(store.token(token.id).unwrap().is_none());
        assert!(store.rules_for_token(token.id).unwrap().is_empty());
        assert!(store.fields_for_rule(rule.id, None).unwrap().is_empty());
        assert!(store.actions_for_target(Target::Rule(rule.id)).unwrap().is_empty());
        assert!(store.actions_for_target(Target::Field(field.id)).unwrap().is_empty());
        assert!(!store.delete_token(token.id).unwrap());
    }

    #[test]
    fn test_resave_rule_rechecks_owned_fields() {
        let store = store();
        let token = saved_token(&store);
        let rule = Rule::new(token.id, "pkg.User");
        store.save_rule(&rule).unwrap();
        let field = Field::new(rule.id, "username");
        store.save_field(&field).unwrap();
        store.save_action(&Action::on_field(Verb::Read, field.id)).unwrap();

        let retyped = Rule {
            resource_type: "app.Doc".into(),
            ..rule.clone()
        };
        assert!(matches!(
            store.save_rule(&retyped),
            Err(StoreError::Invalid(ModelError::UnknownAttribute { .. }))
        ));
        assert_eq!(store.rules_for_token(token.id).unwrap(), vec![rule.clone()]);

        // Every owned field still names an attribute of the new type
        let compatible = Rule {
            resource_type: "app.Account".into(),
            ..rule.clone()
        };
        store.save_rule(&compatible).unwrap();
        assert_eq!(store.rules_for_token(token.id).unwrap(), vec![compatible]);
    }

    #[test]
    fn test_resave_rule_keeps_its_token() {
        let store = store();
        let owner = saved_token(&store);
        let other = saved_token(&store);
        let rule = Rule::new(owner.id, "pkg.User");
        store.save_rule(&rule).unwrap();

        let moved = Rule {
            token: other.id,
            ..rule.clone()
        };
        assert!(matches!(
            store.save_rule(&moved),
            Err(StoreError::RuleOwnerChanged { token, .. }) if token == owner.id
        ));
        assert!(store.rules_for_token(other.id).unwrap().is_empty());
        assert_eq!(store.rules_for_token(owner.id).unwrap(), vec![rule]);
    }

    #[test]
    fn test_delete_rule_cascades() {
        let store = store();
        let token = saved_token(&store);
        let rule = Rule::new(token.id, "pkg.User");
        let sibling = Rule::new(token.id, "app.Doc");
        store.save_rule(&rule).unwrap();
        store.save_rule(&sibling).unwrap();
        let field = Field::new(rule.id, "username");
        let sibling_field = Field::new(sibling.id, "title");
        store.save_field(&field).unwrap();
        store.save_field(&sibling_field).unwrap();
        let on_rule = Action::on_rule(Verb::Read, rule.id);
        let on_field = Action::on_field(Verb::Update, field.id);
        let on_sibling = Action::on_field(Verb::Update, sibling_field.id);
        for action in [&on_rule, &on_field, &on_sibling] {
            store.save_action(action).unwrap();
        }

        assert!(store.delete_rule(rule.id).unwrap());
        assert!(store.fields_for_rule(rule.id, None).unwrap().is_empty());
        assert!(store.action(on_rule.id).unwrap().is_none());
        assert!(store.action(on_field.id).unwrap().is_none());

        assert_eq!(store.rules_for_token(token.id).unwrap(), vec![sibling.clone()]);
        assert_eq!(store.fields_for_rule(sibling.id, None).unwrap(), vec![sibling_field]);
        assert!(store.action(on_sibling.id).unwrap().is_some());
        assert!(store.token(token.id).unwrap().is_some());
        assert!(!store.delete_rule(rule.id).unwrap());
    }

    #[test]
    fn test_delete_field_cascades() {
        let store = store();
        let token = saved_token(&store);
        let rule = Rule::new(token.id, "pkg.User");
        store.save_rule(&rule).unwrap();
        let username = Field::new(rule.id, "username");
        let email = Field::new(rule.id, "email");
        store.save_field(&username).unwrap();
        store.save_field(&email).unwrap();
        let on_username = Action::on_field(Verb::Update, username.id);
        let on_email = Action::on_field(Verb::Read, email.id);
        let on_rule = Action::on_rule(Verb::Read, rule.id);
        for action in [&on_username, &on_email, &on_rule] {
            store.save_action(action).unwrap();
        }

        assert!(store.delete_field(username.id).unwrap());
        assert!(store.action(on_username.id).unwrap().is_none());

        assert_eq!(store.fields_for_rule(rule.id, None).unwrap(), vec![email]);
        assert!(store.action(on_email.id).unwrap().is_some());
        assert!(store.action(on_rule.id).unwrap().is_some());
        assert_eq!(store.rules_for_token(token.id).unwrap(), vec![rule]);
        assert!(!store.delete_field(username.id).unwrap());
    }

    #[test]
    fn test_delete_action_does_not_cascade() {
        let store = store();
        let token = saved_token(&store);
        let rule = Rule::new(token.id, "pkg.User");
        store.save_rule(&rule).unwrap();
        let action = Action::on_rule(Verb::Delete, rule.id);
        store.save_action(&action).unwrap();

        assert!(store.delete_action(action.id).unwrap());
        assert_eq!(store.rules_for_token(token.id).unwrap(), vec![rule]);
        assert!(store.token(token.id).unwrap().is_some());
    }
}
