//! Grant graph entities
//!
//! A Token owns Rules, a Rule owns Fields, and an Action attaches one CRUD
//! verb to exactly one Rule (type-wide) or one Field (attribute-scoped).
//! Structural checks live here; the save path of each store calls them
//! before anything is committed.

use crate::registry::{split_qualified_name, TypeDescriptor, TypeRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Reasons an entity is rejected at its save boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid model name '{0}' (is it fully qualified and registered?)")]
    InvalidModelName(String),

    #[error("Unknown attribute '{attribute}' on {type_name}")]
    UnknownAttribute { type_name: String, attribute: String },

    #[error("Action must target exactly one of rule or field")]
    InvalidActionTarget,

    #[error("Invalid verb: {0}")]
    InvalidVerb(String),
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(
    /// Identifies a Token record
    TokenId
);
entity_id!(
    /// Identifies a Rule record
    RuleId
);
entity_id!(
    /// Identifies a Field record
    FieldId
);
entity_id!(
    /// Identifies an Action record
    ActionId
);

/// CRUD operation a grant can carry. There is no deny verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Create,
    #[default]
    Read,
    Update,
    Delete,
}

impl Verb {
    pub const ALL: [Verb; 4] = [Verb::Create, Verb::Read, Verb::Update, Verb::Delete];

    /// Single-letter code used in storage
    pub fn code(self) -> char {
        match self {
            Verb::Create => 'C',
            Verb::Read => 'R',
            Verb::Update => 'U',
            Verb::Delete => 'D',
        }
    }

    pub fn from_code(code: char) -> Result<Self, ModelError> {
        match code {
            'C' => Ok(Verb::Create),
            'R' => Ok(Verb::Read),
            'U' => Ok(Verb::Update),
            'D' => Ok(Verb::Delete),
            other => Err(ModelError::InvalidVerb(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Read => "read",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

impl FromStr for Verb {
    type Err = ModelError;

    /// Accepts `create`/`read`/`update`/`delete` in any case, or the one-letter code
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" | "c" => Ok(Verb::Create),
            "read" | "r" => Ok(Verb::Read),
            "update" | "u" => Ok(Verb::Update),
            "delete" | "d" => Ok(Verb::Delete),
            _ => Err(ModelError::InvalidVerb(s.to_string())),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bearer credential scoping zero or more Rules.
///
/// An empty `secret` or a missing `expires` means "not yet generated";
/// [`TokenLifecycle`](crate::TokenLifecycle) fills them in once and never again.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    /// Principal the token acts on behalf of
    #[serde(default)]
    pub principal: Option<String>,
}

impl Token {
    /// A token with no secret, expiration or principal yet
    pub fn new() -> Self {
        Self {
            id: TokenId::new(),
            secret: String::new(),
            expires: None,
            principal: None,
        }
    }

    pub fn for_principal(principal: impl Into<String>) -> Self {
        Self {
            principal: Some(principal.into()),
            ..Self::new()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_expiration(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn is_initialized(&self) -> bool {
        !self.secret.is_empty() && self.expires.is_some()
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

// Keeps the bearer secret out of logs
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("secret", &if self.secret.is_empty() { "" } else { "<redacted>" })
            .field("expires", &self.expires)
            .field("principal", &self.principal)
            .finish()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "token {} for {}",
            self.id,
            self.principal.as_deref().unwrap_or("anonymous")
        )?;
        match self.expires {
            Some(expires) => write!(f, " expires on {}", expires.to_rfc3339()),
            None => f.write_str(" (no expiration set)"),
        }
    }
}

/// Grant scope for one resource type, owned by one Token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub token: TokenId,
    /// Fully-qualified type name, e.g. `app.Doc`
    pub resource_type: String,
}

impl Rule {
    pub fn new(token: TokenId, resource_type: impl Into<String>) -> Self {
        Self {
            id: RuleId::new(),
            token,
            resource_type: resource_type.into(),
        }
    }

    /// Fails with `InvalidModelName` unless the type name is `module.Type`
    /// shaped and registered.
    pub fn validate_type(
        &self,
        registry: &dyn TypeRegistry,
    ) -> Result<Arc<TypeDescriptor>, ModelError> {
        split_qualified_name(&self.resource_type)?;
        registry.resolve(&self.resource_type)
    }

    pub fn is_valid_type(&self, registry: &dyn TypeRegistry) -> bool {
        self.validate_type(registry).is_ok()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule {} on {}", self.id, self.resource_type)
    }
}

/// Narrows a Rule to one named attribute of its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub id: FieldId,
    pub rule: RuleId,
    pub name: String,
}

impl Field {
    pub fn new(rule: RuleId, name: impl Into<String>) -> Self {
        Self {
            id: FieldId::new(),
            rule,
            name: name.into(),
        }
    }

    /// `rule` must be the Rule this Field belongs to.
    pub fn validate_attribute(
        &self,
        rule: &Rule,
        registry: &dyn TypeRegistry,
    ) -> Result<(), ModelError> {
        let descriptor = rule.validate_type(registry)?;
        if descriptor.has_attribute(&self.name) {
            Ok(())
        } else {
            Err(ModelError::UnknownAttribute {
                type_name: descriptor.name.clone(),
                attribute: self.name.clone(),
            })
        }
    }

    pub fn is_valid_attribute(&self, rule: &Rule, registry: &dyn TypeRegistry) -> bool {
        self.validate_attribute(rule, registry).is_ok()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field {} '{}' of rule {}", self.id, self.name, self.rule)
    }
}

/// What an Action is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum Target {
    Rule(RuleId),
    Field(FieldId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Rule(id) => write!(f, "rule {}", id),
            Target::Field(id) => write!(f, "field {}", id),
        }
    }
}

/// One verb attached to exactly one of {Rule, Field}.
///
/// Both references are kept as options so a bad combination can be built
/// and then rejected by [`Action::validate_target`]; it is never repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    #[serde(default)]
    pub verb: Verb,
    #[serde(default)]
    pub rule: Option<RuleId>,
    #[serde(default)]
    pub field: Option<FieldId>,
}

impl Action {
    /// An action with no target yet
    pub fn new(verb: Verb) -> Self {
        Self {
            id: ActionId::new(),
            verb,
            rule: None,
            field: None,
        }
    }

    pub fn on_rule(verb: Verb, rule: RuleId) -> Self {
        Self {
            rule: Some(rule),
            ..Self::new(verb)
        }
    }

    pub fn on_field(verb: Verb, field: FieldId) -> Self {
        Self {
            field: Some(field),
            ..Self::new(verb)
        }
    }

    pub fn target(&self) -> Result<Target, ModelError> {
        match (self.rule, self.field) {
            (Some(rule), None) => Ok(Target::Rule(rule)),
            (None, Some(field)) => Ok(Target::Field(field)),
            _ => Err(ModelError::InvalidActionTarget),
        }
    }

    pub fn validate_target(&self) -> Result<(), ModelError> {
        self.target().map(|_| ())
    }

    pub fn has_valid_target(&self) -> bool {
        self.target().is_ok()
    }

    /// Reattach to a new target, dropping the old reference
    pub fn move_to(&mut self, target: Target) {
        match target {
            Target::Rule(rule) => {
                self.rule = Some(rule);
                self.field = None;
            }
            Target::Field(field) => {
                self.rule = None;
                self.field = Some(field);
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Ok(target) => write!(f, "{} on {}", self.verb, target),
            Err(_) => write!(f, "{} (no valid target)", self.verb),
        }
    }
}
