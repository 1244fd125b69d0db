//! SQLite grant store
//!
//! Foreign keys carry the ownership graph: deleting a token cascades to its
//! rules, their fields, and every action pointing at either. Actions only
//! reference their target, so deleting one touches nothing else.

use actiontoken_core::{
    Action, ActionId, Field, FieldId, GrantStore, ModelError, Rule, RuleId, StoreError, Target,
    Token, TokenId, TokenLifecycle, TypeRegistry, Verb,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tokens (
        id TEXT PRIMARY KEY,
        secret TEXT NOT NULL DEFAULT '',
        expires TEXT,
        principal TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_tokens_secret ON tokens(secret);

    CREATE TABLE IF NOT EXISTS rules (
        id TEXT PRIMARY KEY,
        token_id TEXT NOT NULL REFERENCES tokens(id) ON DELETE CASCADE,
        resource_type TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_rules_token ON rules(token_id);

    CREATE TABLE IF NOT EXISTS fields (
        id TEXT PRIMARY KEY,
        rule_id TEXT NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
        name TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_fields_rule ON fields(rule_id, name);

    CREATE TABLE IF NOT EXISTS actions (
        id TEXT PRIMARY KEY,
        verb TEXT NOT NULL DEFAULT 'R' CHECK (verb IN ('C', 'R', 'U', 'D')),
        rule_id TEXT REFERENCES rules(id) ON DELETE CASCADE,
        field_id TEXT REFERENCES fields(id) ON DELETE CASCADE,
        CHECK ((rule_id IS NULL) <> (field_id IS NULL))
    );
    CREATE INDEX IF NOT EXISTS idx_actions_rule ON actions(rule_id);
    CREATE INDEX IF NOT EXISTS idx_actions_field ON actions(field_id);
";

fn db(err: rusqlite::Error) -> StoreError {
    StoreError::backend(err)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn id_at<T: From<Uuid>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map(T::from)
        .map_err(|e| conversion_error(idx, e))
}

fn optional_id_at<T: From<Uuid>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(|id| Some(T::from(id)))
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Token> {
    let expires = match row.get::<_, Option<String>>(2)? {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(2, e))?,
        ),
        None => None,
    };
    Ok(Token {
        id: id_at(row, 0)?,
        secret: row.get(1)?,
        expires,
        principal: row.get(3)?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: id_at(row, 0)?,
        token: id_at(row, 1)?,
        resource_type: row.get(2)?,
    })
}

fn field_from_row(row: &Row<'_>) -> rusqlite::Result<Field> {
    Ok(Field {
        id: id_at(row, 0)?,
        rule: id_at(row, 1)?,
        name: row.get(2)?,
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<Action> {
    let code: String = row.get(1)?;
    let verb = code
        .chars()
        .next()
        .ok_or_else(|| ModelError::InvalidVerb(code.clone()))
        .and_then(Verb::from_code)
        .map_err(|e| conversion_error(1, e))?;
    Ok(Action {
        id: id_at(row, 0)?,
        verb,
        rule: optional_id_at(row, 2)?,
        field: optional_id_at(row, 3)?,
    })
}

/// SQLite-backed grant store
pub struct SqliteGrantStore {
    conn: Mutex<Connection>,
    registry: Arc<dyn TypeRegistry>,
}

impl SqliteGrantStore {
    /// Open or create the grant database
    pub fn open(path: PathBuf, registry: Arc<dyn TypeRegistry>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
        }
        let conn = Connection::open(&path).map_err(db)?;
        // WAL lets concurrent checks read while a save is in flight
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(db)?;
        tracing::debug!(path = %path.display(), "opened grant database");
        Self::init(conn, registry)
    }

    pub fn open_in_memory(registry: Arc<dyn TypeRegistry>) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(db)?, registry)
    }

    /// Open using the default path (~/.actiontoken/grants.db)
    pub fn open_default(registry: Arc<dyn TypeRegistry>) -> Result<Self, StoreError> {
        Self::open(default_path()?, registry)
    }

    fn init(conn: Connection, registry: Arc<dyn TypeRegistry>) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
            registry,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Insert or update a token.
    ///
    /// The upsert only writes secret/expires into empty columns, so whichever
    /// save lands first wins and later saves adopt its values. `token` is
    /// overwritten with the stored row.
    pub fn save_token(
        &self,
        token: &mut Token,
        lifecycle: &TokenLifecycle,
    ) -> Result<(), StoreError> {
        lifecycle.ensure_initialized(token)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tokens (id, secret, expires, principal) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                secret = CASE WHEN tokens.secret = '' THEN excluded.secret ELSE tokens.secret END,
                expires = COALESCE(tokens.expires, excluded.expires),
                principal = excluded.principal",
            params![
                token.id.to_string(),
                token.secret,
                token.expires.map(|e| e.to_rfc3339()),
                token.principal,
            ],
        )
        .map_err(db)?;

        *token = Self::query_token(&conn, token.id)?.ok_or(StoreError::TokenNotFound(token.id))?;
        tracing::info!(token = %token.id, "saved token");
        Ok(())
    }

    fn query_token(conn: &Connection, id: TokenId) -> Result<Option<Token>, StoreError> {
        conn.query_row(
            "SELECT id, secret, expires, principal FROM tokens WHERE id = ?1",
            params![id.to_string()],
            token_from_row,
        )
        .optional()
        .map_err(db)
    }

    pub fn token(&self, id: TokenId) -> Result<Option<Token>, StoreError> {
        Self::query_token(&*self.lock()?, id)
    }

    /// Look a token up through the secret index. Empty secrets never match.
    pub fn token_by_secret(&self, secret: &str) -> Result<Option<Token>, StoreError> {
        if secret.is_empty() {
            return Ok(None);
        }
        self.lock()?
            .query_row(
                "SELECT id, secret, expires, principal FROM tokens WHERE secret = ?1",
                params![secret],
                token_from_row,
            )
            .optional()
            .map_err(db)
    }

    /// All tokens, soonest expiry first
    pub fn tokens(&self) -> Result<Vec<Token>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, secret, expires, principal FROM tokens ORDER BY expires")
            .map_err(db)?;
        let rows = stmt.query_map([], token_from_row).map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    pub fn rule(&self, id: RuleId) -> Result<Option<Rule>, StoreError> {
        Self::query_rule(&*self.lock()?, id)
    }

    fn query_rule(conn: &Connection, id: RuleId) -> Result<Option<Rule>, StoreError> {
        conn.query_row(
            "SELECT id, token_id, resource_type FROM rules WHERE id = ?1",
            params![id.to_string()],
            rule_from_row,
        )
        .optional()
        .map_err(db)
    }

    fn query_fields(
        conn: &Connection,
        rule: RuleId,
        name: Option<&str>,
    ) -> Result<Vec<Field>, StoreError> {
        let mut stmt = conn
            .prepare(
                "SELECT id, rule_id, name FROM fields
                 WHERE rule_id = ?1 AND (?2 IS NULL OR name = ?2)",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![rule.to_string(), name], field_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Insert or update a rule.
    ///
    /// A stored rule keeps its token. Changing its type re-checks every
    /// Field it owns against the new type; the connection lock is held
    /// throughout so no field can slip in between.
    pub fn save_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        rule.validate_type(self.registry.as_ref())?;
        let conn = self.lock()?;
        if Self::query_token(&conn, rule.token)?.is_none() {
            return Err(StoreError::TokenNotFound(rule.token));
        }
        if let Some(existing) = Self::query_rule(&conn, rule.id)? {
            if existing.token != rule.token {
                return Err(StoreError::RuleOwnerChanged {
                    rule: rule.id,
                    token: existing.token,
                });
            }
            for field in Self::query_fields(&conn, rule.id, None)? {
                field.validate_attribute(rule, self.registry.as_ref())?;
            }
        }
        conn.execute(
            "INSERT INTO rules (id, token_id, resource_type) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                resource_type = excluded.resource_type",
            params![rule.id.to_string(), rule.token.to_string(), rule.resource_type],
        )
        .map_err(db)?;
        Ok(())
    }

    pub fn save_field(&self, field: &Field) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let rule = Self::query_rule(&conn, field.rule)?.ok_or(StoreError::RuleNotFound(field.rule))?;
        field.validate_attribute(&rule, self.registry.as_ref())?;
        conn.execute(
            "INSERT INTO fields (id, rule_id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                rule_id = excluded.rule_id,
                name = excluded.name",
            params![field.id.to_string(), field.rule.to_string(), field.name],
        )
        .map_err(db)?;
        Ok(())
    }

    pub fn action(&self, id: ActionId) -> Result<Option<Action>, StoreError> {
        self.lock()?
            .query_row(
                "SELECT id, verb, rule_id, field_id FROM actions WHERE id = ?1",
                params![id.to_string()],
                action_from_row,
            )
            .optional()
            .map_err(db)
    }

    /// Insert or update an action, re-checking the single-target rule
    pub fn save_action(&self, action: &Action) -> Result<(), StoreError> {
        let target = action.target()?;
        let conn = self.lock()?;
        let exists = match target {
            Target::Rule(id) => conn.query_row(
                "SELECT COUNT(*) > 0 FROM rules WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, bool>(0),
            ),
            Target::Field(id) => conn.query_row(
                "SELECT COUNT(*) > 0 FROM fields WHERE id = ?1",
                params![id.to_string()],
                |row| row.get::<_, bool>(0),
            ),
        }
        .map_err(db)?;
        if !exists {
            return Err(match target {
                Target::Rule(id) => StoreError::RuleNotFound(id),
                Target::Field(id) => StoreError::FieldNotFound(id),
            });
        }

        conn.execute(
            "INSERT INTO actions (id, verb, rule_id, field_id) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                verb = excluded.verb,
                rule_id = excluded.rule_id,
                field_id = excluded.field_id",
            params![
                action.id.to_string(),
                action.verb.code().to_string(),
                action.rule.map(|id| id.to_string()),
                action.field.map(|id| id.to_string()),
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    pub fn delete_token(&self, id: TokenId) -> Result<bool, StoreError> {
        let deleted = self.delete_by_id("DELETE FROM tokens WHERE id = ?1", id.0)?;
        if deleted {
            tracing::info!(token = %id, "revoked token");
        }
        Ok(deleted)
    }

    pub fn delete_rule(&self, id: RuleId) -> Result<bool, StoreError> {
        self.delete_by_id("DELETE FROM rules WHERE id = ?1", id.0)
    }

    pub fn delete_field(&self, id: FieldId) -> Result<bool, StoreError> {
        self.delete_by_id("DELETE FROM fields WHERE id = ?1", id.0)
    }

    pub fn delete_action(&self, id: ActionId) -> Result<bool, StoreError> {
        self.delete_by_id("DELETE FROM actions WHERE id = ?1", id.0)
    }

    fn delete_by_id(&self, sql: &str, id: Uuid) -> Result<bool, StoreError> {
        let deleted = self
            .lock()?
            .execute(sql, params![id.to_string()])
            .map_err(db)?;
        Ok(deleted > 0)
    }
}

impl GrantStore for SqliteGrantStore {
    fn rules_for_token(&self, token: TokenId) -> Result<Vec<Rule>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, token_id, resource_type FROM rules WHERE token_id = ?1")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![token.to_string()], rule_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn fields_for_rule(&self, rule: RuleId, name: Option<&str>) -> Result<Vec<Field>, StoreError> {
        Self::query_fields(&*self.lock()?, rule, name)
    }

    fn actions_for_target(&self, target: Target) -> Result<Vec<Action>, StoreError> {
        let (sql, id) = match target {
            Target::Rule(id) => (
                "SELECT id, verb, rule_id, field_id FROM actions WHERE rule_id = ?1",
                id.0,
            ),
            Target::Field(id) => (
                "SELECT id, verb, rule_id, field_id FROM actions WHERE field_id = ?1",
                id.0,
            ),
        };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db)?;
        let rows = stmt
            .query_map(params![id.to_string()], action_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }
}

/// ~/.actiontoken/grants.db
pub fn default_path() -> Result<PathBuf, StoreError> {
    dirs::home_dir()
        .map(|home| home.join(".actiontoken").join("grants.db"))
        .ok_or_else(|| {
            StoreError::backend(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no home directory",
            ))
        })
}
