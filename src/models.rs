use std::fmt;

use rand::Rng;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{FieldError, ValidationError};

/// Token purpose accepted by the authentication middleware.
pub const AUTH_ACCESS: &str = "auth";

const PASSWORD_MIN_LEN: usize = 6;

/// 12-byte identifier: 4 bytes of big-endian unix seconds, then 8 random bytes.
/// Rendered as 24 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        let secs = OffsetDateTime::now_utc().unix_timestamp() as u32;
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::rng().fill(&mut bytes[4..]);
        ObjectId(bytes)
    }

    /// Accepts exactly 24 hex digits. Anything else is not an id.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(ObjectId(bytes))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl ToSql for ObjectId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for ObjectId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        ObjectId::parse(s).ok_or_else(|| FromSqlError::Other(format!("invalid id {s:?}").into()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    pub access: String,
    pub token: String,
}

/// A registered account. Only `_id` and `email` are ever serialized.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    #[serde(skip)]
    pub tokens: Vec<AuthToken>,
    /// Plaintext awaiting hashing on the next save.
    #[serde(skip)]
    pending_password: Option<String>,
}

impl User {
    pub fn new(email: &str, password: &str) -> Self {
        User {
            id: ObjectId::generate(),
            email: normalize_email(email),
            password_hash: String::new(),
            tokens: Vec::new(),
            pending_password: Some(password.to_string()),
        }
    }

    pub(crate) fn from_store(
        id: ObjectId,
        email: String,
        password_hash: String,
        tokens: Vec<AuthToken>,
    ) -> Self {
        User {
            id,
            email,
            password_hash,
            tokens,
            pending_password: None,
        }
    }

    pub fn set_password(&mut self, password: &str) {
        self.pending_password = Some(password.to_string());
    }

    pub fn password_changed(&self) -> bool {
        self.pending_password.is_some()
    }

    pub(crate) fn take_pending_password(&mut self) -> Option<String> {
        self.pending_password.take()
    }

    pub fn push_token(&mut self, access: &str, token: &str) {
        self.tokens.push(AuthToken {
            access: access.to_string(),
            token: token.to_string(),
        });
    }

    /// Removes every entry carrying `token`, returning how many went.
    pub fn remove_token(&mut self, token: &str) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|t| t.token != token);
        before - self.tokens.len()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();

        if self.email.is_empty() {
            errors.push(FieldError::new(
                "email",
                "required",
                "Path `email` is required.",
            ));
        } else if !looks_like_email(&self.email) {
            errors.push(FieldError::new(
                "email",
                "user defined",
                format!("{} is not a valid email", self.email),
            ));
        }

        match &self.pending_password {
            Some(p) if p.is_empty() => errors.push(FieldError::new(
                "password",
                "required",
                "Path `password` is required.",
            )),
            Some(p) if p.chars().count() < PASSWORD_MIN_LEN => errors.push(FieldError::new(
                "password",
                "minlength",
                format!(
                    "Path `password` is shorter than the minimum allowed length ({PASSWORD_MIN_LEN})."
                ),
            )),
            Some(_) => {}
            None if self.password_hash.is_empty() => errors.push(FieldError::new(
                "password",
                "required",
                "Path `password` is required.",
            )),
            None => {}
        }

        ValidationError::check("User", errors)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Todo {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub text: String,
    pub completed: bool,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<i64>,
    #[serde(rename = "_creator")]
    pub creator: ObjectId,
}

impl Todo {
    pub fn new(text: &str, creator: ObjectId) -> Self {
        Todo {
            id: ObjectId::generate(),
            text: text.trim().to_string(),
            completed: false,
            completed_at: None,
            creator,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        ValidationError::check("Todo", text_errors(&self.text))
    }
}

fn text_errors(text: &str) -> Vec<FieldError> {
    if text.is_empty() {
        vec![FieldError::new("text", "required", "Path `text` is required.")]
    } else {
        Vec::new()
    }
}

/// Field updates applied by `PATCH /todos/:id`.
#[derive(Debug, Clone, PartialEq)]
pub struct TodoChanges {
    pub text: Option<String>,
    pub completed: bool,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTodo {
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTodo {
    pub text: Option<String>,
    /// Kept raw: only the JSON boolean `true` completes an item.
    pub completed: Option<Value>,
}

impl UpdateTodo {
    pub fn into_changes(self, now_ms: i64) -> Result<TodoChanges, ValidationError> {
        let text = self.text.map(|t| t.trim().to_string());
        if let Some(text) = &text {
            ValidationError::check("Todo", text_errors(text))?;
        }

        let completed = matches!(self.completed, Some(Value::Bool(true)));
        Ok(TodoChanges {
            text,
            completed,
            completed_at: completed.then_some(now_ms),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
