//! Structured bootstrap configuration documents
//!
//! Bootstrap configuration is HOCON text. Parsing goes through the `hocon`
//! crate; rendering is canonical (sorted keys, one assignment per line) so
//! that parse → render → parse is lossless and two equal documents always
//! render to the same bytes.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use hocon::{Hocon, HoconLoader};

use crate::Error;

/// Username used when the document does not configure one
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";

/// Password used when the document does not configure one
pub const DEFAULT_ADMIN_PASSWORD: &str = "public";

const INDENT: &str = "  ";

/// A value inside a configuration document
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    /// Explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// Integer number
    Integer(i64),
    /// Floating point number
    Real(f64),
    /// String
    String(String),
    /// Ordered list
    Array(Vec<ConfigValue>),
    /// Nested block
    Object(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    fn from_hocon(value: Hocon) -> Result<Self, Error> {
        Ok(match value {
            Hocon::Null => Self::Null,
            Hocon::Boolean(b) => Self::Bool(b),
            Hocon::Integer(i) => Self::Integer(i),
            Hocon::Real(f) => Self::Real(f),
            Hocon::String(s) => Self::String(s),
            Hocon::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(Self::from_hocon)
                    .collect::<Result<_, _>>()?,
            ),
            Hocon::Hash(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Self::from_hocon(v)?)))
                    .collect::<Result<_, Error>>()?,
            ),
            Hocon::BadValue(e) => return Err(Error::validation(e.to_string())),
        })
    }

    /// Scalar value as text; `None` for blocks, lists and null
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Bool(b) => Some(b.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Real(f) => Some(f.to_string()),
            Self::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn render_inline(&self, out: &mut String) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Self::Integer(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Real(f) => {
                let _ = write!(out, "{f:?}");
            }
            Self::String(s) => out.push_str(&quote(s)),
            Self::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render_inline(out);
                }
                out.push(']');
            }
            Self::Object(map) => {
                out.push('{');
                for (i, (k, v)) in map.iter().enumerate() {
                    out.push_str(if i > 0 { ", " } else { " " });
                    out.push_str(&render_key(k));
                    out.push_str(" = ");
                    v.render_inline(out);
                }
                out.push_str(if map.is_empty() { "}" } else { " }" });
            }
        }
    }
}

/// A parsed bootstrap configuration document
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigDocument {
    root: BTreeMap<String, ConfigValue>,
}

/// Shared administrative credentials for the broker's REST API
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    /// Account name
    pub username: String,
    /// Account password
    pub password: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for AdminCredentials {
    fn default() -> Self {
        Self {
            username: DEFAULT_ADMIN_USERNAME.to_string(),
            password: DEFAULT_ADMIN_PASSWORD.to_string(),
        }
    }
}

impl ConfigDocument {
    /// Parse HOCON text
    ///
    /// Empty or whitespace-only text is an empty document. Trailing whitespace
    /// after the last entry is ignored.
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let parsed = HoconLoader::new()
            .no_system()
            .strict()
            .load_str(text.trim_end())
            .and_then(|loader| loader.hocon())
            .map_err(|e| Error::validation(e.to_string()))?;

        match ConfigValue::from_hocon(parsed)? {
            ConfigValue::Object(root) => Ok(Self { root }),
            other => Err(Error::validation(format!(
                "configuration root must be an object, got {other:?}"
            ))),
        }
    }

    /// Canonical HOCON text for this document
    pub fn render(&self) -> String {
        let mut out = String::new();
        render_block(&self.root, 0, &mut out);
        out
    }

    /// True when the document has no keys
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Look up a dotted path
    pub fn get(&self, path: &str) -> Option<&ConfigValue> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.root.get(first)?;
        for segment in segments {
            match current {
                ConfigValue::Object(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Look up a dotted path holding a scalar
    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).and_then(ConfigValue::as_text)
    }

    /// True when the dotted path is present
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Dashboard admin account configured in the document
    pub fn admin_credentials(&self) -> AdminCredentials {
        let defaults = AdminCredentials::default();
        AdminCredentials {
            username: self
                .get_str("dashboard.default_username")
                .unwrap_or(defaults.username),
            password: self
                .get_str("dashboard.default_password")
                .unwrap_or(defaults.password),
        }
    }
}

fn render_block(map: &BTreeMap<String, ConfigValue>, depth: usize, out: &mut String) {
    let pad = INDENT.repeat(depth);
    for (key, value) in map {
        out.push_str(&pad);
        out.push_str(&render_key(key));
        match value {
            ConfigValue::Object(inner) if !inner.is_empty() => {
                out.push_str(" {\n");
                render_block(inner, depth + 1, out);
                out.push_str(&pad);
                out.push_str("}\n");
            }
            other => {
                out.push_str(" = ");
                other.render_inline(out);
                out.push('\n');
            }
        }
    }
}

fn render_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        key.to_string()
    } else {
        quote(key)
    }
}

fn quote(s: &str) -> String {
    // JSON string escapes are a subset of HOCON quoted-string escapes.
    serde_json::Value::String(s.to_string()).to_string()
}
