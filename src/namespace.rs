// Namespace Matcher
// Classifies user-IDs and aliases as inside or outside the appservice's
// namespace and maps suffixes to full identifiers and back

use regex::Regex;
use thiserror::Error;

use crate::registration::Registration;

#[derive(Error, Debug)]
pub enum NamespaceError {
    #[error("Expected exactly one user namespace, found {0}")]
    InvalidUserNamespaceCount(usize),

    #[error("Invalid configured alias prefix")]
    InvalidAliasPrefix,

    #[error("No valid user prefix configured for suffix lookups")]
    InvalidUserPrefix,

    #[error("Invalid namespace regex: {0}")]
    InvalidRegex(#[from] regex::Error),
}

impl NamespaceError {
    pub fn status_code(&self) -> u16 {
        500
    }

    pub fn error_code(&self) -> &'static str {
        "M_UNKNOWN"
    }
}

/// Compiled view of the registration's namespaces. Constructed once at
/// startup and never mutated afterwards.
#[derive(Debug)]
pub struct NamespaceMatcher {
    server_name: String,
    bot_user_id: String,
    user_regex: Regex,
    user_prefix: Option<String>,
    alias_regex: Option<Regex>,
    alias_prefix: Option<String>,
}

impl NamespaceMatcher {
    pub fn new(registration: &Registration, server_name: &str) -> Result<Self, NamespaceError> {
        let users = &registration.namespaces.users;
        if users.len() != 1 {
            return Err(NamespaceError::InvalidUserNamespaceCount(users.len()));
        }

        let user_pattern = &users[0].regex;
        let user_regex = Regex::new(user_pattern)?;
        let user_prefix = extract_prefix(user_pattern, server_name);

        let (alias_regex, alias_prefix) = match registration.namespaces.aliases.first() {
            Some(entry) => (
                Some(Regex::new(&entry.regex)?),
                extract_prefix(&entry.regex, server_name),
            ),
            None => (None, None),
        };

        Ok(Self {
            server_name: server_name.to_string(),
            bot_user_id: registration.bot_user_id(server_name),
            user_regex,
            user_prefix,
            alias_regex,
            alias_prefix,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    /// True when the user-ID is inside the appservice's namespace. The bot
    /// user is always considered namespaced even when the regex misses it.
    pub fn is_namespaced_user(&self, user_id: &str) -> bool {
        user_id == self.bot_user_id || self.user_regex.is_match(user_id)
    }

    pub fn is_namespaced_alias(&self, alias: &str) -> Result<bool, NamespaceError> {
        match &self.alias_regex {
            Some(regex) => Ok(regex.is_match(alias)),
            None => Err(NamespaceError::InvalidAliasPrefix),
        }
    }

    /// Build a full user-ID from a namespace suffix.
    pub fn user_id_for_suffix(&self, suffix: &str) -> Result<String, NamespaceError> {
        let prefix = self
            .user_prefix
            .as_deref()
            .ok_or(NamespaceError::InvalidUserPrefix)?;
        Ok(format!("{}{}:{}", prefix, suffix, self.server_name))
    }

    /// The portion of a user-ID between the namespace prefix and the server
    /// name. `None` for anything that does not match.
    pub fn suffix_for_user_id(&self, user_id: &str) -> Option<String> {
        let prefix = self.user_prefix.as_deref()?;
        let rest = user_id.strip_prefix(prefix)?;
        let suffix = rest.strip_suffix(&format!(":{}", self.server_name))?;
        Some(suffix.to_string())
    }

    pub fn alias_for_suffix(&self, suffix: &str) -> Result<String, NamespaceError> {
        let prefix = self
            .alias_prefix
            .as_deref()
            .ok_or(NamespaceError::InvalidAliasPrefix)?;
        Ok(format!("{}{}:{}", prefix, suffix, self.server_name))
    }

    pub fn suffix_for_alias(&self, alias: &str) -> Option<String> {
        let prefix = self.alias_prefix.as_deref()?;
        let rest = alias.strip_prefix(prefix)?;
        let suffix = rest.strip_suffix(&format!(":{}", self.server_name))?;
        Some(suffix.to_string())
    }

    /// Localpart of an alias, for `room_alias_name` in room creation.
    pub fn alias_localpart(alias: &str) -> &str {
        let trimmed = alias.strip_prefix('#').unwrap_or(alias);
        trimmed.split(':').next().unwrap_or(trimmed)
    }
}

/// Pull the literal prefix out of a namespace regex of the shape
/// `prefix.*:<server>` or `prefix.+:<server>`. Anything else disables
/// suffix round-tripping while membership tests keep working.
fn extract_prefix(pattern: &str, server_name: &str) -> Option<String> {
    let trimmed = pattern.strip_prefix('^').unwrap_or(pattern);
    let trimmed = trimmed.strip_suffix('$').unwrap_or(trimmed);

    let escaped_server = regex::escape(server_name);
    for wildcard in [".*", ".+"] {
        for server in [server_name, escaped_server.as_str()] {
            let tail = format!("{}:{}", wildcard, server);
            if let Some(prefix) = trimmed.strip_suffix(tail.as_str()) {
                // The prefix is a regex literal; drop escapes to get the text form.
                return Some(prefix.replace('\\', ""));
            }
        }
    }
    None
}
