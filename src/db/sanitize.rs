//! SQL identifier sanitization.
//!
//! Table and column names cannot be bound as parameters, so every name that
//! reaches generated SQL goes through [`validate_identifier`] and is quoted.

/// Maximum length for identifiers (table names, column names)
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Validates that a string is a safe SQL identifier.
/// Only allows ASCII alphanumeric characters and underscores, starting with
/// a letter or underscore.
pub fn validate_identifier(s: &str) -> Result<(), SqlSanitizeError> {
  let mut chars = s.chars();
  let first = match chars.next() {
    Some(c) => c,
    None => return Err(SqlSanitizeError::EmptyIdentifier),
  };

  if s.len() > MAX_IDENTIFIER_LENGTH {
    return Err(SqlSanitizeError::IdentifierTooLong(s.len()));
  }

  if !first.is_ascii_alphabetic() && first != '_' {
    return Err(SqlSanitizeError::InvalidIdentifierStart(first));
  }

  for c in chars {
    if !c.is_ascii_alphanumeric() && c != '_' {
      return Err(SqlSanitizeError::InvalidIdentifierChar(c));
    }
  }

  Ok(())
}

/// Validate and double-quote an identifier for inclusion in SQL.
pub fn quote_identifier(s: &str) -> Result<String, SqlSanitizeError> {
  validate_identifier(s)?;
  Ok(format!("\"{}\"", s))
}

/// SQL sanitization errors
#[derive(Debug, Clone, PartialEq)]
pub enum SqlSanitizeError {
  EmptyIdentifier,
  IdentifierTooLong(usize),
  InvalidIdentifierStart(char),
  InvalidIdentifierChar(char),
}

impl std::fmt::Display for SqlSanitizeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::EmptyIdentifier => write!(f, "Identifier cannot be empty"),
      Self::IdentifierTooLong(len) => {
        write!(
          f,
          "Identifier too long: {} > {}",
          len, MAX_IDENTIFIER_LENGTH
        )
      }
      Self::InvalidIdentifierStart(c) => {
        write!(
          f,
          "Identifier must start with letter or underscore, got '{}'",
          c
        )
      }
      Self::InvalidIdentifierChar(c) => {
        write!(f, "Invalid character in identifier: '{}'", c)
      }
    }
  }
}

impl std::error::Error for SqlSanitizeError {}
