// 🏷️ Keyword Registry - get-or-create tags by normalized text
//
// Keywords are created lazily the first time a series is tagged with them,
// never mutated and never deleted. Series reference them by normalized text;
// the keyword row is resolved when the series is saved.

use crate::error::{Result, SeriesError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Longest accepted keyword (after normalization)
pub const MAX_KEYWORD_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Trim, collapse inner whitespace, lower-case.
///
/// "  Core   CPI " -> "core cpi"
pub fn normalize_keyword(raw: &str) -> Result<String> {
    let text = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if text.is_empty() {
        return Err(SeriesError::InvalidValue("keyword is empty".to_string()));
    }
    if text.chars().count() > MAX_KEYWORD_LEN {
        return Err(SeriesError::InvalidValue(format!(
            "keyword '{text}' is longer than {MAX_KEYWORD_LEN} characters"
        )));
    }

    Ok(text)
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Keyword rows, backed by the `keyword` table
pub struct KeywordRegistry<'c> {
    conn: &'c Connection,
}

impl<'c> KeywordRegistry<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        KeywordRegistry { conn }
    }

    /// Return the keyword for `text`, creating it if absent.
    /// Repeated calls with equivalent text return the same row.
    pub fn ensure(&self, text: &str) -> Result<Keyword> {
        let text = normalize_keyword(text)?;

        let inserted = self.conn.execute(
            "INSERT INTO keyword (text, created_at) VALUES (?1, ?2)",
            params![text, Utc::now()],
        );

        match inserted {
            Ok(_) => log::debug!("keyword '{}' created", text),
            // Already registered
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation => {}
            Err(e) => return Err(e.into()),
        }

        self.find(&text)?
            .ok_or_else(|| SeriesError::UnresolvedReference(format!("keyword '{text}'")))
    }

    /// Look up by (normalized) text without creating
    pub fn find(&self, text: &str) -> Result<Option<Keyword>> {
        let text = normalize_keyword(text)?;

        let keyword = self
            .conn
            .query_row(
                "SELECT id, text, created_at FROM keyword WHERE text = ?1",
                params![text],
                |row| {
                    Ok(Keyword {
                        id: row.get(0)?,
                        text: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(keyword)
    }

    /// Every keyword, alphabetical
    pub fn all(&self) -> Result<Vec<Keyword>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, text, created_at FROM keyword ORDER BY text")?;

        let keywords = stmt
            .query_map([], |row| {
                Ok(Keyword {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(keywords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    #[test]
    fn test_normalize_keyword() {
        assert_eq!(normalize_keyword("  Core   CPI ").unwrap(), "core cpi");
        assert_eq!(normalize_keyword("Inflation").unwrap(), "inflation");
        assert_eq!(normalize_keyword("a\tb\nc").unwrap(), "a b c");
    }

    #[test]
    fn test_normalize_rejects_empty_and_long() {
        assert!(matches!(
            normalize_keyword("   "),
            Err(SeriesError::InvalidValue(_))
        ));

        let exactly_max = "x".repeat(MAX_KEYWORD_LEN);
        assert!(normalize_keyword(&exactly_max).is_ok());

        let too_long = "x".repeat(MAX_KEYWORD_LEN + 1);
        assert!(matches!(
            normalize_keyword(&too_long),
            Err(SeriesError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let registry = KeywordRegistry::new(&conn);

        let first = registry.ensure("Inflation").unwrap();
        let second = registry.ensure("  inflation ").unwrap();

        assert_eq!(first.id, second.id, "Equivalent text should resolve to one row");
        assert_eq!(first.text, "inflation");
        assert_eq!(registry.all().unwrap().len(), 1);
    }

    #[test]
    fn test_find_does_not_create() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let registry = KeywordRegistry::new(&conn);

        assert!(registry.find("rates").unwrap().is_none());
        registry.ensure("rates").unwrap();
        registry.ensure("equities").unwrap();

        assert!(registry.find("RATES").unwrap().is_some());
        let texts: Vec<String> = registry.all().unwrap().into_iter().map(|k| k.text).collect();
        assert_eq!(texts, vec!["equities", "rates"]);
    }
}
