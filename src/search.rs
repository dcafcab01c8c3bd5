// 🔍 Series Search - find stored groups and time series by name, code or keyword
//
// Multi-word text is searched word by word; the union is deduplicated by id
// (first hit wins) and cut to `limit`.

use crate::db;
use crate::entities::SeriesKind;
use crate::error::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub by_name: bool,
    pub by_code: bool,
    pub by_keyword: bool,
    /// Case-insensitive substring match; false = exact match
    pub partial: bool,
    pub include_time_series: bool,
    pub include_groups: bool,
    pub limit: usize,
}

impl SearchQuery {
    /// Everything enabled, partial matching, 100 hits
    pub fn new(text: impl Into<String>) -> Self {
        SearchQuery {
            text: text.into(),
            by_name: true,
            by_code: true,
            by_keyword: true,
            partial: true,
            include_time_series: true,
            include_groups: true,
            limit: 100,
        }
    }

    pub fn exact(mut self) -> Self {
        self.partial = false;
        self
    }

    pub fn only_time_series(mut self) -> Self {
        self.include_groups = false;
        self.include_time_series = true;
        self
    }

    pub fn only_groups(mut self) -> Self {
        self.include_time_series = false;
        self.include_groups = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub kind: SeriesKind,
    pub id: i64,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
}

pub fn search(conn: &Connection, query: &SearchQuery) -> Result<Vec<SearchHit>> {
    let mut hits = Vec::new();
    let mut seen = HashSet::new();

    for word in query.text.split_whitespace() {
        for hit in search_word(conn, query, word)? {
            if seen.insert(hit.id) {
                hits.push(hit);
            }
        }
    }

    hits.truncate(query.limit);
    Ok(hits)
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn search_word(conn: &Connection, query: &SearchQuery, word: &str) -> Result<Vec<SearchHit>> {
    // Keywords are stored lower-case
    let (matcher, keyword_matcher, pattern) = if query.partial {
        (
            "LIKE ?1 ESCAPE '\\'",
            "LIKE ?1 ESCAPE '\\'",
            format!("%{}%", escape_like(word)),
        )
    } else {
        ("= ?1", "= lower(?1)", word.to_string())
    };

    let mut conditions = Vec::new();
    if query.by_name {
        conditions.push(format!("sb.name {matcher}"));
    }
    if query.by_code {
        conditions.push(format!("v.code {matcher}"));
    }
    if query.by_keyword {
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM series_keyword sk
                     JOIN keyword k ON k.id = sk.keyword_id
                     WHERE sk.series_id = sb.id AND k.text {keyword_matcher})"
        ));
    }
    if conditions.is_empty() {
        return Ok(Vec::new());
    }

    let mut kinds = Vec::new();
    if query.include_time_series {
        kinds.push((SeriesKind::TimeSeries, "time_series"));
    }
    if query.include_groups {
        kinds.push((SeriesKind::Group, "series_group"));
    }

    let mut hits = Vec::new();
    for (kind, table) in kinds {
        let sql = format!(
            "SELECT sb.id, sb.name, v.code, sb.description
             FROM series_base sb
             JOIN {table} v ON v.id = sb.id
             WHERE {}
             ORDER BY sb.id",
            conditions.join(" OR ")
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![pattern], |row| {
                Ok(SearchHit {
                    kind,
                    id: row.get(0)?,
                    name: row.get(1)?,
                    code: row.get(2)?,
                    description: row.get(3)?,
                    keywords: Vec::new(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for mut hit in rows {
            hit.keywords = db::keyword_texts_for(conn, hit.id)?;
            hits.push(hit);
        }
    }

    Ok(hits)
}
