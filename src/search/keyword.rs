//! Keyword search over the FTS5 index
//!
//! BM25 raw scores map into [0, 1] relevance via
//! `clamp(1 + raw/divisor, 0, 1)`; the divisor is configurable.

use rusqlite::Connection;

use super::SearchConfig;
use crate::error::{MycelicError, Result};
use crate::storage::queries::{apply_filters, memory_from_row, MEMORY_COLUMNS};
use crate::types::*;

/// Sanitize a user query for FTS5.
///
/// Each whitespace-delimited term becomes a quoted phrase with embedded
/// double quotes doubled, so FTS5 operators and punctuation are matched
/// literally rather than interpreted. Terms are joined with OR for recall;
/// ranking orders multi-term matches first. Boolean operators typed by the
/// user are quoted like any other term, never rewritten.
pub fn sanitize_query(query: &str) -> Result<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(MycelicError::invalid("query", "must not be empty"));
    }

    let terms: Vec<String> = trimmed
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();

    Ok(terms.join(" OR "))
}

/// Map a raw BM25 score into [0, 1]
pub fn bm25_relevance(raw: f64, divisor: f64) -> f64 {
    (1.0 + raw / divisor).clamp(0.0, 1.0)
}

/// FTS5 match with BM25 ranking and shared filters
pub fn keyword_search(
    conn: &Connection,
    query: &str,
    limit: i64,
    offset: i64,
    options: &SearchOptions,
    config: &SearchConfig,
) -> Result<Vec<SearchResult>> {
    let sanitized = sanitize_query(query)?;

    let mut sql = format!(
        "SELECT {}, bm25(memories_fts) AS raw_score
         FROM memories_fts fts
         JOIN memories m ON m.id = fts.rowid
         WHERE memories_fts MATCH ?",
        MEMORY_COLUMNS
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(sanitized)];

    apply_filters(&mut sql, &mut params, &options.filters);

    sql.push_str(" ORDER BY raw_score ASC LIMIT ? OFFSET ?");
    params.push(Box::new(limit));
    params.push(Box::new(offset));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();

    let mut results: Vec<SearchResult> = stmt
        .query_map(param_refs.as_slice(), |row| {
            let memory = memory_from_row(row)?;
            let raw: f64 = row.get("raw_score")?;
            Ok((memory, raw))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|(memory, raw)| SearchResult {
            memory,
            relevance: bm25_relevance(raw, config.bm25_divisor),
            match_type: MatchType::Keyword,
        })
        .collect();

    results.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.memory.id.cmp(&b.memory.id))
    });

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::{insert_memory, NewMemory};
    use crate::storage::Storage;

    fn mem(content: &str) -> NewMemory {
        NewMemory {
            content: content.to_string(),
            source: None,
            importance: 5,
            tags: vec![],
            session_id: None,
            domain: None,
            agent_type: AgentType::Unknown,
            access_scope: AccessScope::Session,
            slug: None,
            parent_memory_id: None,
            chunk_level: 0,
            chunk_index: None,
            source_id: None,
            external_id: None,
        }
    }

    #[test]
    fn test_sanitize_quotes_terms() {
        assert_eq!(sanitize_query("hello").unwrap(), "\"hello\"");
        assert_eq!(
            sanitize_query("hello world").unwrap(),
            "\"hello\" OR \"world\""
        );
    }

    #[test]
    fn test_sanitize_doubles_embedded_quotes() {
        assert_eq!(
            sanitize_query("say \"hi\"").unwrap(),
            "\"say\" OR \"\"\"hi\"\"\""
        );
    }

    #[test]
    fn test_sanitize_rejects_empty() {
        assert!(sanitize_query("").is_err());
        assert!(sanitize_query("   ").is_err());
    }

    #[test]
    fn test_sanitize_operators_become_literals() {
        assert_eq!(
            sanitize_query("cats AND dogs").unwrap(),
            "\"cats\" OR \"AND\" OR \"dogs\""
        );
    }

    #[test]
    fn test_bm25_relevance_mapping() {
        assert_eq!(bm25_relevance(0.0, 10.0), 1.0);
        assert!((bm25_relevance(-2.0, 10.0) - 0.8).abs() < 1e-9);
        assert_eq!(bm25_relevance(-20.0, 10.0), 0.0);
        assert_eq!(bm25_relevance(5.0, 10.0), 1.0);
    }

    #[test]
    fn test_fts_match_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_writer(|conn| insert_memory(conn, &mem("Go interfaces are implicit")))
            .unwrap();
        storage
            .with_writer(|conn| insert_memory(conn, &mem("Rust traits are explicit")))
            .unwrap();

        let results = storage
            .with_reader(|conn| {
                keyword_search(
                    conn,
                    "implicit",
                    10,
                    0,
                    &SearchOptions::default(),
                    &SearchConfig::default(),
                )
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].memory.content.contains("implicit"));
        assert!(results[0].relevance >= 0.5);
        assert_eq!(results[0].match_type, MatchType::Keyword);
    }

    #[test]
    fn test_embedded_quote_no_injection() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_writer(|conn| insert_memory(conn, &mem("met with O'Brien about the launch")))
            .unwrap();

        let results = storage
            .with_reader(|conn| {
                keyword_search(
                    conn,
                    "O'Brien",
                    10,
                    0,
                    &SearchOptions::default(),
                    &SearchConfig::default(),
                )
            })
            .unwrap();
        assert_eq!(results.len(), 1);

        // A double-quoted attempt must not raise a syntax error either
        let quoted = storage.with_reader(|conn| {
            keyword_search(
                conn,
                "\"O'Brien\" OR (",
                10,
                0,
                &SearchOptions::default(),
                &SearchConfig::default(),
            )
        });
        assert!(quoted.is_ok());
    }

    #[test]
    fn test_update_moves_fts_entry() {
        let storage = Storage::open_in_memory().unwrap();
        let id = storage
            .with_writer(|conn| insert_memory(conn, &mem("the original wording")))
            .unwrap();
        storage
            .with_writer(|conn| {
                crate::storage::queries::update_memory(
                    conn,
                    id,
                    &crate::storage::queries::MemoryPatch {
                        content: Some("completely different text".into()),
                        ..Default::default()
                    },
                )
            })
            .unwrap();

        let old = storage
            .with_reader(|conn| {
                keyword_search(
                    conn,
                    "wording",
                    10,
                    0,
                    &SearchOptions::default(),
                    &SearchConfig::default(),
                )
            })
            .unwrap();
        assert!(old.is_empty());

        let new = storage
            .with_reader(|conn| {
                keyword_search(
                    conn,
                    "different",
                    10,
                    0,
                    &SearchOptions::default(),
                    &SearchConfig::default(),
                )
            })
            .unwrap();
        assert_eq!(new.len(), 1);
    }

    #[test]
    fn test_domain_filter_applies() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_writer(|conn| {
                let mut a = mem("channels in go");
                a.domain = Some("programming".into());
                insert_memory(conn, &a)?;
                let mut b = mem("tv channels guide");
                b.domain = Some("media".into());
                insert_memory(conn, &b)
            })
            .unwrap();

        let mut options = SearchOptions::default();
        options.filters.domain = Some("programming".into());
        let results = storage
            .with_reader(|conn| {
                keyword_search(conn, "channels", 10, 0, &options, &SearchConfig::default())
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.domain.as_deref(), Some("programming"));
    }
}
