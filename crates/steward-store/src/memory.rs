//! Durable facts extracted from conversations.
//!
//! Extraction itself lives in the agent crate; this module only stores and
//! recalls what it produces.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Kind of a remembered fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Preference,
    Knowledge,
    Pattern,
    Skill,
    Task,
}

impl FactCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Knowledge => "knowledge",
            Self::Pattern => "pattern",
            Self::Skill => "skill",
            Self::Task => "task",
        }
    }

    fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "preference" => Ok(Self::Preference),
            "knowledge" => Ok(Self::Knowledge),
            "pattern" => Ok(Self::Pattern),
            "skill" => Ok(Self::Skill),
            "task" => Ok(Self::Task),
            other => Err(StoreError::Corrupt {
                field: "category",
                value: other.to_string(),
            }),
        }
    }
}

impl std::str::FromStr for FactCategory {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        Self::parse(&s.trim().to_lowercase())
    }
}

impl std::fmt::Display for FactCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    /// Session the fact was learned in, if any.
    pub session_id: Option<String>,
    pub category: FactCategory,
    pub content: String,
    /// 0.0 to 1.0.
    pub importance: f64,
    pub created_at: i64,
}

/// Input for [`FactStore::insert`].
#[derive(Debug, Clone)]
pub struct NewFact {
    pub session_id: Option<String>,
    pub category: FactCategory,
    pub content: String,
    pub importance: f64,
}

impl NewFact {
    pub fn new(category: FactCategory, content: impl Into<String>, importance: f64) -> Self {
        Self {
            session_id: None,
            category,
            content: content.into(),
            importance: importance.clamp(0.0, 1.0),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

type FactRow = (i64, Option<String>, String, String, f64, i64);

const FACT_COLUMNS: &str = "id, session_id, category, content, importance, created_at";

/// CRUD over the `memory_facts` table.
#[derive(Clone)]
pub struct FactStore {
    db: Database,
}

impl FactStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, fact), fields(category = ?fact.category))]
    pub async fn insert(&self, fact: NewFact) -> StoreResult<i64> {
        let now = Utc::now().timestamp_millis();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO memory_facts (session_id, category, content, importance, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        fact.session_id,
                        fact.category.as_str(),
                        fact.content,
                        fact.importance,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Insert a batch in one transaction. Returns how many were written.
    #[instrument(skip(self, facts), fields(count = facts.len()))]
    pub async fn insert_many(&self, facts: Vec<NewFact>) -> StoreResult<usize> {
        if facts.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().timestamp_millis();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO memory_facts (session_id, category, content, importance, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for fact in &facts {
                        stmt.execute(rusqlite::params![
                            fact.session_id,
                            fact.category.as_str(),
                            fact.content,
                            fact.importance,
                            now,
                        ])?;
                    }
                }
                tx.commit()?;
                debug!(written = facts.len(), "facts stored");
                Ok(facts.len())
            })
            .await
    }

    /// Most important facts first, optionally restricted to one category.
    #[instrument(skip(self))]
    pub async fn list(&self, category: Option<FactCategory>, limit: u32) -> StoreResult<Vec<Fact>> {
        let category = category.map(|c| c.as_str());
        self.query(
            format!(
                "SELECT {FACT_COLUMNS} FROM memory_facts \
                 WHERE ?1 IS NULL OR category = ?1 \
                 ORDER BY importance DESC, id DESC LIMIT ?2"
            ),
            category.map(str::to_string),
            limit,
        )
        .await
    }

    /// Case-insensitive substring search over fact content.
    #[instrument(skip(self))]
    pub async fn search(&self, needle: &str, limit: u32) -> StoreResult<Vec<Fact>> {
        self.query(
            format!(
                "SELECT {FACT_COLUMNS} FROM memory_facts \
                 WHERE content LIKE '%' || ?1 || '%' \
                 ORDER BY importance DESC, id DESC LIMIT ?2"
            ),
            Some(needle.to_string()),
            limit,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> StoreResult<()> {
        self.db
            .execute(move |conn| {
                let deleted = conn.execute("DELETE FROM memory_facts WHERE id = ?1", [id])?;
                if deleted == 0 {
                    return Err(StoreError::NotFound {
                        entity: "fact",
                        id: id.to_string(),
                    });
                }
                Ok(())
            })
            .await
    }

    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM memory_facts", [], |row| row.get(0))?)
            })
            .await
    }

    async fn query(&self, sql: String, arg: Option<String>, limit: u32) -> StoreResult<Vec<Fact>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows: Vec<FactRow> = stmt
                    .query_map(rusqlite::params![arg, limit], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<Result<_, _>>()?;

                rows.into_iter()
                    .map(|(id, session_id, category, content, importance, created_at)| {
                        Ok(Fact {
                            id,
                            session_id,
                            category: FactCategory::parse(&category)?,
                            content,
                            importance,
                            created_at,
                        })
                    })
                    .collect()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> FactStore {
        FactStore::new(Database::in_memory_migrated().await.unwrap())
    }

    #[tokio::test]
    async fn insert_and_list_by_importance() {
        let facts = store().await;
        facts
            .insert(NewFact::new(FactCategory::Knowledge, "project uses postgres", 0.4))
            .await
            .unwrap();
        facts
            .insert(NewFact::new(FactCategory::Preference, "prefers terse answers", 0.9).in_session("s1"))
            .await
            .unwrap();

        let all = facts.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].category, FactCategory::Preference);
        assert_eq!(all[0].session_id.as_deref(), Some("s1"));

        let knowledge = facts.list(Some(FactCategory::Knowledge), 10).await.unwrap();
        assert_eq!(knowledge.len(), 1);
    }

    #[test]
    fn importance_is_clamped() {
        let fact = NewFact::new(FactCategory::Task, "ship it", 3.0);
        assert_eq!(fact.importance, 1.0);
    }

    #[tokio::test]
    async fn batch_insert_and_search() {
        let facts = store().await;
        let written = facts
            .insert_many(vec![
                NewFact::new(FactCategory::Skill, "knows Rust", 0.7),
                NewFact::new(FactCategory::Pattern, "asks for tests first", 0.5),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(facts.count().await.unwrap(), 2);

        let hits = facts.search("rust", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "knows Rust");
    }

    #[tokio::test]
    async fn delete_missing_fact_is_not_found() {
        let facts = store().await;
        let id = facts
            .insert(NewFact::new(FactCategory::Task, "renew cert", 0.3))
            .await
            .unwrap();
        facts.delete(id).await.unwrap();
        assert!(matches!(
            facts.delete(id).await,
            Err(StoreError::NotFound { entity: "fact", .. })
        ));
    }
}
