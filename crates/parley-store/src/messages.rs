use chrono::{DateTime, SecondsFormat, Utc};
use tracing::instrument;

use parley_core::{Envelope, MessageId, UserId};

use crate::database::Database;
use crate::error::StoreError;

/// Message persistence.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message.
    #[instrument(skip(self, envelope), fields(message_id = %envelope.id, to_id = %envelope.to_id))]
    pub fn insert(&self, envelope: &Envelope) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO messages (id, from_id, to_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    envelope.id.as_str(),
                    envelope.from_id.as_str(),
                    envelope.to_id.as_str(),
                    envelope.content,
                    format_ts(&envelope.created_at),
                    format_ts(&envelope.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Messages exchanged between `a` and `b` in either direction, newest first.
    #[instrument(skip(self), fields(a = %a, b = %b))]
    pub fn conversation(
        &self,
        a: &UserId,
        b: &UserId,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_id, to_id, content, created_at, updated_at
                 FROM messages
                 WHERE (from_id = ?1 AND to_id = ?2) OR (from_id = ?2 AND to_id = ?1)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt.query_map(rusqlite::params![a.as_str(), b.as_str(), limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, from_id, to_id, content, created_at, updated_at) = row?;
                out.push(Envelope {
                    id: MessageId::from_raw(id),
                    from_id: UserId::from_raw(from_id),
                    to_id: UserId::from_raw(to_id),
                    content,
                    created_at: parse_ts(&created_at, "created_at")?,
                    updated_at: parse_ts(&updated_at, "updated_at")?,
                });
            }
            Ok(out)
        })
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "messages",
            column,
            detail: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn repo() -> MessageRepo {
        MessageRepo::new(Database::in_memory().unwrap())
    }

    fn at(from: &str, to: &str, content: &str, offset_secs: i64) -> Envelope {
        let mut env = Envelope::new(UserId::from_raw(from), UserId::from_raw(to), content);
        env.created_at += Duration::seconds(offset_secs);
        env.updated_at = env.created_at;
        env
    }

    #[test]
    fn insert_then_read_back() {
        let repo = repo();
        let env = at("alice", "bob", "hello", 0);
        repo.insert(&env).unwrap();

        let got = repo
            .conversation(&UserId::from_raw("bob"), &UserId::from_raw("alice"), 50)
            .unwrap();
        assert_eq!(got, vec![env]);
    }

    #[test]
    fn conversation_is_newest_first_both_directions() {
        let repo = repo();
        repo.insert(&at("alice", "bob", "one", 0)).unwrap();
        repo.insert(&at("bob", "alice", "two", 1)).unwrap();
        repo.insert(&at("alice", "bob", "three", 2)).unwrap();

        let got = repo
            .conversation(&UserId::from_raw("alice"), &UserId::from_raw("bob"), 50)
            .unwrap();
        let contents: Vec<_> = got.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["three", "two", "one"]);
    }

    #[test]
    fn conversation_excludes_other_pairs() {
        let repo = repo();
        repo.insert(&at("alice", "bob", "mine", 0)).unwrap();
        repo.insert(&at("alice", "carol", "not yours", 1)).unwrap();
        repo.insert(&at("carol", "bob", "nor this", 2)).unwrap();

        let got = repo
            .conversation(&UserId::from_raw("alice"), &UserId::from_raw("bob"), 50)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].content, "mine");
    }

    #[test]
    fn conversation_respects_limit() {
        let repo = repo();
        for i in 0..5 {
            repo.insert(&at("alice", "bob", &format!("m{i}"), i)).unwrap();
        }
        let got = repo
            .conversation(&UserId::from_raw("alice"), &UserId::from_raw("bob"), 2)
            .unwrap();
        let contents: Vec<_> = got.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["m4", "m3"]);
    }

    #[test]
    fn duplicate_id_rejected() {
        let repo = repo();
        let env = at("alice", "bob", "once", 0);
        repo.insert(&env).unwrap();
        assert!(matches!(repo.insert(&env), Err(StoreError::Database(_))));
    }

    #[test]
    fn corrupt_timestamp_reported() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO messages VALUES ('m1', 'a', 'b', 'x', 'yesterday', 'yesterday')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let repo = MessageRepo::new(db);
        let err = repo
            .conversation(&UserId::from_raw("a"), &UserId::from_raw("b"), 10)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptRow { column: "created_at", .. }
        ));
    }
}
